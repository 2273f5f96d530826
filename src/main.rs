//! lazydb - Main entry point.
//!
//! Runs SQL statements against one database through a single lazily opened
//! connection. Row-returning statements print each row as a JSON line; other
//! statements print the affected-row count.

use lazydb::config::Config;
use lazydb::{DbError, DbResult, create_engine, select, update, with_connection, with_transaction};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    // Logs go to stderr so stdout stays machine-readable.
    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

/// True for statements that produce a result set.
fn returns_rows(sql: &str) -> bool {
    let first = sql
        .trim_start_matches(|c: char| c.is_whitespace() || c == '(')
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    matches!(
        first.as_str(),
        "select" | "with" | "values" | "show" | "pragma" | "explain" | "describe" | "desc"
    )
}

async fn run_statements(statements: &[String]) -> DbResult<()> {
    for sql in statements {
        if returns_rows(sql) {
            for row in select(sql, &[]).await? {
                let line = serde_json::to_string(&row)
                    .map_err(|e| DbError::internal(format!("Failed to encode row: {}", e)))?;
                println!("{}", line);
            }
        } else {
            let affected = update(sql, &[]).await?;
            println!("{}", serde_json::json!({ "rows_affected": affected }));
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse_args();

    // Initialize logging
    init_tracing(&config);

    let engine_config = config.engine_config()?;
    info!(
        database = %engine_config.masked_connection_string(),
        statements = config.statements.len(),
        transaction = config.transaction,
        "Starting lazydb v{}",
        env!("CARGO_PKG_VERSION")
    );

    create_engine(engine_config)?;

    let statements = config.statements.clone();
    let result = if config.transaction {
        with_transaction(|| run_statements(&statements)).await
    } else {
        with_connection(|| run_statements(&statements)).await
    };

    if let Err(e) = result {
        error!(error = %e, usage_error = e.is_usage_error(), "Execution failed");
        if let Some(suggestion) = e.suggestion() {
            eprintln!("Hint: {}", suggestion);
        }
        return Err(e.into());
    }

    Ok(())
}
