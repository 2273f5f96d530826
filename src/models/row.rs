//! Result rows addressable by column name and by position.

use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::Value as JsonValue;
use std::ops::Index;
use std::sync::Arc;

/// One result row: the statement's column names zipped with this row's values.
///
/// Name lookup follows mapping semantics, so when a result repeats a column name
/// the last column with that name wins. Positional access sees every column.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<JsonValue>,
}

impl Row {
    /// Build a row from shared column names and its values.
    ///
    /// Values beyond the column count are dropped; missing values read as absent.
    pub fn new(columns: Arc<[String]>, mut values: Vec<JsonValue>) -> Self {
        values.truncate(columns.len());
        Self { columns, values }
    }

    /// Build a row from owned `(name, value)` pairs.
    pub fn from_pairs<K, I>(pairs: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, JsonValue)>,
    {
        let (columns, values): (Vec<String>, Vec<JsonValue>) =
            pairs.into_iter().map(|(k, v)| (k.into(), v)).unzip();
        Self::new(columns.into(), values)
    }

    /// Value of the named column.
    pub fn get(&self, name: &str) -> Option<&JsonValue> {
        self.columns
            .iter()
            .rposition(|c| c == name)
            .and_then(|idx| self.values.get(idx))
    }

    /// Value at a column position.
    pub fn get_index(&self, idx: usize) -> Option<&JsonValue> {
        self.values.get(idx)
    }

    /// Integer value of the named column, if it holds one.
    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(JsonValue::as_i64)
    }

    /// String value of the named column, if it holds one.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(JsonValue::as_str)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[JsonValue] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate `(column, value)` pairs in result order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &JsonValue)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }

    /// Take the values, discarding the column names.
    pub fn into_values(self) -> Vec<JsonValue> {
        self.values
    }

    /// Convert into a JSON object keyed by column name.
    pub fn into_json_map(self) -> serde_json::Map<String, JsonValue> {
        self.columns.iter().cloned().zip(self.values).collect()
    }
}

impl Index<&str> for Row {
    type Output = JsonValue;

    fn index(&self, name: &str) -> &JsonValue {
        match self.get(name) {
            Some(v) => v,
            None => panic!("row has no column named '{name}'"),
        }
    }
}

impl Index<usize> for Row {
    type Output = JsonValue;

    fn index(&self, idx: usize) -> &JsonValue {
        &self.values[idx]
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (name, value) in self.iter() {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}
