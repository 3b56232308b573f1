//! Rows as they travel from the recorder to the store

use std::fmt;

/// Column types the schema registry knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    BigInt,
    Text,
    Bytea,
    Bool,
}

impl SqlType {
    pub fn ddl(&self) -> &'static str {
        match self {
            SqlType::BigInt => "BIGINT",
            SqlType::Text => "TEXT",
            SqlType::Bytea => "BYTEA",
            SqlType::Bool => "BOOLEAN",
        }
    }
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.ddl())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    BigInt(i64),
    Text(String),
    Bytes(Vec<u8>),
    Bool(bool),
    Null,
}

impl SqlValue {
    /// Whether the value can be stored in a column of type `ty`
    pub fn fits(&self, ty: SqlType, nullable: bool) -> bool {
        matches!(
            (self, ty),
            (SqlValue::BigInt(_), SqlType::BigInt)
                | (SqlValue::Text(_), SqlType::Text)
                | (SqlValue::Bytes(_), SqlType::Bytea)
                | (SqlValue::Bool(_), SqlType::Bool)
        ) || (nullable && matches!(self, SqlValue::Null))
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::BigInt(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            SqlValue::Bytes(v) => Some(v),
            _ => None,
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::BigInt(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<&String> for SqlValue {
    fn from(v: &String) -> Self {
        SqlValue::Text(v.clone())
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Bytes(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(SqlValue::Null, Into::into)
    }
}

/// One validated row. Column names point into the schema registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub table: &'static str,
    pub columns: Vec<&'static str>,
    pub values: Vec<SqlValue>,
}

impl Row {
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|c| *c == column)
            .and_then(|i| self.values.get(i))
    }

    /// Tables and column lists match, so the rows can share one multi-row insert
    pub fn same_shape(&self, other: &Row) -> bool {
        self.table == other.table && self.columns == other.columns
    }
}
