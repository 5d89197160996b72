//! Core types for EMS queries and results.

use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error types for EMS operations.
#[derive(Error, Debug)]
pub enum EmsError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API request failed: {0}")]
    Api(String),

    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    #[error("Malformed filter expression: {0}")]
    MalformedExpression(String),

    #[error("No field was found with the keyword '{0}'")]
    UnknownField(String),

    #[error("Unsupported conditional operator {operator} for {field_type} field")]
    UnsupportedOperator {
        operator: String,
        field_type: FieldType,
    },

    #[error("'{value}' could not be found in the values of field {field_id}")]
    UnmappedValue { value: String, field_id: String },

    #[error("Discrete values of field {0} are not loaded; fetch them with FieldTree::fetch_discrete_values")]
    DiscreteValuesNotLoaded(String),

    #[error("Unknown field data type: {0}")]
    UnknownFieldType(String),

    #[error("Invalid literal: {0}")]
    InvalidLiteral(String),

    #[error("Data conversion error: {0}")]
    DataConversion(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

/// Result type alias for EMS operations.
pub type Result<T> = std::result::Result<T, EmsError>;

/// Data type of a remote schema field.
///
/// The set is closed: a type string outside these five is rejected when the
/// field is parsed, so filter dispatch never sees an unknown kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FieldType {
    Boolean,
    Discrete,
    Number,
    String,
    DateTime,
}

impl FieldType {
    /// Name used by the API for this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Boolean => "boolean",
            FieldType::Discrete => "discrete",
            FieldType::Number => "number",
            FieldType::String => "string",
            FieldType::DateTime => "dateTime",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldType {
    type Err = EmsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "boolean" => Ok(FieldType::Boolean),
            "discrete" => Ok(FieldType::Discrete),
            "number" => Ok(FieldType::Number),
            "string" => Ok(FieldType::String),
            "dateTime" => Ok(FieldType::DateTime),
            other => Err(EmsError::UnknownFieldType(other.to_string())),
        }
    }
}

impl TryFrom<String> for FieldType {
    type Error = EmsError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<FieldType> for String {
    fn from(t: FieldType) -> Self {
        t.as_str().to_string()
    }
}

/// One field of the remote schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    /// Opaque field identifier, e.g. `[-hub-][field][[[ems-core]...]]`
    pub id: String,

    /// Human readable field name
    pub name: String,

    /// Field data type
    #[serde(rename = "type")]
    pub field_type: FieldType,
}

impl FieldDescriptor {
    pub fn new(id: impl Into<String>, name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            field_type,
        }
    }
}

/// Aggregation applied to a selected field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregate {
    #[default]
    None,
    Avg,
    Count,
    Max,
    Min,
    Stdev,
    Sum,
    Var,
}

impl FromStr for Aggregate {
    type Err = EmsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Aggregate::None),
            "avg" => Ok(Aggregate::Avg),
            "count" => Ok(Aggregate::Count),
            "max" => Ok(Aggregate::Max),
            "min" => Ok(Aggregate::Min),
            "stdev" => Ok(Aggregate::Stdev),
            "sum" => Ok(Aggregate::Sum),
            "var" => Ok(Aggregate::Var),
            other => Err(EmsError::InvalidParam(format!(
                "Unknown aggregation '{}'. Use one of none, avg, count, max, min, stdev, sum, var",
                other
            ))),
        }
    }
}

/// Sort direction for `order_by`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Wrapper around a Polars DataFrame holding query results.
#[derive(Debug, Clone)]
pub struct QueryResult {
    df: DataFrame,
}

impl QueryResult {
    /// Create a QueryResult from a Polars DataFrame.
    pub fn new(df: DataFrame) -> Self {
        Self { df }
    }

    /// Get the underlying DataFrame.
    pub fn dataframe(&self) -> &DataFrame {
        &self.df
    }

    /// Consume and return the underlying DataFrame.
    pub fn into_dataframe(self) -> DataFrame {
        self.df
    }

    /// Get the number of rows.
    pub fn len(&self) -> usize {
        self.df.height()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.df.height() == 0
    }

    /// Get column names.
    pub fn columns(&self) -> Vec<String> {
        self.df.get_column_names().iter().map(|s| s.to_string()).collect()
    }

    /// Export to CSV file.
    pub fn to_csv(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        crate::write_csv(&self.df, path)
    }

    /// Export to Parquet file.
    pub fn to_parquet(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        crate::write_parquet(&self.df, path)
    }
}
