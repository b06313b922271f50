//! Schema-related data models.
//!
//! Vendor-neutral descriptors produced by introspection. Every driver maps its
//! own system catalog onto these shapes.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Category of a database object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObjectCategory {
    Table,
    View,
    Procedure,
    Function,
}

impl ObjectCategory {
    /// Map a catalog label ("BASE TABLE", "VIEW", "PROCEDURE", "FN", ...) to a category.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "TABLE" | "BASE TABLE" | "U" | "USER_TABLE" => Some(Self::Table),
            "VIEW" | "V" | "MATERIALIZED VIEW" => Some(Self::View),
            "PROCEDURE" | "P" | "SQL_STORED_PROCEDURE" => Some(Self::Procedure),
            "FUNCTION" | "FN" | "IF" | "TF" => Some(Self::Function),
            _ => None,
        }
    }
}

impl std::fmt::Display for ObjectCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Table => write!(f, "TABLE"),
            Self::View => write!(f, "VIEW"),
            Self::Procedure => write!(f, "PROCEDURE"),
            Self::Function => write!(f, "FUNCTION"),
        }
    }
}

/// A table, view, procedure or function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DatabaseObjectDescriptor {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub category: ObjectCategory,
    /// Vendor-native label, e.g. "BASE TABLE" or "SQL_STORED_PROCEDURE"
    pub type_label: String,
}

impl DatabaseObjectDescriptor {
    pub fn new(
        name: impl Into<String>,
        schema: Option<String>,
        category: ObjectCategory,
        type_label: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            schema,
            category,
            type_label: type_label.into(),
        }
    }

    /// `schema.name` when a schema is known.
    pub fn qualified_name(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", schema, self.name),
            None => self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ColumnDescriptor {
    pub name: String,
    /// Normalized type name
    pub data_type: String,
    pub nullable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub precision: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    /// 1-based ordinal position
    pub position: i64,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable,
            max_length: None,
            precision: None,
            scale: None,
            default_value: None,
            position: 0,
        }
    }

    pub fn with_max_length(mut self, max_length: Option<i64>) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn with_precision(mut self, precision: Option<i64>, scale: Option<i64>) -> Self {
        self.precision = precision;
        self.scale = scale;
        self
    }

    pub fn with_default(mut self, default_value: Option<String>) -> Self {
        self.default_value = default_value;
        self
    }

    pub fn with_position(mut self, position: i64) -> Self {
        self.position = position;
        self
    }
}
