//! Schema-related data models.
//!
//! This module defines types for database schema introspection.

use schemars::JsonSchema;
use serde::Serialize;

use super::connection::BackendType;

#[derive(Debug, Clone, PartialEq, Serialize, JsonSchema)]
pub struct TableSchema {
    pub table: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    /// Ordered by ordinal position.
    pub columns: Vec<ColumnDefinition>,
}

impl TableSchema {
    /// Create a new table schema.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            schema: None,
            columns: Vec::new(),
        }
    }

    /// Set the schema name.
    pub fn with_schema(mut self, schema: Option<impl Into<String>>) -> Self {
        self.schema = schema.map(Into::into);
        self
    }

    /// Add a column definition.
    pub fn with_column(mut self, column: ColumnDefinition) -> Self {
        self.columns.push(column);
        self
    }

    /// Names of the primary key columns, in column order.
    pub fn primary_key(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Get the fully qualified table name.
    pub fn qualified_name(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", schema, self.table),
            None => self.table.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema)]
pub struct ColumnDefinition {
    pub name: String,
    /// Normalized type: integer, float, text, decimal(p,s), timestamp, date,
    /// time, boolean, binary, json, uuid, or the lowercased native name.
    #[serde(rename = "type")]
    pub data_type: String,
    /// Type as declared in the backend catalog.
    pub native_type: String,
    pub nullable: bool,
    pub primary_key: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    /// 1-based position in the table definition.
    pub ordinal_position: u32,
}

impl ColumnDefinition {
    /// Create a new column definition.
    pub fn new(
        name: impl Into<String>,
        data_type: impl Into<String>,
        native_type: impl Into<String>,
        ordinal_position: u32,
    ) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            native_type: native_type.into(),
            nullable: true,
            primary_key: false,
            default: None,
            ordinal_position,
        }
    }

    pub fn with_nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    /// Set whether this is a primary key column.
    pub fn with_primary_key(mut self, is_pk: bool) -> Self {
        self.primary_key = is_pk;
        self
    }

    pub fn with_default(mut self, default: Option<String>) -> Self {
        self.default = default;
        self
    }
}

#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct SchemaList {
    pub backend: String,
    pub schemas: Vec<String>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct TableList {
    pub backend: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub tables: Vec<String>,
    pub count: usize,
}

/// Result of `test_connection`.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct ConnectionStatus {
    pub backend: String,
    pub backend_type: BackendType,
    pub connected: bool,
    pub read_only: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Failure reason when `connected` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_key_in_column_order() {
        let schema = TableSchema::new("orders")
            .with_schema(Some("public"))
            .with_column(ColumnDefinition::new("tenant", "integer", "int4", 1).with_primary_key(true))
            .with_column(ColumnDefinition::new("note", "text", "text", 2))
            .with_column(ColumnDefinition::new("id", "integer", "int8", 3).with_primary_key(true));

        assert_eq!(schema.primary_key(), vec!["tenant", "id"]);
        assert_eq!(schema.qualified_name(), "public.orders");
    }

    #[test]
    fn test_column_serializes_type_field() {
        let col = ColumnDefinition::new("id", "integer", "INTEGER", 1).with_nullable(false);
        let json = serde_json::to_value(&col).unwrap();
        assert_eq!(json["type"], "integer");
        assert_eq!(json["nullable"], false);
        assert!(json.get("default").is_none());
    }
}
