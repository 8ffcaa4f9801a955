//! Output formatting utilities for MCP tools.
//!
//! Query results can be rendered as an ASCII table (like the MySQL CLI) or as
//! markdown; schema answers have markdown renderings of their own.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use unicode_width::UnicodeWidthStr;

use crate::models::{
    BackendSummary, QueryResult, ScalarValue, SchemaList, TableList, TableSchema,
};

/// Output format for tool results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// JSON format (default)
    #[default]
    Json,
    /// ASCII table format (like MySQL CLI)
    Table,
    /// Markdown table format
    Markdown,
}

/// Escape pipes and newlines so a value stays inside its markdown cell.
fn md_cell(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}

fn is_numeric(value: &ScalarValue) -> bool {
    matches!(
        value,
        ScalarValue::Int(_) | ScalarValue::Float(_) | ScalarValue::Decimal(_)
    )
}

pub fn format_as_table(result: &QueryResult) -> String {
    if result.columns.is_empty() {
        return "Empty set".to_string();
    }

    let cells: Vec<Vec<String>> = result
        .rows
        .iter()
        .map(|row| row.iter().map(ScalarValue::display_text).collect())
        .collect();

    let mut widths: Vec<usize> = result.columns.iter().map(|c| c.name.width()).collect();
    for row in &cells {
        for (i, text) in row.iter().enumerate() {
            if let Some(w) = widths.get_mut(i) {
                *w = (*w).max(text.width());
            }
        }
    }

    let mut output = String::new();
    let separator: String = widths
        .iter()
        .map(|w| format!("+{}", "-".repeat(w + 2)))
        .collect::<String>()
        + "+\n";

    output.push_str(&separator);
    let header: String = result
        .columns
        .iter()
        .zip(&widths)
        .map(|(col, w)| format!("| {} ", pad(&col.name, *w, Align::Center)))
        .collect::<String>()
        + "|\n";
    output.push_str(&header);
    output.push_str(&separator);

    for (row, texts) in result.rows.iter().zip(&cells) {
        let line: String = row
            .iter()
            .zip(texts)
            .zip(&widths)
            .map(|((value, text), w)| {
                // Right-align numbers, left-align others
                let align = if is_numeric(value) {
                    Align::Right
                } else {
                    Align::Left
                };
                format!("| {} ", pad(text, *w, align))
            })
            .collect::<String>()
            + "|\n";
        output.push_str(&line);
    }

    output.push_str(&separator);

    let row_text = if result.row_count == 1 { "row" } else { "rows" };
    let truncated_text = if result.truncated { " (truncated)" } else { "" };
    output.push_str(&format!(
        "{} {} in set{} ({:.2} sec)\n",
        result.row_count,
        row_text,
        truncated_text,
        result.execution_time_ms as f64 / 1000.0
    ));
    output
}

enum Align {
    Left,
    Right,
    Center,
}

/// Pad by display width; `format!` widths count chars, not columns.
fn pad(text: &str, width: usize, align: Align) -> String {
    let fill = width.saturating_sub(text.width());
    match align {
        Align::Left => format!("{text}{}", " ".repeat(fill)),
        Align::Right => format!("{}{text}", " ".repeat(fill)),
        Align::Center => {
            let left = fill / 2;
            format!("{}{text}{}", " ".repeat(left), " ".repeat(fill - left))
        }
    }
}

pub fn format_as_markdown(result: &QueryResult) -> String {
    if result.columns.is_empty() {
        return "*Empty set*".to_string();
    }

    let mut output = String::new();
    let header: String = result
        .columns
        .iter()
        .map(|c| format!("| {} ", md_cell(&c.name)))
        .collect::<String>()
        + "|\n";
    output.push_str(&header);

    let sep: String = result.columns.iter().map(|_| "|---").collect::<String>() + "|\n";
    output.push_str(&sep);

    for row in &result.rows {
        let line: String = row
            .iter()
            .map(|value| format!("| {} ", md_cell(&value.display_text())))
            .collect::<String>()
            + "|\n";
        output.push_str(&line);
    }

    let truncated_text = if result.truncated { " *(truncated)*" } else { "" };
    output.push_str(&format!("\n*{} rows*{}", result.row_count, truncated_text));
    output
}

pub fn format_table_schema(schema: &TableSchema) -> String {
    let mut output = format!("## {}\n\n", md_cell(&schema.qualified_name()));
    output.push_str("| Column | Type | Nullable | Primary Key | Default |\n");
    output.push_str("|---|---|---|---|---|\n");
    for column in &schema.columns {
        output.push_str(&format!(
            "| {} | {} | {} | {} | {} |\n",
            md_cell(&column.name),
            md_cell(&column.data_type),
            if column.nullable { "YES" } else { "NO" },
            if column.primary_key { "YES" } else { "" },
            md_cell(column.default.as_deref().unwrap_or("")),
        ));
    }
    let pk = schema.primary_key();
    if !pk.is_empty() {
        output.push_str(&format!("\n**Primary key:** {}\n", pk.join(", ")));
    }
    output
}

pub fn format_table_list(list: &TableList) -> String {
    let title = match &list.schema {
        Some(schema) => format!("Tables in `{}.{schema}`", list.backend),
        None => format!("Tables in `{}`", list.backend),
    };
    bullet_list(&title, &list.tables, "tables")
}

pub fn format_schema_list(list: &SchemaList) -> String {
    bullet_list(&format!("Schemas in `{}`", list.backend), &list.schemas, "schemas")
}

fn bullet_list(title: &str, items: &[String], noun: &str) -> String {
    let mut output = format!("## {title}\n\n");
    if items.is_empty() {
        output.push_str(&format!("*No {noun} found*\n"));
        return output;
    }
    for item in items {
        output.push_str(&format!("- {}\n", md_cell(item)));
    }
    output.push_str(&format!("\n*{} {noun}*\n", items.len()));
    output
}

pub fn format_backends(backends: &[BackendSummary]) -> String {
    let mut output = String::from("| Name | Type | Read-only | Pool | Target |\n");
    output.push_str("|---|---|---|---|---|\n");
    for backend in backends {
        output.push_str(&format!(
            "| {} | {} | {} | {}/{} | {} |\n",
            md_cell(&backend.name),
            backend.backend_type,
            if backend.read_only { "yes" } else { "no" },
            backend.pool.live,
            backend.pool_size,
            md_cell(&backend.target),
        ));
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ColumnDefinition, ColumnInfo};

    fn result() -> QueryResult {
        QueryResult {
            columns: vec![ColumnInfo::new("id", "INTEGER"), ColumnInfo::new("name", "TEXT")],
            rows: vec![
                vec![ScalarValue::Int(1), ScalarValue::Text("Zoë".into())],
                vec![ScalarValue::Int(20), ScalarValue::Null],
            ],
            row_count: 2,
            truncated: true,
            row_limit: 2,
            execution_time_ms: 5,
        }
    }

    #[test]
    fn test_format_as_table() {
        let out = format_as_table(&result());
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines[0], "+----+------+");
        assert_eq!(lines[1], "| id | name |");
        assert_eq!(lines[3], "|  1 | Zoë  |");
        assert_eq!(lines[4], "| 20 | NULL |");
        assert!(out.contains("2 rows in set (truncated)"));
    }

    #[test]
    fn test_format_as_markdown() {
        let out = format_as_markdown(&result());
        assert!(out.starts_with("| id | name |\n|---|---|\n| 1 | Zoë |"));
        assert!(out.ends_with("*2 rows* *(truncated)*"));
    }

    #[test]
    fn test_format_table_schema() {
        let schema = TableSchema::new("users")
            .with_column(
                ColumnDefinition::new("id", "integer", "INTEGER", 1)
                    .with_nullable(false)
                    .with_primary_key(true),
            )
            .with_column(
                ColumnDefinition::new("bio", "text", "TEXT", 2).with_default(Some("'a|b'".into())),
            );
        let out = format_table_schema(&schema);
        assert!(out.contains("| Column | Type | Nullable | Primary Key | Default |"));
        assert!(out.contains("| id | integer | NO | YES |  |"));
        assert!(out.contains("| bio | text | YES |  | 'a\\|b' |"));
        assert!(out.contains("**Primary key:** id"));
    }

    #[test]
    fn test_format_empty_table_list() {
        let list = TableList {
            backend: "local".into(),
            schema: None,
            tables: vec![],
            count: 0,
        };
        assert!(format_table_list(&list).contains("*No tables found*"));
    }
}
