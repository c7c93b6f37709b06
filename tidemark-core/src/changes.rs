//! Built-in change kinds.
//!
//! Each kind is a plain serde struct. Identifiers are always quoted; raw
//! SQL fragments (column types, defaults, view queries) are passed through.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::change::{build, Change, ChangeRegistry, Statement};
use crate::db::quote_ident;

/// Register every built-in kind under its tag name.
pub fn register_builtins(registry: &mut ChangeRegistry) {
    registry
        .register("sql", build::<Sql>)
        .register("createTable", build::<CreateTable>)
        .register("dropTable", build::<DropTable>)
        .register("addColumn", build::<AddColumn>)
        .register("dropColumn", build::<DropColumn>)
        .register("renameTable", build::<RenameTable>)
        .register("renameColumn", build::<RenameColumn>)
        .register("createIndex", build::<CreateIndex>)
        .register("dropIndex", build::<DropIndex>)
        .register("createView", build::<CreateView>)
        .register("dropView", build::<DropView>)
        .register("createSequence", build::<CreateSequence>)
        .register("dropSequence", build::<DropSequence>)
        .register("insert", build::<Insert>)
        .register("tagDatabase", build::<TagDatabase>);
}

fn qualified(schema: &Option<String>, name: &str) -> String {
    match schema {
        Some(s) => format!("{}.{}", quote_ident(s), quote_ident(name)),
        None => quote_ident(name),
    }
}

fn to_payload<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn require(field: &str, value: &str, problems: &mut Vec<String>) {
    if value.trim().is_empty() {
        problems.push(format!("{} is required", field));
    }
}

fn default_true() -> bool {
    true
}

/// Collapse runs of whitespace so reformatting SQL does not count as drift.
fn normalize_sql(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        other => format!("'{}'", other.to_string().replace('\'', "''")),
    }
}

// ---------------------------------------------------------------------------
// Columns
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

impl ColumnDef {
    pub fn new(name: &str, data_type: &str) -> Self {
        Self {
            name: name.to_string(),
            data_type: data_type.to_string(),
            nullable: true,
            primary_key: false,
            unique: false,
            default: None,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    fn render(&self) -> String {
        let mut sql = format!("{} {}", quote_ident(&self.name), self.data_type);
        if self.primary_key {
            sql.push_str(" PRIMARY KEY");
        }
        if self.unique {
            sql.push_str(" UNIQUE");
        }
        if !self.nullable && !self.primary_key {
            sql.push_str(" NOT NULL");
        }
        if let Some(ref default) = self.default {
            sql.push_str(&format!(" DEFAULT {}", default));
        }
        sql
    }
}

// ---------------------------------------------------------------------------
// Raw SQL
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sql {
    pub sql: String,
}

impl Sql {
    pub fn new(sql: &str) -> Self {
        Self {
            sql: sql.to_string(),
        }
    }
}

impl Change for Sql {
    fn kind(&self) -> &'static str {
        "sql"
    }

    fn payload(&self) -> Value {
        json!({ "sql": normalize_sql(&self.sql) })
    }

    fn describe(&self) -> String {
        let flat = normalize_sql(&self.sql);
        if flat.len() > 60 {
            let cut = flat
                .char_indices()
                .map(|(i, _)| i)
                .take_while(|i| *i <= 57)
                .last()
                .unwrap_or(0);
            format!("sql {}...", &flat[..cut])
        } else {
            format!("sql {}", flat)
        }
    }

    fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        require("sql", &self.sql, &mut problems);
        problems
    }

    fn forward(&self) -> Vec<Statement> {
        vec![Statement::new(self.sql.trim())]
    }
}

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTable {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub table: String,
    pub columns: Vec<ColumnDef>,
}

impl CreateTable {
    pub fn new(table: &str, columns: Vec<ColumnDef>) -> Self {
        Self {
            schema: None,
            table: table.to_string(),
            columns,
        }
    }
}

impl Change for CreateTable {
    fn kind(&self) -> &'static str {
        "createTable"
    }

    fn payload(&self) -> Value {
        to_payload(self)
    }

    fn describe(&self) -> String {
        format!("createTable {}", self.table)
    }

    fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        require("table", &self.table, &mut problems);
        if self.columns.is_empty() {
            problems.push("at least one column is required".to_string());
        }
        for column in &self.columns {
            require("column name", &column.name, &mut problems);
            require("column type", &column.data_type, &mut problems);
        }
        problems
    }

    fn forward(&self) -> Vec<Statement> {
        let columns: Vec<String> = self.columns.iter().map(ColumnDef::render).collect();
        vec![Statement::new(format!(
            "CREATE TABLE {} ({})",
            qualified(&self.schema, &self.table),
            columns.join(", ")
        ))]
    }

    fn invert(&self) -> Option<Vec<Statement>> {
        Some(vec![Statement::new(format!(
            "DROP TABLE {}",
            qualified(&self.schema, &self.table)
        ))])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropTable {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub table: String,
    #[serde(default)]
    pub cascade: bool,
}

impl Change for DropTable {
    fn kind(&self) -> &'static str {
        "dropTable"
    }

    fn payload(&self) -> Value {
        to_payload(self)
    }

    fn describe(&self) -> String {
        format!("dropTable {}", self.table)
    }

    fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        require("table", &self.table, &mut problems);
        problems
    }

    fn forward(&self) -> Vec<Statement> {
        let cascade = if self.cascade { " CASCADE" } else { "" };
        vec![Statement::new(format!(
            "DROP TABLE {}{}",
            qualified(&self.schema, &self.table),
            cascade
        ))]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenameTable {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub old_table: String,
    pub new_table: String,
}

impl Change for RenameTable {
    fn kind(&self) -> &'static str {
        "renameTable"
    }

    fn payload(&self) -> Value {
        to_payload(self)
    }

    fn describe(&self) -> String {
        format!("renameTable {} to {}", self.old_table, self.new_table)
    }

    fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        require("old_table", &self.old_table, &mut problems);
        require("new_table", &self.new_table, &mut problems);
        problems
    }

    fn forward(&self) -> Vec<Statement> {
        vec![Statement::new(format!(
            "ALTER TABLE {} RENAME TO {}",
            qualified(&self.schema, &self.old_table),
            quote_ident(&self.new_table)
        ))]
    }

    fn invert(&self) -> Option<Vec<Statement>> {
        Some(vec![Statement::new(format!(
            "ALTER TABLE {} RENAME TO {}",
            qualified(&self.schema, &self.new_table),
            quote_ident(&self.old_table)
        ))])
    }
}

// ---------------------------------------------------------------------------
// Columns
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddColumn {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub table: String,
    pub columns: Vec<ColumnDef>,
}

impl Change for AddColumn {
    fn kind(&self) -> &'static str {
        "addColumn"
    }

    fn payload(&self) -> Value {
        to_payload(self)
    }

    fn describe(&self) -> String {
        let names: Vec<&str> = self.columns.iter().map(|c| c.name.as_str()).collect();
        format!("addColumn {}({})", self.table, names.join(", "))
    }

    fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        require("table", &self.table, &mut problems);
        if self.columns.is_empty() {
            problems.push("at least one column is required".to_string());
        }
        problems
    }

    fn forward(&self) -> Vec<Statement> {
        let table = qualified(&self.schema, &self.table);
        self.columns
            .iter()
            .map(|c| Statement::new(format!("ALTER TABLE {} ADD COLUMN {}", table, c.render())))
            .collect()
    }

    fn invert(&self) -> Option<Vec<Statement>> {
        let table = qualified(&self.schema, &self.table);
        Some(
            self.columns
                .iter()
                .rev()
                .map(|c| {
                    Statement::new(format!(
                        "ALTER TABLE {} DROP COLUMN {}",
                        table,
                        quote_ident(&c.name)
                    ))
                })
                .collect(),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropColumn {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub table: String,
    pub column: String,
}

impl Change for DropColumn {
    fn kind(&self) -> &'static str {
        "dropColumn"
    }

    fn payload(&self) -> Value {
        to_payload(self)
    }

    fn describe(&self) -> String {
        format!("dropColumn {}.{}", self.table, self.column)
    }

    fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        require("table", &self.table, &mut problems);
        require("column", &self.column, &mut problems);
        problems
    }

    fn forward(&self) -> Vec<Statement> {
        vec![Statement::new(format!(
            "ALTER TABLE {} DROP COLUMN {}",
            qualified(&self.schema, &self.table),
            quote_ident(&self.column)
        ))]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenameColumn {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub table: String,
    pub old_column: String,
    pub new_column: String,
}

impl Change for RenameColumn {
    fn kind(&self) -> &'static str {
        "renameColumn"
    }

    fn payload(&self) -> Value {
        to_payload(self)
    }

    fn describe(&self) -> String {
        format!(
            "renameColumn {}.{} to {}",
            self.table, self.old_column, self.new_column
        )
    }

    fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        require("table", &self.table, &mut problems);
        require("old_column", &self.old_column, &mut problems);
        require("new_column", &self.new_column, &mut problems);
        problems
    }

    fn forward(&self) -> Vec<Statement> {
        vec![Statement::new(format!(
            "ALTER TABLE {} RENAME COLUMN {} TO {}",
            qualified(&self.schema, &self.table),
            quote_ident(&self.old_column),
            quote_ident(&self.new_column)
        ))]
    }

    fn invert(&self) -> Option<Vec<Statement>> {
        Some(vec![Statement::new(format!(
            "ALTER TABLE {} RENAME COLUMN {} TO {}",
            qualified(&self.schema, &self.table),
            quote_ident(&self.new_column),
            quote_ident(&self.old_column)
        ))])
    }
}

// ---------------------------------------------------------------------------
// Indexes, views, sequences
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateIndex {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub table: String,
    pub index: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

impl Change for CreateIndex {
    fn kind(&self) -> &'static str {
        "createIndex"
    }

    fn payload(&self) -> Value {
        to_payload(self)
    }

    fn describe(&self) -> String {
        format!("createIndex {} on {}", self.index, self.table)
    }

    fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        require("table", &self.table, &mut problems);
        require("index", &self.index, &mut problems);
        if self.columns.is_empty() {
            problems.push("at least one column is required".to_string());
        }
        problems
    }

    fn forward(&self) -> Vec<Statement> {
        let unique = if self.unique { "UNIQUE " } else { "" };
        let columns: Vec<String> = self.columns.iter().map(|c| quote_ident(c)).collect();
        vec![Statement::new(format!(
            "CREATE {}INDEX {} ON {} ({})",
            unique,
            quote_ident(&self.index),
            qualified(&self.schema, &self.table),
            columns.join(", ")
        ))]
    }

    fn invert(&self) -> Option<Vec<Statement>> {
        Some(vec![Statement::new(format!(
            "DROP INDEX {}",
            qualified(&self.schema, &self.index)
        ))])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropIndex {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub index: String,
}

impl Change for DropIndex {
    fn kind(&self) -> &'static str {
        "dropIndex"
    }

    fn payload(&self) -> Value {
        to_payload(self)
    }

    fn describe(&self) -> String {
        format!("dropIndex {}", self.index)
    }

    fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        require("index", &self.index, &mut problems);
        problems
    }

    fn forward(&self) -> Vec<Statement> {
        vec![Statement::new(format!(
            "DROP INDEX {}",
            qualified(&self.schema, &self.index)
        ))]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateView {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub view: String,
    pub query: String,
    #[serde(default)]
    pub replace: bool,
}

impl Change for CreateView {
    fn kind(&self) -> &'static str {
        "createView"
    }

    fn payload(&self) -> Value {
        json!({
            "schema": self.schema,
            "view": self.view,
            "query": normalize_sql(&self.query),
            "replace": self.replace,
        })
    }

    fn describe(&self) -> String {
        format!("createView {}", self.view)
    }

    fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        require("view", &self.view, &mut problems);
        require("query", &self.query, &mut problems);
        problems
    }

    fn forward(&self) -> Vec<Statement> {
        let replace = if self.replace { "OR REPLACE " } else { "" };
        vec![Statement::new(format!(
            "CREATE {}VIEW {} AS {}",
            replace,
            qualified(&self.schema, &self.view),
            self.query.trim()
        ))]
    }

    fn invert(&self) -> Option<Vec<Statement>> {
        // A replaced view had a previous definition we no longer know.
        if self.replace {
            return None;
        }
        Some(vec![Statement::new(format!(
            "DROP VIEW {}",
            qualified(&self.schema, &self.view)
        ))])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropView {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub view: String,
}

impl Change for DropView {
    fn kind(&self) -> &'static str {
        "dropView"
    }

    fn payload(&self) -> Value {
        to_payload(self)
    }

    fn describe(&self) -> String {
        format!("dropView {}", self.view)
    }

    fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        require("view", &self.view, &mut problems);
        problems
    }

    fn forward(&self) -> Vec<Statement> {
        vec![Statement::new(format!(
            "DROP VIEW {}",
            qualified(&self.schema, &self.view)
        ))]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSequence {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub sequence: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub increment: Option<i64>,
}

impl Change for CreateSequence {
    fn kind(&self) -> &'static str {
        "createSequence"
    }

    fn payload(&self) -> Value {
        to_payload(self)
    }

    fn describe(&self) -> String {
        format!("createSequence {}", self.sequence)
    }

    fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        require("sequence", &self.sequence, &mut problems);
        if self.increment == Some(0) {
            problems.push("increment cannot be zero".to_string());
        }
        problems
    }

    fn forward(&self) -> Vec<Statement> {
        let mut sql = format!(
            "CREATE SEQUENCE {}",
            qualified(&self.schema, &self.sequence)
        );
        if let Some(start) = self.start {
            sql.push_str(&format!(" START WITH {}", start));
        }
        if let Some(increment) = self.increment {
            sql.push_str(&format!(" INCREMENT BY {}", increment));
        }
        vec![Statement::new(sql)]
    }

    fn invert(&self) -> Option<Vec<Statement>> {
        Some(vec![Statement::new(format!(
            "DROP SEQUENCE {}",
            qualified(&self.schema, &self.sequence)
        ))])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropSequence {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub sequence: String,
}

impl Change for DropSequence {
    fn kind(&self) -> &'static str {
        "dropSequence"
    }

    fn payload(&self) -> Value {
        to_payload(self)
    }

    fn describe(&self) -> String {
        format!("dropSequence {}", self.sequence)
    }

    fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        require("sequence", &self.sequence, &mut problems);
        problems
    }

    fn forward(&self) -> Vec<Statement> {
        vec![Statement::new(format!(
            "DROP SEQUENCE {}",
            qualified(&self.schema, &self.sequence)
        ))]
    }
}

// ---------------------------------------------------------------------------
// Data and markers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Insert {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub table: String,
    pub values: BTreeMap<String, Value>,
}

impl Change for Insert {
    fn kind(&self) -> &'static str {
        "insert"
    }

    fn payload(&self) -> Value {
        to_payload(self)
    }

    fn describe(&self) -> String {
        format!("insert {}", self.table)
    }

    fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        require("table", &self.table, &mut problems);
        if self.values.is_empty() {
            problems.push("at least one value is required".to_string());
        }
        problems
    }

    fn forward(&self) -> Vec<Statement> {
        let columns: Vec<String> = self.values.keys().map(|c| quote_ident(c)).collect();
        let values: Vec<String> = self.values.values().map(sql_literal).collect();
        vec![Statement::new(format!(
            "INSERT INTO {} ({}) VALUES ({})",
            qualified(&self.schema, &self.table),
            columns.join(", "),
            values.join(", ")
        ))]
    }
}

/// Marks the ledger row of its change set with a tag. Emits no SQL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagDatabase {
    pub tag: String,
}

impl Change for TagDatabase {
    fn kind(&self) -> &'static str {
        "tagDatabase"
    }

    fn payload(&self) -> Value {
        to_payload(self)
    }

    fn describe(&self) -> String {
        format!("tagDatabase {}", self.tag)
    }

    fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        require("tag", &self.tag, &mut problems);
        problems
    }

    fn forward(&self) -> Vec<Statement> {
        Vec::new()
    }

    fn invert(&self) -> Option<Vec<Statement>> {
        Some(Vec::new())
    }

    fn tag(&self) -> Option<&str> {
        Some(&self.tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users_table() -> CreateTable {
        CreateTable::new(
            "users",
            vec![
                ColumnDef::new("id", "BIGINT").primary_key(),
                ColumnDef::new("email", "TEXT").not_null(),
            ],
        )
    }

    #[test]
    fn test_create_table_sql() {
        let sql = users_table().forward();
        assert_eq!(
            sql[0].sql(),
            r#"CREATE TABLE "users" ("id" BIGINT PRIMARY KEY, "email" TEXT NOT NULL)"#
        );
    }

    #[test]
    fn test_create_table_inverts_to_drop() {
        let inverse = users_table().invert().unwrap();
        assert_eq!(inverse[0].sql(), r#"DROP TABLE "users""#);
    }

    #[test]
    fn test_schema_qualified_names() {
        let mut change = users_table();
        change.schema = Some("app".to_string());
        assert!(change.forward()[0]
            .sql()
            .starts_with(r#"CREATE TABLE "app"."users""#));
    }

    #[test]
    fn test_add_column_inverts_in_reverse_order() {
        let change = AddColumn {
            schema: None,
            table: "users".to_string(),
            columns: vec![ColumnDef::new("a", "INT"), ColumnDef::new("b", "INT")],
        };
        let inverse = change.invert().unwrap();
        assert_eq!(inverse.len(), 2);
        assert!(inverse[0].sql().ends_with(r#"DROP COLUMN "b""#));
        assert!(inverse[1].sql().ends_with(r#"DROP COLUMN "a""#));
    }

    #[test]
    fn test_rename_column_round_trip() {
        let change = RenameColumn {
            schema: None,
            table: "users".to_string(),
            old_column: "mail".to_string(),
            new_column: "email".to_string(),
        };
        assert_eq!(
            change.invert().unwrap()[0].sql(),
            r#"ALTER TABLE "users" RENAME COLUMN "email" TO "mail""#
        );
    }

    #[test]
    fn test_destructive_changes_are_not_invertible() {
        let drop = DropTable {
            schema: None,
            table: "users".to_string(),
            cascade: false,
        };
        assert!(drop.invert().is_none());
        assert!(Sql::new("DELETE FROM users").invert().is_none());
        let insert = Insert {
            schema: None,
            table: "users".to_string(),
            values: BTreeMap::new(),
        };
        assert!(insert.invert().is_none());
    }

    #[test]
    fn test_replacing_view_is_not_invertible() {
        let view = CreateView {
            schema: None,
            view: "active_users".to_string(),
            query: "SELECT 1".to_string(),
            replace: true,
        };
        assert!(view.invert().is_none());
    }

    #[test]
    fn test_insert_literals() {
        let mut values = BTreeMap::new();
        values.insert("name".to_string(), json!("O'Brien"));
        values.insert("age".to_string(), json!(41));
        values.insert("admin".to_string(), json!(false));
        let change = Insert {
            schema: None,
            table: "people".to_string(),
            values,
        };
        assert_eq!(
            change.forward()[0].sql(),
            r#"INSERT INTO "people" ("admin", "age", "name") VALUES (FALSE, 41, 'O''Brien')"#
        );
    }

    #[test]
    fn test_sql_payload_ignores_whitespace() {
        let a = Sql::new("SELECT  1\n  FROM dual");
        let b = Sql::new("SELECT 1 FROM dual");
        assert_eq!(a.payload(), b.payload());
    }

    #[test]
    fn test_validation_problems() {
        let table = CreateTable::new("", Vec::new());
        let problems = table.validate();
        assert_eq!(problems.len(), 2);
        assert!(users_table().validate().is_empty());
    }

    #[test]
    fn test_tag_database_has_no_sql() {
        let tag = TagDatabase {
            tag: "v1".to_string(),
        };
        assert!(tag.forward().is_empty());
        assert_eq!(tag.tag(), Some("v1"));
        assert_eq!(tag.invert(), Some(Vec::new()));
    }
}
