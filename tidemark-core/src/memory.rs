//! In-process backend for tests and embedded use.
//!
//! [`MemoryDatabase`] implements [`Database`], [`HistoryStore`] and
//! [`LockStore`] over one shared state. DDL is interpreted by a small set of
//! regexes that maintain a catalog of tables, columns, views, indexes,
//! sequences and row counts; every other statement is accepted and logged.
//!
//! Clones share one session. [`MemoryDatabase::connect`] opens another
//! session on the same state, the way a second process would. Each session
//! has its own transaction snapshot; the lock row is never part of it.
//! Schema qualifiers are ignored: names live in one namespace.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex_lite::Regex;

use crate::change::Statement;
use crate::changeset::ChangeSetId;
use crate::checksum::CheckSum;
use crate::db::{Database, DatabaseInfo};
use crate::error::{Result, TidemarkError};
use crate::history::{HistoryStore, RanChangeSet};
use crate::lock::{LockRecord, LockStore};

static CREATE_TABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^CREATE\s+(?:UNLOGGED\s+)?TABLE\s+(IF\s+NOT\s+EXISTS\s+)?([^\s(]+)\s*\((.*)\)$")
        .unwrap()
});

static DROP_TABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^DROP\s+TABLE\s+(IF\s+EXISTS\s+)?([^\s,]+)").unwrap()
});

static ALTER_TABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^ALTER\s+TABLE\s+(?:IF\s+EXISTS\s+)?(?:ONLY\s+)?(\S+)\s+(.*)$").unwrap()
});

static ADD_COLUMN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^ADD\s+(?:COLUMN\s+)?(IF\s+NOT\s+EXISTS\s+)?(\S+)").unwrap()
});

static DROP_COLUMN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^DROP\s+(?:COLUMN\s+)?(IF\s+EXISTS\s+)?(\S+)").unwrap()
});

static RENAME_TABLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)^RENAME\s+TO\s+(\S+)$").unwrap());

static RENAME_COLUMN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^RENAME\s+(?:COLUMN\s+)?(\S+)\s+TO\s+(\S+)$").unwrap()
});

static CREATE_INDEX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?is)^CREATE\s+(?:UNIQUE\s+)?INDEX\s+(?:CONCURRENTLY\s+)?(IF\s+NOT\s+EXISTS\s+)?(\S+)\s+ON\s+(?:ONLY\s+)?([^\s(]+)",
    )
    .unwrap()
});

static DROP_INDEX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^DROP\s+INDEX\s+(?:CONCURRENTLY\s+)?(IF\s+EXISTS\s+)?([^\s,]+)").unwrap()
});

static CREATE_VIEW_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^CREATE\s+(OR\s+REPLACE\s+)?VIEW\s+([^\s(]+)").unwrap()
});

static DROP_VIEW_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^DROP\s+VIEW\s+(IF\s+EXISTS\s+)?([^\s,]+)").unwrap()
});

static CREATE_SEQUENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^CREATE\s+SEQUENCE\s+(IF\s+NOT\s+EXISTS\s+)?([^\s;]+)").unwrap()
});

static DROP_SEQUENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^DROP\s+SEQUENCE\s+(IF\s+EXISTS\s+)?([^\s,]+)").unwrap()
});

static INSERT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^INSERT\s+INTO\s+([^\s(]+)(.*)$").unwrap()
});

static DELETE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^DELETE\s+FROM\s+(\S+)(\s+WHERE\s+.*)?$").unwrap()
});

static TRUNCATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^TRUNCATE\s+(?:TABLE\s+)?([^\s,]+)").unwrap()
});

static COUNT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^SELECT\s+COUNT\s*\(\s*\*\s*\)\s+FROM\s+(\S+)$").unwrap()
});

/// Words that open a table constraint rather than a column definition.
const CONSTRAINT_WORDS: &[&str] = &["constraint", "primary", "unique", "foreign", "check", "exclude"];

#[derive(Debug, Clone, Default)]
struct Table {
    columns: Vec<String>,
    rows: i64,
}

#[derive(Debug, Clone, Default)]
struct Catalog {
    tables: BTreeMap<String, Table>,
    views: BTreeSet<String>,
    /// index name → table name
    indexes: BTreeMap<String, String>,
    sequences: BTreeSet<String>,
}

#[derive(Debug, Clone)]
struct Snapshot {
    catalog: Catalog,
    ledger: Option<Vec<RanChangeSet>>,
}

#[derive(Debug)]
struct SharedState {
    catalog: Catalog,
    ledger: Option<Vec<RanChangeSet>>,
    lock: Option<LockRecord>,
    executed: Vec<String>,
    fail_on: Vec<String>,
    user: String,
    scalars: HashMap<String, String>,
    statement_delay: Option<Duration>,
    disconnected: bool,
}

impl Default for SharedState {
    fn default() -> Self {
        Self {
            catalog: Catalog::default(),
            ledger: None,
            lock: None,
            executed: Vec::new(),
            fail_on: Vec::new(),
            user: "tidemark".to_string(),
            scalars: HashMap::new(),
            statement_delay: None,
            disconnected: false,
        }
    }
}

impl SharedState {
    fn injected_failure(&self, sql: &str) -> Option<&str> {
        let lower = sql.to_lowercase();
        self.fail_on
            .iter()
            .find(|p| lower.contains(&p.to_lowercase()))
            .map(String::as_str)
    }
}

/// An in-memory database. See the module docs.
#[derive(Clone)]
pub struct MemoryDatabase {
    shared: Arc<Mutex<SharedState>>,
    session: Arc<Mutex<Option<Snapshot>>>,
    info: DatabaseInfo,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDatabase")
            .field("info", &self.info)
            .finish()
    }
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(SharedState::default())),
            session: Arc::new(Mutex::new(None)),
            info: DatabaseInfo {
                dialect: "memory".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                default_schema: "public".to_string(),
                supports_ddl_transactions: true,
            },
        }
    }

    /// Report a different dialect name to `dbms` filters and preconditions.
    pub fn with_dialect(mut self, dialect: &str) -> Self {
        self.info.dialect = dialect.to_string();
        self
    }

    /// Behave like a backend whose DDL autocommits.
    pub fn without_ddl_transactions(mut self) -> Self {
        self.info.supports_ddl_transactions = false;
        self
    }

    /// A new session over the same state.
    pub fn connect(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            session: Arc::new(Mutex::new(None)),
            info: self.info.clone(),
        }
    }

    fn state(&self) -> MutexGuard<'_, SharedState> {
        self.shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn snapshot(&self) -> MutexGuard<'_, Option<Snapshot>> {
        self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fail every statement or query containing `pattern` (case-insensitive).
    pub fn fail_on(&self, pattern: &str) {
        self.state().fail_on.push(pattern.to_string());
    }

    pub fn clear_failures(&self) {
        self.state().fail_on.clear();
    }

    pub fn set_user(&self, user: &str) {
        self.state().user = user.to_string();
    }

    /// Answer `sql` with `value` in [`Database::query_scalar`].
    pub fn set_scalar(&self, sql: &str, value: &str) {
        self.state()
            .scalars
            .insert(sql.trim().to_string(), value.to_string());
    }

    /// Sleep this long before every statement.
    pub fn set_statement_delay(&self, delay: Option<Duration>) {
        self.state().statement_delay = delay;
    }

    /// Drop or restore the connection. While dropped, health checks and
    /// statements fail with [`TidemarkError::ConnectionLost`].
    pub fn set_disconnected(&self, disconnected: bool) {
        self.state().disconnected = disconnected;
    }

    /// Every statement sent to [`Database::execute`], in order.
    pub fn executed_statements(&self) -> Vec<String> {
        self.state().executed.clone()
    }

    pub fn clear_executed(&self) {
        self.state().executed.clear();
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.state().catalog.tables.contains_key(&object_name(table))
    }

    pub fn has_column(&self, table: &str, column: &str) -> bool {
        let column = object_name(column);
        self.state()
            .catalog
            .tables
            .get(&object_name(table))
            .is_some_and(|t| t.columns.contains(&column))
    }

    pub fn has_view(&self, view: &str) -> bool {
        self.state().catalog.views.contains(&object_name(view))
    }

    pub fn has_index(&self, index: &str) -> bool {
        self.state().catalog.indexes.contains_key(&object_name(index))
    }

    pub fn has_sequence(&self, sequence: &str) -> bool {
        self.state().catalog.sequences.contains(&object_name(sequence))
    }

    /// Names of every table, sorted.
    pub fn tables(&self) -> Vec<String> {
        self.state().catalog.tables.keys().cloned().collect()
    }

    /// Ledger rows as stored, or `None` when the ledger table was never created.
    pub fn ledger_rows(&self) -> Option<Vec<RanChangeSet>> {
        self.state().ledger.clone()
    }
}

// ---------------------------------------------------------------------------
// Statement interpretation
// ---------------------------------------------------------------------------

/// Split SQL on `;` outside string literals and comments.
fn split_statements(sql: &str) -> Vec<&str> {
    let bytes = sql.as_bytes();
    let len = bytes.len();
    let mut statements = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < len {
        match bytes[i] {
            b'-' if i + 1 < len && bytes[i + 1] == b'-' => {
                while i < len && bytes[i] != b'\n' {
                    i += 1;
                }
                continue;
            }
            b'\'' => {
                i += 1;
                while i < len {
                    if bytes[i] == b'\'' {
                        if i + 1 < len && bytes[i + 1] == b'\'' {
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
            }
            b';' => {
                let trimmed = sql[start..i].trim();
                if !trimmed.is_empty() {
                    statements.push(trimmed);
                }
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }

    let remainder = sql[start.min(len)..].trim();
    if !remainder.is_empty() {
        statements.push(remainder);
    }
    statements
}

/// Drop leading `--` comment lines.
fn strip_leading_comments(sql: &str) -> &str {
    let mut rest = sql.trim_start();
    while rest.starts_with("--") {
        rest = match rest.find('\n') {
            Some(pos) => rest[pos + 1..].trim_start(),
            None => "",
        };
    }
    rest.trim_end()
}

/// Last segment of a possibly qualified name, unquoted. Unquoted names fold to lower case.
fn object_name(raw: &str) -> String {
    let raw = raw.trim().trim_end_matches(';');
    let last = match raw.rfind("\".\"") {
        Some(pos) => &raw[pos + 2..],
        None if raw.starts_with('"') => raw,
        None => raw.rsplit('.').next().unwrap_or(raw),
    };
    if last.len() >= 2 && last.starts_with('"') && last.ends_with('"') {
        last[1..last.len() - 1].replace("\"\"", "\"")
    } else {
        last.to_lowercase()
    }
}

/// Split on commas that are not nested in parentheses.
fn split_top_level(body: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, ch) in body.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(body[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(body[start..].trim());
    parts.into_iter().filter(|p| !p.is_empty()).collect()
}

fn first_word(s: &str) -> &str {
    s.split_whitespace().next().unwrap_or("")
}

fn is_constraint(word: &str) -> bool {
    CONSTRAINT_WORDS.contains(&word.to_lowercase().as_str())
}

fn missing(kind: &str, name: &str) -> TidemarkError {
    TidemarkError::StatementFailed(format!("{} \"{}\" does not exist", kind, name))
}

fn connection_lost(operation: &str) -> TidemarkError {
    TidemarkError::ConnectionLost {
        operation: operation.to_string(),
        detail: "connection closed".to_string(),
    }
}

fn duplicate(kind: &str, name: &str) -> TidemarkError {
    TidemarkError::StatementFailed(format!("{} \"{}\" already exists", kind, name))
}

/// Number of row tuples following `VALUES`.
fn count_value_rows(rest: &str) -> i64 {
    let lower = rest.to_ascii_lowercase();
    let Some(pos) = lower.find("values") else {
        return 1;
    };
    let mut depth = 0;
    let mut rows = 0;
    for ch in rest[pos + "values".len()..].chars() {
        match ch {
            '(' => {
                if depth == 0 {
                    rows += 1;
                }
                depth += 1;
            }
            ')' => depth -= 1,
            _ => {}
        }
    }
    rows.max(1)
}

impl Catalog {
    fn table_mut(&mut self, name: &str) -> Result<&mut Table> {
        self.tables.get_mut(name).ok_or_else(|| missing("relation", name))
    }

    fn relation_taken(&self, name: &str) -> bool {
        self.tables.contains_key(name)
            || self.views.contains(name)
            || self.indexes.contains_key(name)
            || self.sequences.contains(name)
    }

    fn apply(&mut self, sql: &str) -> Result<()> {
        if let Some(c) = CREATE_TABLE_RE.captures(sql) {
            let name = object_name(&c[2]);
            if self.relation_taken(&name) {
                return if c.get(1).is_some() {
                    Ok(())
                } else {
                    Err(duplicate("relation", &name))
                };
            }
            let columns = split_top_level(&c[3])
                .into_iter()
                .map(first_word)
                .filter(|w| !w.is_empty() && !is_constraint(w))
                .map(object_name)
                .collect();
            self.tables.insert(name, Table { columns, rows: 0 });
            return Ok(());
        }

        if let Some(c) = DROP_TABLE_RE.captures(sql) {
            let name = object_name(&c[2]);
            if self.tables.remove(&name).is_none() {
                return if c.get(1).is_some() {
                    Ok(())
                } else {
                    Err(missing("table", &name))
                };
            }
            self.indexes.retain(|_, table| table != &name);
            return Ok(());
        }

        if let Some(c) = ALTER_TABLE_RE.captures(sql) {
            let table = object_name(&c[1]);
            return self.alter_table(&table, c[2].trim());
        }

        if let Some(c) = CREATE_INDEX_RE.captures(sql) {
            let name = object_name(&c[2]);
            let table = object_name(&c[3]);
            if !self.tables.contains_key(&table) {
                return Err(missing("relation", &table));
            }
            if self.relation_taken(&name) {
                return if c.get(1).is_some() {
                    Ok(())
                } else {
                    Err(duplicate("relation", &name))
                };
            }
            self.indexes.insert(name, table);
            return Ok(());
        }

        if let Some(c) = DROP_INDEX_RE.captures(sql) {
            let name = object_name(&c[2]);
            if self.indexes.remove(&name).is_none() && c.get(1).is_none() {
                return Err(missing("index", &name));
            }
            return Ok(());
        }

        if let Some(c) = CREATE_VIEW_RE.captures(sql) {
            let name = object_name(&c[2]);
            let replace = c.get(1).is_some();
            if self.views.contains(&name) && !replace {
                return Err(duplicate("relation", &name));
            }
            if self.tables.contains_key(&name) {
                return Err(duplicate("relation", &name));
            }
            self.views.insert(name);
            return Ok(());
        }

        if let Some(c) = DROP_VIEW_RE.captures(sql) {
            let name = object_name(&c[2]);
            if !self.views.remove(&name) && c.get(1).is_none() {
                return Err(missing("view", &name));
            }
            return Ok(());
        }

        if let Some(c) = CREATE_SEQUENCE_RE.captures(sql) {
            let name = object_name(&c[2]);
            if self.relation_taken(&name) {
                return if c.get(1).is_some() {
                    Ok(())
                } else {
                    Err(duplicate("relation", &name))
                };
            }
            self.sequences.insert(name);
            return Ok(());
        }

        if let Some(c) = DROP_SEQUENCE_RE.captures(sql) {
            let name = object_name(&c[2]);
            if !self.sequences.remove(&name) && c.get(1).is_none() {
                return Err(missing("sequence", &name));
            }
            return Ok(());
        }

        if let Some(c) = INSERT_RE.captures(sql) {
            let name = object_name(&c[1]);
            let rows = count_value_rows(&c[2]);
            self.table_mut(&name)?.rows += rows;
            return Ok(());
        }

        if let Some(c) = DELETE_RE.captures(sql) {
            let name = object_name(&c[1]);
            let table = self.table_mut(&name)?;
            if c.get(2).is_none() {
                table.rows = 0;
            }
            return Ok(());
        }

        if let Some(c) = TRUNCATE_RE.captures(sql) {
            let name = object_name(&c[1]);
            self.table_mut(&name)?.rows = 0;
            return Ok(());
        }

        Ok(())
    }

    fn alter_table(&mut self, table: &str, action: &str) -> Result<()> {
        if let Some(c) = RENAME_TABLE_RE.captures(action) {
            let new_name = object_name(&c[1]);
            if self.relation_taken(&new_name) {
                return Err(duplicate("relation", &new_name));
            }
            let existing = self.tables.remove(table).ok_or_else(|| missing("relation", table))?;
            self.tables.insert(new_name.clone(), existing);
            for owner in self.indexes.values_mut() {
                if owner == table {
                    *owner = new_name.clone();
                }
            }
            return Ok(());
        }

        if let Some(c) = RENAME_COLUMN_RE.captures(action) {
            let old = object_name(&c[1]);
            let new = object_name(&c[2]);
            let t = self.table_mut(table)?;
            if t.columns.contains(&new) {
                return Err(duplicate("column", &new));
            }
            let slot = t
                .columns
                .iter_mut()
                .find(|col| **col == old)
                .ok_or_else(|| missing("column", &old))?;
            *slot = new;
            return Ok(());
        }

        if let Some(c) = ADD_COLUMN_RE.captures(action) {
            if is_constraint(&c[2]) {
                self.table_mut(table)?;
                return Ok(());
            }
            let column = object_name(&c[2]);
            let t = self.table_mut(table)?;
            if t.columns.contains(&column) {
                return if c.get(1).is_some() {
                    Ok(())
                } else {
                    Err(duplicate("column", &column))
                };
            }
            t.columns.push(column);
            return Ok(());
        }

        if let Some(c) = DROP_COLUMN_RE.captures(action) {
            if is_constraint(&c[2]) {
                self.table_mut(table)?;
                return Ok(());
            }
            let column = object_name(&c[2]);
            let t = self.table_mut(table)?;
            let before = t.columns.len();
            t.columns.retain(|col| *col != column);
            if t.columns.len() == before && c.get(1).is_none() {
                return Err(missing("column", &column));
            }
            return Ok(());
        }

        self.table_mut(table)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

#[async_trait]
impl Database for MemoryDatabase {
    fn info(&self) -> &DatabaseInfo {
        &self.info
    }

    async fn execute(&self, statement: &Statement) -> Result<()> {
        let delay = self.state().statement_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if state.disconnected {
            return Err(connection_lost("execute"));
        }
        state.executed.push(statement.sql().to_string());
        if let Some(pattern) = state.injected_failure(statement.sql()) {
            return Err(TidemarkError::StatementFailed(format!(
                "injected failure matching '{}'",
                pattern
            )));
        }

        // Apply to a copy so a failing multi-statement batch leaves no partial effect.
        let mut catalog = state.catalog.clone();
        for part in split_statements(statement.sql()) {
            let part = strip_leading_comments(part);
            if part.is_empty() {
                continue;
            }
            catalog.apply(part)?;
        }
        state.catalog = catalog;
        Ok(())
    }

    async fn begin(&self) -> Result<()> {
        let state = self.state();
        let mut snapshot = self.snapshot();
        if snapshot.is_none() {
            *snapshot = Some(Snapshot {
                catalog: state.catalog.clone(),
                ledger: state.ledger.clone(),
            });
        }
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        *self.snapshot() = None;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let mut state = self.state();
        if let Some(snapshot) = self.snapshot().take() {
            state.catalog = snapshot.catalog;
            state.ledger = snapshot.ledger;
        }
        Ok(())
    }

    async fn current_user(&self) -> Result<String> {
        Ok(self.state().user.clone())
    }

    async fn check_connection(&self) -> Result<()> {
        if self.state().disconnected {
            return Err(connection_lost("health check"));
        }
        Ok(())
    }

    async fn table_exists(&self, _schema: Option<&str>, table: &str) -> Result<bool> {
        Ok(self.has_table(table))
    }

    async fn column_exists(
        &self,
        _schema: Option<&str>,
        table: &str,
        column: &str,
    ) -> Result<bool> {
        Ok(self.has_column(table, column))
    }

    async fn view_exists(&self, _schema: Option<&str>, view: &str) -> Result<bool> {
        Ok(self.has_view(view))
    }

    async fn index_exists(&self, _schema: Option<&str>, index: &str) -> Result<bool> {
        Ok(self.has_index(index))
    }

    async fn sequence_exists(&self, _schema: Option<&str>, sequence: &str) -> Result<bool> {
        Ok(self.has_sequence(sequence))
    }

    async fn row_count(&self, _schema: Option<&str>, table: &str) -> Result<i64> {
        let name = object_name(table);
        let state = self.state();
        if let Some(pattern) = state.injected_failure(&name) {
            return Err(TidemarkError::StatementFailed(format!(
                "injected failure matching '{}'",
                pattern
            )));
        }
        state
            .catalog
            .tables
            .get(&name)
            .map(|t| t.rows)
            .ok_or_else(|| missing("relation", &name))
    }

    async fn query_scalar(&self, sql: &str) -> Result<Option<String>> {
        let state = self.state();
        if let Some(pattern) = state.injected_failure(sql) {
            return Err(TidemarkError::StatementFailed(format!(
                "injected failure matching '{}'",
                pattern
            )));
        }
        let sql = sql.trim().trim_end_matches(';').trim();
        if let Some(value) = state.scalars.get(sql) {
            return Ok(Some(value.clone()));
        }
        if let Some(c) = COUNT_RE.captures(sql) {
            let name = object_name(&c[1]);
            return state
                .catalog
                .tables
                .get(&name)
                .map(|t| Some(t.rows.to_string()))
                .ok_or_else(|| missing("relation", &name));
        }
        Err(TidemarkError::StatementFailed(format!(
            "query not supported by the in-memory backend: {}",
            sql
        )))
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

fn ledger_missing() -> TidemarkError {
    TidemarkError::StatementFailed("ledger table does not exist".to_string())
}

#[async_trait]
impl HistoryStore for MemoryDatabase {
    async fn table_exists(&self) -> Result<bool> {
        Ok(self.state().ledger.is_some())
    }

    async fn ensure_table(&self) -> Result<()> {
        self.state().ledger.get_or_insert_with(Vec::new);
        Ok(())
    }

    async fn load(&self) -> Result<Vec<RanChangeSet>> {
        let mut rows = self.state().ledger.clone().ok_or_else(ledger_missing)?;
        rows.sort_by(|a, b| {
            a.date_executed
                .cmp(&b.date_executed)
                .then(a.order_executed.cmp(&b.order_executed))
        });
        Ok(rows)
    }

    async fn insert(&self, row: &RanChangeSet) -> Result<()> {
        let mut state = self.state();
        if let Some(pattern) = state.injected_failure(&row.identity.to_string()) {
            return Err(TidemarkError::StatementFailed(format!(
                "injected failure matching '{}'",
                pattern
            )));
        }
        let ledger = state.ledger.as_mut().ok_or_else(ledger_missing)?;
        if ledger.iter().any(|r| r.identity == row.identity) {
            return Err(TidemarkError::StatementFailed(format!(
                "duplicate key value violates ledger primary key: {}",
                row.identity
            )));
        }
        ledger.push(row.clone());
        Ok(())
    }

    async fn update(&self, row: &RanChangeSet) -> Result<()> {
        let mut state = self.state();
        let ledger = state.ledger.as_mut().ok_or_else(ledger_missing)?;
        if let Some(existing) = ledger.iter_mut().find(|r| r.identity == row.identity) {
            *existing = row.clone();
        }
        Ok(())
    }

    async fn delete(&self, identity: &ChangeSetId) -> Result<()> {
        let mut state = self.state();
        let ledger = state.ledger.as_mut().ok_or_else(ledger_missing)?;
        ledger.retain(|r| &r.identity != identity);
        Ok(())
    }

    async fn update_checksum(&self, identity: &ChangeSetId, checksum: &CheckSum) -> Result<()> {
        let mut state = self.state();
        let ledger = state.ledger.as_mut().ok_or_else(ledger_missing)?;
        if let Some(row) = ledger.iter_mut().find(|r| &r.identity == identity) {
            row.checksum = Some(checksum.clone());
        }
        Ok(())
    }

    async fn clear_checksums(&self) -> Result<u64> {
        let mut state = self.state();
        let ledger = state.ledger.as_mut().ok_or_else(ledger_missing)?;
        for row in ledger.iter_mut() {
            row.checksum = None;
        }
        Ok(ledger.len() as u64)
    }

    async fn set_tag(&self, identity: &ChangeSetId, tag: &str) -> Result<()> {
        let mut state = self.state();
        let ledger = state.ledger.as_mut().ok_or_else(ledger_missing)?;
        if let Some(row) = ledger.iter_mut().find(|r| &r.identity == identity) {
            row.tag = Some(tag.to_string());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Lock
// ---------------------------------------------------------------------------

#[async_trait]
impl LockStore for MemoryDatabase {
    async fn ensure_table(&self) -> Result<()> {
        self.state().lock.get_or_insert_with(LockRecord::default);
        Ok(())
    }

    async fn try_acquire(&self, holder: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state();
        let lock = state.lock.get_or_insert_with(LockRecord::default);
        if lock.locked {
            return Ok(false);
        }
        *lock = LockRecord {
            locked: true,
            holder: Some(holder.to_string()),
            granted: Some(now),
        };
        Ok(true)
    }

    async fn reclaim(
        &self,
        previous: &LockRecord,
        holder: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state();
        let lock = state.lock.get_or_insert_with(LockRecord::default);
        if !lock.locked || lock != previous {
            return Ok(false);
        }
        lock.holder = Some(holder.to_string());
        lock.granted = Some(now);
        Ok(true)
    }

    async fn release(&self, holder: &str) -> Result<bool> {
        let mut state = self.state();
        match state.lock.as_mut() {
            Some(lock) if lock.locked && lock.holder.as_deref() == Some(holder) => {
                *lock = LockRecord::default();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn force_release(&self) -> Result<bool> {
        let mut state = self.state();
        match state.lock.as_mut() {
            Some(lock) if lock.locked => {
                *lock = LockRecord::default();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn current(&self) -> Result<LockRecord> {
        Ok(self.state().lock.clone().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(db: &MemoryDatabase, sql: &str) -> Result<()> {
        db.execute(&Statement::new(sql)).await
    }

    #[test]
    fn test_object_name_unquotes_and_folds() {
        assert_eq!(object_name(r#""public"."Users""#), "Users");
        assert_eq!(object_name("public.Users"), "users");
        assert_eq!(object_name(r#""orders""#), "orders");
    }

    #[test]
    fn test_split_statements_respects_literals() {
        let parts = split_statements("INSERT INTO t VALUES ('a;b'); SELECT 1;");
        assert_eq!(parts, vec!["INSERT INTO t VALUES ('a;b')", "SELECT 1"]);
    }

    #[tokio::test]
    async fn test_create_and_drop_table() {
        let db = MemoryDatabase::new();
        run(&db, r#"CREATE TABLE "users" ("id" BIGINT PRIMARY KEY, "email" TEXT NOT NULL, PRIMARY KEY (id))"#)
            .await
            .unwrap();
        assert!(db.has_table("users"));
        assert!(db.has_column("users", "email"));
        assert!(!db.has_column("users", "primary"));

        assert!(run(&db, "CREATE TABLE users (id INT)").await.is_err());
        run(&db, "CREATE TABLE IF NOT EXISTS users (id INT)").await.unwrap();

        run(&db, r#"DROP TABLE "users""#).await.unwrap();
        assert!(!db.has_table("users"));
        assert!(run(&db, "DROP TABLE users").await.is_err());
        run(&db, "DROP TABLE IF EXISTS users").await.unwrap();
    }

    #[tokio::test]
    async fn test_alter_table_columns() {
        let db = MemoryDatabase::new();
        run(&db, "CREATE TABLE t (a INT)").await.unwrap();
        run(&db, "ALTER TABLE t ADD COLUMN b TEXT").await.unwrap();
        assert!(db.has_column("t", "b"));
        run(&db, r#"ALTER TABLE "t" RENAME COLUMN "b" TO "c""#).await.unwrap();
        assert!(db.has_column("t", "c"));
        run(&db, "ALTER TABLE t DROP COLUMN c").await.unwrap();
        assert!(!db.has_column("t", "c"));
        assert!(run(&db, "ALTER TABLE t DROP COLUMN c").await.is_err());
        run(&db, "ALTER TABLE t RENAME TO u").await.unwrap();
        assert!(db.has_table("u"));
        assert!(!db.has_table("t"));
    }

    #[tokio::test]
    async fn test_indexes_views_sequences() {
        let db = MemoryDatabase::new();
        run(&db, "CREATE TABLE t (a INT); CREATE INDEX idx_a ON t (a)").await.unwrap();
        assert!(db.has_index("idx_a"));
        run(&db, "CREATE VIEW v AS SELECT a FROM t").await.unwrap();
        assert!(db.has_view("v"));
        assert!(run(&db, "CREATE VIEW v AS SELECT 1").await.is_err());
        run(&db, "CREATE OR REPLACE VIEW v AS SELECT 1").await.unwrap();
        run(&db, "CREATE SEQUENCE s START WITH 1").await.unwrap();
        assert!(db.has_sequence("s"));
        run(&db, "DROP TABLE t").await.unwrap();
        assert!(!db.has_index("idx_a"));
    }

    #[tokio::test]
    async fn test_failed_batch_leaves_no_partial_effect() {
        let db = MemoryDatabase::new();
        let err = run(&db, "CREATE TABLE a (x INT); DROP TABLE missing").await;
        assert!(err.is_err());
        assert!(!db.has_table("a"));
    }

    #[tokio::test]
    async fn test_row_counts() {
        let db = MemoryDatabase::new();
        run(&db, "CREATE TABLE t (a INT)").await.unwrap();
        run(&db, "INSERT INTO t (a) VALUES (1), (2)").await.unwrap();
        assert_eq!(db.row_count(None, "t").await.unwrap(), 2);
        assert_eq!(
            db.query_scalar("SELECT COUNT(*) FROM t").await.unwrap().as_deref(),
            Some("2")
        );
        run(&db, "DELETE FROM t").await.unwrap();
        assert_eq!(db.row_count(None, "t").await.unwrap(), 0);
        assert!(db.row_count(None, "missing").await.is_err());
    }

    #[tokio::test]
    async fn test_insert_with_non_ascii_literals() {
        let db = MemoryDatabase::new();
        run(&db, "CREATE TABLE t (a TEXT)").await.unwrap();
        run(&db, "INSERT INTO t (a) SELECT 'İİİİ' AS values_x").await.unwrap();
        run(&db, "INSERT INTO t (a) VALUES ('İstanbul'), ('Ærø')").await.unwrap();
        assert_eq!(db.row_count(None, "t").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_transaction_rollback_restores_catalog() {
        let db = MemoryDatabase::new();
        db.begin().await.unwrap();
        run(&db, "CREATE TABLE t (a INT)").await.unwrap();
        db.rollback().await.unwrap();
        assert!(!db.has_table("t"));

        db.begin().await.unwrap();
        run(&db, "CREATE TABLE t (a INT)").await.unwrap();
        db.commit().await.unwrap();
        db.rollback().await.unwrap();
        assert!(db.has_table("t"));
    }

    #[tokio::test]
    async fn test_sessions_share_state() {
        let db = MemoryDatabase::new();
        let other = db.connect();
        run(&db, "CREATE TABLE t (a INT)").await.unwrap();
        assert!(other.has_table("t"));
        // a rollback on another session does not touch this one's snapshot
        other.rollback().await.unwrap();
        assert!(db.has_table("t"));
    }

    #[tokio::test]
    async fn test_injected_failure_and_scalars() {
        let db = MemoryDatabase::new();
        db.fail_on("boom");
        assert!(run(&db, "SELECT 'BOOM'").await.is_err());
        db.set_scalar("SELECT setting", "on");
        assert_eq!(
            db.query_scalar("SELECT setting;").await.unwrap().as_deref(),
            Some("on")
        );
        assert!(db.query_scalar("SELECT whatever").await.is_err());
        assert_eq!(db.executed_statements(), vec!["SELECT 'BOOM'".to_string()]);
    }
}
