//! The change set model: identity, changes, run policy and rollback definition.

use std::fmt;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};

use crate::change::{Change, Statement};
use crate::checksum::{CheckSum, ChecksumVersion, ValidCheckSum};
use crate::error::{Result, TidemarkError};
use crate::expression::Expression;
use crate::precondition::PreconditionContainer;

/// Maximum length of the ledger's description column.
const MAX_DESCRIPTION_LEN: usize = 255;

/// The durable identity of a change set: `(id, author, logical path)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChangeSetId {
    pub id: String,
    pub author: String,
    pub path: String,
}

impl ChangeSetId {
    pub fn new(id: &str, author: &str, path: &str) -> Self {
        Self {
            id: id.to_string(),
            author: author.to_string(),
            path: path.to_string(),
        }
    }
}

impl fmt::Display for ChangeSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}::{}", self.path, self.id, self.author)
    }
}

/// How a change set is undone.
#[derive(Debug, Clone, Default)]
pub enum RollbackDefinition {
    /// Ask each change for its inverse, last change first.
    #[default]
    Derived,
    /// Nothing needs to be undone.
    Empty,
    /// Run these changes instead.
    Changes(Vec<Arc<dyn Change>>),
}

/// What to do when a change rejects its own definition during validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationFailAction {
    #[default]
    Halt,
    MarkRan,
}

impl std::str::FromStr for ValidationFailAction {
    type Err = TidemarkError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "HALT" => Ok(ValidationFailAction::Halt),
            "MARK_RAN" => Ok(ValidationFailAction::MarkRan),
            _ => Err(TidemarkError::ChangelogParseError(format!(
                "Invalid on_validation_fail '{}'. Use HALT or MARK_RAN.",
                s
            ))),
        }
    }
}

/// One atomically identified unit of change.
#[derive(Debug, Clone)]
pub struct ChangeSet {
    identity: ChangeSetId,
    changes: Vec<Arc<dyn Change>>,
    rollback: RollbackDefinition,
    preconditions: Option<PreconditionContainer>,
    run_always: bool,
    run_on_change: bool,
    fail_on_error: bool,
    run_in_transaction: bool,
    contexts: Expression,
    labels: Expression,
    dbms: Expression,
    comments: Option<String>,
    valid_checksums: Vec<ValidCheckSum>,
    on_validation_fail: ValidationFailAction,
    checksum: OnceLock<CheckSum>,
}

impl ChangeSet {
    pub fn new(id: &str, author: &str, path: &str) -> Self {
        Self {
            identity: ChangeSetId::new(id, author, path),
            changes: Vec::new(),
            rollback: RollbackDefinition::Derived,
            preconditions: None,
            run_always: false,
            run_on_change: false,
            fail_on_error: true,
            run_in_transaction: true,
            contexts: Expression::default(),
            labels: Expression::default(),
            dbms: Expression::default(),
            comments: None,
            valid_checksums: Vec::new(),
            on_validation_fail: ValidationFailAction::Halt,
            checksum: OnceLock::new(),
        }
    }

    // ── builders ──

    pub fn with_change(mut self, change: Arc<dyn Change>) -> Self {
        self.add_change(change);
        self
    }

    pub fn with_rollback(mut self, rollback: RollbackDefinition) -> Self {
        self.rollback = rollback;
        self
    }

    pub fn with_preconditions(mut self, preconditions: PreconditionContainer) -> Self {
        self.preconditions = Some(preconditions);
        self
    }

    pub fn with_run_always(mut self, value: bool) -> Self {
        self.run_always = value;
        self
    }

    pub fn with_run_on_change(mut self, value: bool) -> Self {
        self.run_on_change = value;
        self
    }

    pub fn with_fail_on_error(mut self, value: bool) -> Self {
        self.fail_on_error = value;
        self
    }

    pub fn with_run_in_transaction(mut self, value: bool) -> Self {
        self.run_in_transaction = value;
        self
    }

    pub fn with_contexts(mut self, contexts: Expression) -> Self {
        self.contexts = contexts;
        self
    }

    pub fn with_labels(mut self, labels: Expression) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_dbms(mut self, dbms: Expression) -> Self {
        self.dbms = dbms;
        self
    }

    pub fn with_comments(mut self, comments: &str) -> Self {
        self.comments = Some(comments.to_string());
        self
    }

    pub fn with_valid_checksums(mut self, sums: Vec<ValidCheckSum>) -> Self {
        self.valid_checksums = sums;
        self
    }

    pub fn with_on_validation_fail(mut self, action: ValidationFailAction) -> Self {
        self.on_validation_fail = action;
        self
    }

    /// Append a change. Drops the cached checksum.
    pub fn add_change(&mut self, change: Arc<dyn Change>) {
        self.changes.push(change);
        self.checksum = OnceLock::new();
    }

    /// Replace every change. Drops the cached checksum.
    pub fn set_changes(&mut self, changes: Vec<Arc<dyn Change>>) {
        self.changes = changes;
        self.checksum = OnceLock::new();
    }

    // ── accessors ──

    pub fn identity(&self) -> &ChangeSetId {
        &self.identity
    }

    pub fn changes(&self) -> &[Arc<dyn Change>] {
        &self.changes
    }

    pub fn rollback(&self) -> &RollbackDefinition {
        &self.rollback
    }

    pub fn preconditions(&self) -> Option<&PreconditionContainer> {
        self.preconditions.as_ref()
    }

    pub fn run_always(&self) -> bool {
        self.run_always
    }

    pub fn run_on_change(&self) -> bool {
        self.run_on_change
    }

    pub fn fail_on_error(&self) -> bool {
        self.fail_on_error
    }

    pub fn run_in_transaction(&self) -> bool {
        self.run_in_transaction
    }

    pub fn contexts(&self) -> &Expression {
        &self.contexts
    }

    pub fn labels(&self) -> &Expression {
        &self.labels
    }

    pub fn dbms(&self) -> &Expression {
        &self.dbms
    }

    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }

    pub fn valid_checksums(&self) -> &[ValidCheckSum] {
        &self.valid_checksums
    }

    pub fn on_validation_fail(&self) -> ValidationFailAction {
        self.on_validation_fail
    }

    // ── derived values ──

    /// The current-version checksum, computed once and cached.
    pub fn checksum(&self) -> &CheckSum {
        self.checksum.get_or_init(|| {
            let version = ChecksumVersion::latest();
            CheckSum::compute(version, &self.checksum_source(version))
        })
    }

    /// The checksum under a specific algorithm version.
    pub fn checksum_with(&self, version: ChecksumVersion) -> CheckSum {
        if version == ChecksumVersion::latest() {
            return self.checksum().clone();
        }
        CheckSum::compute(version, &self.checksum_source(version))
    }

    fn checksum_source(&self, version: ChecksumVersion) -> String {
        let changes: Vec<String> = self
            .changes
            .iter()
            .map(|c| format!("{}:{}", c.kind(), c.payload()))
            .collect();
        match version {
            ChecksumVersion::V1 => changes.join(";"),
            ChecksumVersion::V2 => {
                let mut source = self.identity.to_string();
                for line in changes {
                    source.push('\n');
                    source.push_str(&line);
                }
                source
            }
        }
    }

    /// Whether a stored digest is explicitly tolerated by `valid_checksums`.
    pub fn accepts_checksum(&self, stored: &CheckSum) -> bool {
        self.valid_checksums.iter().any(|v| v.accepts(stored))
    }

    /// Summary of the changes for the ledger.
    pub fn description(&self) -> String {
        if self.changes.is_empty() {
            return "empty".to_string();
        }
        let full = self
            .changes
            .iter()
            .map(|c| c.describe())
            .collect::<Vec<_>>()
            .join("; ");
        truncate(&full, MAX_DESCRIPTION_LEN)
    }

    /// Tag declared by a `tagDatabase` change, if any.
    pub fn tag(&self) -> Option<&str> {
        self.changes.iter().find_map(|c| c.tag())
    }

    /// Forward statements of every change, in declared order.
    pub fn forward_statements(&self) -> Vec<Statement> {
        self.changes.iter().flat_map(|c| c.forward()).collect()
    }

    /// Statements that undo this change set.
    ///
    /// Derived rollback fails on the first change without an inverse.
    pub fn rollback_statements(&self) -> std::result::Result<Vec<Statement>, String> {
        match &self.rollback {
            RollbackDefinition::Empty => Ok(Vec::new()),
            RollbackDefinition::Changes(changes) => {
                Ok(changes.iter().flat_map(|c| c.forward()).collect())
            }
            RollbackDefinition::Derived => {
                let mut statements = Vec::new();
                for change in self.changes.iter().rev() {
                    match change.invert() {
                        Some(inverse) => statements.extend(inverse),
                        None => {
                            return Err(format!(
                                "change '{}' has no automatic inverse and no explicit rollback is defined",
                                change.describe()
                            ))
                        }
                    }
                }
                Ok(statements)
            }
        }
    }

    /// Problems reported by the changes themselves.
    pub fn change_problems(&self) -> Vec<String> {
        let mut problems: Vec<String> = self
            .changes
            .iter()
            .flat_map(|c| {
                c.validate()
                    .into_iter()
                    .map(move |p| format!("{}: {}", c.kind(), p))
            })
            .collect();
        if let RollbackDefinition::Changes(changes) = &self.rollback {
            problems.extend(changes.iter().flat_map(|c| {
                c.validate()
                    .into_iter()
                    .map(move |p| format!("rollback {}: {}", c.kind(), p))
            }));
        }
        problems
    }

    /// Why this change set is excluded from a run, or `None` when it applies.
    pub fn filter_reason(
        &self,
        contexts: &[String],
        labels: &[String],
        dialect: &str,
    ) -> Option<String> {
        if !self.contexts.matches(contexts) {
            return Some(format!(
                "context '{}' does not match [{}]",
                self.contexts,
                contexts.join(", ")
            ));
        }
        if !self.labels.matches(labels) {
            return Some(format!(
                "labels '{}' do not match [{}]",
                self.labels,
                labels.join(", ")
            ));
        }
        if !self.dbms.matches(&[dialect.to_string()]) {
            return Some(format!("dbms '{}' excludes {}", self.dbms, dialect));
        }
        None
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max - 3;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

/// Parse an optional filter expression attribute.
pub fn parse_expression(value: Option<&str>) -> Result<Expression> {
    Expression::parse(value.unwrap_or(""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changes::{ColumnDef, CreateTable, DropTable, Sql, TagDatabase};

    fn create_users() -> Arc<dyn Change> {
        Arc::new(CreateTable::new(
            "users",
            vec![ColumnDef::new("id", "BIGINT").primary_key()],
        ))
    }

    #[test]
    fn test_identity_display() {
        let cs = ChangeSet::new("1", "alice", "db/main.toml");
        assert_eq!(cs.identity().to_string(), "db/main.toml::1::alice");
    }

    #[test]
    fn test_identical_content_hashes_identically() {
        let a = ChangeSet::new("1", "alice", "p").with_change(create_users());
        let b = ChangeSet::new("1", "alice", "p").with_change(create_users());
        assert_eq!(a.checksum(), b.checksum());
    }

    #[test]
    fn test_identity_is_part_of_checksum() {
        let a = ChangeSet::new("1", "alice", "p").with_change(create_users());
        let b = ChangeSet::new("2", "alice", "p").with_change(create_users());
        assert_ne!(a.checksum(), b.checksum());
    }

    #[test]
    fn test_change_order_matters() {
        let one: Arc<dyn Change> = Arc::new(Sql::new("SELECT 1"));
        let two: Arc<dyn Change> = Arc::new(Sql::new("SELECT 2"));
        let a = ChangeSet::new("1", "a", "p")
            .with_change(one.clone())
            .with_change(two.clone());
        let b = ChangeSet::new("1", "a", "p").with_change(two).with_change(one);
        assert_ne!(a.checksum(), b.checksum());
    }

    #[test]
    fn test_adding_change_invalidates_cache() {
        let mut cs = ChangeSet::new("1", "alice", "p").with_change(create_users());
        let before = cs.checksum().clone();
        cs.add_change(Arc::new(Sql::new("SELECT 1")));
        assert_ne!(&before, cs.checksum());
    }

    #[test]
    fn test_run_flags_do_not_affect_checksum() {
        let a = ChangeSet::new("1", "alice", "p").with_change(create_users());
        let b = ChangeSet::new("1", "alice", "p")
            .with_change(create_users())
            .with_run_on_change(true);
        assert_eq!(a.checksum(), b.checksum());
    }

    #[test]
    fn test_derived_rollback() {
        let cs = ChangeSet::new("1", "alice", "p").with_change(create_users());
        let statements = cs.rollback_statements().unwrap();
        assert_eq!(statements.len(), 1);
        assert_eq!(statements[0].sql(), r#"DROP TABLE "users""#);
    }

    #[test]
    fn test_derived_rollback_unsupported() {
        let cs = ChangeSet::new("1", "alice", "p").with_change(Arc::new(DropTable {
            schema: None,
            table: "users".to_string(),
            cascade: false,
        }));
        let err = cs.rollback_statements().unwrap_err();
        assert!(err.contains("dropTable users"));
    }

    #[test]
    fn test_explicit_rollback_wins() {
        let cs = ChangeSet::new("1", "alice", "p")
            .with_change(Arc::new(Sql::new("UPDATE t SET a = 1")))
            .with_rollback(RollbackDefinition::Changes(vec![Arc::new(Sql::new(
                "UPDATE t SET a = 0",
            ))]));
        let statements = cs.rollback_statements().unwrap();
        assert_eq!(statements[0].sql(), "UPDATE t SET a = 0");
    }

    #[test]
    fn test_empty_rollback_is_noop() {
        let cs = ChangeSet::new("1", "alice", "p")
            .with_change(Arc::new(Sql::new("UPDATE t SET a = 1")))
            .with_rollback(RollbackDefinition::Empty);
        assert!(cs.rollback_statements().unwrap().is_empty());
    }

    #[test]
    fn test_tag_from_tag_database_change() {
        let cs = ChangeSet::new("1", "alice", "p").with_change(Arc::new(TagDatabase {
            tag: "v1.0".to_string(),
        }));
        assert_eq!(cs.tag(), Some("v1.0"));
        assert!(cs.forward_statements().is_empty());
    }

    #[test]
    fn test_filter_reason() {
        let cs = ChangeSet::new("1", "alice", "p")
            .with_contexts(Expression::parse("dev").unwrap())
            .with_dbms(Expression::parse("postgresql").unwrap());
        assert!(cs.filter_reason(&[], &[], "postgresql").is_none());
        assert!(cs
            .filter_reason(&["prod".to_string()], &[], "postgresql")
            .unwrap()
            .contains("context"));
        assert!(cs
            .filter_reason(&[], &[], "mysql")
            .unwrap()
            .contains("dbms"));
    }

    #[test]
    fn test_description_truncated() {
        let long = "x".repeat(400);
        let mut cs = ChangeSet::new("1", "a", "p");
        for _ in 0..10 {
            cs.add_change(Arc::new(Sql::new(&long)));
        }
        assert!(cs.description().len() <= MAX_DESCRIPTION_LEN);
        assert_eq!(ChangeSet::new("1", "a", "p").description(), "empty");
    }

    #[test]
    fn test_change_problems_are_prefixed() {
        let cs = ChangeSet::new("1", "a", "p").with_change(Arc::new(Sql::new("  ")));
        let problems = cs.change_problems();
        assert_eq!(problems, vec!["sql: sql is required".to_string()]);
    }
}
