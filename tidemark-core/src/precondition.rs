//! Precondition trees and the policy container that gates a change set or changelog.
//!
//! Every node yields an [`Evaluation`]: pass, fail (the fact was checked and
//! is false) or error (the fact could not be checked). The two negative
//! outcomes are kept apart because the container applies a different policy
//! to each. Composite nodes evaluate every child so that one pass reports
//! every reason at once.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::changeset::ChangeSetId;
use crate::db::Database;
use crate::error::{Result, TidemarkError};
use crate::expression::Expression;
use crate::history::RanChangeSet;

/// What the container does with a failed or erroring tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PreconditionAction {
    /// Abort the whole pass.
    #[default]
    Halt,
    /// Skip the owner without recording it.
    Continue,
    /// Record the owner as run without executing it.
    MarkRan,
    /// Log and proceed as if the tree had passed.
    Warn,
}

impl std::str::FromStr for PreconditionAction {
    type Err = TidemarkError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "HALT" => Ok(PreconditionAction::Halt),
            "CONTINUE" => Ok(PreconditionAction::Continue),
            "MARK_RAN" => Ok(PreconditionAction::MarkRan),
            "WARN" => Ok(PreconditionAction::Warn),
            _ => Err(TidemarkError::ChangelogParseError(format!(
                "Invalid precondition action '{}'. Use HALT, CONTINUE, MARK_RAN or WARN.",
                s
            ))),
        }
    }
}

/// A user-supplied check. Returning `Ok(false)` is a failure, `Err` an error.
#[async_trait]
pub trait CustomPrecondition: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    async fn check(&self, database: &dyn Database) -> Result<bool>;
}

/// A node of the precondition tree.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precondition {
    And(Vec<Precondition>),
    Or(Vec<Precondition>),
    Not(Box<Precondition>),
    TableExists {
        #[serde(default)]
        schema: Option<String>,
        table: String,
    },
    ColumnExists {
        #[serde(default)]
        schema: Option<String>,
        table: String,
        column: String,
    },
    ViewExists {
        #[serde(default)]
        schema: Option<String>,
        view: String,
    },
    IndexExists {
        #[serde(default)]
        schema: Option<String>,
        index: String,
    },
    SequenceExists {
        #[serde(default)]
        schema: Option<String>,
        sequence: String,
    },
    RowCount {
        #[serde(default)]
        schema: Option<String>,
        table: String,
        expected: i64,
    },
    /// First column of the first row must equal `expected` (compared as text).
    SqlCheck { sql: String, expected: String },
    RunningAs { username: String },
    /// The backend dialect must match this expression (e.g. `postgresql, h2`).
    Dbms {
        #[serde(rename = "type")]
        dbms: String,
    },
    ChangeSetExecuted {
        id: String,
        author: String,
        path: String,
    },
    #[serde(skip)]
    Custom(Arc<dyn CustomPrecondition>),
}

impl fmt::Display for Precondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Precondition::And(children) => write!(f, "and({})", join(children)),
            Precondition::Or(children) => write!(f, "or({})", join(children)),
            Precondition::Not(inner) => write!(f, "not({})", inner),
            Precondition::TableExists { table, .. } => write!(f, "table_exists({})", table),
            Precondition::ColumnExists { table, column, .. } => {
                write!(f, "column_exists({}.{})", table, column)
            }
            Precondition::ViewExists { view, .. } => write!(f, "view_exists({})", view),
            Precondition::IndexExists { index, .. } => write!(f, "index_exists({})", index),
            Precondition::SequenceExists { sequence, .. } => {
                write!(f, "sequence_exists({})", sequence)
            }
            Precondition::RowCount {
                table, expected, ..
            } => write!(f, "row_count({}) = {}", table, expected),
            Precondition::SqlCheck { sql, expected } => {
                write!(f, "sql_check({}) = {}", sql, expected)
            }
            Precondition::RunningAs { username } => write!(f, "running_as({})", username),
            Precondition::Dbms { dbms } => write!(f, "dbms({})", dbms),
            Precondition::ChangeSetExecuted { id, author, path } => {
                write!(f, "change_set_executed({}::{}::{})", path, id, author)
            }
            Precondition::Custom(custom) => write!(f, "custom({})", custom.name()),
        }
    }
}

fn join(children: &[Precondition]) -> String {
    children
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Three-valued outcome of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Pass,
    Fail,
    Error,
}

/// Result of evaluating a node, with every reason collected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Evaluation {
    pub failures: Vec<String>,
    pub errors: Vec<String>,
}

impl Evaluation {
    pub fn pass() -> Self {
        Self::default()
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            failures: vec![reason.into()],
            errors: Vec::new(),
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            failures: Vec::new(),
            errors: vec![reason.into()],
        }
    }

    /// Errors dominate failures.
    pub fn outcome(&self) -> Outcome {
        if !self.errors.is_empty() {
            Outcome::Error
        } else if !self.failures.is_empty() {
            Outcome::Fail
        } else {
            Outcome::Pass
        }
    }

    fn absorb(&mut self, other: Evaluation) {
        self.failures.extend(other.failures);
        self.errors.extend(other.errors);
    }

    fn from_check(result: Result<bool>, failure: impl FnOnce() -> String, node: &Precondition) -> Self {
        match result {
            Ok(true) => Evaluation::pass(),
            Ok(false) => Evaluation::fail(failure()),
            Err(e) => Evaluation::error(format!("{}: {}", node, e)),
        }
    }
}

/// What a leaf may look at.
pub struct EvalContext<'a> {
    pub database: &'a dyn Database,
    /// Ledger rows as of the start of the pass.
    pub ran: &'a [RanChangeSet],
}

impl Precondition {
    /// Evaluate this node and all of its children.
    pub async fn evaluate(&self, ctx: &EvalContext<'_>) -> Evaluation {
        eval_node(self, ctx).await
    }
}

fn eval_node<'a>(
    node: &'a Precondition,
    ctx: &'a EvalContext<'a>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Evaluation> + Send + 'a>> {
    Box::pin(async move {
        let db = ctx.database;
        match node {
            Precondition::And(children) => {
                let mut combined = Evaluation::pass();
                for child in children {
                    combined.absorb(eval_node(child, ctx).await);
                }
                combined
            }

            Precondition::Or(children) => {
                let mut combined = Evaluation::pass();
                let mut any_passed = false;
                for child in children {
                    let eval = eval_node(child, ctx).await;
                    any_passed |= eval.outcome() == Outcome::Pass;
                    combined.absorb(eval);
                }
                if combined.outcome() == Outcome::Error {
                    combined
                } else if any_passed || children.is_empty() {
                    Evaluation::pass()
                } else {
                    combined
                }
            }

            Precondition::Not(inner) => {
                let eval = eval_node(inner, ctx).await;
                match eval.outcome() {
                    Outcome::Error => eval,
                    Outcome::Fail => Evaluation::pass(),
                    Outcome::Pass => Evaluation::fail(format!("{} holds", inner)),
                }
            }

            Precondition::TableExists { schema, table } => Evaluation::from_check(
                db.table_exists(schema.as_deref(), table).await,
                || format!("table {} does not exist", table),
                node,
            ),

            Precondition::ColumnExists {
                schema,
                table,
                column,
            } => Evaluation::from_check(
                db.column_exists(schema.as_deref(), table, column).await,
                || format!("column {}.{} does not exist", table, column),
                node,
            ),

            Precondition::ViewExists { schema, view } => Evaluation::from_check(
                db.view_exists(schema.as_deref(), view).await,
                || format!("view {} does not exist", view),
                node,
            ),

            Precondition::IndexExists { schema, index } => Evaluation::from_check(
                db.index_exists(schema.as_deref(), index).await,
                || format!("index {} does not exist", index),
                node,
            ),

            Precondition::SequenceExists { schema, sequence } => Evaluation::from_check(
                db.sequence_exists(schema.as_deref(), sequence).await,
                || format!("sequence {} does not exist", sequence),
                node,
            ),

            Precondition::RowCount {
                schema,
                table,
                expected,
            } => match db.row_count(schema.as_deref(), table).await {
                Ok(count) if count == *expected => Evaluation::pass(),
                Ok(count) => Evaluation::fail(format!(
                    "table {} has {} rows, expected {}",
                    table, count, expected
                )),
                Err(e) => Evaluation::error(format!("{}: {}", node, e)),
            },

            Precondition::SqlCheck { sql, expected } => match db.query_scalar(sql).await {
                Ok(value) => {
                    let actual = value.unwrap_or_default();
                    if actual.trim() == expected.trim() {
                        Evaluation::pass()
                    } else {
                        Evaluation::fail(format!(
                            "'{}' returned '{}', expected '{}'",
                            sql, actual, expected
                        ))
                    }
                }
                Err(e) => Evaluation::error(format!("{}: {}", node, e)),
            },

            Precondition::RunningAs { username } => match db.current_user().await {
                Ok(user) if user.eq_ignore_ascii_case(username) => Evaluation::pass(),
                Ok(user) => Evaluation::fail(format!(
                    "running as {}, expected {}",
                    user, username
                )),
                Err(e) => Evaluation::error(format!("{}: {}", node, e)),
            },

            Precondition::Dbms { dbms } => match Expression::parse(dbms) {
                Ok(expr) => {
                    let dialect = db.info().dialect.clone();
                    if expr.matches(&[dialect.clone()]) {
                        Evaluation::pass()
                    } else {
                        Evaluation::fail(format!("dbms is {}, expected {}", dialect, dbms))
                    }
                }
                Err(e) => Evaluation::error(format!("{}: {}", node, e)),
            },

            Precondition::ChangeSetExecuted { id, author, path } => {
                let identity = ChangeSetId::new(id, author, path);
                if ctx.ran.iter().any(|r| r.identity == identity) {
                    Evaluation::pass()
                } else {
                    Evaluation::fail(format!("change set {} has not been executed", identity))
                }
            }

            Precondition::Custom(custom) => match custom.check(db).await {
                Ok(true) => Evaluation::pass(),
                Ok(false) => Evaluation::fail(format!("custom precondition {} failed", custom.name())),
                Err(e) => Evaluation::error(format!("{}: {}", node, e)),
            },
        }
    })
}

/// Decision reached by a container.
#[derive(Debug)]
pub enum Verdict {
    Proceed,
    /// Skip the owner; nothing is recorded.
    Skip(String),
    /// Record the owner as MARK_RAN without executing it.
    MarkRan(String),
    Halt(TidemarkError),
}

/// A tree (its top-level checks are ANDed) plus the policies applied to its outcome.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PreconditionContainer {
    #[serde(default)]
    pub on_fail: PreconditionAction,
    #[serde(default)]
    pub on_error: PreconditionAction,
    #[serde(default)]
    pub on_fail_message: Option<String>,
    #[serde(default)]
    pub on_error_message: Option<String>,
    #[serde(default)]
    pub checks: Vec<Precondition>,
}

impl PreconditionContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, precondition: Precondition) -> Self {
        self.checks.push(precondition);
        self
    }

    pub fn on_fail(mut self, action: PreconditionAction) -> Self {
        self.on_fail = action;
        self
    }

    pub fn on_error(mut self, action: PreconditionAction) -> Self {
        self.on_error = action;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// AND another container's checks into this one. This container's policies are kept.
    pub fn merge(&mut self, other: PreconditionContainer) {
        self.checks.extend(other.checks);
    }

    /// Evaluate every check and apply the matching policy.
    pub async fn check(&self, target: &str, ctx: &EvalContext<'_>) -> Verdict {
        if self.checks.is_empty() {
            return Verdict::Proceed;
        }
        let mut eval = Evaluation::pass();
        for check in &self.checks {
            eval.absorb(check.evaluate(ctx).await);
        }

        match eval.outcome() {
            Outcome::Pass => Verdict::Proceed,
            Outcome::Error => {
                let reason = self
                    .on_error_message
                    .clone()
                    .unwrap_or_else(|| eval.errors.join("; "));
                self.apply(self.on_error, target, reason, true)
            }
            Outcome::Fail => {
                let reason = self
                    .on_fail_message
                    .clone()
                    .unwrap_or_else(|| eval.failures.join("; "));
                self.apply(self.on_fail, target, reason, false)
            }
        }
    }

    fn apply(&self, action: PreconditionAction, target: &str, reason: String, is_error: bool) -> Verdict {
        match action {
            PreconditionAction::Halt if is_error => Verdict::Halt(TidemarkError::PreconditionError {
                target: target.to_string(),
                reason,
            }),
            PreconditionAction::Halt => Verdict::Halt(TidemarkError::PreconditionFailed {
                target: target.to_string(),
                reason,
            }),
            PreconditionAction::Continue => {
                log::info!("Precondition not met, skipping; target={}, reason={}", target, reason);
                Verdict::Skip(reason)
            }
            PreconditionAction::MarkRan => {
                log::info!("Precondition not met, marking ran; target={}, reason={}", target, reason);
                Verdict::MarkRan(reason)
            }
            PreconditionAction::Warn => {
                log::warn!("Precondition not met, continuing; target={}, reason={}", target, reason);
                Verdict::Proceed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::Statement;
    use crate::memory::MemoryDatabase;

    #[derive(Debug)]
    struct Broken;

    #[async_trait]
    impl CustomPrecondition for Broken {
        fn name(&self) -> &str {
            "broken"
        }
        async fn check(&self, _database: &dyn Database) -> Result<bool> {
            Err(TidemarkError::StatementFailed("check target unreachable".to_string()))
        }
    }

    fn table(name: &str) -> Precondition {
        Precondition::TableExists {
            schema: None,
            table: name.to_string(),
        }
    }

    async fn db_with_users() -> MemoryDatabase {
        let db = MemoryDatabase::new();
        db.execute(&Statement::new("CREATE TABLE users (id INT)"))
            .await
            .unwrap();
        db
    }

    async fn eval(db: &MemoryDatabase, p: &Precondition) -> Evaluation {
        let ctx = EvalContext {
            database: db,
            ran: &[],
        };
        p.evaluate(&ctx).await
    }

    #[tokio::test]
    async fn test_leaf_pass_and_fail() {
        let db = db_with_users().await;
        assert_eq!(eval(&db, &table("users")).await.outcome(), Outcome::Pass);
        let e = eval(&db, &table("orders")).await;
        assert_eq!(e.outcome(), Outcome::Fail);
        assert_eq!(e.failures, vec!["table orders does not exist".to_string()]);
    }

    #[tokio::test]
    async fn test_not_inverts_fail_and_pass() {
        let db = db_with_users().await;
        let not_orders = Precondition::Not(Box::new(table("orders")));
        assert_eq!(eval(&db, &not_orders).await.outcome(), Outcome::Pass);
        let not_users = Precondition::Not(Box::new(table("users")));
        assert_eq!(eval(&db, &not_users).await.outcome(), Outcome::Fail);
    }

    #[tokio::test]
    async fn test_not_propagates_error() {
        let db = db_with_users().await;
        let p = Precondition::Not(Box::new(Precondition::Custom(Arc::new(Broken))));
        let e = eval(&db, &p).await;
        assert_eq!(e.outcome(), Outcome::Error);
        assert!(e.errors[0].contains("check target unreachable"));
    }

    #[tokio::test]
    async fn test_and_collects_every_failure() {
        let db = db_with_users().await;
        let p = Precondition::And(vec![table("a"), table("users"), table("b")]);
        let e = eval(&db, &p).await;
        assert_eq!(e.outcome(), Outcome::Fail);
        assert_eq!(e.failures.len(), 2);
    }

    #[tokio::test]
    async fn test_or_passes_on_any_pass() {
        let db = db_with_users().await;
        let p = Precondition::Or(vec![table("a"), table("users")]);
        assert_eq!(eval(&db, &p).await.outcome(), Outcome::Pass);
        let p = Precondition::Or(vec![table("a"), table("b")]);
        let e = eval(&db, &p).await;
        assert_eq!(e.outcome(), Outcome::Fail);
        assert_eq!(e.failures.len(), 2);
    }

    #[tokio::test]
    async fn test_or_error_dominates() {
        let db = db_with_users().await;
        let p = Precondition::Or(vec![table("users"), Precondition::Custom(Arc::new(Broken))]);
        assert_eq!(eval(&db, &p).await.outcome(), Outcome::Error);
    }

    #[tokio::test]
    async fn test_row_count_missing_table_is_error() {
        let db = MemoryDatabase::new();
        let p = Precondition::RowCount {
            schema: None,
            table: "ghost".to_string(),
            expected: 0,
        };
        assert_eq!(eval(&db, &p).await.outcome(), Outcome::Error);
    }

    #[tokio::test]
    async fn test_sql_check_and_running_as() {
        let db = MemoryDatabase::new();
        db.set_scalar("SELECT flag FROM settings", "on");
        db.set_user("deployer");
        let ok = Precondition::And(vec![
            Precondition::SqlCheck {
                sql: "SELECT flag FROM settings".to_string(),
                expected: "on".to_string(),
            },
            Precondition::RunningAs {
                username: "DEPLOYER".to_string(),
            },
            Precondition::Dbms {
                dbms: "memory, postgresql".to_string(),
            },
        ]);
        assert_eq!(eval(&db, &ok).await.outcome(), Outcome::Pass);
    }

    #[tokio::test]
    async fn test_container_policies() {
        let db = db_with_users().await;
        let ctx = EvalContext {
            database: &db,
            ran: &[],
        };

        let halt = PreconditionContainer::new().with(table("orders"));
        assert!(matches!(
            halt.check("cs", &ctx).await,
            Verdict::Halt(TidemarkError::PreconditionFailed { .. })
        ));

        let skip = halt.clone().on_fail(PreconditionAction::Continue);
        assert!(matches!(skip.check("cs", &ctx).await, Verdict::Skip(_)));

        let mark = halt.clone().on_fail(PreconditionAction::MarkRan);
        assert!(matches!(mark.check("cs", &ctx).await, Verdict::MarkRan(_)));

        let warn = halt.clone().on_fail(PreconditionAction::Warn);
        assert!(matches!(warn.check("cs", &ctx).await, Verdict::Proceed));
    }

    #[tokio::test]
    async fn test_container_error_uses_on_error_policy() {
        let db = MemoryDatabase::new();
        let ctx = EvalContext {
            database: &db,
            ran: &[],
        };
        let container = PreconditionContainer::new()
            .with(Precondition::Custom(Arc::new(Broken)))
            .on_fail(PreconditionAction::Continue);
        assert!(matches!(
            container.check("cs", &ctx).await,
            Verdict::Halt(TidemarkError::PreconditionError { .. })
        ));

        let mut lenient = container.clone().on_error(PreconditionAction::MarkRan);
        lenient.on_error_message = Some("check target offline".to_string());
        match lenient.check("cs", &ctx).await {
            Verdict::MarkRan(reason) => assert_eq!(reason, "check target offline"),
            other => panic!("unexpected verdict {other:?}"),
        }
    }

    #[test]
    fn test_deserialize_tree_from_toml() {
        let container: PreconditionContainer = toml::from_str(
            r#"
on_fail = "MARK_RAN"

[[checks]]
not = { table_exists = { table = "users" } }

[[checks]]
or = [
    { dbms = { type = "postgresql" } },
    { running_as = { username = "admin" } },
]
"#,
        )
        .unwrap();
        assert_eq!(container.on_fail, PreconditionAction::MarkRan);
        assert_eq!(container.on_error, PreconditionAction::Halt);
        assert_eq!(container.checks.len(), 2);
        assert_eq!(container.checks[0].to_string(), "not(table_exists(users))");
    }
}
