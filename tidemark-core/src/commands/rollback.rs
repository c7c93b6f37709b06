//! Walk the ledger backward to a tag, a date or a count, undoing change sets.

use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::Serialize;

use crate::changelog::Changelog;
use crate::error::{Result, TidemarkError};
use crate::history::{ExecType, RanChangeSet};

use super::EngineContext;

/// How far back to go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackTarget {
    /// Undo every row written after the last row carrying this tag.
    Tag(String),
    /// Undo every row executed after this instant.
    Date(DateTime<Utc>),
    /// Undo the most recent N rows.
    Count(usize),
}

impl fmt::Display for RollbackTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollbackTarget::Tag(tag) => write!(f, "tag {}", tag),
            RollbackTarget::Date(date) => write!(f, "date {}", date.format("%Y-%m-%d %H:%M:%S UTC")),
            RollbackTarget::Count(n) => write!(f, "count {}", n),
        }
    }
}

impl RollbackTarget {
    /// Parse a date target: RFC 3339, `YYYY-MM-DD HH:MM:SS` (UTC) or `YYYY-MM-DD`.
    pub fn parse_date(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Ok(RollbackTarget::Date(dt.with_timezone(&Utc)));
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
            return Ok(RollbackTarget::Date(Utc.from_utc_datetime(&naive)));
        }
        if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
                return Ok(RollbackTarget::Date(Utc.from_utc_datetime(&midnight)));
            }
        }
        Err(TidemarkError::RollbackTargetInvalid(format!(
            "'{}' is not a date. Use RFC 3339, 'YYYY-MM-DD HH:MM:SS' or 'YYYY-MM-DD'",
            s
        )))
    }
}

impl FromStr for RollbackTarget {
    type Err = TidemarkError;

    /// `tag:<name>`, `date:<when>` or `count:<n>`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let Some((kind, value)) = s.split_once(':') else {
            return Err(TidemarkError::RollbackTargetInvalid(format!(
                "'{}' is not a rollback target. Use tag:<name>, date:<when> or count:<n>",
                s
            )));
        };
        match kind.trim().to_lowercase().as_str() {
            "tag" if !value.trim().is_empty() => Ok(RollbackTarget::Tag(value.trim().to_string())),
            "date" => RollbackTarget::parse_date(value),
            "count" => value.trim().parse::<usize>().map(RollbackTarget::Count).map_err(|_| {
                TidemarkError::RollbackTargetInvalid(format!("'{}' is not a count", value))
            }),
            _ => Err(TidemarkError::RollbackTargetInvalid(format!(
                "'{}' is not a rollback target. Use tag:<name>, date:<when> or count:<n>",
                s
            ))),
        }
    }
}

/// Report returned after a rollback.
#[derive(Debug, Serialize)]
pub struct RollbackReport {
    pub target: String,
    /// Rows removed, newest first.
    pub rolled_back: Vec<RolledBackChangeSet>,
    pub total_time_ms: i64,
}

#[derive(Debug, Serialize)]
pub struct RolledBackChangeSet {
    pub change_set: String,
    /// How the row had been recorded.
    pub exec_type: ExecType,
    /// Inverse statements executed. Zero for rows that never ran statements.
    pub statements: usize,
    pub execution_time_ms: i64,
}

/// Execute the rollback command.
pub async fn execute(
    ctx: &EngineContext,
    changelog: &Changelog,
    target: &RollbackTarget,
) -> Result<RollbackReport> {
    let guard = ctx.lock().await?;
    let result = run_rollback(ctx, changelog, target).await;
    let result = ctx.finish(guard, result).await;

    match &result {
        Ok(report) => log::info!(
            "Rollback completed; target={}, rolled_back={}, total_time_ms={}",
            report.target,
            report.rolled_back.len(),
            report.total_time_ms
        ),
        Err(e) => log::error!("Rollback failed: {}", e),
    }
    result
}

async fn run_rollback(
    ctx: &EngineContext,
    changelog: &Changelog,
    target: &RollbackTarget,
) -> Result<RollbackReport> {
    let started = Instant::now();
    ctx.history.reset();
    ctx.history.init().await?;
    let ran = ctx.history.ran_change_sets().await?;
    let rows = select_rows(&ran, target, Utc::now())?;
    log::info!("Rolling back; target={}, change_sets={}", target, rows.len());

    let mut report = RollbackReport {
        target: target.to_string(),
        rolled_back: Vec::with_capacity(rows.len()),
        total_time_ms: 0,
    };

    // Newest first. Stops at the first change set that cannot be undone;
    // everything undone before it stays undone.
    for row in rows {
        let undone = undo(ctx, changelog, row).await?;
        report.rolled_back.push(undone);
    }

    // A marker written by tagging an empty ledger has served its purpose once
    // nothing authored is left above it.
    if let RollbackTarget::Tag(tag) = target {
        let remaining = ctx.history.ran_change_sets().await?;
        if remaining.iter().all(|r| r.is_internal()) {
            for marker in remaining.iter().filter(|r| r.tag.as_deref() == Some(tag.as_str())) {
                ctx.history.remove(&marker.identity).await?;
                log::debug!("Removed tag marker; tag={}", tag);
            }
        }
    }

    report.total_time_ms = started.elapsed().as_millis() as i64;
    Ok(report)
}

/// Rows to undo for `target`, newest first. Internal rows are never undone.
fn select_rows<'a>(
    ran: &'a [RanChangeSet],
    target: &RollbackTarget,
    now: DateTime<Utc>,
) -> Result<Vec<&'a RanChangeSet>> {
    let mut ordered: Vec<&RanChangeSet> = ran.iter().collect();
    ordered.sort_by_key(|r| r.order_executed);

    let selected: Vec<&RanChangeSet> = match target {
        RollbackTarget::Tag(tag) => {
            let Some(marker) = ordered.iter().rev().find(|r| r.tag.as_deref() == Some(tag.as_str()))
            else {
                return Err(TidemarkError::RollbackTargetInvalid(format!(
                    "tag '{}' does not exist in the ledger",
                    tag
                )));
            };
            let cutoff = marker.order_executed;
            ordered
                .iter()
                .copied()
                .filter(|r| r.order_executed > cutoff && !r.is_internal())
                .collect()
        }
        RollbackTarget::Date(date) => {
            if *date > now {
                return Err(TidemarkError::RollbackTargetInvalid(format!(
                    "date {} is in the future",
                    date.format("%Y-%m-%d %H:%M:%S UTC")
                )));
            }
            ordered
                .iter()
                .copied()
                .filter(|r| r.date_executed > *date && !r.is_internal())
                .collect()
        }
        RollbackTarget::Count(n) => {
            let authored: Vec<&RanChangeSet> =
                ordered.iter().copied().filter(|r| !r.is_internal()).collect();
            if *n > authored.len() {
                return Err(TidemarkError::RollbackTargetInvalid(format!(
                    "cannot roll back {} change sets, the ledger holds {}",
                    n,
                    authored.len()
                )));
            }
            authored[authored.len() - n..].to_vec()
        }
    };
    Ok(selected.into_iter().rev().collect())
}

/// Undo one ledger row: run its inverse statements then remove the row.
async fn undo(
    ctx: &EngineContext,
    changelog: &Changelog,
    row: &RanChangeSet,
) -> Result<RolledBackChangeSet> {
    let started = Instant::now();
    let name = row.identity.to_string();

    if !row.exec_type.ran_statements() {
        ctx.history.remove(&row.identity).await?;
        log::info!("Removed ledger row; change_set={}, exec_type={}", name, row.exec_type);
        return Ok(RolledBackChangeSet {
            change_set: name,
            exec_type: row.exec_type,
            statements: 0,
            execution_time_ms: started.elapsed().as_millis() as i64,
        });
    }

    let Some(cs) = changelog.find(&row.identity) else {
        return Err(TidemarkError::RollbackUnsupported {
            change_set: name,
            reason: "change set is not in the changelog".to_string(),
        });
    };
    let statements = cs
        .rollback_statements()
        .map_err(|reason| TidemarkError::RollbackUnsupported {
            change_set: name.clone(),
            reason,
        })?;

    let db = ctx.database.as_ref();
    let transactional = cs.run_in_transaction() && db.info().supports_ddl_transactions;
    if transactional {
        db.begin().await?;
    }

    for statement in &statements {
        log::debug!("Executing rollback statement; change_set={}, sql={}", name, statement);
        if let Err(e) = db.execute(statement).await {
            if transactional {
                if let Err(rb) = db.rollback().await {
                    log::warn!("Rollback of failed undo failed; change_set={}, error={}", name, rb);
                }
            }
            return Err(TidemarkError::RollbackFailed {
                change_set: name,
                reason: e.to_string(),
            });
        }
    }

    if let Err(e) = ctx.history.remove(&row.identity).await {
        if transactional {
            if let Err(rb) = db.rollback().await {
                log::warn!("Rollback after ledger failure failed; change_set={}, error={}", name, rb);
            }
        }
        return Err(TidemarkError::RollbackFailed {
            change_set: name,
            reason: format!("inverse statements ran but the ledger row could not be removed: {}", e),
        });
    }

    if transactional {
        db.commit().await?;
    }
    log::info!("Rolled back change set; change_set={}, statements={}", name, statements.len());
    Ok(RolledBackChangeSet {
        change_set: name,
        exec_type: row.exec_type,
        statements: statements.len(),
        execution_time_ms: started.elapsed().as_millis() as i64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    use crate::changeset::ChangeSetId;
    use crate::history::{INTERNAL_AUTHOR, INTERNAL_PATH, TOOL_VERSION};

    fn row(id: &str, order: i32, minutes_ago: i64, tag: Option<&str>) -> RanChangeSet {
        RanChangeSet {
            identity: ChangeSetId::new(id, "alice", "main.toml"),
            checksum: None,
            exec_type: ExecType::Executed,
            date_executed: Utc::now() - Duration::minutes(minutes_ago),
            order_executed: order,
            tag: tag.map(str::to_string),
            deployment_id: None,
            description: "sql".to_string(),
            comments: None,
            contexts: None,
            labels: None,
            tool_version: TOOL_VERSION.to_string(),
        }
    }

    fn ids(rows: &[&RanChangeSet]) -> Vec<String> {
        rows.iter().map(|r| r.identity.id.clone()).collect()
    }

    #[test]
    fn test_parse_targets() {
        assert_eq!(
            "tag:v1".parse::<RollbackTarget>().unwrap(),
            RollbackTarget::Tag("v1".to_string())
        );
        assert_eq!(
            "count:3".parse::<RollbackTarget>().unwrap(),
            RollbackTarget::Count(3)
        );
        assert!(matches!(
            "date:2024-01-02".parse::<RollbackTarget>().unwrap(),
            RollbackTarget::Date(_)
        ));
        assert!("count:many".parse::<RollbackTarget>().is_err());
        assert!("v1".parse::<RollbackTarget>().is_err());
    }

    #[test]
    fn test_parse_date_formats() {
        let a = RollbackTarget::parse_date("2024-03-01T10:00:00Z").unwrap();
        let b = RollbackTarget::parse_date("2024-03-01 10:00:00").unwrap();
        assert_eq!(a, b);
        assert!(RollbackTarget::parse_date("yesterday").is_err());
    }

    #[test]
    fn test_tag_selects_rows_after_last_tagged_row() {
        let ran = vec![
            row("1", 1, 30, Some("v1")),
            row("2", 2, 20, None),
            row("3", 3, 10, None),
        ];
        let selected = select_rows(&ran, &RollbackTarget::Tag("v1".to_string()), Utc::now()).unwrap();
        assert_eq!(ids(&selected), vec!["3", "2"]);
    }

    #[test]
    fn test_missing_tag_is_invalid() {
        let ran = vec![row("1", 1, 10, None)];
        let err = select_rows(&ran, &RollbackTarget::Tag("nope".to_string()), Utc::now()).unwrap_err();
        assert!(matches!(err, TidemarkError::RollbackTargetInvalid(_)));
    }

    #[test]
    fn test_future_date_is_invalid() {
        let ran = vec![row("1", 1, 10, None)];
        let future = Utc::now() + Duration::hours(1);
        let err = select_rows(&ran, &RollbackTarget::Date(future), Utc::now()).unwrap_err();
        assert!(matches!(err, TidemarkError::RollbackTargetInvalid(_)));
    }

    #[test]
    fn test_date_selects_later_rows() {
        let ran = vec![row("1", 1, 60, None), row("2", 2, 5, None)];
        let cutoff = Utc::now() - Duration::minutes(30);
        let selected = select_rows(&ran, &RollbackTarget::Date(cutoff), Utc::now()).unwrap();
        assert_eq!(ids(&selected), vec!["2"]);
    }

    #[test]
    fn test_count_ignores_internal_rows() {
        let mut marker = row("tag-v0", 1, 40, Some("v0"));
        marker.identity = ChangeSetId::new("tag-v0", INTERNAL_AUTHOR, INTERNAL_PATH);
        let ran = vec![marker, row("1", 2, 20, None), row("2", 3, 10, None)];

        let selected = select_rows(&ran, &RollbackTarget::Count(2), Utc::now()).unwrap();
        assert_eq!(ids(&selected), vec!["2", "1"]);
        assert!(select_rows(&ran, &RollbackTarget::Count(3), Utc::now()).is_err());
    }

    #[test]
    fn test_count_zero_selects_nothing() {
        let ran = vec![row("1", 1, 10, None)];
        assert!(select_rows(&ran, &RollbackTarget::Count(0), Utc::now())
            .unwrap()
            .is_empty());
    }
}
