//! The validation sweep: structural and checksum-integrity checks over the
//! whole changelog. `migrate` and `sync` run it as a hard gate before touching
//! anything; the `validate` command runs it on its own.

use std::collections::HashSet;

use serde::Serialize;

use crate::changelog::Changelog;
use crate::changeset::{ChangeSetId, ValidationFailAction};
use crate::checksum::{self, CheckSum, ChecksumComparison};
use crate::error::{Result, TidemarkError, ValidationIssue};
use crate::history::{ExecType, RanChangeSet};

use super::{index_rows, EngineContext};

/// Outcome of the sweep.
#[derive(Debug, Default, Clone)]
pub(crate) struct Sweep {
    pub issues: Vec<ValidationIssue>,
    /// Rows whose stored digest must be rewritten (legacy version or cleared).
    pub checksum_rewrites: Vec<(ChangeSetId, CheckSum)>,
    /// Unrun change sets with `on_validation_fail = MARK_RAN` whose changes are invalid.
    pub mark_ran_invalid: HashSet<ChangeSetId>,
}

impl Sweep {
    pub fn into_result(self) -> Result<Self> {
        if self.issues.is_empty() {
            Ok(self)
        } else {
            Err(TidemarkError::ValidationFailed(self.issues))
        }
    }
}

/// Check every change set against itself and against the ledger.
///
/// Checksums are verified for every recorded change set, whatever the
/// context or label filters of the current run.
pub(crate) fn sweep(changelog: &Changelog, ran: &[RanChangeSet], batch_transaction: bool) -> Sweep {
    let mut result = Sweep::default();
    let rows = index_rows(ran);

    for identity in changelog.duplicate_identities() {
        result.issues.push(ValidationIssue::DuplicateIdentity {
            change_set: identity.to_string(),
        });
    }

    for cs in changelog.change_sets() {
        let identity = cs.identity();
        let name = identity.to_string();
        let row = rows.get(identity).copied();

        for (field, value) in [("id", &identity.id), ("author", &identity.author)] {
            if value.trim().is_empty() {
                result.issues.push(ValidationIssue::MissingIdentity {
                    change_set: name.clone(),
                    field: field.to_string(),
                });
            }
        }

        let problems = cs.change_problems();
        if !problems.is_empty() {
            match cs.on_validation_fail() {
                ValidationFailAction::Halt => {
                    result.issues.push(ValidationIssue::InvalidChange {
                        change_set: name.clone(),
                        reason: problems.join("; "),
                    });
                }
                ValidationFailAction::MarkRan => {
                    if row.is_none() {
                        result.mark_ran_invalid.insert(identity.clone());
                    }
                }
            }
        }

        if batch_transaction && !cs.run_in_transaction() {
            result.issues.push(ValidationIssue::NonTransactionalInBatch {
                change_set: name.clone(),
            });
        }

        let Some(row) = row else { continue };
        if row.exec_type == ExecType::Failed {
            continue;
        }
        let Some(stored) = &row.checksum else {
            result
                .checksum_rewrites
                .push((identity.clone(), cs.checksum().clone()));
            continue;
        };
        match checksum::compare(stored, cs) {
            ChecksumComparison::Match => {}
            ChecksumComparison::Upgrade { current } => {
                result.checksum_rewrites.push((identity.clone(), current));
            }
            ChecksumComparison::Drift { stored, computed } => {
                let tolerated =
                    cs.run_always() || cs.run_on_change() || cs.accepts_checksum(&stored);
                if !tolerated {
                    result.issues.push(ValidationIssue::ChecksumDrift {
                        change_set: name.clone(),
                        stored: stored.to_string(),
                        computed: computed.to_string(),
                    });
                }
            }
        }
    }
    result
}

/// Report returned by the `validate` command.
#[derive(Debug, Serialize)]
pub struct ValidateReport {
    pub valid: bool,
    /// Change sets in the changelog.
    pub change_sets: usize,
    pub issues: Vec<ValidationIssue>,
    /// Stored checksums the next migrate will rewrite without treating them as drift.
    pub checksums_to_upgrade: usize,
}

/// Execute the validate command. Nothing is written, not even the ledger table.
pub async fn execute(ctx: &EngineContext, changelog: &Changelog) -> Result<ValidateReport> {
    ctx.history.reset();
    let ran = ctx.history.ran_change_sets().await?;
    let result = sweep(changelog, &ran, ctx.settings.batch_transaction);

    let report = ValidateReport {
        valid: result.issues.is_empty(),
        change_sets: changelog.len(),
        issues: result.issues,
        checksums_to_upgrade: result.checksum_rewrites.len(),
    };
    if report.valid {
        log::info!("Validation passed; change_sets={}", report.change_sets);
    } else {
        log::warn!("Validation failed; issues={}", report.issues.len());
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Utc;

    use crate::changes::Sql;
    use crate::changeset::ChangeSet;
    use crate::checksum::ChecksumVersion;
    use crate::history::TOOL_VERSION;

    fn cs(id: &str, sql: &str) -> ChangeSet {
        ChangeSet::new(id, "alice", "main.toml").with_change(Arc::new(Sql::new(sql)))
    }

    fn ran(cs: &ChangeSet, checksum: Option<CheckSum>) -> RanChangeSet {
        RanChangeSet {
            identity: cs.identity().clone(),
            checksum,
            exec_type: ExecType::Executed,
            date_executed: Utc::now(),
            order_executed: 1,
            tag: None,
            deployment_id: None,
            description: cs.description(),
            comments: None,
            contexts: None,
            labels: None,
            tool_version: TOOL_VERSION.to_string(),
        }
    }

    #[test]
    fn test_clean_changelog_passes() {
        let log = Changelog::new("main.toml").with_change_set(cs("1", "SELECT 1"));
        assert!(sweep(&log, &[], false).issues.is_empty());
    }

    #[test]
    fn test_drift_reports_both_digests() {
        let original = cs("1", "SELECT 1");
        let row = ran(&original, Some(original.checksum().clone()));
        let edited = cs("1", "SELECT 2");
        let log = Changelog::new("main.toml").with_change_set(edited.clone());

        let result = sweep(&log, &[row], false);
        assert_eq!(
            result.issues,
            vec![ValidationIssue::ChecksumDrift {
                change_set: "main.toml::1::alice".to_string(),
                stored: original.checksum().to_string(),
                computed: edited.checksum().to_string(),
            }]
        );
    }

    #[test]
    fn test_drift_tolerated_by_flags_and_valid_checksums() {
        let original = cs("1", "SELECT 1");
        let row = ran(&original, Some(original.checksum().clone()));
        for edited in [
            cs("1", "SELECT 2").with_run_on_change(true),
            cs("1", "SELECT 2").with_run_always(true),
            cs("1", "SELECT 2").with_valid_checksums(vec![crate::checksum::ValidCheckSum::Exact(
                original.checksum().clone(),
            )]),
        ] {
            let log = Changelog::new("main.toml").with_change_set(edited);
            assert!(sweep(&log, &[row.clone()], false).issues.is_empty());
        }
    }

    #[test]
    fn test_legacy_and_cleared_checksums_are_rewritten() {
        let a = cs("1", "SELECT 1");
        let b = cs("2", "SELECT 2");
        let rows = vec![
            ran(&a, Some(a.checksum_with(ChecksumVersion::V1))),
            ran(&b, None),
        ];
        let log = Changelog::new("main.toml")
            .with_change_set(a.clone())
            .with_change_set(b.clone());
        let result = sweep(&log, &rows, false);
        assert!(result.issues.is_empty());
        assert_eq!(
            result.checksum_rewrites,
            vec![
                (a.identity().clone(), a.checksum().clone()),
                (b.identity().clone(), b.checksum().clone()),
            ]
        );
    }

    #[test]
    fn test_structural_issues() {
        let log = Changelog::new("main.toml")
            .with_change_set(cs("1", "SELECT 1"))
            .with_change_set(cs("1", "SELECT 1"))
            .with_change_set(ChangeSet::new("", "alice", "main.toml"))
            .with_change_set(cs("3", "  "))
            .with_change_set(cs("4", "SELECT 4").with_run_in_transaction(false));
        let result = sweep(&log, &[], true);
        let kinds: Vec<&str> = result
            .issues
            .iter()
            .map(|i| match i {
                ValidationIssue::DuplicateIdentity { .. } => "duplicate",
                ValidationIssue::MissingIdentity { .. } => "missing",
                ValidationIssue::InvalidChange { .. } => "invalid",
                ValidationIssue::NonTransactionalInBatch { .. } => "batch",
                ValidationIssue::ChecksumDrift { .. } => "drift",
            })
            .collect();
        assert_eq!(kinds, vec!["duplicate", "missing", "invalid", "batch"]);
    }

    #[test]
    fn test_invalid_change_with_mark_ran_policy() {
        let log = Changelog::new("main.toml").with_change_set(
            cs("1", "")
                .with_on_validation_fail(ValidationFailAction::MarkRan),
        );
        let result = sweep(&log, &[], false);
        assert!(result.issues.is_empty());
        assert!(result
            .mark_ran_invalid
            .contains(&ChangeSetId::new("1", "alice", "main.toml")));
    }
}
