//! The ordered changelog: change sets in authored order plus a changelog-level
//! precondition container that is evaluated once before anything runs.

use std::collections::BTreeMap;

use crate::changeset::{ChangeSet, ChangeSetId};
use crate::precondition::PreconditionContainer;

#[derive(Debug, Clone, Default)]
pub struct Changelog {
    path: String,
    change_sets: Vec<ChangeSet>,
    preconditions: PreconditionContainer,
}

impl Changelog {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            ..Default::default()
        }
    }

    pub fn with_preconditions(mut self, preconditions: PreconditionContainer) -> Self {
        self.preconditions = preconditions;
        self
    }

    pub fn with_change_set(mut self, change_set: ChangeSet) -> Self {
        self.add_change_set(change_set);
        self
    }

    /// Append a change set. Duplicates are kept and reported by validation.
    pub fn add_change_set(&mut self, change_set: ChangeSet) {
        self.change_sets.push(change_set);
    }

    /// Flatten a nested changelog into this one: its change sets are appended
    /// in order and its preconditions are ANDed into this container.
    pub fn include(&mut self, other: Changelog) {
        self.preconditions.merge(other.preconditions);
        self.change_sets.extend(other.change_sets);
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn change_sets(&self) -> &[ChangeSet] {
        &self.change_sets
    }

    pub fn preconditions(&self) -> &PreconditionContainer {
        &self.preconditions
    }

    pub fn len(&self) -> usize {
        self.change_sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.change_sets.is_empty()
    }

    pub fn find(&self, identity: &ChangeSetId) -> Option<&ChangeSet> {
        self.change_sets.iter().find(|cs| cs.identity() == identity)
    }

    /// Identities that occur more than once, each reported once, in first-seen order.
    pub fn duplicate_identities(&self) -> Vec<ChangeSetId> {
        let mut seen: BTreeMap<&ChangeSetId, usize> = BTreeMap::new();
        let mut duplicates = Vec::new();
        for cs in &self.change_sets {
            let count = seen.entry(cs.identity()).or_insert(0);
            *count += 1;
            if *count == 2 {
                duplicates.push(cs.identity().clone());
            }
        }
        duplicates
    }
}
