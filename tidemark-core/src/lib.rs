//! Changeset-based database migration engine.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use tidemark_core::config::{CliOverrides, TidemarkConfig};
//! use tidemark_core::Tidemark;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TidemarkConfig::load(None, &CliOverrides::default())?;
//! let tm = Tidemark::new(config).await?;
//! let changelog = tm.load_changelog()?;
//! let report = tm.migrate(&changelog).await?;
//! println!("Executed {} change sets", report.executed);
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`config`]: Configuration loading (TOML, env vars, CLI overrides)
//! - [`change`]: The abstract change trait and the change registry
//! - [`changes`]: Built-in change kinds
//! - [`changeset`]: Change set identity, run policy and rollback definition
//! - [`changelog`]: The ordered changelog
//! - [`loader`]: TOML/JSON changelog documents, includes and properties
//! - [`expression`]: Context, label and dbms filter expressions
//! - [`checksum`]: Versioned change set digests
//! - [`precondition`]: Precondition trees and failure policies
//! - [`db`]: Database abstraction, PostgreSQL backend, TLS
//! - [`memory`]: In-memory backend
//! - [`history`]: The execution ledger
//! - [`lock`]: Cross-process changelog lock
//! - [`commands`]: Individual command implementations
//! - [`error`]: Error types

pub mod change;
pub mod changelog;
pub mod changes;
pub mod changeset;
pub mod checksum;
pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod expression;
pub mod history;
pub mod loader;
pub mod lock;
pub mod memory;
pub mod precondition;

use std::path::Path;
use std::sync::Arc;

use change::ChangeRegistry;
use changelog::Changelog;
use commands::{EngineContext, EngineSettings};
use config::TidemarkConfig;
use db::{Database, PostgresDatabase};
use error::Result;
use history::{HistoryStore, PgHistoryStore, RanChangeSet};
use loader::ChangelogLoader;
use lock::{LockRecord, LockStore, PgLockStore};
use memory::MemoryDatabase;

pub use commands::migrate::{ChangeSetState, MigrateDetail, MigrateReport};
pub use commands::rollback::{RollbackReport, RollbackTarget};
pub use commands::status::{PendingChangeSet, RunStatus, StatusReport};
pub use commands::sync::SyncReport;
pub use commands::validate::ValidateReport;
pub use config::CliOverrides;
pub use error::TidemarkError;

/// Main entry point for the Tidemark library.
///
/// Holds one database session with its ledger and lock services. Create one
/// per target database and run commands through its methods.
pub struct Tidemark {
    pub config: TidemarkConfig,
    registry: ChangeRegistry,
    ctx: EngineContext,
}

impl Tidemark {
    /// Connect to PostgreSQL.
    ///
    /// If `connect_retries` is configured, retries with exponential backoff.
    pub async fn new(config: TidemarkConfig) -> Result<Self> {
        let conn_string = config.connection_string()?;
        let database = PostgresDatabase::connect(&config.database, &conn_string).await?;
        let client = database.client();
        let history = PgHistoryStore::new(
            Arc::clone(&client),
            &config.changelog.schema,
            &config.changelog.table,
        );
        let locks = PgLockStore::new(client, &config.changelog.schema, &config.changelog.lock_table);
        Ok(Self::with_backend(
            config,
            Arc::new(database),
            Arc::new(history),
            Arc::new(locks),
        ))
    }

    /// Run against any backend. The ledger and lock stores should share the
    /// database's session so the ledger commits with the change sets.
    pub fn with_backend(
        config: TidemarkConfig,
        database: Arc<dyn Database>,
        history: Arc<dyn HistoryStore>,
        locks: Arc<dyn LockStore>,
    ) -> Self {
        let settings = EngineSettings {
            batch_transaction: config.changelog.batch_transaction,
        };
        let ctx = EngineContext::new(database, history, locks, config.lock.clone(), settings);
        Self {
            config,
            registry: ChangeRegistry::with_builtins(),
            ctx,
        }
    }

    /// Run against an in-memory database.
    pub fn in_memory(config: TidemarkConfig, database: MemoryDatabase) -> Self {
        let database = Arc::new(database);
        Self::with_backend(
            config,
            Arc::clone(&database) as Arc<dyn Database>,
            Arc::clone(&database) as Arc<dyn HistoryStore>,
            database as Arc<dyn LockStore>,
        )
    }

    /// Replace the change registry used to load changelogs.
    pub fn with_registry(mut self, registry: ChangeRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Register custom change kinds.
    pub fn registry_mut(&mut self) -> &mut ChangeRegistry {
        &mut self.registry
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    /// Load the changelog named in the configuration.
    pub fn load_changelog(&self) -> Result<Changelog> {
        self.load_changelog_from(&self.config.changelog.file)
    }

    /// Load a changelog document with the configured properties.
    pub fn load_changelog_from(&self, path: &Path) -> Result<Changelog> {
        ChangelogLoader::new(&self.registry)
            .with_properties(self.config.properties.clone())
            .load(path)
    }

    /// Apply pending change sets with the configured contexts and labels.
    pub async fn migrate(&self, changelog: &Changelog) -> Result<MigrateReport> {
        self.migrate_with(
            changelog,
            &self.config.changelog.contexts,
            &self.config.changelog.labels,
        )
        .await
    }

    /// Apply pending change sets with explicit contexts and labels.
    pub async fn migrate_with(
        &self,
        changelog: &Changelog,
        contexts: &[String],
        labels: &[String],
    ) -> Result<MigrateReport> {
        commands::migrate::execute(&self.ctx, changelog, contexts, labels).await
    }

    /// Undo change sets back to a tag, a date or a count.
    pub async fn rollback(
        &self,
        changelog: &Changelog,
        target: &RollbackTarget,
    ) -> Result<RollbackReport> {
        commands::rollback::execute(&self.ctx, changelog, target).await
    }

    /// Show what migrate would do.
    pub async fn status(&self, changelog: &Changelog) -> Result<StatusReport> {
        commands::status::execute(
            &self.ctx,
            changelog,
            &self.config.changelog.contexts,
            &self.config.changelog.labels,
        )
        .await
    }

    /// Validate the changelog against itself and the ledger.
    pub async fn validate(&self, changelog: &Changelog) -> Result<ValidateReport> {
        commands::validate::execute(&self.ctx, changelog).await
    }

    /// Every ledger row in execution order.
    pub async fn history(&self) -> Result<Vec<RanChangeSet>> {
        commands::history::execute(&self.ctx).await
    }

    /// Tag the current ledger position.
    pub async fn tag(&self, name: &str) -> Result<RanChangeSet> {
        commands::tag::execute(&self.ctx, name).await
    }

    /// Null every stored checksum.
    pub async fn clear_checksums(&self) -> Result<u64> {
        commands::clear_checksums::execute(&self.ctx).await
    }

    /// Force-release the changelog lock.
    pub async fn release_locks(&self) -> Result<bool> {
        commands::locks::release(&self.ctx).await
    }

    /// Current state of the changelog lock.
    pub async fn list_locks(&self) -> Result<LockRecord> {
        commands::locks::list(&self.ctx).await
    }

    /// Record pending change sets as MARK_RAN without executing them.
    pub async fn sync(&self, changelog: &Changelog) -> Result<SyncReport> {
        commands::sync::execute(
            &self.ctx,
            changelog,
            &self.config.changelog.contexts,
            &self.config.changelog.labels,
        )
        .await
    }
}
