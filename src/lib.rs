//! # waymark
//!
//! Versioned database schema migration engine.
//!
//! This crate provides functionality for:
//! - Resolving versioned, repeatable, baseline and undo SQL migration
//!   scripts from filesystem locations
//! - Migration history tracking in a schema history table
//! - Reconciling resolved scripts against applied history into states
//!   and an ordered execution plan
//! - Safe, transactional migration application with per-script or
//!   grouped transactions
//! - **Validation** of checksums, missing and failed migrations, with
//!   repair and baseline operations
//! - Distributed locking so concurrent runs serialize cleanly
//!
//! ## Architecture
//!
//! The engine scans the configured locations for scripts, loads the
//! applied rows from the history table, reconciles both sides into a
//! per-migration state, and executes whatever is pending under the
//! schema history lock.
//!
//! ```text
//! ┌──────────────┐     ┌────────────────┐     ┌─────────────┐
//! │ Locations    │────▶│ Resolver       │────▶│ Reconciler  │
//! └──────────────┘     └────────────────┘     └─────────────┘
//!                                                    │
//! ┌──────────────┐     ┌────────────────┐            ▼
//! │ History Tbl  │────▶│ Applied Rows   │────▶┌─────────────┐
//! └──────────────┘     └────────────────┘     │ Exec Plan   │
//!        ▲                                    └─────────────┘
//!        │             ┌────────────────┐            │
//!        └─────────────│ Executor       │◀───────────┘
//!                      └────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use waymark::{MigrationConfig, Migrator};
//!
//! async fn run_migrations() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = MigrationConfig::new()
//!         .locations(["./migrations"])
//!         .installed_by("deployer");
//!
//!     // Wire in your driver's connection, history and lock backends.
//!     let engine = Migrator::builder(config)
//!         .connections(Arc::new(/* your ConnectionProvider */))
//!         .history(Arc::new(/* your SchemaHistory */))
//!         .lock(Arc::new(/* your LockProvider */))
//!         .build()?;
//!
//!     let report = engine.migrate().await?;
//!     println!("{}", report.summary());
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Migration Files
//!
//! Scripts live flat in the configured locations and are named
//! `<prefix><version><separator><description><suffix>`:
//!
//! ```text
//! migrations/
//! ├── V1__create_users.sql
//! ├── V1.1__add_email_index.sql
//! ├── V2__add_posts.sql
//! ├── R__refresh_views.sql        # repeatable, reapplied on change
//! └── B2__baseline_schema.sql     # baseline for pre-existing schemas
//! ```
//!
//! Versioned scripts run exactly once, in version order. Repeatable
//! scripts rerun whenever their checksum changes, after all versioned
//! scripts. Undo scripts (`U` prefix) are cataloged but never part of a
//! forward run.

pub mod callback;
pub mod config;
pub mod connect;
pub mod dialect;
pub mod engine;
pub mod error;
pub mod executor;
pub mod history;
pub mod info;
pub mod lock;
pub mod memory;
pub mod pattern;
pub mod reconcile;
pub mod report;
pub mod resolver;
pub mod version;

// Re-exports
pub use callback::{Callback, CallbackSet, Event, EventContext};
pub use config::MigrationConfig;
pub use connect::{Connection, ConnectionProvider, connect_with_retries};
pub use dialect::{AnsiDialect, Dialect, DialectRegistry, LockStatements};
pub use engine::{Migrator, MigratorBuilder};
pub use error::{MigrateError, MigrateResult};
pub use executor::{ExecutionSummary, Executor};
pub use history::{AppliedMigration, HistoryEntry, SchemaHistory};
pub use info::{MigrationInfo, MigrationState};
pub use lock::{LockCoordinator, LockGuard, LockProvider, RetryPolicy};
pub use pattern::{CherryPick, MigrationPattern};
pub use reconcile::{ReconcileOutcome, Reconciler, ValidationError, ValidationErrorKind};
pub use report::{BaselineReport, InfoReport, MigrateReport, RepairReport, ValidateReport};
pub use resolver::{MigrationKind, ResolvedMigration, Resolver, checksum_of};
pub use version::{TargetVersion, Version};
