//! Graduation
//!
//! Lifecycle of a market once its curve fills:
//!
//! ```text
//! ACTIVE ──(real quote ≥ threshold)──→ GRADUATED ──(migration)──→ MIGRATED
//! ```
//!
//! - [`state`]: lifecycle and migration state machines
//! - [`account`]: fixed-layout decoder for the external curve account
//! - [`adapters`]: collaborator traits (ledger reader, custody, pool service)
//! - [`controller`]: the migration flow
//! - [`watcher`]: periodic reconciliation
//! - [`rpc`]: HTTP implementations of the adapters

pub mod account;
pub mod adapters;
pub mod controller;
pub mod rpc;
pub mod state;
pub mod watcher;


pub use account::{CurveAccount, LayoutError};
pub use adapters::{
    Announcer, CustodyService, ExternalLedgerReader, LogAnnouncer, MigrationEvent, PoolCreator,
    ReleaseReceipt,
};
pub use controller::{GraduationController, MigrationOutcome};
pub use state::{Lifecycle, MigrationState};
pub use watcher::{GraduationWatcher, ReconcileReport, WatcherConfig};
