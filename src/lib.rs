//! Local-first storage and sync core for Hearthkeep.
//!
//! Writes land in SQLite immediately through [`mutators::Mutator`] (or the
//! generated functions in [`entities`]); each one records a ledger entry in
//! the same transaction. [`sync::SyncCoordinator`] later drains the ledger
//! against a [`sync::RemoteEndpoint`] and applies what the remote sends
//! back. Live queries in [`live`] re-run after every committed write.

pub mod config;
pub mod db;
pub mod entities;
pub mod error;
pub mod id;
pub mod ledger;
pub mod live;
pub mod logging;
pub mod migrate;
pub mod mutators;
pub mod op_logging;
pub mod state;
pub mod store;
pub mod sync;
pub mod time;

pub use error::{AppError, AppResult};

pub use config::AppConfig;
pub use live::{ChangeBus, LiveQuery, Snapshot, TableChange};
pub use mutators::Mutator;
pub use state::AppState;
pub use store::{ListOptions, Record};
