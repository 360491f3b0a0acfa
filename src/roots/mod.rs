//! Root lifecycle: registration, health probes and the
//! Unknown / Online / Offline / Missing state machine.

pub mod health;
pub mod manager;

use serde::Serialize;

use crate::db::{RootId, RootStatus};

pub use crate::db::Root;
pub use manager::RootManager;

/// Outcome of a health check that changed something.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub root_id: RootId,
    pub from: RootStatus,
    pub to: RootStatus,
    /// A scan should be requested for the root.
    pub scan: bool,
}
