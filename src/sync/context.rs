//! Shared execution context handed to every engine at construction

use std::sync::Arc;

use tokio::runtime::Handle;

use super::store::Database;
use crate::clock::{SharedClock, SystemClock};

/// Where engines spawn background work, which database serializes their
/// storage access and which clock timestamps their values.
#[derive(Clone)]
pub struct SyncContext {
    pub handle: Handle,
    pub database: Arc<Database>,
    pub clock: SharedClock,
}

impl SyncContext {
    pub fn new(handle: Handle, database: Arc<Database>, clock: SharedClock) -> Self {
        Self {
            handle,
            database,
            clock,
        }
    }

    /// Context for the running tokio runtime with the system clock.
    ///
    /// Must be called from within a runtime.
    pub fn current(database_name: &str) -> Self {
        Self::new(
            Handle::current(),
            Arc::new(Database::new(database_name)),
            Arc::new(SystemClock),
        )
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }
}
