//! Per-worker relay engine: polling, transformation, delivery, backfill,
//! deletion sync and durable relay state.

pub mod backfill;
pub mod classify;
mod deliver;
pub mod engine;
pub mod error;
pub mod retry;
pub mod session;
pub mod state;
pub mod store;
pub mod store_file;
pub mod store_memory;

pub use {
    backfill::{BackfillOutcome, reset_backfill},
    engine::{MessageOutcome, RelayEngine, TickReport},
    error::{Error, Result},
    retry::{Attempt, RetryPolicy},
    session::{SessionLock, is_locked},
    state::{GroupMemory, IdMap, IdMapEntry, RelayState},
    store::StateStore,
    store_file::FileStateStore,
    store_memory::MemoryStateStore,
};

