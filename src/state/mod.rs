//! Persisted drift status.
//!
//! The reconciler can record the latest status of every configuration key it
//! touches, so `convergent status` can report drift without contacting the
//! agent.

mod local;
mod lock;
mod store;
mod types;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{generate_holder_id, LockInfo, LOCK_EXPIRY_SECS};
pub use store::StateStore;
pub use types::{DriftRecord, DriftState, DriftStatus, STATE_VERSION};
