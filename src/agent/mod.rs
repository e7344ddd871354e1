//! Per-session coordination: lock hand-off and cancellation.

pub mod cancel;
pub mod session_lock;

pub use cancel::{CancelHandle, CancelSignal};
pub use session_lock::{LockHandle, LockStats, SessionLock};
