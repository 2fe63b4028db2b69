//! Counted permit pool bounding in-flight requests.
//!
//! A permit moves through two states:
//! - `PermitInUse` → returned to the pool on drop (registration aborted)
//! - `PermitInUse` → handed to an outstanding occurrence via `commit()`;
//!   only the winning arrival for that occurrence may `release()` it

mod pool;

pub use pool::{PermitInUse, PermitPool};
