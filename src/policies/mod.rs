//! Restart backoff policies.
//!
//! ## Contents
//! - [`BackoffPolicy`] how the restart delay evolves after consecutive errors
//! - [`Growth`]        the named growth function (additive / multiplicative)
//! - [`JitterPolicy`]  randomization of the scheduled delay
//!
//! ## Quick wiring
//! ```text
//! TaskVars { retry, max-retry, restart }
//!      └─► core::master::TaskMaster uses:
//!           - backoff.next(prev, retry, max) after an error
//!           - restart after a success (0 = finish)
//!           - backoff.schedule(base) for the actual sleep
//! ```

mod backoff;
mod jitter;

pub use backoff::{BackoffPolicy, Growth};
pub use jitter::JitterPolicy;
