//! Leadership Module
//!
//! Single-leader election over a session-scoped advisory lock.
//!
//! # Components
//! - [`LeadershipState`]: exclusion-guarded leader flag with election/loss timestamps
//! - [`LeaderElector`]: acquire/verify/yield loop driving the state
//! - [`BackoffPolicy`]: seeded exponential backoff with jitter
//! - [`LeadershipEvent`]: transition records published to subscribers

mod backoff;
mod elector;
mod events;
mod key;
mod state;


pub use backoff::{seed_for, BackoffPolicy};
pub use elector::{spawn_leader_elector, LeaderElector};
pub use events::{spawn_event_logger, LeadershipEvent, LossReason};
pub use key::lock_key;
pub use state::{LeadershipGuard, LeadershipSnapshot, LeadershipState};
