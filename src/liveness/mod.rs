//! Pod liveness: publishing our own keepalive and reacting to peers' expiry.
//!
//! ```text
//!   LivenessPublisher ──upsert every interval──▶ store (TTL on expireAt)
//!                                                   │ expiry
//!                                                   ▼
//!   feed ──Delete(pod)──▶ FailureDetector ──queue──▶ consumer ──▶ OwnershipClaimer
//! ```
//!
//! A pod is considered dead exactly when its keepalive record disappears from
//! the store. There is no heartbeat counting on our side.

mod detector;
mod publisher;

pub use detector::{FailureDetector, PodDownReceiver};
pub use publisher::LivenessPublisher;
