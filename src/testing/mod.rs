//! Multi-pod scenarios over a shared [`InMemoryStore`](crate::store::InMemoryStore).
//!
//! Every pod is a full [`Drsm`](crate::Drsm) instance with its own feed
//! consumer, publisher and detector. A crash is simulated by shutting the
//! instance down and deleting its keepalive, which is what TTL expiry does.
//!
//! ```text
//!   ┌────────┐  ┌────────┐  ┌────────┐
//!   │ amf-a  │  │ amf-b  │  │ amf-c  │
//!   └───┬────┘  └───┬────┘  └───┬────┘
//!       │ insert /  │ CAS /     │ watch
//!       │ upsert    │ watch     │
//!       ▼           ▼           ▼
//!   ┌─────────────────────────────────┐
//!   │          InMemoryStore          │
//!   └─────────────────────────────────┘
//! ```

mod failover_tests;
pub(crate) mod utils;
