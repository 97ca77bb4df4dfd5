//! Distributed mutual exclusion for a dynamic set of symmetric peers,
//! built on Lamport logical clocks with name tiebreaks (Ricart-Agrawala)
//! and a heartbeat failure detector that prunes the voting quorum.
//!
//! See `clock`, `membership`, `cs` and `transport` for the four
//! building blocks; `peer` is where they are wired into a single
//! coordination engine.

pub mod clock;
pub mod config;
pub mod cs;
pub mod membership;
pub mod peer;
pub mod transport;

pub use clock::Clock;
pub use config::Config;
pub use cs::State;
pub use peer::{spawn_peer, Peer};
pub use transport::{LocalTransport, Rpc, RpcHandler, RpcReply, Transport, TransportError};
