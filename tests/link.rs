//! Link integration tests.
//!
//! Two controllers (or one controller and a scripted peer) talk through a `MemoryRelay`:
//! - `handshake`: EXCHANGE / READY / GO, ordering and rejection
//! - `relay`: buffer injection, retransmission, dedup and turn context
//! - `stall`: relay and liveness thresholds, safety timeout
//! - `outcome`: outcome mirroring, host authority and disconnects
//! - `properties`: property-based checks of the timing and dedup rules

// Shared test infrastructure
#[path = "common/mod.rs"]
mod common;

mod link {
    pub mod handshake;
    pub mod outcome;
    pub mod properties;
    pub mod relay;
    pub mod stall;
}
