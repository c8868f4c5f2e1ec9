//! Common test infrastructure shared across integration tests.
//!
//! This module provides:
//! - `stubs`: a battle simulation stub implementing `SimulationMemory`
//! - `harness`: a host/guest pair over `MemoryRelay`, a scripted peer and a short-deadline
//!   configuration
//!
//! # Usage
//!
//! From any integration test file:
//! ```ignore
//! #[path = "common/mod.rs"]
//! mod common;
//! use common::{DuelPair, SimStub};
//! ```

pub mod harness;
pub mod stubs;

// Each test binary uses a different subset.
#[allow(unused_imports)]
pub use harness::{
    init_tracing, roster_of, singles_controller, test_config, DuelPair, ScriptedPeer, GUEST, HOST,
    HOST_SEED, MAX_TICKS, OPPONENT_SLOT, OWN_SLOT,
};
#[allow(unused_imports)]
pub use stubs::SimStub;
