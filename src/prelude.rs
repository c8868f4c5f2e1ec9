//! Convenient re-exports for common usage.
//!
//! This module provides a "prelude" that re-exports the most commonly used types
//! from Duel Link, allowing you to import them all at once.
//!
//! # Usage
//!
//! ```rust
//! use duel_link::prelude::*;
//! ```
//!
//! # What's Included
//!
//! - **Session types**: [`LinkController`], [`SessionBuilder`], [`DuelSession`]
//! - **Core traits**: [`SimulationMemory`], [`RelayTransport`]
//! - **Transports**: [`MemoryRelay`], [`StreamTransport`]
//! - **Fundamental types**: [`Tick`], [`BattlerSlot`], [`PeerId`], [`Outcome`], [`Role`], [`Phase`]
//! - **Events**: [`LinkEvent`], [`TerminationCause`], [`DiscardReason`]
//! - **Error handling**: [`LinkError`]
//! - **Configuration**: [`LinkConfig`]
//!
//! # Example
//!
//! ```rust
//! use duel_link::prelude::*;
//!
//! let relay = MemoryRelay::new();
//! let controller = SessionBuilder::new()
//!     .with_local_peer("blue")
//!     .with_remote_peer("red")
//!     .with_identity(PlayerIdentity::new("BLUE", 2))
//!     .with_local_slots(&[BattlerSlot::new(0)])
//!     .with_remote_slots(&[BattlerSlot::new(1)])
//!     .start_session(relay.connect("blue"))?;
//!
//! assert_eq!(controller.role(), Role::Guest);
//! assert_eq!(controller.phase(), Phase::Handshake);
//! # Ok::<(), LinkError>(())
//! ```

// Core session types
pub use crate::link::controller::LinkController;
pub use crate::link::session::{DuelSession, Phase};
pub use crate::sessions::builder::SessionBuilder;

// Core traits
pub use crate::{RelayTransport, SimulationMemory};

// Transports
pub use crate::network::memory_relay::MemoryRelay;
pub use crate::network::stream_transport::StreamTransport;

// Fundamental types
pub use crate::link::role::Role;
pub use crate::network::messages::{Message, PlayerIdentity, TurnContext};
pub use crate::{BattlerSlot, Outcome, PeerId, Tick};

// Events
pub use crate::{DiscardReason, LinkEvent, TerminationCause};

// Error handling
pub use crate::LinkError;

// Configuration
pub use crate::sessions::config::LinkConfig;
