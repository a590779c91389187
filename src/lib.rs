//! xHCI transfer-ring engine.
//!
//! Software produces TRBs onto transfer and command rings and consumes the
//! event ring; the controller does the opposite. Ownership of each slot is
//! carried by its cycle bit, segments are chained with link TRBs, and the
//! final link's toggle flag flips the cycle sense once per lap.
//!
//! [`controller::RingEngine`] is the entry point: register endpoints, queue
//! TDs, cancel them, and feed events in. Hardware access is abstracted by
//! the [`hal`] traits, so the engine also runs against mocks on the host.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod command;
pub mod controller;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod hal;
pub mod mem;
pub mod ring;
pub mod segment;
pub mod td;
pub mod trb;

pub use command::{CommandHandle, CommandStatus};
pub use controller::{ControllerState, EngineConfig, RingEngine, MAX_ENDPOINTS};
pub use endpoint::{EpAddr, EpState};
pub use error::{Error, Result};
pub use hal::{CompletionSink, DmaMap, Doorbell, HostOps, IdentityMap, RegisterIo};
pub use ring::RingConfig;
pub use td::{TdHandle, TransferRequest, TransferStatus, TRB_MAX_BUFF_SIZE};
pub use trb::{TrbC, TrbE, TrbRaw, TrbT};
