//! Host-side seams the engine talks through.
//!
//! The engine itself never touches MMIO. Doorbells, run/stop control and
//! completion delivery all go through these traits so the whole ring
//! machinery can run (and be tested) without a controller present.

use crate::command::{CommandHandle, CommandStatus};
use crate::endpoint::EpAddr;
use crate::td::{TdHandle, TransferStatus};

/// Translates a CPU address of ring memory into the address the controller
/// sees on the bus.
pub trait DmaMap {
    fn device_addr(&self, cpu_addr: u64) -> u64;
}

/// Identity translation, for systems where ring memory is mapped 1:1.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityMap;

impl DmaMap for IdentityMap {
    fn device_addr(&self, cpu_addr: u64) -> u64 {
        cpu_addr
    }
}

/// Doorbell register access. `target` is the DCI for transfer rings and 0
/// for the command ring.
pub trait Doorbell {
    fn ring(&self, slot_id: u8, target: u8);
}

/// Controller run/stop control, used only on the failure path.
pub trait RegisterIo {
    /// Stop command ring processing. Best effort; must not block forever.
    fn quiesce(&self);
    /// Halt the controller. Returns `false` if the halt did not take.
    fn halt(&self) -> bool;
}

/// Where retired work goes. Called outside the engine lock, in order.
pub trait CompletionSink {
    fn complete_transfer(&self, td: TdHandle, status: TransferStatus, transferred: u32);
    fn complete_command(&self, cmd: CommandHandle, status: CommandStatus);
    fn port_status_change(&self, port_id: u8);
    fn vendor_event(&self, _trb: [u32; 4]) {}
}

pub trait HostOps: Doorbell + RegisterIo + CompletionSink {}
impl<T: Doorbell + RegisterIo + CompletionSink> HostOps for T {}
