extern crate alloc;

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::ring::{Ring, RingPtr};
use crate::td::{Td, TdHandle};

/// Endpoint address: device slot plus device context index (1..=31).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EpAddr {
    pub slot_id: u8,
    pub endpoint_id: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpState {
    Running,
    /// Consumer acknowledged a stop request; ring position is known.
    Stopped,
    /// Consumer raised an error condition; needs reset plus dequeue fix-up.
    Halted,
    /// Recovery itself failed; only teardown is left.
    Error,
}

/// Per-endpoint engine state. The in-flight queue is FIFO: the consumer
/// retires TDs in ring order, so the front is always the oldest.
#[derive(Debug)]
pub(crate) struct Endpoint {
    pub ring: Ring,
    pub state: EpState,
    pub pending: VecDeque<Td>,
    /// Handles the caller asked to cancel; resolved when the stop completes.
    pub cancel_requested: Vec<TdHandle>,
    /// Cancelled TDs held back until the dequeue move is acknowledged.
    pub awaiting_recovery: Vec<TdHandle>,
    /// A stop command is on the command ring for this endpoint.
    pub stop_pending: bool,
    /// A dequeue-move command is outstanding; doorbells are suppressed.
    pub set_deq_pending: bool,
    /// Position queued with the outstanding dequeue-move command.
    pub queued_deq: Option<(RingPtr, bool)>,
    /// Where the consumer reported it stopped, if mid-stream.
    pub stopped_dma: Option<u64>,
    /// Watchdog deadline for the outstanding stop command.
    pub stop_deadline: Option<u64>,
}

impl Endpoint {
    pub fn new(ring: Ring) -> Self {
        Self {
            ring,
            state: EpState::Running,
            pending: VecDeque::new(),
            cancel_requested: Vec::new(),
            awaiting_recovery: Vec::new(),
            stop_pending: false,
            set_deq_pending: false,
            queued_deq: None,
            stopped_dma: None,
            stop_deadline: None,
        }
    }

    pub fn doorbell_allowed(&self) -> bool {
        !matches!(self.state, EpState::Halted | EpState::Error)
            && !self.set_deq_pending
            && !self.stop_pending
    }

    pub fn find_pending(&self, handle: TdHandle) -> Option<&Td> {
        self.pending.iter().find(|td| td.handle == handle)
    }
}
