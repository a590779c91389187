//! Command ring with completion correlation.
//!
//! Commands complete strictly in ring order, so correlation is a FIFO whose
//! front must match the completion's TRB pointer. A small reservation pool
//! keeps room for the commands error recovery cannot do without.

extern crate alloc;

use alloc::collections::VecDeque;

use crate::endpoint::EpAddr;
use crate::error::{Error, Result};
use crate::hal::DmaMap;
use crate::ring::{Ring, RingConfig};
use crate::trb::{Trb, TrbC};

/// Opaque ticket for a queued command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandHandle(pub(crate) u64);

impl CommandHandle {
    pub fn raw(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// Completion code reported by the consumer.
    Completed(u8),
    /// Controller died before the command completed.
    Killed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommandKind {
    StopEndpoint(EpAddr),
    SetTrDequeue(EpAddr),
    ResetEndpoint(EpAddr),
    External,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct PendingCommand {
    pub handle: CommandHandle,
    pub dma: u64,
    pub kind: CommandKind,
    /// Deliver the completion to the sink (internal commands stay quiet).
    pub notify: bool,
    pub must_succeed: bool,
}

#[derive(Debug)]
pub(crate) struct CommandRing {
    ring: Ring,
    /// Slots held back for must-succeed commands.
    reserved_trbs: usize,
    used_reserved: usize,
    pending: VecDeque<PendingCommand>,
    next_handle: u64,
}

impl CommandRing {
    pub fn new<M: DmaMap>(config: RingConfig, map: &M) -> Self {
        Self {
            ring: Ring::new(config, map),
            reserved_trbs: 0,
            used_reserved: 0,
            pending: VecDeque::new(),
            next_handle: 1,
        }
    }

    /// Ring pointer register value: base address with the consumer's
    /// starting cycle state in bit 0.
    pub fn crcr(&self) -> u64 {
        self.ring.base_dma() | u64::from(self.ring.cycle_state())
    }

    /// Grow the reservation by one slot, called per registered endpoint so
    /// its stop command can always be queued.
    pub fn reserve_slot(&mut self) {
        self.reserved_trbs += 1;
    }

    /// Shrink the reservation, keeping the floor at the in-flight reserved
    /// count so accounting never goes negative under it.
    pub fn release_slot(&mut self) {
        if self.reserved_trbs > self.used_reserved {
            self.reserved_trbs -= 1;
        }
    }

    /// Queue a command TRB; the caller never touches its cycle bit. With
    /// `must_succeed` the command draws on the reservation instead of
    /// competing for ordinary room.
    pub fn submit(
        &mut self,
        trb: Trb,
        kind: CommandKind,
        notify: bool,
        must_succeed: bool,
    ) -> Result<CommandHandle> {
        let free_reserve = self.reserved_trbs - self.used_reserved;
        if must_succeed {
            if free_reserve == 0 {
                return Err(Error::NoReservation);
            }
            self.ring.prepare(free_reserve)?;
        } else {
            self.ring.prepare(free_reserve + 1)?;
        }
        let mut raw = trb;
        raw.set_cycle_bit(self.ring.cycle_state());
        let dma = self.ring.write_enqueue(raw, false);
        if must_succeed {
            self.used_reserved += 1;
        }
        let handle = CommandHandle(self.next_handle);
        self.next_handle += 1;
        self.pending.push_back(PendingCommand {
            handle,
            dma,
            kind,
            notify,
            must_succeed,
        });
        Ok(handle)
    }

    /// Match a completion against the software dequeue position and retire
    /// the front pending command. A mismatch means software and consumer
    /// disagree about the ring and nothing further can be trusted.
    pub fn correlate(&mut self, reported_dma: u64) -> Result<PendingCommand> {
        let expected = self.ring.dequeue_dma();
        if reported_dma != expected {
            return Err(Error::CommandRingDesync {
                expected,
                reported: reported_dma,
            });
        }
        let raw = self.ring.trb_at(self.ring.dequeue_ptr());
        if TrbC::try_from(raw.0).is_err() {
            return Err(Error::UnexpectedTrbContent(raw.0));
        }
        let front = self.pending.pop_front().ok_or(Error::CommandRingDesync {
            expected,
            reported: reported_dma,
        })?;
        debug_assert_eq!(front.dma, reported_dma);
        self.ring.advance_dequeue();
        if front.must_succeed {
            self.used_reserved -= 1;
        }
        Ok(front)
    }

    /// Drop every pending command; the caller reports them as killed.
    pub fn kill_all(&mut self) -> VecDeque<PendingCommand> {
        self.used_reserved = 0;
        core::mem::take(&mut self.pending)
    }
}
