//! The ring engine: ties transfer rings, the command ring and the event ring
//! together behind one lock.
//!
//! Completion delivery happens after the lock is dropped, so sinks may call
//! back into the engine (resubmit, cancel) without deadlocking.

extern crate alloc;

use alloc::vec::Vec;
use core::mem;
use core::sync::atomic::{fence, Ordering};

use heapless::LinearMap;
use spin::Mutex;
use xhci::ring::trb::command::{ResetEndpoint, SetTrDequeuePointer, StopEndpoint};
use xhci::ring::trb::event::{CommandCompletion, CompletionCode, TransferEvent};
use xhci::ring::trb::transfer::Normal;

use crate::command::{CommandHandle, CommandKind, CommandRing, CommandStatus};
use crate::endpoint::{Endpoint, EpAddr, EpState};
use crate::error::{Error, Result};
use crate::event::EventRing;
use crate::hal::{DmaMap, HostOps, IdentityMap};
use crate::ring::{Ring, RingConfig};
use crate::td::{
    element_len, td_size, trbs_needed, Td, TdHandle, TransferRequest, TransferStatus,
};
use crate::trb::{trb_type, Trb, TrbC, TrbE, TrbRaw};

pub const MAX_ENDPOINTS: usize = 32;

/// First vendor-defined completion code; the range up to 255 reports
/// implementation-specific success.
const VENDOR_INFO_FIRST: u8 = 224;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Running,
    /// Failure detected; halt in progress.
    Dying,
    Dead,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub command_ring: RingConfig,
    /// TRB counts of the event ring segments.
    pub event_segments: Vec<usize>,
    pub stop_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command_ring: RingConfig {
                segments: 1,
                trbs_per_segment: 64,
                chain_links: false,
            },
            event_segments: alloc::vec![256],
            stop_timeout_ms: 5000,
        }
    }
}

#[derive(Debug)]
enum Notice {
    Transfer {
        td: TdHandle,
        status: TransferStatus,
        transferred: u32,
    },
    Command {
        cmd: CommandHandle,
        status: CommandStatus,
    },
    Port {
        port: u8,
    },
    Vendor {
        raw: TrbRaw,
    },
}

struct Inner {
    state: ControllerState,
    cmd: CommandRing,
    event: EventRing,
    eps: LinearMap<EpAddr, Endpoint, MAX_ENDPOINTS>,
    next_td: u64,
    notices: Vec<Notice>,
    now_ms: u64,
    stop_timeout_ms: u64,
}

pub struct RingEngine<H: HostOps, M: DmaMap = IdentityMap> {
    inner: Mutex<Inner>,
    hooks: H,
    map: M,
}

impl<H: HostOps, M: DmaMap> RingEngine<H, M> {
    pub fn new(hooks: H, map: M, config: EngineConfig) -> Self {
        let cmd = CommandRing::new(config.command_ring, &map);
        let event = EventRing::new(&config.event_segments, &map);
        Self {
            inner: Mutex::new(Inner {
                state: ControllerState::Running,
                cmd,
                event,
                eps: LinearMap::new(),
                next_td: 1,
                notices: Vec::new(),
                now_ms: 0,
                stop_timeout_ms: config.stop_timeout_ms,
            }),
            hooks,
            map,
        }
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn controller_state(&self) -> ControllerState {
        self.inner.lock().state
    }

    /// Command ring pointer register value (base with cycle state in bit 0).
    pub fn command_ring_pointer(&self) -> u64 {
        self.inner.lock().cmd.crcr()
    }

    pub fn erst_base(&self) -> u64 {
        self.inner.lock().event.erst_base(&self.map)
    }

    pub fn erst_len(&self) -> usize {
        self.inner.lock().event.erst_len()
    }

    pub fn erdp(&self) -> u64 {
        self.inner.lock().event.erdp()
    }

    pub fn endpoint_state(&self, ep: EpAddr) -> Result<EpState> {
        let guard = self.inner.lock();
        guard
            .eps
            .get(&ep)
            .map(|e| e.state)
            .ok_or(Error::UnknownEndpoint(ep))
    }

    /// Ring span (first and last element bus address) of an in-flight TD.
    pub fn td_span(&self, ep: EpAddr, td: TdHandle) -> Result<Option<(u64, u64)>> {
        let guard = self.inner.lock();
        let e = guard.eps.get(&ep).ok_or(Error::UnknownEndpoint(ep))?;
        Ok(e.find_pending(td).map(|t| (t.first_dma, t.last_dma)))
    }

    pub fn pending_transfers(&self, ep: EpAddr) -> Result<usize> {
        let guard = self.inner.lock();
        guard
            .eps
            .get(&ep)
            .map(|e| e.pending.len() + e.awaiting_recovery.len())
            .ok_or(Error::UnknownEndpoint(ep))
    }

    /// Set up a transfer ring for an endpoint. Returns the ring base address
    /// for the endpoint context. Also grows the command reservation so the
    /// stop and dequeue-move commands recovery needs can always be queued.
    pub fn register_endpoint(&self, ep: EpAddr, config: RingConfig) -> Result<u64> {
        if ep.endpoint_id == 0 || ep.endpoint_id > 31 {
            return Err(Error::InvalidEndpointAddress(ep));
        }
        let mut guard = self.inner.lock();
        if !matches!(guard.state, ControllerState::Running) {
            return Err(Error::ControllerDead);
        }
        if guard.eps.contains_key(&ep) {
            return Err(Error::EndpointExists(ep));
        }
        let ring = Ring::new(config, &self.map);
        let base = ring.base_dma();
        guard
            .eps
            .insert(ep, Endpoint::new(ring))
            .map_err(|_| Error::TooManyEndpoints)?;
        // two slots: stop plus dequeue-move, or reset plus dequeue-move
        guard.cmd.reserve_slot();
        guard.cmd.reserve_slot();
        Ok(base)
    }

    /// Drop an idle endpoint. Fails while transfers or recovery commands are
    /// outstanding.
    pub fn unregister_endpoint(&self, ep: EpAddr) -> Result<()> {
        let mut guard = self.inner.lock();
        let e = guard.eps.get(&ep).ok_or(Error::UnknownEndpoint(ep))?;
        if !e.pending.is_empty()
            || !e.awaiting_recovery.is_empty()
            || e.stop_pending
            || e.set_deq_pending
        {
            return Err(Error::InvalidState(e.state));
        }
        guard.eps.remove(&ep);
        guard.cmd.release_slot();
        guard.cmd.release_slot();
        Ok(())
    }

    /// Queue a TD on an endpoint's transfer ring.
    ///
    /// The buffer is split at 64 KiB boundaries into chained elements. All
    /// elements are written with the first one's cycle bit inverted, then a
    /// single flip publishes the whole TD; the consumer can never see a
    /// partial TD.
    pub fn submit(&self, ep: EpAddr, req: TransferRequest) -> Result<TdHandle> {
        self.build_td(ep, req, false)
    }

    /// Queue a TD on an endpoint that is still halted, as part of
    /// caller-driven recovery. Ordinary submissions reject halted endpoints.
    pub fn submit_recovery(&self, ep: EpAddr, req: TransferRequest) -> Result<TdHandle> {
        self.build_td(ep, req, true)
    }

    fn build_td(&self, ep: EpAddr, req: TransferRequest, recovery: bool) -> Result<TdHandle> {
        let mut guard = self.inner.lock();
        if !matches!(guard.state, ControllerState::Running) {
            return Err(Error::ControllerDead);
        }
        let inner = &mut *guard;
        let e = inner.eps.get_mut(&ep).ok_or(Error::UnknownEndpoint(ep))?;
        match e.state {
            EpState::Error => return Err(Error::InvalidState(EpState::Error)),
            EpState::Halted if !recovery => return Err(Error::InvalidState(EpState::Halted)),
            EpState::Halted => {
                log::warn!("queueing on halted endpoint {ep:?}");
            }
            EpState::Running | EpState::Stopped => {}
        }
        let num = trbs_needed(req.buffer, req.len);
        e.ring.prepare(num)?;
        let start = e.ring.enqueue_ptr();
        let start_cycle = e.ring.cycle_state();
        let mut addr = req.buffer;
        let mut remaining = req.len;
        let mut first_dma = 0;
        let mut last_dma = 0;
        for i in 0..num {
            let chunk = element_len(addr, remaining);
            let is_last = i == num - 1;
            let mut normal = Normal::new();
            normal
                .set_data_buffer_pointer(addr)
                .set_trb_transfer_length(chunk)
                .set_td_size(td_size(remaining - chunk));
            if is_last {
                normal.set_interrupt_on_completion();
                normal.set_interrupt_on_short_packet();
            } else {
                normal.set_chain_bit();
            }
            let mut trb = Trb(normal.into_raw());
            let cycle = if i == 0 {
                !start_cycle
            } else {
                e.ring.cycle_state()
            };
            trb.set_cycle_bit(cycle);
            let dma = e.ring.write_enqueue(trb, !is_last);
            if i == 0 {
                first_dma = dma;
            }
            last_dma = dma;
            addr += u64::from(chunk);
            remaining -= chunk;
        }
        fence(Ordering::Release);
        let mut first = e.ring.trb_at(start);
        first.set_cycle_bit(start_cycle);
        e.ring.set_trb_at(start, first);

        let handle = TdHandle(inner.next_td);
        inner.next_td += 1;
        e.pending.push_back(Td {
            handle,
            first_dma,
            last_dma,
            len: req.len,
        });
        let ring_db = e.doorbell_allowed();
        if ring_db {
            e.state = EpState::Running;
        }
        drop(guard);
        if ring_db {
            self.hooks.ring(ep.slot_id, ep.endpoint_id);
        }
        Ok(handle)
    }

    /// Ask for a TD to be taken back. Idempotent; a no-op if the TD already
    /// retired. The first cancel on an endpoint arms a stop command and the
    /// failure watchdog; the TD's completion arrives through the sink once
    /// the ring has been repaired.
    pub fn cancel(&self, ep: EpAddr, td: TdHandle) -> Result<()> {
        let mut guard = self.inner.lock();
        if !matches!(guard.state, ControllerState::Running) {
            return Err(Error::ControllerDead);
        }
        let inner = &mut *guard;
        let e = inner.eps.get_mut(&ep).ok_or(Error::UnknownEndpoint(ep))?;
        if e.cancel_requested.contains(&td) || e.awaiting_recovery.contains(&td) {
            return Ok(());
        }
        if e.find_pending(td).is_none() {
            return Ok(());
        }
        let mut ring_db = false;
        if !e.stop_pending {
            let mut stop = StopEndpoint::new();
            stop.set_slot_id(ep.slot_id).set_endpoint_id(ep.endpoint_id);
            inner.cmd.submit(
                Trb(TrbC::StopEndpoint(stop).into_raw()),
                CommandKind::StopEndpoint(ep),
                false,
                true,
            )?;
            e.stop_pending = true;
            e.stop_deadline = Some(inner.now_ms + inner.stop_timeout_ms);
            ring_db = true;
        }
        e.cancel_requested.push(td);
        drop(guard);
        if ring_db {
            self.hooks.ring(0, 0);
        }
        Ok(())
    }

    /// Queue a caller-built command. Completion arrives through the sink
    /// with the handle returned here.
    pub fn submit_command(&self, trb: TrbC, must_succeed: bool) -> Result<CommandHandle> {
        let mut guard = self.inner.lock();
        if !matches!(guard.state, ControllerState::Running) {
            return Err(Error::ControllerDead);
        }
        let handle = guard.cmd.submit(
            Trb(trb.into_raw()),
            CommandKind::External,
            true,
            must_succeed,
        )?;
        drop(guard);
        self.hooks.ring(0, 0);
        Ok(handle)
    }

    /// Manually reset a halted endpoint.
    pub fn reset_endpoint(&self, ep: EpAddr) -> Result<CommandHandle> {
        let mut guard = self.inner.lock();
        if !matches!(guard.state, ControllerState::Running) {
            return Err(Error::ControllerDead);
        }
        let inner = &mut *guard;
        let e = inner.eps.get(&ep).ok_or(Error::UnknownEndpoint(ep))?;
        if e.state != EpState::Halted {
            return Err(Error::InvalidState(e.state));
        }
        let mut reset = ResetEndpoint::new();
        reset.set_slot_id(ep.slot_id).set_endpoint_id(ep.endpoint_id);
        let handle = inner.cmd.submit(
            Trb(TrbC::ResetEndpoint(reset).into_raw()),
            CommandKind::ResetEndpoint(ep),
            true,
            false,
        )?;
        drop(guard);
        self.hooks.ring(0, 0);
        Ok(handle)
    }

    /// Feed one event TRB in and process everything that is ready.
    pub fn on_event(&self, raw: TrbRaw) {
        self.inner.lock().event.push(raw);
        self.process_events();
    }

    /// Drain the event ring, dispatching each published event. Stops on the
    /// first condition software and consumer disagree about and halts the
    /// controller in that case.
    pub fn process_events(&self) {
        let mut fatal = None;
        let mut guard = self.inner.lock();
        while matches!(guard.state, ControllerState::Running) {
            let Some(raw) = guard.event.peek() else {
                break;
            };
            let res = Self::handle_event(&mut *guard, &self.hooks, raw);
            guard.event.advance();
            if let Err(e) = res {
                fatal = Some(e);
                break;
            }
        }
        let notices = mem::take(&mut guard.notices);
        drop(guard);
        self.deliver(notices);
        if let Some(e) = fatal {
            log::error!("fatal ring condition: {e:?}");
            self.escalate();
        }
    }

    /// Watchdog. Call with a monotonic millisecond clock; if a stop command
    /// has been outstanding past the timeout the controller is considered
    /// gone and everything in flight is failed.
    pub fn tick(&self, now_ms: u64) {
        let mut guard = self.inner.lock();
        guard.now_ms = now_ms;
        let expired = matches!(guard.state, ControllerState::Running)
            && guard
                .eps
                .iter()
                .any(|(_, e)| e.stop_deadline.is_some_and(|d| d <= now_ms));
        drop(guard);
        if expired {
            log::error!("stop command timed out, assuming controller failure");
            self.escalate();
        }
    }

    fn handle_event(inner: &mut Inner, hooks: &H, raw: TrbRaw) -> Result<()> {
        match TrbE::try_from(raw) {
            Ok(TrbE::TransferEvent(ev)) => Self::handle_transfer_event(inner, hooks, &ev),
            Ok(TrbE::CommandCompletion(ev)) => Self::handle_cmd_completion(inner, hooks, &ev),
            Ok(TrbE::PortStatusChange(ev)) => {
                inner.notices.push(Notice::Port {
                    port: ev.port_id(),
                });
                Ok(())
            }
            Ok(other) => {
                log::debug!("ignoring event: {other:?}");
                Ok(())
            }
            Err(raw) => {
                if Trb(raw).trb_type() >= trb_type::VENDOR_FIRST {
                    inner.notices.push(Notice::Vendor { raw });
                } else {
                    log::warn!("unrecognized event TRB: {raw:08x?}");
                }
                Ok(())
            }
        }
    }

    fn handle_cmd_completion(
        inner: &mut Inner,
        hooks: &H,
        ev: &CommandCompletion,
    ) -> Result<()> {
        let code = match ev.completion_code() {
            Ok(c) => c as u8,
            Err(raw) => raw,
        };
        let done = inner.cmd.correlate(ev.command_trb_pointer())?;
        match done.kind {
            CommandKind::StopEndpoint(ep) => Self::handle_stopped_endpoint(inner, hooks, ep),
            CommandKind::SetTrDequeue(ep) => {
                Self::handle_set_deq_completion(inner, hooks, ep, code)
            }
            CommandKind::ResetEndpoint(ep) => Self::handle_reset_ep_completion(inner, hooks, ep),
            CommandKind::External => {}
        }
        if done.notify {
            inner.notices.push(Notice::Command {
                cmd: done.handle,
                status: CommandStatus::Completed(code),
            });
        }
        Ok(())
    }

    /// The consumer acknowledged a stop. Sort the cancelled TDs: the one the
    /// consumer stopped inside needs the dequeue pointer moved past it, the
    /// rest are overwritten with no-ops in place. Cancelled TDs retire only
    /// once the ring is consistent again.
    fn handle_stopped_endpoint(inner: &mut Inner, hooks: &H, ep: EpAddr) {
        let Some(e) = inner.eps.get_mut(&ep) else {
            return;
        };
        e.stop_pending = false;
        e.stop_deadline = None;
        if e.state == EpState::Running {
            e.state = EpState::Stopped;
        }
        let cancelled = mem::take(&mut e.cancel_requested);
        let stopped_dma = e.stopped_dma.take();
        if cancelled.is_empty() {
            Self::restart_endpoint(e, hooks, ep);
            return;
        }
        let mut new_deq = None;
        let mut batch = Vec::new();
        for handle in cancelled {
            let Some(pos) = e.pending.iter().position(|t| t.handle == handle) else {
                // retired normally before the stop took effect
                continue;
            };
            let Some(td) = e.pending.remove(pos) else {
                continue;
            };
            let hit = stopped_dma
                .is_some_and(|dma| e.ring.dma_in_range(td.first_dma, td.last_dma, dma));
            let fixup = if hit {
                // stopped_dma is Some here
                let dma = stopped_dma.unwrap_or(td.first_dma);
                e.ring
                    .new_dequeue_state(dma, td.last_dma)
                    .map(|state| new_deq = Some(state))
            } else {
                e.ring.td_to_noop(td.first_dma, td.last_dma)
            };
            if let Err(err) = fixup {
                log::error!("ring repair failed on {ep:?}: {err:?}");
                e.state = EpState::Error;
                inner.notices.push(Notice::Transfer {
                    td: handle,
                    status: TransferStatus::Cancelled,
                    transferred: 0,
                });
                return;
            }
            batch.push(handle);
        }
        if let Some((ptr, cycle)) = new_deq {
            e.set_deq_pending = true;
            e.queued_deq = Some((ptr, cycle));
            e.awaiting_recovery.extend(batch);
            let deq_dma = e.ring.dma_at(ptr);
            if Self::queue_set_deq(inner, ep, deq_dma, cycle).is_err() {
                // reservation keeps room; losing it means the command ring
                // is gone, so fail the batch instead of wedging the endpoint
                log::error!("failed to queue dequeue move for {ep:?}");
                if let Some(e) = inner.eps.get_mut(&ep) {
                    e.state = EpState::Error;
                    e.set_deq_pending = false;
                    e.queued_deq = None;
                    for handle in mem::take(&mut e.awaiting_recovery) {
                        inner.notices.push(Notice::Transfer {
                            td: handle,
                            status: TransferStatus::Cancelled,
                            transferred: 0,
                        });
                    }
                }
                return;
            }
            hooks.ring(0, 0);
        } else {
            for handle in batch {
                inner.notices.push(Notice::Transfer {
                    td: handle,
                    status: TransferStatus::Cancelled,
                    transferred: 0,
                });
            }
            if let Some(e) = inner.eps.get_mut(&ep) {
                Self::restart_endpoint(e, hooks, ep);
            }
        }
    }

    fn queue_set_deq(inner: &mut Inner, ep: EpAddr, deq_dma: u64, cycle: bool) -> Result<()> {
        let mut cmd = SetTrDequeuePointer::new();
        cmd.set_slot_id(ep.slot_id)
            .set_endpoint_id(ep.endpoint_id)
            .set_new_tr_dequeue_pointer(deq_dma);
        let mut trb = Trb(TrbC::SetTrDequeuePointer(cmd).into_raw());
        // dequeue cycle state rides bit 0 of the pointer field
        if cycle {
            trb.0[0] |= 1;
        } else {
            trb.0[0] &= !1;
        }
        inner
            .cmd
            .submit(trb, CommandKind::SetTrDequeue(ep), false, true)
            .map(|_| ())
    }

    fn handle_set_deq_completion(inner: &mut Inner, hooks: &H, ep: EpAddr, code: u8) {
        let Some(e) = inner.eps.get_mut(&ep) else {
            return;
        };
        e.set_deq_pending = false;
        let queued = e.queued_deq.take();
        if code == CompletionCode::Success as u8 {
            if let Some((ptr, _cycle)) = queued {
                if !e.ring.update_dequeue_to(ptr) {
                    log::warn!("dequeue target unreachable on {ep:?}, keeping old pointer");
                }
            }
        } else {
            log::warn!("dequeue move rejected on {ep:?}, code {code}");
        }
        for handle in mem::take(&mut e.awaiting_recovery) {
            inner.notices.push(Notice::Transfer {
                td: handle,
                status: TransferStatus::Cancelled,
                transferred: 0,
            });
        }
        Self::restart_endpoint(e, hooks, ep);
    }

    fn handle_reset_ep_completion(inner: &mut Inner, hooks: &H, ep: EpAddr) {
        let Some(e) = inner.eps.get_mut(&ep) else {
            return;
        };
        if e.state == EpState::Halted {
            e.state = EpState::Stopped;
        }
        Self::restart_endpoint(e, hooks, ep);
    }

    fn restart_endpoint(e: &mut Endpoint, hooks: &H, ep: EpAddr) {
        if !e.pending.is_empty() && e.doorbell_allowed() {
            e.state = EpState::Running;
            hooks.ring(ep.slot_id, ep.endpoint_id);
        }
    }

    fn handle_transfer_event(inner: &mut Inner, hooks: &H, ev: &TransferEvent) -> Result<()> {
        let ep = EpAddr {
            slot_id: ev.slot_id(),
            endpoint_id: ev.endpoint_id(),
        };
        let trb_dma = ev.trb_pointer();
        let residue = ev.trb_transfer_length();
        let code = ev.completion_code();

        let Some(e) = inner.eps.get_mut(&ep) else {
            log::warn!("transfer event for unknown endpoint {ep:?}");
            return Ok(());
        };

        // events the consumer raises without a TD attached
        if matches!(
            code,
            Ok(CompletionCode::RingUnderrun) | Ok(CompletionCode::RingOverrun)
        ) {
            log::debug!("ring underrun/overrun on {ep:?}");
            return Ok(());
        }

        // stop acknowledgements carry the position, not a retirement
        if matches!(
            code,
            Ok(CompletionCode::Stopped) | Ok(CompletionCode::StoppedLengthInvalid)
        ) {
            e.state = EpState::Stopped;
            e.stopped_dma = Some(trb_dma);
            return Ok(());
        }

        let Some(&td) = e.pending.front() else {
            log::warn!("transfer event on {ep:?} with nothing in flight");
            return Ok(());
        };

        if !e.ring.dma_in_range(td.first_dma, td.last_dma, trb_dma) {
            // consumer reports progress outside the oldest TD; the rings
            // are no longer describing the same world
            return Err(Error::TdNotFound { dma: trb_dma });
        }

        if e
            .ring
            .ptr_of(trb_dma)
            .map(|p| e.ring.trb_at(p))
            .is_some_and(|t| t.is_transfer_noop())
        {
            log::debug!("event on cancelled element, skipping");
            return Ok(());
        }

        let transferred = td.len.saturating_sub(residue);
        let (status, halts) = match code {
            Ok(CompletionCode::Success) => (TransferStatus::Success, false),
            Ok(CompletionCode::ShortPacket) => (TransferStatus::ShortPacket, false),
            Ok(CompletionCode::StallError) => (TransferStatus::Stall, true),
            Ok(CompletionCode::BabbleDetectedError) => (TransferStatus::Babble, true),
            Ok(CompletionCode::UsbTransactionError)
            | Ok(CompletionCode::SplitTransactionError) => {
                (TransferStatus::TransactionError, true)
            }
            Ok(CompletionCode::TrbError) => (TransferStatus::TrbError, false),
            Ok(CompletionCode::DataBufferError) => (TransferStatus::BufferOverrun, false),
            Err(raw) if raw >= VENDOR_INFO_FIRST => (TransferStatus::Success, false),
            other => {
                log::warn!("unhandled completion code {other:?} on {ep:?}");
                return Ok(());
            }
        };

        if halts {
            return Self::halt_endpoint_cleanup(inner, hooks, ep, td, trb_dma, status, transferred);
        }

        e.ring.advance_dequeue_past(td.last_dma)?;
        e.pending.pop_front();
        e.cancel_requested.retain(|h| *h != td.handle);
        inner.notices.push(Notice::Transfer {
            td: td.handle,
            status,
            transferred,
        });
        Ok(())
    }

    /// The consumer halted on this TD. Retire it with the error right away,
    /// then repair: reset the endpoint and move its dequeue pointer past the
    /// offending TD. The software dequeue follows only when the consumer
    /// acknowledges the move.
    fn halt_endpoint_cleanup(
        inner: &mut Inner,
        hooks: &H,
        ep: EpAddr,
        td: Td,
        stopped_dma: u64,
        status: TransferStatus,
        transferred: u32,
    ) -> Result<()> {
        let Some(e) = inner.eps.get_mut(&ep) else {
            return Ok(());
        };
        e.state = EpState::Halted;
        e.pending.pop_front();
        e.cancel_requested.retain(|h| *h != td.handle);
        let (ptr, cycle) = e.ring.new_dequeue_state(stopped_dma, td.last_dma)?;
        e.set_deq_pending = true;
        e.queued_deq = Some((ptr, cycle));
        let deq_dma = e.ring.dma_at(ptr);

        let mut reset = ResetEndpoint::new();
        reset.set_slot_id(ep.slot_id).set_endpoint_id(ep.endpoint_id);
        inner.cmd.submit(
            Trb(TrbC::ResetEndpoint(reset).into_raw()),
            CommandKind::ResetEndpoint(ep),
            false,
            true,
        )?;
        Self::queue_set_deq(inner, ep, deq_dma, cycle)?;
        inner.notices.push(Notice::Transfer {
            td: td.handle,
            status,
            transferred,
        });
        hooks.ring(0, 0);
        Ok(())
    }

    /// Failure path: stop feeding the controller, halt it, fail everything
    /// still in flight.
    fn escalate(&self) {
        let mut guard = self.inner.lock();
        if !matches!(guard.state, ControllerState::Running) {
            return;
        }
        guard.state = ControllerState::Dying;
        let pre = mem::take(&mut guard.notices);
        drop(guard);
        self.deliver(pre);

        log::error!("halting host controller");
        self.hooks.quiesce();
        if !self.hooks.halt() {
            log::error!("controller refused to halt");
        }

        let mut guard = self.inner.lock();
        guard.state = ControllerState::Dead;
        let inner = &mut *guard;
        for (_, e) in inner.eps.iter_mut() {
            e.cancel_requested.clear();
            e.stop_pending = false;
            e.set_deq_pending = false;
            e.stop_deadline = None;
            e.queued_deq = None;
            e.state = EpState::Error;
            for td in e.pending.drain(..) {
                inner.notices.push(Notice::Transfer {
                    td: td.handle,
                    status: TransferStatus::Killed,
                    transferred: 0,
                });
            }
            for handle in e.awaiting_recovery.drain(..) {
                inner.notices.push(Notice::Transfer {
                    td: handle,
                    status: TransferStatus::Killed,
                    transferred: 0,
                });
            }
        }
        for cmd in inner.cmd.kill_all() {
            if cmd.notify {
                inner.notices.push(Notice::Command {
                    cmd: cmd.handle,
                    status: CommandStatus::Killed,
                });
            }
        }
        let notices = mem::take(&mut inner.notices);
        drop(guard);
        self.deliver(notices);
    }

    fn deliver(&self, notices: Vec<Notice>) {
        for notice in notices {
            match notice {
                Notice::Transfer {
                    td,
                    status,
                    transferred,
                } => self.hooks.complete_transfer(td, status, transferred),
                Notice::Command { cmd, status } => self.hooks.complete_command(cmd, status),
                Notice::Port { port } => self.hooks.port_status_change(port),
                Notice::Vendor { raw } => self.hooks.vendor_event(raw),
            }
        }
    }
}
