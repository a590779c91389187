//! End-to-end scenarios driving `RingEngine` with hand-built event TRBs.

use std::sync::Mutex;

use xhci::ring::trb::command::Noop;
use xhci_ring::{
    CommandHandle, CommandStatus, CompletionSink, ControllerState, Doorbell, EngineConfig,
    EpAddr, EpState, Error, IdentityMap, RegisterIo, RingConfig, RingEngine, TdHandle,
    TransferRequest, TransferStatus, TrbC, TrbRaw,
};

const COMP_SUCCESS: u8 = 1;
const COMP_BABBLE: u8 = 3;
const COMP_TRB_ERROR: u8 = 5;
const COMP_STALL: u8 = 6;
const COMP_SHORT_PACKET: u8 = 13;
const COMP_STOPPED: u8 = 26;

const SLOT: u8 = 1;
const DCI: u8 = 3;
const EP: EpAddr = EpAddr {
    slot_id: SLOT,
    endpoint_id: DCI,
};

#[derive(Default)]
struct MockHost {
    doorbells: Mutex<Vec<(u8, u8)>>,
    transfers: Mutex<Vec<(TdHandle, TransferStatus, u32)>>,
    commands: Mutex<Vec<(CommandHandle, CommandStatus)>>,
    ports: Mutex<Vec<u8>>,
    vendor: Mutex<Vec<TrbRaw>>,
    halted: Mutex<bool>,
}

impl Doorbell for MockHost {
    fn ring(&self, slot_id: u8, target: u8) {
        self.doorbells.lock().unwrap().push((slot_id, target));
    }
}

impl RegisterIo for MockHost {
    fn quiesce(&self) {}
    fn halt(&self) -> bool {
        *self.halted.lock().unwrap() = true;
        true
    }
}

impl CompletionSink for MockHost {
    fn complete_transfer(&self, td: TdHandle, status: TransferStatus, transferred: u32) {
        self.transfers.lock().unwrap().push((td, status, transferred));
    }
    fn complete_command(&self, cmd: CommandHandle, status: CommandStatus) {
        self.commands.lock().unwrap().push((cmd, status));
    }
    fn port_status_change(&self, port_id: u8) {
        self.ports.lock().unwrap().push(port_id);
    }
    fn vendor_event(&self, trb: TrbRaw) {
        self.vendor.lock().unwrap().push(trb);
    }
}

type Engine = RingEngine<MockHost, IdentityMap>;

fn engine() -> Engine {
    let config = EngineConfig {
        command_ring: RingConfig {
            segments: 1,
            trbs_per_segment: 16,
            chain_links: false,
        },
        event_segments: vec![32],
        ..Default::default()
    };
    RingEngine::new(MockHost::default(), IdentityMap, config)
}

fn ep_config(trbs: usize) -> RingConfig {
    RingConfig {
        segments: 1,
        trbs_per_segment: trbs,
        chain_links: false,
    }
}

fn transfer_event(trb_ptr: u64, code: u8, residue: u32) -> TrbRaw {
    [
        trb_ptr as u32,
        (trb_ptr >> 32) as u32,
        (u32::from(code) << 24) | (residue & 0xff_ffff),
        (u32::from(SLOT) << 24) | (u32::from(DCI) << 16) | (32 << 10),
    ]
}

fn command_completion(trb_ptr: u64, code: u8) -> TrbRaw {
    [
        trb_ptr as u32,
        (trb_ptr >> 32) as u32,
        u32::from(code) << 24,
        (u32::from(SLOT) << 24) | (33 << 10),
    ]
}

fn port_status_event(port: u8) -> TrbRaw {
    [
        u32::from(port) << 24,
        0,
        u32::from(COMP_SUCCESS) << 24,
        34 << 10,
    ]
}

fn cmd_base(engine: &Engine) -> u64 {
    engine.command_ring_pointer() & !0xf
}

fn transfers(engine: &Engine) -> Vec<(TdHandle, TransferStatus, u32)> {
    engine.hooks().transfers.lock().unwrap().clone()
}

fn commands(engine: &Engine) -> Vec<(CommandHandle, CommandStatus)> {
    engine.hooks().commands.lock().unwrap().clone()
}

fn doorbells(engine: &Engine) -> Vec<(u8, u8)> {
    engine.hooks().doorbells.lock().unwrap().clone()
}

#[test]
fn transfers_complete_in_fifo_order() {
    let engine = engine();
    let base = engine.register_endpoint(EP, ep_config(16)).unwrap();

    let a = engine
        .submit(
            EP,
            TransferRequest {
                buffer: 0x10_0000,
                len: 512,
            },
        )
        .unwrap();
    let b = engine
        .submit(
            EP,
            TransferRequest {
                buffer: 0x20_0000,
                len: 1024,
            },
        )
        .unwrap();
    assert_eq!(doorbells(&engine), vec![(SLOT, DCI), (SLOT, DCI)]);

    engine.on_event(transfer_event(base, COMP_SUCCESS, 0));
    engine.on_event(transfer_event(base + 16, COMP_SHORT_PACKET, 24));

    assert_eq!(
        transfers(&engine),
        vec![
            (a, TransferStatus::Success, 512),
            (b, TransferStatus::ShortPacket, 1000),
        ]
    );
    assert_eq!(engine.pending_transfers(EP).unwrap(), 0);
}

#[test]
fn large_buffer_splits_into_chained_elements() {
    let engine = engine();
    let base = engine.register_endpoint(EP, ep_config(16)).unwrap();

    // 256 bytes to the first boundary, one full chunk, then the tail
    let td = engine
        .submit(
            EP,
            TransferRequest {
                buffer: 0xff00,
                len: 0x2_0000,
            },
        )
        .unwrap();
    let (first, last) = engine.td_span(EP, td).unwrap().unwrap();
    assert_eq!(first, base);
    assert_eq!(last, base + 32);

    engine.on_event(transfer_event(last, COMP_SUCCESS, 0));
    assert_eq!(transfers(&engine), vec![(td, TransferStatus::Success, 0x2_0000)]);
}

#[test]
fn td_spans_multiple_segments() {
    let engine = engine();
    let base = engine
        .register_endpoint(
            EP,
            RingConfig {
                segments: 3,
                trbs_per_segment: 5,
                chain_links: false,
            },
        )
        .unwrap();

    // ten full 64 KiB chunks: crosses two link slots
    let td = engine
        .submit(
            EP,
            TransferRequest {
                buffer: 0,
                len: 10 * 0x1_0000,
            },
        )
        .unwrap();
    let (first, last) = engine.td_span(EP, td).unwrap().unwrap();
    assert_eq!(first, base);
    assert_ne!(last, base + 9 * 16, "last element lives in a later segment");

    engine.on_event(transfer_event(last, COMP_SUCCESS, 0));
    assert_eq!(
        transfers(&engine),
        vec![(td, TransferStatus::Success, 10 * 0x1_0000)]
    );
    assert_eq!(engine.pending_transfers(EP).unwrap(), 0);
}

#[test]
fn zero_length_transfer_takes_one_element() {
    let engine = engine();
    let base = engine.register_endpoint(EP, ep_config(16)).unwrap();
    let td = engine
        .submit(
            EP,
            TransferRequest {
                buffer: 0x1000,
                len: 0,
            },
        )
        .unwrap();
    let (first, last) = engine.td_span(EP, td).unwrap().unwrap();
    assert_eq!(first, last);
    engine.on_event(transfer_event(last, COMP_SUCCESS, 0));
    assert_eq!(transfers(&engine), vec![(td, TransferStatus::Success, 0)]);
}

#[test]
fn ring_full_reports_no_room() {
    let engine = engine();
    engine.register_endpoint(EP, ep_config(4)).unwrap();
    let req = TransferRequest {
        buffer: 0x1000,
        len: 8,
    };
    engine.submit(EP, req).unwrap();
    engine.submit(EP, req).unwrap();
    assert_eq!(engine.submit(EP, req), Err(Error::NoRoom));
}

#[test]
fn drained_ring_keeps_accepting_after_enqueue_parks_on_link() {
    let engine = engine();
    let base = engine.register_endpoint(EP, ep_config(4)).unwrap();
    let req = TransferRequest {
        buffer: 0x1000,
        len: 8,
    };
    // the third TD parks the enqueue pointer on the link slot and its
    // retirement wraps the dequeue pointer back to slot 0
    for i in 0..3u64 {
        engine.submit(EP, req).unwrap();
        engine.on_event(transfer_event(base + 16 * i, COMP_SUCCESS, 0));
    }
    let td = engine.submit(EP, req).unwrap();
    engine.on_event(transfer_event(base, COMP_SUCCESS, 0));
    assert_eq!(
        transfers(&engine).last(),
        Some(&(td, TransferStatus::Success, 8))
    );
    assert_eq!(engine.controller_state(), ControllerState::Running);
}

#[test]
fn stall_recovery_lands_past_a_trailing_link() {
    let engine = engine();
    let base = engine
        .register_endpoint(
            EP,
            RingConfig {
                segments: 2,
                trbs_per_segment: 4,
                chain_links: false,
            },
        )
        .unwrap();
    let cmds = cmd_base(&engine);

    // three elements fill segment 0's payload; the repaired dequeue
    // position is the slot after the segment's link
    let a = engine
        .submit(
            EP,
            TransferRequest {
                buffer: 0,
                len: 3 * 0x1_0000,
            },
        )
        .unwrap();
    engine.on_event(transfer_event(base + 16, COMP_STALL, 3 * 0x1_0000));
    assert_eq!(transfers(&engine), vec![(a, TransferStatus::Stall, 0)]);

    engine.on_event(command_completion(cmds, COMP_SUCCESS));
    engine.on_event(command_completion(cmds + 16, COMP_SUCCESS));
    assert_eq!(engine.endpoint_state(EP).unwrap(), EpState::Stopped);

    let b = engine
        .submit(
            EP,
            TransferRequest {
                buffer: 0x2000,
                len: 64,
            },
        )
        .unwrap();
    let (first, _) = engine.td_span(EP, b).unwrap().unwrap();
    assert_ne!(first, base + 48, "element must not land on the link slot");
    engine.on_event(transfer_event(first, COMP_SUCCESS, 0));
    assert_eq!(
        transfers(&engine).last(),
        Some(&(b, TransferStatus::Success, 64))
    );
    assert_eq!(engine.controller_state(), ControllerState::Running);
}

#[test]
fn recovery_submission_is_admitted_while_halted() {
    let engine = engine();
    let base = engine.register_endpoint(EP, ep_config(16)).unwrap();
    let cmds = cmd_base(&engine);
    engine
        .submit(
            EP,
            TransferRequest {
                buffer: 0x1000,
                len: 512,
            },
        )
        .unwrap();
    engine.on_event(transfer_event(base, COMP_STALL, 512));
    assert_eq!(engine.endpoint_state(EP).unwrap(), EpState::Halted);

    // ordinary submission is rejected, the recovery path is not
    let req = TransferRequest {
        buffer: 0x3000,
        len: 8,
    };
    assert_eq!(engine.submit(EP, req), Err(Error::InvalidState(EpState::Halted)));
    let r = engine.submit_recovery(EP, req).unwrap();
    // doorbell stays quiet until the repair completes
    assert_ne!(doorbells(&engine).last(), Some(&(SLOT, DCI)));

    engine.on_event(command_completion(cmds, COMP_SUCCESS));
    engine.on_event(command_completion(cmds + 16, COMP_SUCCESS));
    assert_eq!(engine.endpoint_state(EP).unwrap(), EpState::Running);
    assert_eq!(doorbells(&engine).last(), Some(&(SLOT, DCI)));

    engine.on_event(transfer_event(base + 16, COMP_SUCCESS, 0));
    assert_eq!(
        transfers(&engine).last(),
        Some(&(r, TransferStatus::Success, 8))
    );
}

#[test]
fn cancelled_td_retires_only_after_dequeue_move() {
    let engine = engine();
    let base = engine.register_endpoint(EP, ep_config(16)).unwrap();
    let cmds = cmd_base(&engine);

    // A spans two elements, B one
    let a = engine
        .submit(
            EP,
            TransferRequest {
                buffer: 0xff00,
                len: 0x200,
            },
        )
        .unwrap();
    let b = engine
        .submit(
            EP,
            TransferRequest {
                buffer: 0x30_0000,
                len: 64,
            },
        )
        .unwrap();
    assert_eq!(engine.td_span(EP, a).unwrap(), Some((base, base + 16)));

    engine.cancel(EP, a).unwrap();
    // stop command armed once, command doorbell rung
    assert!(doorbells(&engine).contains(&(0, 0)));

    // consumer reports it stopped inside A, then the stop completes
    engine.on_event(transfer_event(base + 16, COMP_STOPPED, 0x100));
    assert_eq!(engine.endpoint_state(EP).unwrap(), EpState::Stopped);
    engine.on_event(command_completion(cmds, COMP_SUCCESS));

    // A is held back until the dequeue move is acknowledged
    assert!(transfers(&engine).is_empty());
    assert_eq!(engine.pending_transfers(EP).unwrap(), 2);

    engine.on_event(command_completion(cmds + 16, COMP_SUCCESS));
    assert_eq!(transfers(&engine), vec![(a, TransferStatus::Cancelled, 0)]);
    // ring restarted for B
    assert_eq!(doorbells(&engine).last(), Some(&(SLOT, DCI)));
    assert_eq!(engine.endpoint_state(EP).unwrap(), EpState::Running);

    engine.on_event(transfer_event(base + 32, COMP_SUCCESS, 0));
    assert_eq!(
        transfers(&engine),
        vec![
            (a, TransferStatus::Cancelled, 0),
            (b, TransferStatus::Success, 64),
        ]
    );
    // internal commands never show up as command completions
    assert!(commands(&engine).is_empty());
}

#[test]
fn cancel_is_idempotent_and_arms_one_stop() {
    let engine = engine();
    engine.register_endpoint(EP, ep_config(16)).unwrap();
    let a = engine
        .submit(
            EP,
            TransferRequest {
                buffer: 0x1000,
                len: 64,
            },
        )
        .unwrap();
    engine.cancel(EP, a).unwrap();
    engine.cancel(EP, a).unwrap();
    engine.cancel(EP, a).unwrap();
    let db = doorbells(&engine);
    assert_eq!(db.iter().filter(|&&d| d == (0, 0)).count(), 1);
}

#[test]
fn cancel_after_retirement_is_a_noop() {
    let engine = engine();
    let base = engine.register_endpoint(EP, ep_config(16)).unwrap();
    let a = engine
        .submit(
            EP,
            TransferRequest {
                buffer: 0x1000,
                len: 64,
            },
        )
        .unwrap();
    engine.on_event(transfer_event(base, COMP_SUCCESS, 0));
    engine.cancel(EP, a).unwrap();
    // no stop command was armed
    assert!(!doorbells(&engine).contains(&(0, 0)));
}

#[test]
fn cancelled_td_behind_stop_point_is_nooped_in_place() {
    let engine = engine();
    let base = engine.register_endpoint(EP, ep_config(16)).unwrap();
    let cmds = cmd_base(&engine);

    let a = engine
        .submit(
            EP,
            TransferRequest {
                buffer: 0x1000,
                len: 64,
            },
        )
        .unwrap();
    let b = engine
        .submit(
            EP,
            TransferRequest {
                buffer: 0x2000,
                len: 64,
            },
        )
        .unwrap();

    engine.cancel(EP, b).unwrap();
    // consumer stopped inside A, which stays queued
    engine.on_event(transfer_event(base, COMP_STOPPED, 32));
    engine.on_event(command_completion(cmds, COMP_SUCCESS));

    // B needed no dequeue move: retired right away, ring restarted for A
    assert_eq!(transfers(&engine), vec![(b, TransferStatus::Cancelled, 0)]);
    assert_eq!(doorbells(&engine).last(), Some(&(SLOT, DCI)));

    engine.on_event(transfer_event(base, COMP_SUCCESS, 0));
    assert_eq!(
        transfers(&engine),
        vec![
            (b, TransferStatus::Cancelled, 0),
            (a, TransferStatus::Success, 64),
        ]
    );
}

#[test]
fn stall_halts_resets_and_recovers() {
    let engine = engine();
    let base = engine.register_endpoint(EP, ep_config(16)).unwrap();
    let cmds = cmd_base(&engine);

    let a = engine
        .submit(
            EP,
            TransferRequest {
                buffer: 0x1000,
                len: 512,
            },
        )
        .unwrap();
    engine.on_event(transfer_event(base, COMP_STALL, 512));

    // TD fails immediately, endpoint is halted until repair completes
    assert_eq!(transfers(&engine), vec![(a, TransferStatus::Stall, 0)]);
    assert_eq!(engine.endpoint_state(EP).unwrap(), EpState::Halted);
    assert_eq!(
        engine.submit(
            EP,
            TransferRequest {
                buffer: 0x3000,
                len: 8
            }
        ),
        Err(Error::InvalidState(EpState::Halted))
    );

    // reset endpoint, then the dequeue move
    engine.on_event(command_completion(cmds, COMP_SUCCESS));
    engine.on_event(command_completion(cmds + 16, COMP_SUCCESS));
    assert_eq!(engine.endpoint_state(EP).unwrap(), EpState::Stopped);

    // next submission runs normally from the repaired position
    let b = engine
        .submit(
            EP,
            TransferRequest {
                buffer: 0x2000,
                len: 64,
            },
        )
        .unwrap();
    assert_eq!(engine.endpoint_state(EP).unwrap(), EpState::Running);
    engine.on_event(transfer_event(base + 16, COMP_SUCCESS, 0));
    assert_eq!(transfers(&engine).last(), Some(&(b, TransferStatus::Success, 64)));
}

#[test]
fn babble_takes_the_halt_path_and_trb_error_does_not() {
    let engine = engine();
    let base = engine.register_endpoint(EP, ep_config(16)).unwrap();
    let a = engine
        .submit(
            EP,
            TransferRequest {
                buffer: 0x1000,
                len: 64,
            },
        )
        .unwrap();
    engine.on_event(transfer_event(base, COMP_BABBLE, 64));
    assert_eq!(transfers(&engine), vec![(a, TransferStatus::Babble, 0)]);
    assert_eq!(engine.endpoint_state(EP).unwrap(), EpState::Halted);

    let other = EpAddr {
        slot_id: SLOT,
        endpoint_id: 5,
    };
    let base2 = engine.register_endpoint(other, ep_config(16)).unwrap();
    let b = engine
        .submit(
            other,
            TransferRequest {
                buffer: 0x2000,
                len: 64,
            },
        )
        .unwrap();
    engine.on_event([
        base2 as u32,
        (base2 >> 32) as u32,
        (u32::from(COMP_TRB_ERROR) << 24) | 64,
        (u32::from(SLOT) << 24) | (5 << 16) | (32 << 10),
    ]);
    assert_eq!(transfers(&engine).last(), Some(&(b, TransferStatus::TrbError, 0)));
    assert_eq!(engine.endpoint_state(other).unwrap(), EpState::Running);
}

#[test]
fn external_commands_complete_through_the_sink() {
    let engine = engine();
    let cmds = cmd_base(&engine);
    let handle = engine
        .submit_command(TrbC::Noop(Noop::new()), false)
        .unwrap();
    assert_eq!(doorbells(&engine), vec![(0, 0)]);
    engine.on_event(command_completion(cmds, COMP_SUCCESS));
    assert_eq!(
        commands(&engine),
        vec![(handle, CommandStatus::Completed(COMP_SUCCESS))]
    );
}

#[test]
fn command_ring_desync_is_fatal() {
    let engine = engine();
    let cmds = cmd_base(&engine);
    let handle = engine
        .submit_command(TrbC::Noop(Noop::new()), false)
        .unwrap();
    // completion points one slot past the software dequeue
    engine.on_event(command_completion(cmds + 16, COMP_SUCCESS));
    assert_eq!(engine.controller_state(), ControllerState::Dead);
    assert!(*engine.hooks().halted.lock().unwrap());
    assert_eq!(commands(&engine), vec![(handle, CommandStatus::Killed)]);
}

#[test]
fn stop_watchdog_kills_the_controller() {
    let engine = engine();
    engine.register_endpoint(EP, ep_config(16)).unwrap();
    let a = engine
        .submit(
            EP,
            TransferRequest {
                buffer: 0x1000,
                len: 64,
            },
        )
        .unwrap();
    engine.cancel(EP, a).unwrap();

    engine.tick(4999);
    assert_eq!(engine.controller_state(), ControllerState::Running);

    engine.tick(5000);
    assert_eq!(engine.controller_state(), ControllerState::Dead);
    assert!(*engine.hooks().halted.lock().unwrap());
    assert_eq!(transfers(&engine), vec![(a, TransferStatus::Killed, 0)]);
    assert_eq!(
        engine.submit(
            EP,
            TransferRequest {
                buffer: 0x1000,
                len: 64
            }
        ),
        Err(Error::ControllerDead)
    );
}

#[test]
fn port_and_vendor_events_reach_the_sink() {
    let engine = engine();
    engine.on_event(port_status_event(4));
    assert_eq!(*engine.hooks().ports.lock().unwrap(), vec![4]);

    engine.on_event([0xaa, 0xbb, 0xcc, 48 << 10]);
    let vendor = engine.hooks().vendor.lock().unwrap();
    assert_eq!(vendor.len(), 1);
    assert_eq!(vendor[0][0], 0xaa);
}

#[test]
fn unknown_endpoint_event_is_ignored() {
    let engine = engine();
    engine.on_event(transfer_event(0x1000, COMP_SUCCESS, 0));
    assert_eq!(engine.controller_state(), ControllerState::Running);
    assert!(transfers(&engine).is_empty());
}

#[test]
fn endpoint_registration_is_validated() {
    let engine = engine();
    assert_eq!(
        engine.register_endpoint(
            EpAddr {
                slot_id: 1,
                endpoint_id: 0
            },
            ep_config(16)
        ),
        Err(Error::InvalidEndpointAddress(EpAddr {
            slot_id: 1,
            endpoint_id: 0
        }))
    );
    engine.register_endpoint(EP, ep_config(16)).unwrap();
    assert_eq!(
        engine.register_endpoint(EP, ep_config(16)),
        Err(Error::EndpointExists(EP))
    );
    engine.unregister_endpoint(EP).unwrap();
    engine.register_endpoint(EP, ep_config(16)).unwrap();
}
