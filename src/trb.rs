//! Raw TRB access.
//!
//! Rings store TRBs as raw `[u32; 4]` words; the typed `Allowed` enums from
//! the `xhci` crate are conversion layers on top, used where a whole TRB is
//! built or decoded. Control-field twiddling (cycle, chain, toggle) happens
//! on the raw words because it must not care which TRB type it touches.

use bit_field::BitField;
use xhci::ring::trb::Link;

pub use xhci::ring::trb::command::Allowed as TrbC;
pub use xhci::ring::trb::event::Allowed as TrbE;
pub use xhci::ring::trb::transfer::Allowed as TrbT;

pub type TrbRaw = [u32; 4];

/// TRB type IDs (control word bits 10..16).
pub mod trb_type {
    pub const NORMAL: u32 = 1;
    pub const LINK: u32 = 6;
    pub const NO_OP_TRANSFER: u32 = 8;
    pub const NO_OP_COMMAND: u32 = 23;
    pub const TRANSFER_EVENT: u32 = 32;
    pub const COMMAND_COMPLETION: u32 = 33;
    pub const PORT_STATUS_CHANGE: u32 = 34;
    /// First vendor-defined type; everything at or above is vendor territory.
    pub const VENDOR_FIRST: u32 = 48;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trb(pub TrbRaw);

impl Trb {
    pub const ZERO: Self = Self([0; 4]);

    pub fn cycle_bit(&self) -> bool {
        self.0[3].get_bit(0)
    }

    pub fn set_cycle_bit(&mut self, value: bool) -> &mut Self {
        self.0[3].set_bit(0, value);
        self
    }

    pub fn flip_cycle(&mut self) -> &mut Self {
        let cur = self.cycle_bit();
        self.set_cycle_bit(!cur)
    }

    pub fn chain_bit(&self) -> bool {
        self.0[3].get_bit(4)
    }

    pub fn set_chain_bit(&mut self, value: bool) -> &mut Self {
        self.0[3].set_bit(4, value);
        self
    }

    /// Toggle-cycle flag; only meaningful on link TRBs.
    pub fn toggle_cycle(&self) -> bool {
        self.0[3].get_bit(1)
    }

    pub fn interrupt_on_completion(&self) -> bool {
        self.0[3].get_bit(5)
    }

    /// Status word (word 2): transfer length, TD size, interrupter target.
    pub fn status(&self) -> u32 {
        self.0[2]
    }

    pub fn trb_type(&self) -> u32 {
        self.0[3].get_bits(10..16)
    }

    /// 64-bit parameter field (words 0 and 1).
    pub fn parameter(&self) -> u64 {
        (self.0[0] as u64) | ((self.0[1] as u64) << 32)
    }

    pub fn is_link(&self) -> bool {
        self.trb_type() == trb_type::LINK
    }

    pub fn is_transfer_noop(&self) -> bool {
        self.trb_type() == trb_type::NO_OP_TRANSFER
    }

    /// Overwrite this TRB with a transfer no-op, keeping only the cycle bit
    /// so the controller's cycle match is undisturbed.
    pub fn to_transfer_noop(&mut self) {
        let cycle = self.cycle_bit();
        self.0 = [0; 4];
        self.0[3].set_bits(10..16, trb_type::NO_OP_TRANSFER);
        self.set_cycle_bit(cycle);
    }

    /// Build a link TRB pointing at `target`. Cycle starts clear; the ring
    /// hands it to the controller when it first rolls over the slot.
    pub fn new_link(target: u64, toggle: bool) -> Self {
        let mut link = Link::new();
        link.set_ring_segment_pointer(target);
        if toggle {
            link.set_toggle_cycle();
        }
        Self(link.into_raw())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xhci::ring::trb::transfer::Normal;

    #[test]
    fn control_bits() {
        let mut trb = Trb::ZERO;
        assert!(!trb.cycle_bit());
        trb.set_cycle_bit(true).set_chain_bit(true);
        assert!(trb.cycle_bit());
        assert!(trb.chain_bit());
        trb.flip_cycle();
        assert!(!trb.cycle_bit());
        assert!(trb.chain_bit());
    }

    #[test]
    fn link_construction() {
        let link = Trb::new_link(0x1000, true);
        assert!(link.is_link());
        assert!(link.toggle_cycle());
        assert_eq!(link.parameter(), 0x1000);
        let plain = Trb::new_link(0x2000, false);
        assert!(!plain.toggle_cycle());
    }

    #[test]
    fn noop_overwrite_keeps_cycle() {
        let mut trb = Trb([0xdead, 0xbeef, 0x1234, 0]);
        trb.set_cycle_bit(true).set_chain_bit(true);
        trb.to_transfer_noop();
        assert!(trb.is_transfer_noop());
        assert!(trb.cycle_bit());
        assert!(!trb.chain_bit());
        assert_eq!(trb.parameter(), 0);
    }

    #[test]
    fn typed_round_trip() {
        let raw = Trb::new_link(0x4000, true).0;
        match TrbT::try_from(raw) {
            Ok(TrbT::Link(l)) => assert_eq!(l.ring_segment_pointer(), 0x4000),
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn transfer_fields_visible_through_raw_words() {
        let mut normal = Normal::new();
        normal.set_trb_transfer_length(0x200);
        let plain = Trb(TrbT::Normal(normal).into_raw());
        assert!(!plain.interrupt_on_completion());
        normal.set_interrupt_on_completion();
        let trb = Trb(TrbT::Normal(normal).into_raw());
        assert!(trb.interrupt_on_completion());
        assert_eq!(trb.status() & 0x1_ffff, 0x200);
    }
}
