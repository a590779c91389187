//! Event ring: the consumer side of the protocol.
//!
//! Event segments carry no link slots; the producer walks every slot of
//! every segment in table order and flips its cycle after the last one. The
//! segment table lives in ring-aligned memory so the host can hand its
//! address straight to the controller.

extern crate alloc;

use alloc::vec::Vec;

use crate::hal::DmaMap;
use crate::mem::TrbBuf;
use crate::ring::RingPtr;
use crate::segment::Segment;
use crate::trb::{Trb, TrbRaw};

#[derive(Debug)]
pub struct EventRing {
    segs: Vec<Segment>,
    erst: TrbBuf,
    deq: RingPtr,
    cycle_state: bool,
    // producer side, for feeding events in by software
    enq: RingPtr,
    producer_cycle: bool,
}

impl EventRing {
    pub fn new<M: DmaMap>(seg_trbs: &[usize], map: &M) -> Self {
        assert!(!seg_trbs.is_empty(), "event ring needs at least one segment");
        let segs: Vec<Segment> = seg_trbs.iter().map(|&n| Segment::new(n, map)).collect();
        let mut erst = TrbBuf::new(segs.len());
        for (i, seg) in segs.iter().enumerate() {
            let base = seg.dma();
            erst.set(
                i,
                [base as u32, (base >> 32) as u32, seg.len() as u32, 0],
            );
        }
        Self {
            segs,
            erst,
            deq: RingPtr { seg: 0, idx: 0 },
            cycle_state: true,
            enq: RingPtr { seg: 0, idx: 0 },
            producer_cycle: true,
        }
    }

    /// Segment table base, for the ERSTBA register.
    pub fn erst_base<M: DmaMap>(&self, map: &M) -> u64 {
        map.device_addr(self.erst.head_addr())
    }

    pub fn erst_len(&self) -> usize {
        self.segs.len()
    }

    /// Current dequeue position, for ERDP write-back.
    pub fn erdp(&self) -> u64 {
        self.segs[self.deq.seg].dma_at(self.deq.idx)
    }

    /// Next unprocessed event, if the producer has published one.
    pub fn peek(&self) -> Option<TrbRaw> {
        let trb = self.segs[self.deq.seg].trb(self.deq.idx);
        (trb.cycle_bit() == self.cycle_state).then_some(trb.0)
    }

    pub fn advance(&mut self) {
        self.deq.idx += 1;
        if self.deq.idx == self.segs[self.deq.seg].len() {
            self.deq.idx = 0;
            self.deq.seg += 1;
            if self.deq.seg == self.segs.len() {
                self.deq.seg = 0;
                self.cycle_state = !self.cycle_state;
            }
        }
    }

    /// Publish an event the way the producer would: cycle bit set last-ish
    /// (single volatile store of the whole TRB).
    pub fn push(&mut self, raw: TrbRaw) {
        let mut trb = Trb(raw);
        trb.set_cycle_bit(self.producer_cycle);
        self.segs[self.enq.seg].set_trb(self.enq.idx, trb);
        self.enq.idx += 1;
        if self.enq.idx == self.segs[self.enq.seg].len() {
            self.enq.idx = 0;
            self.enq.seg += 1;
            if self.enq.seg == self.segs.len() {
                self.enq.seg = 0;
                self.producer_cycle = !self.producer_cycle;
            }
        }
    }
}
