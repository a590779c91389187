//! Producer/consumer ring core.
//!
//! A ring is a list of segments chained through link slots. The producer and
//! consumer never exchange indices, only the cycle bit: a slot belongs to the
//! consumer while its cycle bit matches the producer's current cycle state.
//! The final segment's link carries the toggle flag, flipping the cycle sense
//! once per lap.

extern crate alloc;

use alloc::vec::Vec;
use core::sync::atomic::{fence, Ordering};

use crate::error::{Error, Result};
use crate::hal::DmaMap;
use crate::segment::Segment;
use crate::trb::Trb;

/// Position on a ring: segment number plus slot index within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingPtr {
    pub seg: usize,
    pub idx: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct RingConfig {
    pub segments: usize,
    pub trbs_per_segment: usize,
    /// Keep the chain bit permanently set on link slots. Some controllers
    /// stop mid-TD otherwise.
    pub chain_links: bool,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            segments: 2,
            trbs_per_segment: 256,
            chain_links: false,
        }
    }
}

#[derive(Debug)]
pub struct Ring {
    segs: Vec<Segment>,
    enq: RingPtr,
    deq: RingPtr,
    cycle_state: bool,
    chain_links: bool,
}

impl Ring {
    pub fn new<M: DmaMap>(config: RingConfig, map: &M) -> Self {
        assert!(config.segments >= 1, "ring needs at least one segment");
        assert!(
            config.trbs_per_segment >= 2,
            "segment needs a payload slot besides the link slot"
        );
        let mut segs: Vec<Segment> = (0..config.segments)
            .map(|_| Segment::new(config.trbs_per_segment, map))
            .collect();
        let targets: Vec<u64> = (0..config.segments)
            .map(|i| segs[(i + 1) % config.segments].dma())
            .collect();
        let last = config.segments - 1;
        for (i, seg) in segs.iter_mut().enumerate() {
            seg.install_link(targets[i], i == last, config.chain_links);
        }
        Self {
            segs,
            enq: RingPtr { seg: 0, idx: 0 },
            deq: RingPtr { seg: 0, idx: 0 },
            cycle_state: true,
            chain_links: config.chain_links,
        }
    }

    pub fn base_dma(&self) -> u64 {
        self.segs[0].dma()
    }

    pub fn cycle_state(&self) -> bool {
        self.cycle_state
    }

    pub fn enqueue_ptr(&self) -> RingPtr {
        self.enq
    }

    pub fn dequeue_ptr(&self) -> RingPtr {
        self.deq
    }

    pub fn dequeue_dma(&self) -> u64 {
        self.dma_at(self.deq)
    }

    pub fn is_empty(&self) -> bool {
        // the enqueue pointer may be parked on a link slot at a TD boundary
        self.skip_links(self.enq) == self.deq
    }

    fn slots(&self) -> usize {
        self.segs.iter().map(Segment::len).sum()
    }

    fn is_link_slot(&self, p: RingPtr) -> bool {
        p.idx == self.segs[p.seg].len() - 1
    }

    fn next_seg_start(&self, p: RingPtr) -> RingPtr {
        RingPtr {
            seg: (p.seg + 1) % self.segs.len(),
            idx: 0,
        }
    }

    fn skip_links(&self, mut p: RingPtr) -> RingPtr {
        while self.is_link_slot(p) {
            p = self.next_seg_start(p);
        }
        p
    }

    /// One slot forward, visiting link slots.
    fn step_raw(&self, p: RingPtr) -> RingPtr {
        if self.is_link_slot(p) {
            self.next_seg_start(p)
        } else {
            RingPtr {
                seg: p.seg,
                idx: p.idx + 1,
            }
        }
    }

    pub fn trb_at(&self, p: RingPtr) -> Trb {
        self.segs[p.seg].trb(p.idx)
    }

    pub fn set_trb_at(&mut self, p: RingPtr, trb: Trb) {
        self.segs[p.seg].set_trb(p.idx, trb)
    }

    pub fn dma_at(&self, p: RingPtr) -> u64 {
        self.segs[p.seg].dma_at(p.idx)
    }

    pub fn ptr_of(&self, dma: u64) -> Option<RingPtr> {
        self.segs
            .iter()
            .enumerate()
            .find_map(|(seg, s)| s.index_of(dma).map(|idx| RingPtr { seg, idx }))
    }

    /// Count of slots a producer may still fill. Link slots and the one
    /// mandatory empty slot are excluded.
    pub fn room_on_ring(&self, num_trbs: usize) -> bool {
        // compare past any parked link slot, or an empty ring with the
        // enqueue pointer resting on a link looks full forever
        let mut p = self.skip_links(self.enq);
        if p == self.deq {
            let payload: usize = self.segs.iter().map(|s| s.len() - 1).sum();
            return num_trbs <= payload - 1;
        }
        // n slots for the TRBs plus one that must stay empty
        for _ in 0..=num_trbs {
            if p == self.deq {
                return false;
            }
            p.idx += 1;
            p = self.skip_links(p);
        }
        true
    }

    /// Check room for `num_trbs` and hand any link slot the enqueue pointer
    /// rests on over to the consumer.
    pub fn prepare(&mut self, num_trbs: usize) -> Result<()> {
        if !self.room_on_ring(num_trbs) {
            return Err(Error::NoRoom);
        }
        while self.is_link_slot(self.enq) {
            let mut link = self.trb_at(self.enq);
            if !self.chain_links {
                link.set_chain_bit(false);
                self.set_trb_at(self.enq, link);
            }
            fence(Ordering::Release);
            link.flip_cycle();
            self.set_trb_at(self.enq, link);
            if link.toggle_cycle() {
                self.cycle_state = !self.cycle_state;
            }
            self.enq = self.next_seg_start(self.enq);
        }
        Ok(())
    }

    /// Write a TRB at the enqueue pointer and advance it. The caller has
    /// already put the right cycle and chain bits on `trb`. Returns the bus
    /// address of the written slot.
    pub fn write_enqueue(&mut self, trb: Trb, more_trbs_coming: bool) -> u64 {
        let dma = self.dma_at(self.enq);
        self.set_trb_at(self.enq, trb);
        self.advance_enqueue(more_trbs_coming);
        dma
    }

    /// Move the enqueue pointer past the slot just written. When the pointer
    /// lands on a link slot the chain state of the previous TRB decides the
    /// hand-off: mid-TD (chain set) or with more TRBs coming, the link is
    /// given to the consumer immediately; at a TD boundary the pointer parks
    /// on the link and `prepare` hands it over later.
    fn advance_enqueue(&mut self, more_trbs_coming: bool) {
        let chain = self.trb_at(self.enq).chain_bit();
        self.enq.idx += 1;
        while self.is_link_slot(self.enq) {
            if !chain && !more_trbs_coming {
                break;
            }
            let mut link = self.trb_at(self.enq);
            if !self.chain_links {
                link.set_chain_bit(chain);
                self.set_trb_at(self.enq, link);
            }
            fence(Ordering::Release);
            link.flip_cycle();
            self.set_trb_at(self.enq, link);
            if link.toggle_cycle() {
                self.cycle_state = !self.cycle_state;
            }
            self.enq = self.next_seg_start(self.enq);
        }
    }

    /// Move the dequeue pointer one payload slot forward.
    pub fn advance_dequeue(&mut self) {
        self.deq.idx += 1;
        while self.is_link_slot(self.deq) {
            self.deq = self.next_seg_start(self.deq);
        }
    }

    /// Retire a TD: advance the dequeue pointer to the slot after `last_dma`.
    pub fn advance_dequeue_past(&mut self, last_dma: u64) -> Result<()> {
        let mut steps = 0;
        while self.dma_at(self.deq) != last_dma {
            self.advance_dequeue();
            steps += 1;
            if steps > self.slots() {
                return Err(Error::TdNotFound { dma: last_dma });
            }
        }
        self.advance_dequeue();
        Ok(())
    }

    /// Whether `suspect` lies within the slot range `first_dma..=last_dma`,
    /// walking in ring order so ranges that wrap a segment boundary work.
    pub fn dma_in_range(&self, first_dma: u64, last_dma: u64, suspect: u64) -> bool {
        let Some(mut p) = self.ptr_of(first_dma) else {
            return false;
        };
        for _ in 0..self.slots() {
            let dma = self.dma_at(p);
            if dma == suspect {
                return true;
            }
            if dma == last_dma {
                return false;
            }
            p = self.step_raw(p);
        }
        false
    }

    /// Compute where the consumer should resume after it stopped at
    /// `stopped_dma` inside the TD ending at `td_last_dma`. Returns the slot
    /// after the TD's last element plus the cycle state the consumer must
    /// adopt there. If the consumer already sits past the TD, returns its
    /// stop position unchanged.
    ///
    /// The cycle state at the stop position is the cycle bit of the TRB
    /// there; the walk then replays every toggle link crossed on the way.
    pub fn new_dequeue_state(
        &self,
        stopped_dma: u64,
        td_last_dma: u64,
    ) -> Result<(RingPtr, bool)> {
        let stopped = self.ptr_of(stopped_dma).ok_or(Error::RecoveryWalkFailed)?;
        let mut cycle = self.trb_at(stopped).cycle_bit();
        let mut p = self.deq;
        let mut cycle_found = false;
        let mut last_found = false;
        loop {
            let dma = self.dma_at(p);
            if !cycle_found && dma == stopped_dma {
                cycle_found = true;
                if last_found {
                    // Consumer stopped past the TD end; resume right there.
                    break;
                }
            }
            if dma == td_last_dma {
                last_found = true;
            }
            let trb = self.trb_at(p);
            if cycle_found && trb.is_link() && trb.toggle_cycle() {
                cycle = !cycle;
            }
            p = self.step_raw(p);
            if p == self.deq {
                return Err(Error::RecoveryWalkFailed);
            }
            if cycle_found && last_found {
                break;
            }
        }
        Ok((p, cycle))
    }

    /// Overwrite the TD's elements with no-op TRBs, cycle bits untouched.
    /// Link slots inside the TD get their chain bit cleared instead (unless
    /// link chaining is forced on).
    pub fn td_to_noop(&mut self, first_dma: u64, last_dma: u64) -> Result<()> {
        let mut p = self
            .ptr_of(first_dma)
            .ok_or(Error::TdNotFound { dma: first_dma })?;
        for _ in 0..self.slots() {
            let mut trb = self.trb_at(p);
            if self.is_link_slot(p) {
                if !self.chain_links && trb.chain_bit() {
                    trb.set_chain_bit(false);
                    self.set_trb_at(p, trb);
                }
            } else {
                trb.to_transfer_noop();
                self.set_trb_at(p, trb);
            }
            if self.dma_at(p) == last_dma {
                return Ok(());
            }
            p = self.step_raw(p);
        }
        Err(Error::TdNotFound { dma: last_dma })
    }

    /// After the consumer acknowledged a dequeue move, bring the software
    /// dequeue pointer to `target`. Reverts and returns `false` if `target`
    /// is not reachable without passing the enqueue region a full lap.
    pub fn update_dequeue_to(&mut self, target: RingPtr) -> bool {
        let saved = self.deq;
        let mut p = self.deq;
        if self.is_link_slot(p) {
            p = self.next_seg_start(p);
        }
        while p != target {
            p = RingPtr {
                seg: p.seg,
                idx: p.idx + 1,
            };
            if self.is_link_slot(p) && p != target {
                p = self.next_seg_start(p);
            }
            if p == saved {
                return false;
            }
        }
        // the target may be a link slot when a TD ends a segment; the
        // software pointer rests on payload slots only
        self.deq = self.skip_links(p);
        true
    }
}
