use crate::hal::DmaMap;
use crate::mem::TrbBuf;
use crate::trb::Trb;

pub const TRB_BYTES: u64 = 16;

/// One contiguous run of TRB slots. Producer rings chain segments with a
/// link TRB in the final slot; event ring segments use every slot.
#[derive(Debug)]
pub struct Segment {
    buf: TrbBuf,
    dma: u64,
}

impl Segment {
    pub fn new<M: DmaMap>(trbs: usize, map: &M) -> Self {
        let buf = TrbBuf::new(trbs);
        let dma = map.device_addr(buf.head_addr());
        Self { buf, dma }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn dma(&self) -> u64 {
        self.dma
    }

    pub fn trb(&self, index: usize) -> Trb {
        Trb(self.buf.get(index))
    }

    pub fn set_trb(&mut self, index: usize, trb: Trb) {
        self.buf.set(index, trb.0)
    }

    /// Bus address of the slot at `index`.
    pub fn dma_at(&self, index: usize) -> u64 {
        debug_assert!(index < self.len());
        self.dma + index as u64 * TRB_BYTES
    }

    /// Slot index for a bus address, if it falls inside this segment.
    pub fn index_of(&self, dma: u64) -> Option<usize> {
        if dma < self.dma {
            return None;
        }
        let offset = dma - self.dma;
        if offset % TRB_BYTES != 0 {
            return None;
        }
        let index = (offset / TRB_BYTES) as usize;
        (index < self.len()).then_some(index)
    }

    /// Write the link TRB into the final slot. The cycle bit stays clear so
    /// the slot still belongs to software until the producer rolls past it.
    pub fn install_link(&mut self, target: u64, toggle: bool, chain: bool) {
        let mut link = Trb::new_link(target, toggle);
        link.set_chain_bit(chain);
        let last = self.len() - 1;
        self.set_trb(last, link);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::IdentityMap;

    #[test]
    fn dma_index_round_trip() {
        let seg = Segment::new(8, &IdentityMap);
        for i in 0..8 {
            assert_eq!(seg.index_of(seg.dma_at(i)), Some(i));
        }
        assert_eq!(seg.index_of(seg.dma() + 8 * TRB_BYTES), None);
        assert_eq!(seg.index_of(seg.dma() + 1), None);
    }

    #[test]
    fn link_lands_in_last_slot() {
        let mut seg = Segment::new(4, &IdentityMap);
        seg.install_link(0xabc0, true, false);
        let link = seg.trb(3);
        assert!(link.is_link());
        assert!(link.toggle_cycle());
        assert!(!link.cycle_bit());
        assert_eq!(link.parameter(), 0xabc0);
    }
}
