extern crate alloc;

use alloc::alloc::{alloc_zeroed, dealloc, handle_alloc_error};
use core::alloc::Layout;
use core::ptr::NonNull;

/// Ring memory alignment required by the controller.
pub const RING_ALIGN: usize = 64;

/// Fixed-size TRB array, 64-byte aligned, zero-initialized.
///
/// Never grows: the controller holds the base address in its registers, so a
/// reallocation would move the ring out from under it. All element access is
/// volatile because the controller reads and writes the same memory.
#[derive(Debug)]
pub struct TrbBuf {
    ptr: NonNull<[u32; 4]>,
    len: usize,
}

// TrbBuf owns its allocation exclusively; &mut is required for writes.
unsafe impl Send for TrbBuf {}

impl TrbBuf {
    pub fn new(len: usize) -> Self {
        assert!(len > 0, "TRB buffer must have at least one entry.");
        let layout = Self::layout(len);
        let raw = unsafe { alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw.cast::<[u32; 4]>()) else {
            handle_alloc_error(layout);
        };
        Self { ptr, len }
    }

    fn layout(len: usize) -> Layout {
        match Layout::array::<[u32; 4]>(len).and_then(|l| l.align_to(RING_ALIGN)) {
            Ok(layout) => layout,
            Err(_) => panic!("invalid TRB buffer length: {len}"),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn head_addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    pub fn get(&self, index: usize) -> [u32; 4] {
        assert!(index < self.len);
        unsafe { self.ptr.as_ptr().add(index).read_volatile() }
    }

    pub fn set(&mut self, index: usize, trb: [u32; 4]) {
        assert!(index < self.len);
        unsafe { self.ptr.as_ptr().add(index).write_volatile(trb) }
    }
}

impl Drop for TrbBuf {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr().cast(), Self::layout(self.len)) }
    }
}
