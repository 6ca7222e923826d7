#![allow(dead_code)]

use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage};
use kernel_vmem::{PhysMapper, TableFrameAlloc};
use std::cell::UnsafeCell;
use std::collections::BTreeSet;

/// A 4 KiB-aligned raw frame.
#[repr(align(4096))]
pub struct Aligned4K([u8; 4096]);

/// Simulated physical memory starting at `base`.
pub struct TestRam {
    base: u64,
    frames: Box<[UnsafeCell<Aligned4K>]>,
}

impl TestRam {
    pub fn new(base: u64, frames: usize) -> Self {
        Self {
            base,
            frames: (0..frames)
                .map(|_| UnsafeCell::new(Aligned4K([0; 4096])))
                .collect(),
        }
    }

    pub fn frame(&self, i: usize) -> PhysicalPage {
        PhysicalPage::from_aligned(PhysicalAddress::new(self.base + i as u64 * PAGE_SIZE))
    }

    pub fn all_frames(&self) -> Vec<PhysicalPage> {
        (0..self.frames.len()).map(|i| self.frame(i)).collect()
    }
}

impl PhysMapper for TestRam {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let rel = pa.as_u64() - self.base;
        let idx = (rel / PAGE_SIZE) as usize;
        let off = (rel % PAGE_SIZE) as usize;
        let frame = self.frames[idx].get().cast::<u8>();
        unsafe { &mut *frame.add(off).cast::<T>() }
    }
}

/// Table frame source that tracks what is live.
pub struct TestFrames {
    free: Vec<PhysicalPage>,
    pub live: BTreeSet<PhysicalPage>,
    pub freed: Vec<PhysicalPage>,
}

impl TestFrames {
    pub fn new(frames: Vec<PhysicalPage>) -> Self {
        let mut free = frames;
        free.reverse();
        Self {
            free,
            live: BTreeSet::new(),
            freed: Vec::new(),
        }
    }

    pub fn take(&mut self) -> PhysicalPage {
        self.alloc_table().expect("test RAM exhausted")
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }
}

impl TableFrameAlloc for TestFrames {
    fn alloc_table(&mut self) -> Option<PhysicalPage> {
        let frame = self.free.pop()?;
        self.live.insert(frame);
        Some(frame)
    }

    fn free_table(&mut self, frame: PhysicalPage) {
        assert!(self.live.remove(&frame), "double free of {frame}");
        self.freed.push(frame);
        self.free.push(frame);
    }
}
