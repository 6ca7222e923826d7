#![allow(dead_code)]

use kernel_info::boot::{BootMemoryKind, BootMemoryRange};
use kernel_memory_addresses::{PAGE_SIZE, PageBytes, PhysicalAddress, PhysicalPage, VirtualAddress};
use kernel_mm::{MemoryConfig, MemoryManager, Platform};
use kernel_sync::InterruptControl;
use kernel_vmem::PhysMapper;
use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Start of simulated RAM.
pub const RAM_BASE: u64 = 16 << 20;

/// Frames given to the kernel pool: 256 pinned top-level tables, the root,
/// the quickmap chain and room for a few address spaces.
pub const KERNEL_POOL_PAGES: u64 = 320;

/// A reserved range that user space may map.
pub const MMIO_BASE: u64 = 0xfee0_0000;
pub const MMIO_SIZE: u64 = 4 * PAGE_SIZE;

const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;
const LEVEL_SHIFTS: [u64; 4] = [39, 30, 21, 12];

#[repr(align(4096))]
struct Frame(PageBytes);

/// A small multiprocessor: RAM as host pages, one software TLB, interrupt
/// flag and active root per CPU.
pub struct SimMachine {
    frames: Box<[UnsafeCell<Frame>]>,
    cpu: AtomicUsize,
    interrupts: Vec<AtomicBool>,
    roots: Vec<AtomicU64>,
    tlb: Vec<Mutex<HashMap<u64, u64>>>,
    remote_flushes: AtomicUsize,
}

// SAFETY: tests hand out page references only through the manager, which
// serializes access to every frame.
unsafe impl Sync for SimMachine {}

impl SimMachine {
    pub fn new(cpus: usize, frames: usize) -> Self {
        Self {
            frames: (0..frames)
                .map(|_| UnsafeCell::new(Frame([0; PAGE_SIZE as usize])))
                .collect(),
            cpu: AtomicUsize::new(0),
            interrupts: (0..cpus).map(|_| AtomicBool::new(true)).collect(),
            roots: (0..cpus).map(|_| AtomicU64::new(0)).collect(),
            tlb: (0..cpus).map(|_| Mutex::new(HashMap::new())).collect(),
            remote_flushes: AtomicUsize::new(0),
        }
    }

    /// Pretend to run on `cpu` from now on.
    pub fn switch_cpu(&self, cpu: usize) {
        assert!(cpu < self.roots.len());
        self.cpu.store(cpu, Ordering::SeqCst);
    }

    pub fn active_root(&self, cpu: usize) -> u64 {
        self.roots[cpu].load(Ordering::SeqCst)
    }

    pub fn cached_translations(&self, cpu: usize) -> usize {
        self.tlb[cpu].lock().unwrap().len()
    }

    pub fn remote_flushes(&self) -> usize {
        self.remote_flushes.load(Ordering::SeqCst)
    }

    fn frame_ptr(&self, pa: u64) -> *mut u8 {
        let rel = pa - RAM_BASE;
        let index = usize::try_from(rel / PAGE_SIZE).unwrap();
        assert!(index < self.frames.len(), "physical access outside RAM at {pa:#x}");
        let offset = usize::try_from(rel % PAGE_SIZE).unwrap();
        unsafe { self.frames[index].get().cast::<u8>().add(offset) }
    }

    /// Bytes of a frame, bypassing the MMU.
    pub fn read_phys(&self, page: PhysicalPage) -> PageBytes {
        unsafe { *self.frame_ptr(page.base().as_u64()).cast::<PageBytes>() }
    }

    pub fn fill_phys(&self, page: PhysicalPage, byte: u8) {
        unsafe { (*self.frame_ptr(page.base().as_u64()).cast::<PageBytes>()).fill(byte) }
    }

    fn read_entry(&self, table: u64, index: u64) -> u64 {
        unsafe { *self.frame_ptr(table + index * 8).cast::<u64>() }
    }

    /// Hardware walk from `root`. Panics where the CPU would fault.
    fn walk(&self, root: u64, va: VirtualAddress) -> u64 {
        assert_ne!(root, 0, "no directory active");
        let mut table = root;
        for shift in LEVEL_SHIFTS {
            let entry = self.read_entry(table, (va.as_u64() >> shift) & 0x1ff);
            assert!(entry & 1 == 1, "simulated page fault at {va}");
            table = entry & ADDR_MASK;
        }
        table
    }
}

impl PhysMapper for SimMachine {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { &mut *self.frame_ptr(pa.as_u64()).cast::<T>() }
    }
}

impl InterruptControl for SimMachine {
    fn interrupts_enabled(&self) -> bool {
        self.interrupts[self.current_cpu()].load(Ordering::SeqCst)
    }

    fn disable_interrupts(&self) {
        self.interrupts[self.current_cpu()].store(false, Ordering::SeqCst);
    }

    fn enable_interrupts(&self) {
        self.interrupts[self.current_cpu()].store(true, Ordering::SeqCst);
    }
}

impl Platform for SimMachine {
    fn current_cpu(&self) -> usize {
        self.cpu.load(Ordering::SeqCst)
    }

    fn max_cpus(&self) -> usize {
        self.roots.len()
    }

    fn flush_local(&self, va: VirtualAddress) {
        self.tlb[self.current_cpu()]
            .lock()
            .unwrap()
            .remove(&va.page().base().as_u64());
    }

    fn flush_remote(&self, va: VirtualAddress, pages: usize) {
        let me = self.current_cpu();
        self.remote_flushes.fetch_add(1, Ordering::SeqCst);
        for (cpu, tlb) in self.tlb.iter().enumerate() {
            if cpu == me {
                continue;
            }
            let mut tlb = tlb.lock().unwrap();
            for i in 0..pages as u64 {
                tlb.remove(&(va.page().base().as_u64() + i * PAGE_SIZE));
            }
        }
    }

    unsafe fn activate(&self, root: PhysicalPage) {
        let cpu = self.current_cpu();
        self.roots[cpu].store(root.base().as_u64(), Ordering::SeqCst);
        self.tlb[cpu].lock().unwrap().clear();
    }

    unsafe fn page_at<'a>(&self, va: VirtualAddress) -> &'a mut PageBytes {
        assert!(va.is_page_aligned());
        let cpu = self.current_cpu();
        // An interrupt could migrate us away from the TLB we just flushed.
        assert!(
            !self.interrupts[cpu].load(Ordering::SeqCst),
            "quickmap slot {va} used with interrupts enabled on CPU {cpu}"
        );
        let pa = *self.tlb[cpu]
            .lock()
            .unwrap()
            .entry(va.as_u64())
            .or_insert_with(|| self.walk(self.roots[cpu].load(Ordering::SeqCst), va));
        unsafe { &mut *self.frame_ptr(pa).cast::<PageBytes>() }
    }
}

pub fn usable(base: u64, frames: u64) -> BootMemoryRange {
    BootMemoryRange::new(BootMemoryKind::Usable, base, frames * PAGE_SIZE)
}

pub fn config(cpus: usize) -> MemoryConfig {
    let mut config = MemoryConfig::x86_64(cpus);
    config.kernel_pool_pages = KERNEL_POOL_PAGES;
    config
}

/// A manager over `user_frames` user frames, with the kernel directory
/// active on every CPU and CPU 0 current.
pub fn boot(cpus: usize, user_frames: u64) -> MemoryManager<SimMachine> {
    let total = KERNEL_POOL_PAGES + user_frames;
    let machine = SimMachine::new(cpus, usize::try_from(total).unwrap());
    let map = [
        usable(RAM_BASE, total),
        BootMemoryRange::new(BootMemoryKind::Reserved, MMIO_BASE, MMIO_SIZE),
    ];
    let manager = MemoryManager::from_boot_map(machine, config(cpus), &map, &[]).unwrap();
    for cpu in (0..cpus).rev() {
        manager.platform().switch_cpu(cpu);
        manager.enter_address_space(manager.kernel_space());
    }
    manager
}

/// `(uncommitted, committed, used)` of the user pool.
pub fn counters<P: Platform>(manager: &MemoryManager<P>) -> (usize, usize, usize) {
    let stats = manager.stats();
    assert_eq!(
        stats.user_committed + stats.user_uncommitted + stats.user_used,
        stats.user_total
    );
    (stats.user_uncommitted, stats.user_committed, stats.user_used)
}
