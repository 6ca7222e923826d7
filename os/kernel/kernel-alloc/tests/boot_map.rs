use kernel_alloc::{BootMapError, PhysicalMemoryLayout, boot_map};
use kernel_info::boot::{
    BootMemoryKind, BootMemoryRange, KernelBootInfo, MemoryMapInfo, PhysicalRangeInfo,
};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage};

const MIB: u64 = 1 << 20;

fn usable(base: u64, length: u64) -> BootMemoryRange {
    BootMemoryRange::new(BootMemoryKind::Usable, base, length)
}

fn region_bounds(pool: &kernel_alloc::FramePool) -> Vec<(u64, u64)> {
    pool.regions()
        .iter()
        .map(|r| (r.base().base().as_u64(), r.end().base().as_u64()))
        .collect()
}

#[test]
fn low_memory_and_used_ranges_are_carved_out() {
    let map = [usable(0, 16 * MIB)];
    let kernel_image = PhysicalRangeInfo::new(MIB, 2 * MIB);
    let layout = PhysicalMemoryLayout::from_boot_map(&map, &[kernel_image], 4).unwrap();

    // [0, 1 MiB) is reserved, [1 MiB, 3 MiB) holds the kernel
    assert_eq!(region_bounds(&layout.kernel), vec![(3 * MIB, 3 * MIB + 4 * PAGE_SIZE)]);
    assert_eq!(
        region_bounds(layout.user.frames()),
        vec![(3 * MIB + 4 * PAGE_SIZE, 16 * MIB)]
    );
    let counters = layout.user.counters();
    assert_eq!(counters.used, 0);
    assert_eq!(counters.committed, 0);
    assert_eq!(counters.uncommitted as u64, (13 * MIB) / PAGE_SIZE - 4);
}

#[test]
fn alignment_fixups_round_inwards_and_drop_slivers() {
    let map = [
        usable(2 * MIB + 0x10, 3 * PAGE_SIZE),       // shrinks to 2 frames
        usable(8 * MIB + 0x800, 0x400),              // sub-page, dropped
        usable(9 * MIB, 2 * PAGE_SIZE + 0xfff),      // keeps 2 frames
    ];
    let layout = PhysicalMemoryLayout::from_boot_map(&map, &[], 1).unwrap();

    assert_eq!(layout.kernel.total(), 1);
    assert_eq!(layout.user.frames().total(), 3);
    assert_eq!(region_bounds(&layout.kernel), vec![(2 * MIB + PAGE_SIZE, 2 * MIB + 2 * PAGE_SIZE)]);
    assert_eq!(
        region_bounds(layout.user.frames()),
        vec![
            (2 * MIB + 2 * PAGE_SIZE, 2 * MIB + 3 * PAGE_SIZE),
            (9 * MIB, 9 * MIB + 2 * PAGE_SIZE)
        ]
    );
}

#[test]
fn kernel_pool_may_span_several_ranges() {
    let map = [usable(4 * MIB, 2 * PAGE_SIZE), usable(8 * MIB, 8 * PAGE_SIZE)];
    let layout = PhysicalMemoryLayout::from_boot_map(&map, &[], 5).unwrap();
    assert_eq!(layout.kernel.regions().len(), 2);
    assert_eq!(layout.kernel.total(), 5);
    assert_eq!(layout.user.frames().total(), 5);
}

#[test]
fn overlapping_usable_entries_are_merged() {
    let map = [usable(4 * MIB, 4 * PAGE_SIZE), usable(4 * MIB + 2 * PAGE_SIZE, 4 * PAGE_SIZE)];
    let layout = PhysicalMemoryLayout::from_boot_map(&map, &[], 1).unwrap();
    assert_eq!(layout.kernel.total() + layout.user.frames().total(), 6);
}

#[test]
fn too_little_memory_is_reported() {
    let map = [usable(4 * MIB, 4 * PAGE_SIZE)];
    assert_eq!(
        PhysicalMemoryLayout::from_boot_map(&map, &[], 4).unwrap_err(),
        BootMapError::InsufficientMemory {
            available: 4,
            kernel_pool: 4
        }
    );
    let reserved_only = [BootMemoryRange::new(BootMemoryKind::Reserved, 0, MIB)];
    assert_eq!(
        PhysicalMemoryLayout::from_boot_map(&reserved_only, &[], 1).unwrap_err(),
        BootMapError::NoUsableMemory
    );
}

#[test]
fn user_mappable_only_inside_one_reserved_range() {
    let map = [
        usable(0, 64 * MIB),
        BootMemoryRange::new(BootMemoryKind::Reserved, 0xfd00_0000, 16 * MIB),
        BootMemoryRange::new(BootMemoryKind::Reserved, 0xfe00_0000, MIB),
        BootMemoryRange::new(BootMemoryKind::AcpiNvs, 0xfee0_0000, PAGE_SIZE),
    ];
    let layout = PhysicalMemoryLayout::from_boot_map(&map, &[], 16).unwrap();
    assert_eq!(layout.recorded.len(), 3);

    let pa = PhysicalAddress::new;
    assert!(layout.is_allowed_to_map_to_userspace(pa(0xfd00_0000), 16 * MIB));
    assert!(layout.is_allowed_to_map_to_userspace(pa(0xfd10_0000), PAGE_SIZE));
    // straddles two reserved entries even though they touch
    assert!(!layout.is_allowed_to_map_to_userspace(pa(0xfdff_f000), 2 * PAGE_SIZE));
    // not reserved
    assert!(!layout.is_allowed_to_map_to_userspace(pa(0xfee0_0000), PAGE_SIZE));
    assert!(!layout.is_allowed_to_map_to_userspace(pa(0x20_0000), PAGE_SIZE));
    assert!(!layout.is_allowed_to_map_to_userspace(pa(u64::MAX - 10), PAGE_SIZE));
}

#[test]
fn boot_info_pointers_are_followed() {
    let ranges = [usable(0, 8 * MIB)];
    let modules = [PhysicalRangeInfo::new(4 * MIB, MIB)];
    let info = KernelBootInfo {
        memory_map: MemoryMapInfo {
            ranges_ptr: ranges.as_ptr() as u64,
            ranges_len: ranges.len() as u64,
        },
        kernel_image: PhysicalRangeInfo::new(MIB, MIB),
        modules_ptr: modules.as_ptr() as u64,
        modules_len: modules.len() as u64,
        rsdp_addr: 0,
    };

    assert_eq!(unsafe { boot_map::boot_ranges(&info.memory_map) }, &ranges);
    let layout = unsafe { PhysicalMemoryLayout::from_boot_info(&info, 2) }.unwrap();
    let total = layout.kernel.total() + layout.user.frames().total();
    // 8 MiB minus low memory, kernel image and one module
    assert_eq!(total as u64, 5 * MIB / PAGE_SIZE);
    assert!(!layout.user.frames().contains(PhysicalPage::from_number(4 * MIB / PAGE_SIZE)));
}
