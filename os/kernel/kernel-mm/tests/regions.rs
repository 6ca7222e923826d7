mod common;

use common::{MMIO_BASE, boot, counters};
use kernel_info::memory::KERNEL_REGION_BASE;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress, VirtualRange};
use kernel_mm::{Access, AllocationStrategy, MemoryError, RegionFlags};

fn user_range(base: u64, pages: u64) -> VirtualRange {
    VirtualRange::new(VirtualAddress::new(base), pages * PAGE_SIZE)
}

#[test]
fn kernel_regions_are_separated_by_guard_pages() {
    let mm = boot(1, 8);
    let a = mm
        .allocate_kernel_region(2 * PAGE_SIZE, "a", Access::READ_WRITE, AllocationStrategy::Reserve)
        .unwrap();
    let b = mm
        .allocate_kernel_region(PAGE_SIZE, "b", Access::READ_WRITE, AllocationStrategy::Reserve)
        .unwrap();

    assert_eq!(a.base(), VirtualAddress::new(KERNEL_REGION_BASE));
    assert_eq!(b.base(), a.range().end() + PAGE_SIZE);
    assert!(mm.find_kernel_region(a.range().end()).is_none());
    assert_eq!(mm.find_kernel_region(b.base() + 0x123).unwrap().name(), "b");
    assert_eq!(mm.kernel_region_count(), 2);
}

#[test]
fn freed_kernel_range_is_reused_first_fit() {
    let mm = boot(1, 8);
    let a = mm
        .allocate_kernel_region(PAGE_SIZE, "a", Access::READ_WRITE, AllocationStrategy::None)
        .unwrap();
    let base = a.base();
    let _b = mm
        .allocate_kernel_region(PAGE_SIZE, "b", Access::READ_WRITE, AllocationStrategy::None)
        .unwrap();
    drop(a);

    let c = mm
        .allocate_kernel_region(PAGE_SIZE, "c", Access::READ_WRITE, AllocationStrategy::None)
        .unwrap();
    assert_eq!(c.base(), base);
}

#[test]
fn dropping_a_kernel_region_returns_everything() {
    let mm = boot(1, 8);
    let kernel_before = mm.stats().kernel_used;
    {
        let region = mm
            .allocate_kernel_region(
                3 * PAGE_SIZE,
                "populated",
                Access::READ_WRITE,
                AllocationStrategy::AllocateNow,
            )
            .unwrap();
        assert_eq!(counters(&mm), (5, 0, 3));
        for page in region.range().pages() {
            assert!(mm.translate(mm.kernel_space(), page.base()).is_some());
        }
        assert!(mm.stats().kernel_used > kernel_before);
    }
    assert_eq!(counters(&mm), (8, 0, 0));
    assert_eq!(mm.kernel_region_count(), 0);
    // Tables below the pinned top level went away with the last mapping.
    assert_eq!(mm.stats().kernel_used, kernel_before);
}

#[test]
fn reserving_more_than_available_fails() {
    let mm = boot(1, 2);
    let err = mm
        .allocate_kernel_region(
            4 * PAGE_SIZE,
            "big",
            Access::READ_WRITE,
            AllocationStrategy::Reserve,
        )
        .unwrap_err();
    assert_eq!(err, MemoryError::OutOfMemory);
    assert_eq!(counters(&mm), (2, 0, 0));
}

#[test]
fn zero_and_unaligned_sizes_are_rejected() {
    let mm = boot(1, 2);
    assert_eq!(
        mm.allocate_kernel_region(0, "empty", Access::READ, AllocationStrategy::None)
            .unwrap_err(),
        MemoryError::InvalidSize(0)
    );
    assert_eq!(
        mm.allocate_kernel_region(100, "odd", Access::READ, AllocationStrategy::None)
            .unwrap_err(),
        MemoryError::InvalidSize(100)
    );
}

#[test]
fn physical_kernel_region_maps_eagerly() {
    let mm = boot(1, 2);
    let base = PhysicalAddress::new(MMIO_BASE);
    let region = mm
        .allocate_kernel_region_with_physical(base, 2 * PAGE_SIZE, "lapic", Access::READ_WRITE)
        .unwrap();
    assert_eq!(
        mm.translate(mm.kernel_space(), region.base() + PAGE_SIZE + 8),
        Some(base + PAGE_SIZE + 8)
    );
    assert_eq!(counters(&mm), (2, 0, 0));

    let unaligned = PhysicalAddress::new(MMIO_BASE + 1);
    assert_eq!(
        mm.allocate_kernel_region_with_physical(unaligned, PAGE_SIZE, "bad", Access::READ)
            .unwrap_err(),
        MemoryError::UnalignedPhysical(unaligned)
    );
}

#[test]
fn user_regions_may_not_overlap() {
    let mm = boot(1, 8);
    let space = mm.create_address_space().unwrap();
    mm.allocate_user_region(
        &space,
        user_range(0x40_0000, 4),
        "text",
        Access::READ | Access::EXECUTE,
        RegionFlags::empty(),
        AllocationStrategy::Reserve,
    )
    .unwrap();

    let clash = user_range(0x40_3000, 2);
    let err = mm
        .allocate_user_region(
            &space,
            clash,
            "data",
            Access::READ_WRITE,
            RegionFlags::empty(),
            AllocationStrategy::Reserve,
        )
        .unwrap_err();
    assert_eq!(err, MemoryError::Overlap(clash));
    // The failed attempt's commitment was handed back.
    assert_eq!(counters(&mm), (4, 4, 0));

    mm.allocate_user_region(
        &space,
        user_range(0x40_4000, 1),
        "adjacent",
        Access::READ_WRITE,
        RegionFlags::STACK,
        AllocationStrategy::None,
    )
    .unwrap();
    assert_eq!(space.regions().len(), 2);
}

#[test]
fn user_ranges_must_stay_in_the_user_half() {
    let mm = boot(1, 2);
    let space = mm.create_address_space().unwrap();

    let kernel = VirtualRange::new(VirtualAddress::new(KERNEL_REGION_BASE), PAGE_SIZE);
    assert_eq!(
        mm.allocate_user_guard_region(&space, kernel, "nope").unwrap_err(),
        MemoryError::OutsideAddressSpace(kernel)
    );

    let unaligned = VirtualRange::new(VirtualAddress::new(0x1000), 10);
    assert_eq!(
        mm.allocate_user_guard_region(&space, unaligned, "nope").unwrap_err(),
        MemoryError::InvalidRange(unaligned)
    );
}

#[test]
fn only_reserved_ranges_are_user_mappable() {
    let mm = boot(1, 2);
    let mmio = PhysicalAddress::new(MMIO_BASE);
    assert!(mm.is_allowed_to_map_to_userspace(mmio, 4 * PAGE_SIZE));
    assert!(!mm.is_allowed_to_map_to_userspace(mmio, 5 * PAGE_SIZE));
    assert!(!mm.is_allowed_to_map_to_userspace(PhysicalAddress::new(common::RAM_BASE), PAGE_SIZE));

    let space = mm.create_address_space().unwrap();
    let ram = PhysicalAddress::new(common::RAM_BASE);
    assert_eq!(
        mm.allocate_user_region_with_physical(
            &space,
            user_range(0x1000, 1),
            ram,
            "ram",
            Access::READ,
        )
        .unwrap_err(),
        MemoryError::NotUserMappable(ram)
    );
    let region = mm
        .allocate_user_region_with_physical(
            &space,
            user_range(0x1000, 2),
            mmio,
            "regs",
            Access::READ,
        )
        .unwrap();
    assert!(region.is_user());
    assert_eq!(mm.translate(&space, VirtualAddress::new(0x2004)), Some(mmio + PAGE_SIZE + 4));
}

#[test]
fn deallocating_a_user_region_frees_its_frames() {
    let mm = boot(1, 4);
    let space = mm.create_address_space().unwrap();
    let region = mm
        .allocate_user_region(
            &space,
            user_range(0x80_0000, 2),
            "heap",
            Access::READ_WRITE,
            RegionFlags::empty(),
            AllocationStrategy::AllocateNow,
        )
        .unwrap();
    assert_eq!(counters(&mm), (2, 0, 2));

    mm.deallocate_user_region(&space, &region).unwrap();
    assert_eq!(counters(&mm), (4, 0, 0));
    assert!(mm.translate(&space, region.base()).is_none());
    assert_eq!(
        mm.deallocate_user_region(&space, &region).unwrap_err(),
        MemoryError::NoSuchRegion
    );
}
