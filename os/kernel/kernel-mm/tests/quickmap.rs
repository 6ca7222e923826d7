mod common;

use common::boot;
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use kernel_mm::{Access, AllocationStrategy, FaultResolution, PageFault, PageFaultCode, Platform};
use kernel_sync::{InterruptControl, IrqGuard};

#[test]
fn shared_slot_repointed_across_cpus_never_reads_stale() {
    let mm = boot(2, 4);
    let machine = mm.platform();
    let (a, _) = mm.allocate_user_frame(false).unwrap();
    let (b, _) = mm.allocate_user_frame(false).unwrap();
    machine.fill_phys(a.page(), 0xaa);
    machine.fill_phys(b.page(), 0xbb);

    machine.switch_cpu(0);
    let va = {
        let irq = IrqGuard::new(machine);
        let token = irq.token();
        let page = mm.quickmap_shared(&token, a.page());
        assert_eq!(page[0], 0xaa);
        page.va()
    };

    machine.switch_cpu(1);
    {
        let irq = IrqGuard::new(machine);
        let token = irq.token();
        let page = mm.quickmap_shared(&token, b.page());
        assert_eq!(page.va(), va);
        assert_eq!(page[0], 0xbb);
    }

    // CPU 0 still caches the slot's translation to `a`.
    machine.switch_cpu(0);
    {
        let irq = IrqGuard::new(machine);
        let token = irq.token();
        let mut page = mm.quickmap_shared(&token, b.page());
        assert_eq!(page[PAGE_SIZE as usize - 1], 0xbb);
        page[0] = 0x11;
    }
    assert_eq!(machine.read_phys(b.page())[0], 0x11);
}

#[test]
fn per_cpu_slots_are_distinct() {
    let mm = boot(2, 2);
    let machine = mm.platform();
    let (frame, _) = mm.allocate_user_frame(true).unwrap();

    machine.switch_cpu(0);
    let va0 = {
        let irq = IrqGuard::new(machine);
        let token = irq.token();
        mm.quickmap_cpu(&token, frame.page()).va()
    };
    machine.switch_cpu(1);
    let va1 = {
        let irq = IrqGuard::new(machine);
        let token = irq.token();
        let mut page = mm.quickmap_cpu(&token, frame.page());
        page[7] = 7;
        page.va()
    };

    assert_eq!(va0, mm.quickmap().base());
    assert_eq!(va1, mm.quickmap().base() + PAGE_SIZE);
    assert_eq!(machine.read_phys(frame.page())[7], 7);
}

#[test]
fn interrupts_are_restored_after_zero_fill() {
    let mm = boot(1, 2);
    assert!(mm.platform().interrupts_enabled());
    let _ = mm.allocate_user_frame(true).unwrap();
    assert!(mm.platform().interrupts_enabled());
}

#[test]
#[should_panic(expected = "checked out twice")]
fn per_cpu_slot_cannot_be_taken_twice() {
    let mm = boot(1, 2);
    let (a, _) = mm.allocate_user_frame(false).unwrap();
    let (b, _) = mm.allocate_user_frame(false).unwrap();

    let irq = IrqGuard::new(mm.platform());
    let token = irq.token();
    let _first = mm.quickmap_cpu(&token, a.page());
    let _second = mm.quickmap_cpu(&token, b.page());
}

#[test]
fn shared_slots_can_be_held_together() {
    let mm = boot(1, 2);
    let (a, _) = mm.allocate_user_frame(false).unwrap();
    let (b, _) = mm.allocate_user_frame(false).unwrap();
    mm.platform().fill_phys(a.page(), 1);
    mm.platform().fill_phys(b.page(), 2);

    let irq = IrqGuard::new(mm.platform());
    let token = irq.token();
    let first = mm.quickmap_shared(&token, a.page());
    let second = mm.quickmap_shared(&token, b.page());
    assert_ne!(first.va(), second.va());
    assert_eq!((first[0], second[0]), (1, 2));
}

#[test]
fn slot_table_lives_in_the_kernel_pool() {
    let mm = boot(2, 1);
    let quickmap = mm.quickmap();
    assert_eq!(quickmap.slot_count(), 2 + mm.config().shared_quickmap_slots);
    assert!(
        mm.translate(mm.kernel_space(), quickmap.base()).is_none(),
        "slots start out unmapped"
    );
}

#[test]
fn table_walks_keep_interrupts_off_and_restore_them() {
    // Every slot access below would panic in the simulated MMU if a walk
    // ran with interrupts enabled.
    let mm = boot(1, 2);
    let region = mm
        .allocate_kernel_region(
            PAGE_SIZE,
            "walked",
            Access::READ_WRITE,
            AllocationStrategy::Reserve,
        )
        .unwrap();
    let fault = PageFault::new(region.base(), PageFaultCode::new().with_write(true));
    assert_eq!(mm.handle_page_fault(&fault, false), FaultResolution::Handled);
    assert!(mm.translate(mm.kernel_space(), region.base()).is_some());
    assert!(mm.translate(mm.kernel_space(), VirtualAddress::new(0xffff_c000_0000_0000)).is_none());

    let space = mm.create_address_space().unwrap();
    mm.destroy_address_space(space).unwrap();
    drop(region);
    assert!(mm.platform().interrupts_enabled());
}

#[test]
#[should_panic(expected = "interrupts enabled")]
fn slot_pages_are_only_reached_with_interrupts_off() {
    let mm = boot(1, 1);
    // SAFETY: the simulated MMU refuses before handing out a reference.
    let _page = unsafe { mm.platform().page_at(mm.quickmap().base()) };
}
