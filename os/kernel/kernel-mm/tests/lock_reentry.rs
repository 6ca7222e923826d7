mod common;

use common::{SimMachine, boot, counters};
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use kernel_mm::{
    Access, AllocationStrategy, FaultResolution, MemoryManager, PageFault, PageFaultCode,
    PurgeContext, Purgeable,
};
use std::sync::{Arc, Mutex, Weak};

/// What a purge callback does while the global lock is held.
enum Reentry {
    Fault(PageFault),
    Stats,
}

/// Calls back into the manager from inside a purge.
struct Hook {
    mm: &'static MemoryManager<SimMachine>,
    action: Reentry,
    outcome: Mutex<Option<FaultResolution>>,
}

impl Purgeable for Hook {
    fn purge(&self, _ctx: &mut PurgeContext<'_>) -> usize {
        match self.action {
            Reentry::Fault(fault) => {
                let resolution = self.mm.handle_page_fault(&fault, false);
                *self.outcome.lock().unwrap() = Some(resolution);
            }
            Reentry::Stats => {
                let _ = self.mm.stats();
            }
        }
        0
    }
}

fn install(mm: &'static MemoryManager<SimMachine>, action: Reentry) -> Arc<Hook> {
    let hook = Arc::new(Hook {
        mm,
        action,
        outcome: Mutex::new(None),
    });
    let entry: Weak<Hook> = Arc::downgrade(&hook);
    mm.register_purgeable(entry);
    hook
}

#[test]
fn fault_under_the_global_lock_crashes_instead_of_hanging() {
    let mm: &'static _ = Box::leak(Box::new(boot(1, 2)));
    let region = mm
        .allocate_kernel_region(PAGE_SIZE, "lazy", Access::READ_WRITE, AllocationStrategy::None)
        .unwrap();
    let fault = PageFault::new(region.base(), PageFaultCode::new().with_write(true));
    let hook = install(mm, Reentry::Fault(fault));

    let _a = mm.allocate_user_frame(false).unwrap();
    let _b = mm.allocate_user_frame(false).unwrap();
    // The pool is dry, so this purges and the hook faults under the lock.
    assert!(mm.allocate_user_frame(false).is_none());
    assert_eq!(*hook.outcome.lock().unwrap(), Some(FaultResolution::ShouldCrash));

    // Nothing was resolved, and the lock is free again afterwards.
    assert!(mm.translate(mm.kernel_space(), region.base()).is_none());
    assert_eq!(counters(mm), (0, 0, 2));
    assert_eq!(
        mm.handle_page_fault(&fault, false),
        FaultResolution::ShouldCrash,
        "the pool is still empty"
    );
}

#[test]
fn manager_recovers_after_a_fault_under_the_lock() {
    let mm: &'static _ = Box::leak(Box::new(boot(1, 1)));
    let fault = PageFault::new(VirtualAddress::new(0xffff_c000_dead_0000), PageFaultCode::new());
    let hook = install(mm, Reentry::Fault(fault));

    let (frame, _) = mm.allocate_user_frame(false).unwrap();
    assert!(mm.allocate_user_frame(false).is_none());
    assert_eq!(*hook.outcome.lock().unwrap(), Some(FaultResolution::ShouldCrash));
    mm.deallocate_user_frame(frame);

    let region = mm
        .allocate_kernel_region(PAGE_SIZE, "after", Access::READ_WRITE, AllocationStrategy::None)
        .unwrap();
    let fault = PageFault::new(region.base(), PageFaultCode::new().with_write(true));
    assert_eq!(mm.handle_page_fault(&fault, false), FaultResolution::Handled);
}

#[test]
#[should_panic(expected = "global memory lock re-entered on CPU 0")]
fn taking_the_global_lock_twice_on_one_cpu_is_fatal() {
    let mm: &'static _ = Box::leak(Box::new(boot(1, 1)));
    let _hook = install(mm, Reentry::Stats);

    let _held = mm.allocate_user_frame(false).unwrap();
    let _ = mm.allocate_user_frame(false);
}

#[test]
fn other_cpus_are_not_taken_for_the_owner() {
    let mm = boot(2, 1);
    let machine = mm.platform();
    machine.switch_cpu(1);
    let (frame, _) = mm.allocate_user_frame(false).unwrap();
    machine.switch_cpu(0);
    mm.deallocate_user_frame(frame);
    assert_eq!(counters(&mm), (1, 0, 0));
}
