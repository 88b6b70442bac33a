use crate::spinlock::{Mutex, MutexGuard};

static KERNEL_LOCK: Mutex<()> = Mutex::new(());

/// Acquire the big kernel lock. trap() takes this on every kernel entry
/// from user mode (and on waking a HALTED cpu) and holds it, via this
/// guard, across the whole trap/dispatch path.
pub(crate) fn lock_kernel<'a>() -> MutexGuard<'a, ()> {
    KERNEL_LOCK.lock()
}

/// Release the big kernel lock without a guard.
///
/// Called from the two places the lock must be dropped at a precise
/// instruction boundary rather than at ordinary Rust scope-exit: just
/// before `iret` in env_run, and just before the `hlt` loop in sched_halt.
/// Both are reached via a diverging tail call from trap()'s dispatch, whose
/// own `lock_kernel()` guard is therefore never dropped by its destructor.
pub(crate) unsafe fn unlock_kernel() {
    KERNEL_LOCK.force_unlock();
}
