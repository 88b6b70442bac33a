use crate::env;
use crate::env::EnvTable;
use crate::mpconfig;
use crate::spinlock::MutexGuard;

/// Choose a user environment to run and run it.
///
/// Round-robin with affinity:
/// 1. If this CPU has never run anything, scan slots 0..NENV for the first
///    RUNNABLE env and dispatch it.
/// 2. Otherwise, starting just after the slot this CPU last ran, search one
///    full revolution for a RUNNABLE env; dispatch the first hit.
/// 3. If nothing is RUNNABLE, look for an env still RUNNING on this CPU —
///    whoever transitioned an env to RUNNING must drive it to completion.
/// 4. Otherwise, halt this CPU.
///
/// The big kernel lock is assumed held on entry (by trap()'s dispatch) and
/// is released, at the precise instant mandated, by whichever of env_run /
/// sched_halt this ultimately tail-calls into.
pub(crate) fn sched_yield() -> ! {
    let this_cpu_id = mpconfig::this_cpu().cpu_id;
    let env_table = env::env_table();

    let start = match env::cur_env() {
        Some(cur) => (env::envx(cur.get_env_id()) + 1) % env::NENV_USIZE,
        None => 0,
    };

    let env_id_opt = env_table
        .find_runnable_from(start)
        .or_else(|| env_table.find_running_on(this_cpu_id));

    match env_id_opt {
        Some(env_id) => env::env_run(env_id, env_table),
        None => sched_halt(env_table),
    }
}

/// Halts this CPU: if nothing anywhere is still RUNNABLE/RUNNING/DYING,
/// this is the all-idle condition and we drop into a minimal diagnostic
/// loop (no real interactive monitor — this is a teaching kernel).
/// Otherwise this CPU genuinely has no work: clear curenv, load the
/// master directory, mark this CPU HALTED, release the big kernel lock,
/// reset the stack, enable interrupts and `hlt` until the next timer IRQ
/// brings us back through trap()'s HALTED->STARTED transition.
pub(crate) fn sched_halt(table: MutexGuard<EnvTable>) -> ! {
    if table.all_idle() {
        println!("sched_halt: no runnable environments anywhere, idling.");
        drop(table);
        unsafe { crate::kernel_lock::unlock_kernel() };
        loop {
            crate::x86::hlt();
        }
    }

    drop(table);
    mpconfig::this_cpu_mut().unset_env();
    crate::pmap::load_kern_pgdir();
    mpconfig::this_cpu_mut().halted();
    unsafe { crate::kernel_lock::unlock_kernel() };

    unsafe {
        let stack_top = mpconfig::this_cpu().kstack_top().0;
        asm!(
        "movl $0, %esp; \
        sti; \
        1: hlt; \
        jmp 1b"
        : : "r" (stack_top) : "memory" : "volatile"
        );
    }

    unreachable!("sched_halt: hlt loop returned")
}
