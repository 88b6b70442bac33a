// User-level page-fault upcall delivery: on a user-mode page fault, if the
// faulting env has registered a handler, build a UTrapframe on its
// exception stack and redirect execution there instead of destroying it.

use crate::constants::*;
use crate::env;
use crate::pmap::VirtAddr;
use crate::trap::{PushRegs, Trapframe};
use core::mem;

/// Layout handed to a user pgfault_upcall, built by page_fault_handler on
/// the user exception stack. Field order is ascending address; the upcall
/// entry itself sees %esp pointing at `fault_va`. Shared with user::pgfault,
/// which reads this same layout back out of its own exception stack.
#[repr(C, packed)]
pub(crate) struct UTrapframe {
    pub(crate) utf_fault_va: u32,
    pub(crate) utf_err: u32,
    pub(crate) utf_regs: PushRegs,
    pub(crate) utf_eip: u32,
    pub(crate) utf_eflags: u32,
    pub(crate) utf_esp: u32,
}

/// Dispatch a page fault taken while running in user mode. A kernel-mode
/// page fault is a kernel bug in this teaching kernel and panics.
pub(crate) fn page_fault_handler(tf: &mut Trapframe) {
    let fault_va = crate::x86::rcr2();

    if tf.tf_cs & 3 == 0 {
        panic!(
            "page fault in kernel mode: va {:08x} eip {:08x}",
            fault_va, tf.tf_eip
        );
    }

    let env_table = env::env_table();
    let env_id = env::cur_env().expect("page fault with no running env").get_env_id();
    drop(env_table);

    let env = env::cur_env_mut().unwrap();
    let upcall = env.pgfault_upcall();
    if upcall.0 == 0 {
        println!(
            "[{:08x}] user fault va {:08x} ip {:08x}: no pgfault_upcall registered",
            env_id.0, fault_va, tf.tf_eip
        );
        destroy_faulting_env(env_id);
        return;
    }

    let nested = (tf.tf_esp as u32) >= USTACKTOP;
    let top = if nested {
        VirtAddr((tf.tf_esp as u32) - 4)
    } else {
        VirtAddr(UXSTACKTOP)
    };

    let utf_va = VirtAddr(top.0 - mem::size_of::<UTrapframe>() as u32);

    if env
        .get_pgdir()
        .user_mem_check(utf_va, mem::size_of::<UTrapframe>(), PTE_U | PTE_W | PTE_P)
        .is_err()
        || env
            .get_pgdir()
            .user_mem_check(upcall, 1, PTE_U | PTE_P)
            .is_err()
    {
        println!(
            "[{:08x}] user fault va {:08x} ip {:08x}: can't set up exception stack",
            env_id.0, fault_va, tf.tf_eip
        );
        destroy_faulting_env(env_id);
        return;
    }

    let utf = UTrapframe {
        utf_fault_va: fault_va,
        utf_err: tf.tf_err,
        utf_regs: tf.tf_regs,
        utf_eip: tf.tf_eip as u32,
        utf_eflags: tf.tf_eflags,
        utf_esp: tf.tf_esp as u32,
    };
    unsafe {
        *utf_va.as_mut_ptr::<UTrapframe>() = utf;
    }

    tf.tf_esp = utf_va.0 as usize;
    tf.tf_eip = upcall.0 as usize;
}

fn destroy_faulting_env(env_id: env::EnvId) {
    let env_table = env::env_table();
    env::env_destroy(env_id, env_table);
}
