use crate::constants::*;
use crate::env::{self, EnvId};
use crate::gdt::consts::{GDT_USER_CODE, GDT_USER_DATA};
use crate::pmap::VirtAddr;
use crate::sched;
use crate::trap::Trapframe;
use core::{slice, str};

mod consts {
    pub(crate) const SYS_CPUTS: u32 = 0;
    pub(crate) const SYS_CGETC: u32 = 1;
    pub(crate) const SYS_GETENVID: u32 = 2;
    pub(crate) const SYS_ENV_DESTROY: u32 = 3;
    pub(crate) const SYS_YIELD: u32 = 4;
    pub(crate) const SYS_EXOFORK: u32 = 5;
    pub(crate) const SYS_ENV_SET_STATUS: u32 = 6;
    pub(crate) const SYS_ENV_SET_PGFAULT_UPCALL: u32 = 7;
    pub(crate) const SYS_PAGE_ALLOC: u32 = 8;
    pub(crate) const SYS_PAGE_MAP: u32 = 9;
    pub(crate) const SYS_PAGE_UNMAP: u32 = 10;
    pub(crate) const SYS_IPC_TRY_SEND: u32 = 11;
    pub(crate) const SYS_IPC_RECV: u32 = 12;
    pub(crate) const SYS_ENV_SET_TRAPFRAME: u32 = 13;
}
use consts::*;

/// A syscall implementation's internal error. Collapsed to a raw negative
/// i32 only once, at the bottom of `syscall`.
pub(crate) enum SyscallError {
    BadEnv,
    Inval,
    NoMem,
    NoFreeEnv,
    IpcNotRecv,
}

impl SyscallError {
    fn code(&self) -> i32 {
        match self {
            SyscallError::BadEnv => E_BAD_ENV,
            SyscallError::Inval => E_INVAL,
            SyscallError::NoMem => E_NO_MEM,
            SyscallError::NoFreeEnv => E_NO_FREE_ENV,
            SyscallError::IpcNotRecv => E_IPC_NOT_RECV,
        }
    }
}

impl From<i32> for SyscallError {
    fn from(code: i32) -> SyscallError {
        match code {
            E_BAD_ENV => SyscallError::BadEnv,
            E_NO_MEM => SyscallError::NoMem,
            E_NO_FREE_ENV => SyscallError::NoFreeEnv,
            E_IPC_NOT_RECV => SyscallError::IpcNotRecv,
            _ => SyscallError::Inval,
        }
    }
}

/// Checks that the current env may access [va, va+len) with `perm`. On
/// failure the env is destroyed, mirroring env::user_mem_assert's policy.
fn user_mem_assert(va: u32, len: usize, perm: u32) -> Result<(), SyscallError> {
    let curenv = env::cur_env_mut().expect("syscall with no running env");
    match curenv.get_pgdir().user_mem_check(VirtAddr(va), len, perm | PTE_U) {
        Ok(()) => Ok(()),
        Err(_) => {
            let env_id = curenv.get_env_id();
            let table = env::env_table();
            env::env_destroy(env_id, table);
            Err(SyscallError::BadEnv)
        }
    }
}

fn sys_cputs(s: &str) {
    print!("{}", s);
}

fn sys_cgetc() -> i32 {
    match crate::kbd::kbd_getc() {
        Some(c) => c as i32,
        None => 0,
    }
}

fn sys_getenvid() -> i32 {
    env::cur_env()
        .expect("syscall with no running env")
        .get_env_id()
        .0 as i32
}

/// Destroys the named env (envid 0 means the caller itself).
fn sys_env_destroy(envid: u32) -> Result<i32, SyscallError> {
    let env_id = EnvId(envid);
    let cur_id = env::cur_env().unwrap().get_env_id();

    let target_id = {
        let table = env::env_table();
        table.lookup(env_id, true).map_err(SyscallError::from)?.get_env_id()
    };

    if target_id == cur_id {
        println!("[{:08x}] exiting gracefully", cur_id.0);
    } else {
        println!("[{:08x}] destroying {:08x}", cur_id.0, target_id.0);
    }

    let table = env::env_table();
    env::env_destroy(target_id, table);
    env::env_table().sync_env_info();
    Ok(0)
}

fn sys_yield() -> ! {
    sched::sched_yield()
}

/// Allocates a new env, NOT_RUNNABLE, that is an exact copy of the caller
/// except for the syscall return value (0 in the child, the child's id in
/// the parent). The building block user-level fork is built on.
fn sys_exofork() -> Result<i32, SyscallError> {
    let cur = env::cur_env_mut().expect("syscall with no running env");
    let parent_id = cur.get_env_id();
    let parent_tf = cur.get_tf().clone();

    let mut table = env::env_table();
    let child_id = env::env_create(&mut table, parent_id).map_err(SyscallError::from)?;
    let child = table.find_mut(child_id).unwrap();
    child.set_tf(&parent_tf);
    child.get_tf_mut().tf_regs.reg_eax = 0;
    table.sync_env_info();

    Ok(child_id.0 as i32)
}

fn sys_env_set_status(envid: u32, status: i32) -> Result<i32, SyscallError> {
    let new_status = match status {
        2 => env::EnvStatus::Runnable,
        4 => env::EnvStatus::NotRunnable,
        _ => return Err(SyscallError::Inval),
    };

    let mut table = env::env_table();
    let env_id = table
        .lookup(EnvId(envid), true)
        .map_err(SyscallError::from)?
        .get_env_id();
    table.find_mut(env_id).unwrap().set_status(new_status);
    table.sync_env_info();
    Ok(0)
}

/// Registers the address of the named env's page-fault upcall entry
/// point, invoked from upcall::page_fault_handler on its next fault.
fn sys_env_set_pgfault_upcall(envid: u32, func: u32) -> Result<i32, SyscallError> {
    let mut table = env::env_table();
    let env_id = table
        .lookup(EnvId(envid), true)
        .map_err(SyscallError::from)?
        .get_env_id();
    table
        .find_mut(env_id)
        .unwrap()
        .set_pgfault_upcall(VirtAddr(func));
    Ok(0)
}

/// Overwrites the named env's trapframe with the one at `tf_va`, used by
/// user-level exception handlers to resume after a page-fault upcall.
/// Regardless of what the caller supplies, the copied frame is forced back
/// to ring-3 segment selectors with interrupts enabled and IOPL cleared,
/// so this can't be used to escalate privilege or disable interrupts.
fn sys_env_set_trapframe(envid: u32, tf_va: u32) -> Result<i32, SyscallError> {
    user_mem_assert(tf_va, core::mem::size_of::<Trapframe>(), 0)?;

    let mut tf = unsafe { *(tf_va as *const Trapframe) };
    tf.tf_ds = GDT_USER_DATA | 3;
    tf.tf_es = GDT_USER_DATA | 3;
    tf.tf_ss = GDT_USER_DATA | 3;
    tf.tf_cs = GDT_USER_CODE | 3;
    tf.tf_eflags |= FL_IF;
    tf.tf_eflags &= !FL_IOPL_MASK;

    let mut table = env::env_table();
    let env_id = table
        .lookup(EnvId(envid), true)
        .map_err(SyscallError::from)?
        .get_env_id();
    let is_cur = env::cur_env().map(|e| e.get_env_id()) == Some(env_id);
    table.find_mut(env_id).unwrap().set_tf(&tf);

    if is_cur {
        Ok(tf.tf_regs.reg_eax as i32)
    } else {
        Ok(0)
    }
}

/// Allocates a fresh, zeroed physical page and maps it into `envid`'s
/// space at `va` with `perm`.
fn sys_page_alloc(envid: u32, va: u32, perm: u32) -> Result<i32, SyscallError> {
    if va as usize >= UTOP as usize || va % PGSIZE != 0 {
        return Err(SyscallError::Inval);
    }
    if perm & (PTE_U | PTE_P) != (PTE_U | PTE_P) || perm & !PTE_SYSCALL != 0 {
        return Err(SyscallError::Inval);
    }

    let mut table = env::env_table();
    let env_id = table
        .lookup(EnvId(envid), true)
        .map_err(SyscallError::from)?
        .get_env_id();

    let pa = crate::pmap::page_alloc().ok_or(SyscallError::NoMem)?;
    let inserted = table
        .find_mut(env_id)
        .unwrap()
        .get_pgdir()
        .page_insert(pa, VirtAddr(va), perm);
    if inserted.is_err() {
        crate::pmap::page_free(pa);
        return Err(SyscallError::NoMem);
    }
    Ok(0)
}

/// Maps the page at `srcva` in `srcenvid`'s space into `dstenvid`'s space
/// at `dstva` with `perm`.
fn sys_page_map(
    srcenvid: u32,
    srcva: u32,
    dstenvid: u32,
    dstva: u32,
    perm: u32,
) -> Result<i32, SyscallError> {
    if srcva as usize >= UTOP as usize || srcva % PGSIZE != 0 {
        return Err(SyscallError::Inval);
    }
    if dstva as usize >= UTOP as usize || dstva % PGSIZE != 0 {
        return Err(SyscallError::Inval);
    }

    let mut table = env::env_table();
    let src_id = table
        .lookup(EnvId(srcenvid), true)
        .map_err(SyscallError::from)?
        .get_env_id();
    let dst_id = table
        .lookup(EnvId(dstenvid), true)
        .map_err(SyscallError::from)?
        .get_env_id();

    let src_env = table.find_mut(src_id).unwrap();
    // Preserved in the order the original has it: the lookup happens
    // before the requested perm bits are validated against what it found,
    // not the other way around.
    let (pa, src_perm) = src_env
        .get_pgdir()
        .page_lookup(VirtAddr(srcva))
        .ok_or(SyscallError::Inval)?;

    if perm & (PTE_U | PTE_P) != (PTE_U | PTE_P) || perm & !PTE_SYSCALL != 0 {
        return Err(SyscallError::Inval);
    }
    if perm & PTE_W != 0 && src_perm & PTE_W == 0 {
        return Err(SyscallError::Inval);
    }

    table
        .find_mut(dst_id)
        .unwrap()
        .get_pgdir()
        .page_insert(pa, VirtAddr(dstva), perm)
        .map_err(|_| SyscallError::NoMem)?;
    Ok(0)
}

fn sys_page_unmap(envid: u32, va: u32) -> Result<i32, SyscallError> {
    if va as usize >= UTOP as usize || va % PGSIZE != 0 {
        return Err(SyscallError::Inval);
    }

    let mut table = env::env_table();
    let env_id = table
        .lookup(EnvId(envid), true)
        .map_err(SyscallError::from)?
        .get_env_id();
    table
        .find_mut(env_id)
        .unwrap()
        .get_pgdir()
        .page_remove(VirtAddr(va));
    Ok(0)
}

/// Tries to send `value` (and, if `srcva < UTOP`, the page mapped there
/// with `perm`) to `envid`. Only succeeds immediately if the target is
/// currently blocked in sys_ipc_recv; a busy receiver is not an error, so
/// this returns E_IPC_NOT_RECV without destroying either side.
fn sys_ipc_try_send(envid: u32, value: u32, srcva: u32, perm: u32) -> Result<i32, SyscallError> {
    let mut table = env::env_table();
    let target_id = table
        .lookup(EnvId(envid), false)
        .map_err(SyscallError::from)?
        .get_env_id();

    if !table.find(target_id).unwrap().is_ipc_recving() {
        return Err(SyscallError::IpcNotRecv);
    }

    let dstva = table.find(target_id).unwrap().ipc_dstva();
    let mut transferred_perm = 0;

    if (srcva as usize) < UTOP as usize {
        if srcva % PGSIZE != 0 {
            return Err(SyscallError::Inval);
        }
        if perm & (PTE_U | PTE_P) != (PTE_U | PTE_P) || perm & !PTE_SYSCALL != 0 {
            return Err(SyscallError::Inval);
        }

        let cur = env::cur_env_mut().expect("syscall with no running env");
        let (pa, src_perm) = cur
            .get_pgdir()
            .page_lookup(VirtAddr(srcva))
            .ok_or(SyscallError::Inval)?;
        if perm & PTE_W != 0 && src_perm & PTE_W == 0 {
            return Err(SyscallError::Inval);
        }

        if dstva.0 < UTOP {
            table
                .find_mut(target_id)
                .unwrap()
                .get_pgdir()
                .page_insert(pa, dstva, perm)
                .map_err(|_| SyscallError::NoMem)?;
            transferred_perm = perm;
        }
    }

    let from = env::cur_env().unwrap().get_env_id();
    let target = table.find_mut(target_id).unwrap();
    target.deliver_ipc(from, value, transferred_perm);
    target.set_status(env::EnvStatus::Runnable);
    table.sync_env_info();

    Ok(0)
}

/// Blocks the caller until some other env ipc_try_sends to it. If `dstva`
/// is below UTOP, any page the sender transfers gets mapped there.
fn sys_ipc_recv(dstva: u32) -> Result<i32, SyscallError> {
    if (dstva as usize) < UTOP as usize && dstva % PGSIZE != 0 {
        return Err(SyscallError::Inval);
    }

    let store_va = if (dstva as usize) < UTOP as usize {
        VirtAddr(dstva)
    } else {
        VirtAddr(UTOP)
    };

    let cur = env::cur_env_mut().expect("syscall with no running env");
    cur.set_ipc_recv_state(store_va);
    cur.set_status(env::EnvStatus::NotRunnable);
    env::env_table().sync_env_info();

    sched::sched_yield()
}

/// Dispatches a trapped syscall. `a1..a5` arrive from trap.rs as
/// `(edx, ecx, ebx, edi, esi)` — every call below takes that convention.
/// Earlier revisions of this table had `env_set_trapframe` read its
/// trapframe pointer argument off `edx` a second time (as if it were a1
/// again) instead of off `edi`; every call here already takes the later,
/// settled convention, so that mix-up has no surviving code path.
pub(crate) unsafe fn syscall(syscall_no: u32, a1: u32, a2: u32, a3: u32, a4: u32, a5: u32) -> i32 {
    let result: Result<i32, SyscallError> = if syscall_no == SYS_CPUTS {
        user_mem_assert(a1, a2 as usize, 0).map(|()| {
            let raw_s = a1 as *const u8;
            let s = slice::from_raw_parts(raw_s, a2 as usize);
            let s = str::from_utf8(s).expect("illegal utf8 string");
            sys_cputs(s);
            0
        })
    } else if syscall_no == SYS_CGETC {
        Ok(sys_cgetc())
    } else if syscall_no == SYS_GETENVID {
        Ok(sys_getenvid())
    } else if syscall_no == SYS_ENV_DESTROY {
        sys_env_destroy(a1)
    } else if syscall_no == SYS_YIELD {
        sys_yield()
    } else if syscall_no == SYS_EXOFORK {
        sys_exofork()
    } else if syscall_no == SYS_ENV_SET_STATUS {
        sys_env_set_status(a1, a2 as i32)
    } else if syscall_no == SYS_ENV_SET_PGFAULT_UPCALL {
        sys_env_set_pgfault_upcall(a1, a2)
    } else if syscall_no == SYS_PAGE_ALLOC {
        sys_page_alloc(a1, a2, a3)
    } else if syscall_no == SYS_PAGE_MAP {
        sys_page_map(a1, a2, a3, a4, a5)
    } else if syscall_no == SYS_PAGE_UNMAP {
        sys_page_unmap(a1, a2)
    } else if syscall_no == SYS_IPC_TRY_SEND {
        sys_ipc_try_send(a1, a2, a3, a4)
    } else if syscall_no == SYS_IPC_RECV {
        sys_ipc_recv(a1)
    } else if syscall_no == SYS_ENV_SET_TRAPFRAME {
        sys_env_set_trapframe(a1, a4)
    } else {
        Err(SyscallError::Inval)
    };

    match result {
        Ok(v) => v,
        Err(e) => e.code(),
    }
}
