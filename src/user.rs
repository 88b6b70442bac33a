// User-mode support library: the routines an environment links against to
// talk to the kernel. Mirrors the split in JOS's lib/ directory — these
// functions run in ring 3, reached only through the syscall trap gate, and
// are built into whatever ELF image env_create_for_init (and friends) load,
// not into the kernel image itself.

use crate::constants::*;
use crate::env::EnvInfo;
use crate::pmap::VirtAddr;
use crate::upcall::UTrapframe;
use crate::util;

mod nums {
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
}
use nums::*;

const ENV_RUNNABLE: i32 = 2;

// PDX/PGNUM-style address decomposition, kept local to this module: the
// richer PDX/PTX types in pmap are kernel-internal page table plumbing, not
// meant to cross into user code, which only ever needs the self-map trick
// below.
const fn pdx(va: u32) -> u32 {
    (va >> 22) & 0x3ff
}

const fn pgnum(va: u32) -> u32 {
    va >> PGSHIFT
}

const fn pgaddr(dir: u32, tbl: u32, offset: u32) -> u32 {
    (dir << 22) | (tbl << 12) | offset
}

// The directory maps itself at UVPT (see pmap::PageDirectory::new_for_user),
// so uvpt[pgnum(va)] is va's PTE and uvpd[pdx(va)] is va's PDE, both
// readable with no syscall.
const UVPT_PDX: u32 = pdx(UVPT);
const UVPD: u32 = pgaddr(UVPT_PDX, UVPT_PDX, 0);

unsafe fn uvpt_entry(va: u32) -> u32 {
    *((UVPT as *const u32).add(pgnum(va) as usize))
}

unsafe fn uvpd_entry(va: u32) -> u32 {
    *((UVPD as *const u32).add(pdx(va) as usize))
}

fn page_present(va: u32) -> bool {
    unsafe { uvpd_entry(va) & PTE_P != 0 && uvpt_entry(va) & PTE_P != 0 }
}

/// The UENVS snapshot, as a flat slice. Kept current by
/// env::EnvTable::sync_env_info; reading it costs no syscall.
fn uenvs() -> &'static [EnvInfo] {
    unsafe { core::slice::from_raw_parts(UENVS as *const EnvInfo, crate::env::NENV_USIZE) }
}

fn envx(id: u32) -> usize {
    (id & (crate::env::NENV_USIZE as u32 - 1)) as usize
}

#[inline]
unsafe fn raw_syscall(no: u32, a1: u32, a2: u32, a3: u32, a4: u32, a5: u32) -> i32 {
    let ret: i32;
    asm!("int $$0x30"
        : "={eax}"(ret)
        : "{eax}"(no), "{edx}"(a1), "{ecx}"(a2), "{ebx}"(a3), "{edi}"(a4), "{esi}"(a5)
        : "cc", "memory"
        : "volatile");
    ret
}

fn panic_on_error(who: &str, rc: i32) {
    if rc < 0 {
        panic!("{}: {}", who, rc);
    }
}

pub(crate) fn sys_cputs(s: &str) {
    unsafe {
        raw_syscall(SYS_CPUTS, s.as_ptr() as u32, s.len() as u32, 0, 0, 0);
    }
}

pub(crate) fn sys_cgetc() -> i32 {
    unsafe { raw_syscall(SYS_CGETC, 0, 0, 0, 0, 0) }
}

pub(crate) fn sys_getenvid() -> u32 {
    unsafe { raw_syscall(SYS_GETENVID, 0, 0, 0, 0, 0) as u32 }
}

pub(crate) fn sys_env_destroy(envid: u32) -> i32 {
    unsafe { raw_syscall(SYS_ENV_DESTROY, envid, 0, 0, 0, 0) }
}

pub(crate) fn sys_yield() {
    unsafe {
        raw_syscall(SYS_YIELD, 0, 0, 0, 0, 0);
    }
}

pub(crate) fn sys_exofork() -> i32 {
    unsafe { raw_syscall(SYS_EXOFORK, 0, 0, 0, 0, 0) }
}

pub(crate) fn sys_env_set_status(envid: u32, status: i32) -> i32 {
    unsafe { raw_syscall(SYS_ENV_SET_STATUS, envid, status as u32, 0, 0, 0) }
}

pub(crate) fn sys_env_set_pgfault_upcall(envid: u32, func: u32) -> i32 {
    unsafe { raw_syscall(SYS_ENV_SET_PGFAULT_UPCALL, envid, func, 0, 0, 0) }
}

pub(crate) fn sys_page_alloc(envid: u32, va: u32, perm: u32) -> i32 {
    unsafe { raw_syscall(SYS_PAGE_ALLOC, envid, va, perm, 0, 0) }
}

pub(crate) fn sys_page_map(srcenvid: u32, srcva: u32, dstenvid: u32, dstva: u32, perm: u32) -> i32 {
    unsafe { raw_syscall(SYS_PAGE_MAP, srcenvid, srcva, dstenvid, dstva, perm) }
}

pub(crate) fn sys_page_unmap(envid: u32, va: u32) -> i32 {
    unsafe { raw_syscall(SYS_PAGE_UNMAP, envid, va, 0, 0, 0) }
}

pub(crate) fn sys_ipc_try_send(envid: u32, value: u32, srcva: u32, perm: u32) -> i32 {
    unsafe { raw_syscall(SYS_IPC_TRY_SEND, envid, value, srcva, perm, 0) }
}

pub(crate) fn sys_ipc_recv(dstva: u32) -> i32 {
    unsafe { raw_syscall(SYS_IPC_RECV, dstva, 0, 0, 0, 0) }
}

// ---- page-fault upcall entry and COW fork ------------------------------

/// Address of the handler the trampoline below calls. Set by
/// set_pgfault_handler; read by pgfault_upcall_entry before it does
/// anything else, so it must never be written to once any page fault could
/// possibly occur.
#[no_mangle]
static mut PGFAULT_HANDLER: u32 = 0;

static mut PGFAULT_EXCSTACK_ALLOCATED: bool = false;

/// Entry point an env registers with sys_env_set_pgfault_upcall. The kernel
/// jumps here directly (via iret) with %esp pointing at a UTrapframe it
/// built on the exception stack; this function must not touch any register
/// it hasn't restored by the time it resumes the faulting instruction.
///
/// Naked: a normal Rust prologue would push ebp and move esp before we can
/// read the frame, which is exactly what we can't afford here.
#[naked]
#[no_mangle]
pub(crate) unsafe extern "C" fn pgfault_upcall_entry() {
    asm!(
    "pushl %esp; \
    movl PGFAULT_HANDLER, %eax; \
    call *%eax; \
    addl $$4, %esp; \
    movl 0x28(%esp), %eax; \
    movl 0x30(%esp), %ebx; \
    subl $$4, %ebx; \
    movl %ebx, 0x30(%esp); \
    movl %eax, (%ebx); \
    addl $$8, %esp; \
    popal; \
    addl $$4, %esp; \
    popfl; \
    popl %esp; \
    ret"
    ::: "memory" : "volatile"
    );
}

/// Registers `handler` as this env's page-fault callback, allocating its
/// exception stack and the kernel-side upcall registration on first use.
/// `handler` must be `extern "C"`: the asm trampoline above calls it with a
/// bare `call *%eax` under the cdecl convention, not Rust's.
pub(crate) fn set_pgfault_handler(handler: extern "C" fn(*mut UTrapframe)) {
    unsafe {
        if !PGFAULT_EXCSTACK_ALLOCATED {
            let rc = sys_page_alloc(0, UXSTACKTOP - PGSIZE, PTE_P | PTE_U | PTE_W);
            panic_on_error("sys_page_alloc(excstack)", rc);
            let rc = sys_env_set_pgfault_upcall(0, pgfault_upcall_entry as usize as u32);
            panic_on_error("sys_env_set_pgfault_upcall", rc);
            PGFAULT_EXCSTACK_ALLOCATED = true;
        }
        PGFAULT_HANDLER = handler as usize as u32;
    }
}

/// The actual page-fault logic invoked (indirectly, through the asm
/// trampoline above) on every COW write fault. Must read its own env id
/// with sys_getenvid rather than any cached value: a just-forked child
/// reaches here before it has had any chance to fix up per-env state of its
/// own, and touching anything beyond the UTrapframe itself before the COW
/// page is fixed up would fault again.
extern "C" fn pgfault(utf: *mut UTrapframe) {
    let utf = unsafe { &mut *utf };
    let fault_va = utf.utf_fault_va;
    let err = utf.utf_err;

    if err & FEC_WR == 0 || unsafe { uvpt_entry(fault_va) } & PTE_COW == 0 {
        panic!(
            "pgfault: unexpected fault at {:08x}, err {:08x}",
            fault_va, err
        );
    }

    let envid = sys_getenvid();
    let va_page = fault_va & !(PGSIZE - 1);

    let rc = sys_page_alloc(0, PFTEMP, PTE_P | PTE_U | PTE_W);
    panic_on_error("sys_page_alloc(pftemp)", rc);

    unsafe {
        util::memmove(VirtAddr(PFTEMP), VirtAddr(va_page), PGSIZE as usize);
    }

    let rc = sys_page_map(0, PFTEMP, envid, va_page, PTE_P | PTE_U | PTE_W);
    panic_on_error("sys_page_map(fixup)", rc);

    let rc = sys_page_unmap(0, PFTEMP);
    panic_on_error("sys_page_unmap(pftemp)", rc);
}

/// Shares or copies page `pn` (a page number below USTACKTOP) from the
/// calling env into `envid`, following the COW rule in fork's contract: a
/// writable or already-COW page is remapped read-only-and-COW in both
/// envs; anything else keeps the parent's permissions unchanged.
fn duppage(envid: u32, pn: u32) -> i32 {
    let va = pn * PGSIZE;
    let pte = unsafe { uvpt_entry(va) };
    let perm = pte & 0xfff;

    let new_perm = if perm & (PTE_W | PTE_COW) != 0 {
        (perm & !(PTE_W)) | PTE_COW | PTE_P | PTE_U
    } else {
        perm
    };

    let rc = sys_page_map(0, va, envid, va, new_perm);
    if rc < 0 {
        return rc;
    }

    if new_perm & PTE_COW != 0 {
        let rc = sys_page_map(0, va, 0, va, new_perm);
        if rc < 0 {
            return rc;
        }
    }

    0
}

/// Duplicates every present user page below USTACKTOP into the child,
/// applying the COW rule page by page.
fn copy_address_space(child: u32) {
    let mut va = 0u32;
    while va < USTACKTOP {
        if page_present(va) {
            let rc = duppage(child, pgnum(va));
            panic_on_error("duppage", rc);
        }
        va += PGSIZE;
    }
}

/// Creates a child env that is a copy-on-write clone of the caller. Returns
/// 0 in the child, the child's envid in the parent.
pub(crate) fn fork() -> i32 {
    set_pgfault_handler(pgfault);

    let envid = sys_exofork();
    if envid < 0 {
        panic!("sys_exofork: {}", envid);
    }
    if envid == 0 {
        // We're the child: our own env id and thisenv-equivalent state are
        // not set up yet, so nothing beyond this return may touch them.
        return 0;
    }

    let child = envid as u32;
    copy_address_space(child);

    // The exception stack is never COW: allocate the child a fresh one
    // rather than sharing the parent's.
    let rc = sys_page_alloc(child, UXSTACKTOP - PGSIZE, PTE_P | PTE_U | PTE_W);
    panic_on_error("sys_page_alloc(child excstack)", rc);

    let upcall = unsafe { PGFAULT_HANDLER };
    if upcall != 0 {
        let rc = sys_env_set_pgfault_upcall(child, pgfault_upcall_entry as usize as u32);
        panic_on_error("sys_env_set_pgfault_upcall(child)", rc);
    }

    let rc = sys_env_set_status(child, ENV_RUNNABLE);
    panic_on_error("sys_env_set_status(child)", rc);

    envid
}

// ---- IPC ------------------------------------------------------------

/// Receives a value (and, if `pg` is Some, a page mapped at `pg`) sent via
/// ipc_try_send. Blocks until a sender arrives. Returns
/// (sender envid, value, perm the page was granted with, or 0).
pub(crate) fn ipc_recv(pg: Option<u32>) -> (u32, u32, u32) {
    let dstva = pg.unwrap_or(UTOP);
    let rc = sys_ipc_recv(dstva);
    panic_on_error("sys_ipc_recv", rc);

    let me = envx(sys_getenvid());
    let info = &uenvs()[me];
    (info.env_ipc_from, info.env_ipc_value, info.env_ipc_perm)
}

/// Sends `value` (and, if `pg` is Some, the page at that va with `perm`) to
/// `to_env`. Retries on IPC_NOT_RECV, since that only means the receiver
/// hasn't called ipc_recv yet, not a real error.
pub(crate) fn ipc_send(to_env: u32, value: u32, pg: Option<u32>, perm: u32) {
    let srcva = pg.unwrap_or(UTOP);
    loop {
        let rc = sys_ipc_try_send(to_env, value, srcva, perm);
        if rc == 0 {
            return;
        }
        if rc != E_IPC_NOT_RECV {
            panic!("ipc_send: {}", rc);
        }
        sys_yield();
    }
}
