use alloc::boxed::Box;
use core::ptr::null_mut;

use crate::constants::*;
use crate::elf::{ElfParser, ProghdrType};
use crate::pmap::{PageDirectory, PhysAddr, VirtAddr, PDX};
use crate::spinlock::{Mutex, MutexGuard};
use crate::trap::Trapframe;
use crate::{mpconfig, pmap, sched, util, x86};
use core::fmt::{Error, Formatter};
use core::fmt;

// log2(NENV); NENV must stay a power of two so ENVX can mask off the slot
// bits with a simple AND.
const LOG2NENV: u32 = 10;
const NENV: u32 = 1 << LOG2NENV;
const ENVGENSHIFT: u32 = LOG2NENV;
pub(crate) const NENV_USIZE: usize = NENV as usize;

pub(crate) fn envx(id: EnvId) -> usize {
    (id.0 & (NENV - 1)) as usize
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) struct EnvId(pub(crate) u32);

impl fmt::LowerHex for EnvId {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        let val = self.0;
        fmt::LowerHex::fmt(&val, f)
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum EnvType {
    User,
    Fs,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum EnvStatus {
    Free,
    Dying,
    Runnable,
    Running,
    NotRunnable,
}

#[repr(C)]
pub(crate) struct Env {
    env_tf: Trapframe,        // Saved registers
    env_id: EnvId,            // Unique environment identifier
    env_parent_id: EnvId,     // env_id of this env's parent
    env_type: EnvType,        // Indicates special system environments
    env_status: EnvStatus,    // Status of the environment
    env_runs: u32,            // Number of times environment has run
    env_cpu: u8,              // Id of the CPU that most recently ran this env
    env_pgdir: Box<PageDirectory>, // Kernel virtual address of page dir

    // User-level page fault handling, set by sys_env_set_pgfault_upcall.
    env_pgfault_upcall: VirtAddr,

    // Synchronous IPC rendezvous, set by sys_ipc_recv.
    env_ipc_recving: bool, // Env is blocked receiving
    env_ipc_dstva: VirtAddr, // va at which to map received page
    env_ipc_from: EnvId,   // envid of the sender
    env_ipc_value: u32,    // data value sent to us
    env_ipc_perm: u32,     // perm of the page mapping received
}

impl PartialEq for Env {
    fn eq(&self, other: &Self) -> bool {
        self.env_id == other.env_id
    }
}

impl Eq for Env {}

impl Env {
    fn set_entry_point(&mut self, va: VirtAddr) {
        self.env_tf.set_entry_point(va);
    }

    pub(crate) fn is_running(&self) -> bool {
        self.env_status == EnvStatus::Running
    }

    pub(crate) fn is_runnable(&self) -> bool {
        self.env_status == EnvStatus::Runnable
    }

    pub(crate) fn is_dying(&self) -> bool {
        self.env_status == EnvStatus::Dying
    }

    pub(crate) fn is_free(&self) -> bool {
        self.env_status == EnvStatus::Free
    }

    pub(crate) fn set_status(&mut self, status: EnvStatus) {
        self.env_status = status;
    }

    fn pause(&mut self) {
        self.env_status = EnvStatus::Runnable;
    }

    fn resume(&mut self, cpu_id: u8) {
        self.env_status = EnvStatus::Running;
        self.env_runs += 1;
        self.env_cpu = cpu_id;
    }

    fn die(&mut self) {
        self.env_status = EnvStatus::Dying;
    }

    pub(crate) fn get_tf(&self) -> &Trapframe {
        &self.env_tf
    }

    pub(crate) fn get_tf_mut(&mut self) -> &mut Trapframe {
        &mut self.env_tf
    }

    pub(crate) fn set_tf(&mut self, tf: &Trapframe) {
        self.env_tf = tf.clone();
    }

    pub(crate) fn get_env_id(&self) -> EnvId {
        self.env_id
    }

    pub(crate) fn get_parent_id(&self) -> EnvId {
        self.env_parent_id
    }

    pub(crate) fn get_cpu(&self) -> u8 {
        self.env_cpu
    }

    pub(crate) fn get_pgdir(&mut self) -> &mut PageDirectory {
        self.env_pgdir.as_mut()
    }

    pub(crate) fn get_pgdir_paddr(&mut self) -> PhysAddr {
        self.env_pgdir.paddr().unwrap()
    }

    pub(crate) fn pgfault_upcall(&self) -> VirtAddr {
        self.env_pgfault_upcall
    }

    pub(crate) fn set_pgfault_upcall(&mut self, func: VirtAddr) {
        self.env_pgfault_upcall = func;
    }

    pub(crate) fn is_ipc_recving(&self) -> bool {
        self.env_ipc_recving
    }

    pub(crate) fn ipc_dstva(&self) -> VirtAddr {
        self.env_ipc_dstva
    }

    pub(crate) fn set_ipc_recv_state(&mut self, dstva: VirtAddr) {
        self.env_ipc_recving = true;
        self.env_ipc_dstva = dstva;
    }

    pub(crate) fn deliver_ipc(&mut self, from: EnvId, value: u32, perm: u32) {
        self.env_ipc_recving = false;
        self.env_ipc_from = from;
        self.env_ipc_value = value;
        self.env_ipc_perm = perm;
        self.env_tf.tf_regs.reg_eax = 0;
    }

    pub(crate) fn ipc_from(&self) -> EnvId {
        self.env_ipc_from
    }

    pub(crate) fn ipc_value(&self) -> u32 {
        self.env_ipc_value
    }

    pub(crate) fn ipc_perm(&self) -> u32 {
        self.env_ipc_perm
    }
}

/// Read-only per-env snapshot mirrored at UENVS so user code (fork's
/// duppage, ipc_recv's thisenv-style lookup) can read status/id/ipc state
/// without a syscall. Kept in sync by sync_env_info, called from the
/// syscalls that change the fields it mirrors.
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct EnvInfo {
    pub(crate) env_id: u32,
    pub(crate) env_parent_id: u32,
    pub(crate) env_type: u32,
    pub(crate) env_status: u32,
    pub(crate) env_ipc_from: u32,
    pub(crate) env_ipc_value: u32,
    pub(crate) env_ipc_perm: u32,
}

impl EnvInfo {
    const fn empty() -> EnvInfo {
        EnvInfo {
            env_id: 0,
            env_parent_id: 0,
            env_type: 0,
            env_status: 0,
            env_ipc_from: 0,
            env_ipc_value: 0,
            env_ipc_perm: 0,
        }
    }
}

pub(crate) static mut ENV_INFO: [EnvInfo; NENV_USIZE] = [EnvInfo::empty(); NENV_USIZE];

// A descriptor sitting on the free list. Slot index is implicit (it is
// this descriptor's position in EnvTable::envs); `next` chains to the
// next free slot, NENV meaning "end of list".
#[derive(Clone, Copy)]
struct FreeEnv {
    id: u32,
    next: u32,
}

pub(crate) struct EnvTable {
    envs: [Option<Env>; NENV as usize],
    // Ids and free-list links for slots currently FREE. For slots that are
    // occupied the entry here is stale and unused.
    free: [FreeEnv; NENV as usize],
    free_head: u32, // NENV means empty
}

impl EnvTable {
    pub(crate) fn init(&mut self) {
        for i in 0..(NENV as usize) {
            self.envs[i] = None;
            self.free[i] = FreeEnv {
                id: 0,
                next: if i + 1 < NENV as usize {
                    (i + 1) as u32
                } else {
                    NENV
                },
            };
        }
        self.free_head = 0;
    }

    pub(crate) fn find(&self, env_id: EnvId) -> Option<&Env> {
        if env_id.0 == 0 {
            return cur_env();
        }
        let idx = envx(env_id);
        match &self.envs[idx] {
            Some(env) if env.env_id == env_id => Some(env),
            _ => None,
        }
    }

    pub(crate) fn find_mut(&mut self, env_id: EnvId) -> Option<&mut Env> {
        if env_id.0 == 0 {
            return cur_env_mut();
        }
        let idx = envx(env_id);
        match &mut self.envs[idx] {
            Some(env) if env.env_id == env_id => Some(env),
            _ => None,
        }
    }

    /// Look up an env and, if `check_perm`, additionally require that it is
    /// the current env or one of its immediate children.
    pub(crate) fn lookup(&self, env_id: EnvId, check_perm: bool) -> Result<&Env, i32> {
        let env = self.find(env_id).ok_or(E_BAD_ENV)?;
        if check_perm {
            let cur = cur_env().ok_or(E_BAD_ENV)?;
            if env.env_id != cur.env_id && env.env_parent_id != cur.env_id {
                return Err(E_BAD_ENV);
            }
        }
        Ok(env)
    }

    fn get_idx(&self, env_id: EnvId) -> Option<usize> {
        let idx = envx(env_id);
        match &self.envs[idx] {
            Some(env) if env.env_id == env_id => Some(idx),
            _ => None,
        }
    }

    /// Finds the next env to run per the round-robin-with-affinity policy.
    /// See sched::sched_yield for the full algorithm; this only implements
    /// the table scan, not the CPU bookkeeping around it.
    pub(crate) fn find_runnable_from(&self, start: usize) -> Option<EnvId> {
        for i in 0..(NENV as usize) {
            let idx = (start + i) % (NENV as usize);
            if let Some(env) = &self.envs[idx] {
                if env.is_runnable() {
                    return Some(env.get_env_id());
                }
            }
        }
        None
    }

    /// Finds an env RUNNING on the given CPU ("whoever started it finishes
    /// it" — used when nothing is RUNNABLE).
    pub(crate) fn find_running_on(&self, cpu_id: u8) -> Option<EnvId> {
        for env_opt in self.envs.iter() {
            if let Some(env) = env_opt {
                if env.is_running() && env.get_cpu() == cpu_id {
                    return Some(env.get_env_id());
                }
            }
        }
        None
    }

    /// True iff no descriptor anywhere is RUNNABLE, RUNNING, or DYING.
    pub(crate) fn all_idle(&self) -> bool {
        self.envs.iter().flatten().all(|env| env.is_free())
    }

    /// Allocates and initializes a new environment.
    ///
    /// Returns the new env's id, or an error if the table is full or
    /// the address space could not be built.
    fn env_alloc(&mut self, parent_id: EnvId, typ: EnvType) -> Result<EnvId, i32> {
        if self.free_head == NENV {
            return Err(E_NO_FREE_ENV);
        }
        let idx = self.free_head as usize;
        let old_id = self.free[idx].id;
        self.free_head = self.free[idx].next;

        // Allocate and set up the page directory for this environment.
        let new_pgdir = PageDirectory::new_for_user();

        // id = ((old_id + 2^ENVGENSHIFT) & ~(NENV-1)) | slot, never <= 0.
        let mut new_id = (old_id.wrapping_add(1 << ENVGENSHIFT)) & !(NENV - 1);
        if (new_id as i32) <= 0 {
            new_id = 1 << ENVGENSHIFT;
        }
        let new_id = new_id | (idx as u32);

        let mut new_tf = Trapframe::new_for_user();
        if typ == EnvType::Fs {
            // IOPL=3: grant I/O privilege to the lone filesystem environment.
            new_tf.tf_eflags |= 3 << 12;
        }

        let new_env = Env {
            env_tf: new_tf,
            env_id: EnvId(new_id),
            env_parent_id: parent_id,
            env_type: typ,
            env_status: EnvStatus::Runnable,
            env_runs: 0,
            env_cpu: 0,
            env_pgdir: new_pgdir,
            env_pgfault_upcall: VirtAddr(0),
            env_ipc_recving: false,
            env_ipc_dstva: VirtAddr(0),
            env_ipc_from: EnvId(0),
            env_ipc_value: 0,
            env_ipc_perm: 0,
        };

        self.envs[idx] = Some(new_env);
        println!("[{:08x}] new env {:08x}", parent_id.0, new_id);
        Ok(EnvId(new_id))
    }

    /// Set up the initial program binary, stack, and processor flags
    /// for a user process. Only called during kernel initialization,
    /// before running the first user-mode environment.
    unsafe fn load_icode(&mut self, env_id: EnvId, binary: *const u8) {
        let env = self.find_mut(env_id).expect("illegal env_id");

        let elf = ElfParser::new(binary).expect("binary is not elf");

        // Change page directory to that of env temporarily so the kernel
        // can copy file contents directly into the new address space.
        let kern_pgdir = x86::rcr3();
        x86::lcr3(
            env.env_pgdir
                .paddr()
                .expect("failed to get a paddr of pgdir"),
        );

        for ph in elf.program_headers() {
            if ph.p_type != ProghdrType::PtLoad {
                continue;
            }

            let src_va = VirtAddr(binary as u32 + ph.p_offset);
            let dest_va = VirtAddr(ph.p_vaddr);
            let memsz = ph.p_memsz as usize;
            let filesz = ph.p_filesz as usize;

            env.env_pgdir.as_mut().region_alloc(dest_va, memsz);

            util::memcpy(dest_va, src_va, filesz);
            util::memset(dest_va + filesz, 0, memsz - filesz);
        }

        // Map one page for the program's initial stack at USTACKTOP - PGSIZE.
        let stack_base = VirtAddr(USTACKTOP - PGSIZE);
        let stack_size = USTACKSIZE as usize;
        env.env_pgdir.region_alloc(stack_base, stack_size);

        // Restore kernel page directory.
        x86::lcr3(kern_pgdir);

        env.set_entry_point(elf.entry_point());
    }

    /// Frees resources and memory the env uses, and returns its slot to the
    /// free list with status FREE.
    unsafe fn env_free(&mut self, env_id: EnvId) {
        let idx = self.get_idx(env_id).expect("illegal env_id");

        // If freeing the current environment, switch to kern_pgdir first,
        // just in case the page directory's frame gets reused.
        if let Some(cur) = cur_env_mut() {
            if cur.env_id == env_id {
                pmap::load_kern_pgdir();
            }
        }

        {
            let curenv_id = cur_env().map(Env::get_env_id).map(|x| x.0).unwrap_or(0);
            println!("[{:08x}] free env {:08x}", curenv_id, env_id.0);
        }

        let env = self.envs[idx].as_mut().unwrap();

        // Flush all mapped pages in the user portion of the address space.
        assert_eq!(UTOP % (PTSIZE as u32), 0);
        let start_pdx = PDX::new(VirtAddr(0));
        let end_pdx = PDX::new(VirtAddr(UTOP));
        let mut pdx = start_pdx;
        while pdx < end_pdx {
            let pde = &env.env_pgdir[pdx];
            if pde.exists() {
                env.env_pgdir.remove_pde(pdx);
            }
            pdx += 1;
        }

        // The directory frame itself is owned by the Box<PageDirectory> and
        // is reclaimed when the Env is dropped below.

        let old_id = env.env_id.0;
        self.envs[idx] = None;
        self.free[idx] = FreeEnv {
            id: old_id,
            next: self.free_head,
        };
        self.free_head = idx as u32;
    }

    /// Reclaims a running env, or marks it DYING if it is running on
    /// another CPU, per `destroy`'s semantics in §4.1.
    fn destroy(&mut self, env_id: EnvId) {
        let is_myself = match cur_env() {
            Some(cur) => cur.get_env_id() == env_id,
            None => false,
        };

        let is_running_elsewhere = match self.find(env_id) {
            Some(env) => env.is_running() && !is_myself,
            None => return,
        };

        if is_running_elsewhere {
            self.find_mut(env_id).unwrap().die();
            return;
        }

        // Reap any DYING grandchildren first so they are not orphaned.
        let dying_children: alloc::vec::Vec<EnvId> = self
            .envs
            .iter()
            .flatten()
            .filter(|e| e.is_dying() && e.get_parent_id() == env_id)
            .map(Env::get_env_id)
            .collect();
        for child in dying_children {
            unsafe { self.env_free(child) };
        }

        unsafe { self.env_free(env_id) };

        if is_myself {
            mpconfig::this_cpu_mut().unset_env();
        }
    }

    /// Rewrites the whole UENVS snapshot from the live table. Called after
    /// any syscall mutates a field this mirrors; NENV is small enough that
    /// a full pass is simpler than tracking individual dirty slots.
    pub(crate) fn sync_env_info(&self) {
        for i in 0..(NENV as usize) {
            let info = match &self.envs[i] {
                Some(env) => EnvInfo {
                    env_id: env.env_id.0,
                    env_parent_id: env.env_parent_id.0,
                    env_type: env.env_type as u32,
                    env_status: env.env_status as u32,
                    env_ipc_from: env.env_ipc_from.0,
                    env_ipc_value: env.env_ipc_value,
                    env_ipc_perm: env.env_ipc_perm,
                },
                None => EnvInfo::empty(),
            };
            unsafe {
                ENV_INFO[i] = info;
            }
        }
    }
}

static ENV_TABLE: Mutex<EnvTable> = Mutex::new(EnvTable {
    envs: [None; NENV as usize],
    free: [FreeEnv { id: 0, next: 0 }; NENV as usize],
    free_head: 0,
});

pub(crate) fn env_table() -> MutexGuard<'static, EnvTable> {
    ENV_TABLE.lock()
}

pub(crate) fn init() {
    env_table().init();
}

pub(crate) fn cur_env() -> Option<&'static Env> {
    mpconfig::this_cpu().cur_env()
}

pub(crate) fn cur_env_mut() -> Option<&'static mut Env> {
    mpconfig::this_cpu_mut().cur_env_mut()
}

/// Allocates a new env with env_alloc, loads the named ELF binary into it
/// with load_icode, and sets its env_type. Only called during kernel
/// initialization, before running the first user-mode environment. The
/// new env's parent id is 0.
pub(crate) fn env_create_for_init(env_table: &mut EnvTable) -> EnvId {
    extern "C" {
        static _binary_obj_user_init_start: u8;
    }

    let env_id = env_table
        .env_alloc(EnvId(0), EnvType::User)
        .expect("env_create_for_init: env_alloc failed");

    unsafe {
        let user_init_start = &_binary_obj_user_init_start as *const u8;
        env_table.load_icode(env_id, user_init_start);
    }

    env_id
}

/// Allocates a new env via a VM syscall (exofork-style): parent is the
/// current env, the child starts NOT_RUNNABLE so the caller can finish
/// configuring it before making it runnable.
pub(crate) fn env_create(env_table: &mut EnvTable, parent_id: EnvId) -> Result<EnvId, i32> {
    let id = env_table.env_alloc(parent_id, EnvType::User)?;
    env_table.find_mut(id).unwrap().set_status(EnvStatus::NotRunnable);
    Ok(id)
}

/// Destroys an env. If it was the current one, `curenv` is cleared and this
/// call does not return to its caller: the scheduler is invoked directly,
/// the same way sched_yield's own diverging tail calls release the big
/// kernel lock at the right instant.
pub(crate) fn env_destroy(env_id: EnvId, mut table: MutexGuard<EnvTable>) {
    let is_myself = match cur_env() {
        Some(cur) => cur.get_env_id() == env_id,
        None => false,
    };

    table.destroy(env_id);
    drop(table);

    if is_myself {
        sched::sched_yield();
    }
}

/// Restores the register values in the Trapframe with the 'iret' instruction.
/// This exits the kernel and starts executing some environment's code.
///
/// This function does not return.
pub(crate) fn env_pop_tf(tf: *const Trapframe) -> ! {
    unsafe {
        asm!(
        "movl $0, %esp; \
        popal; \
        popl %es; \
        popl %ds; \
        addl $0x8, %esp; \
        iret"
        : : "rmi" (tf) : "memory" : "volatile"
        );
    }

    panic!("iret failed")
}

/// Context switch from curenv to env e.
/// Note: if this is the first call to env_run, curenv is NULL.
/// Note: this function releases the passed env table guard, and the big
/// kernel lock that trap()'s dispatch has been holding, just before
/// returning to user mode.
///
/// This function does not return.
pub(crate) fn env_run(env_id: EnvId, mut table: MutexGuard<EnvTable>) -> ! {
    let this_cpu_id = mpconfig::this_cpu().cpu_id;

    if let Some(cur) = cur_env_mut().filter(|e| e.is_running()) {
        cur.pause();
    }

    let env = table.find_mut(env_id).unwrap();
    let env_tf = &env.env_tf as *const Trapframe;
    let env_ptr = env as *mut Env;
    let env_pgdir_paddr = env.env_pgdir.paddr().unwrap();

    env.resume(this_cpu_id);
    mpconfig::this_cpu_mut().set_env(env_ptr);
    x86::lcr3(env_pgdir_paddr);

    drop(table);
    unsafe { crate::kernel_lock::unlock_kernel() };

    env_pop_tf(env_tf);
}

/// Checks that environment 'env' is allowed to access the range
/// of memory [va, va+len) with permissions 'perm | PTE_U | PTE_P'.
/// If it can, then the function simply returns.
/// If it cannot, 'env' is destroyed and, if env is the current
/// environment, this function will not return.
pub(crate) fn user_mem_assert(env: &mut Env, va: VirtAddr, len: usize, perm: u32) {
    if let Err(addr) = env.env_pgdir.user_mem_check(va, len, perm | PTE_U) {
        println!(
            "[{:08x}] user_mem_check assertion failure for va {:08x}",
            env.env_id.0, addr.0
        );

        let env_table = env_table();
        env_destroy(env.get_env_id(), env_table);
    }
}
