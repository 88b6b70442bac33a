// Virtual memory layout, permission bits, and other machine constants.
// Addresses below follow the classic JOS layout: user-visible read-only
// windows (UVPT/UENVS/UPAGES) sit directly below ULIM/MMIOBASE, and the
// kernel heap occupies its own window further down, out of the user's way.

pub(crate) const KERN_BASE: u32 = 0xf0000000;
pub(crate) const PGSIZE: u32 = 4096;
pub(crate) const PGSHIFT: u32 = 12;

// PTE/PDE permission and status bits.
pub(crate) const PTE_P: u32 = 0x001; // Present
pub(crate) const PTE_W: u32 = 0x002; // Writeable
pub(crate) const PTE_U: u32 = 0x004; // User
pub(crate) const PTE_PWT: u32 = 0x008; // Write-Through
pub(crate) const PTE_PCD: u32 = 0x010; // Cache-Disable
pub(crate) const PTE_A: u32 = 0x020; // Accessed
pub(crate) const PTE_D: u32 = 0x040; // Dirty
pub(crate) const PTE_PS: u32 = 0x080; // Page Size
pub(crate) const PTE_G: u32 = 0x100; // Global

// The bits available for software use in a PTE. PTE_AVAIL is the mask of
// all three; PTE_COW is the one fork() assigns a meaning to.
pub(crate) const PTE_AVAIL: u32 = 0xE00;
pub(crate) const PTE_COW: u32 = 0x800;

// Mask of permission bits a VM syscall may legally grant.
pub(crate) const PTE_SYSCALL: u32 = PTE_P | PTE_U | PTE_W | PTE_AVAIL;

pub(crate) const NPDENTRIES: usize = 1024;
pub(crate) const NPTENTRIES: usize = 1024;
pub(crate) const PTSIZE: usize = NPTENTRIES * (PGSIZE as usize);

pub(crate) const KSTACKTOP: u32 = KERN_BASE;
pub(crate) const KSTKSIZE: u32 = 8 * PGSIZE;
pub(crate) const KSTKGAP: u32 = 8 * PGSIZE;

pub(crate) const MMIOLIM: u32 = KSTACKTOP - (PTSIZE as u32);
pub(crate) const MMIOBASE: u32 = MMIOLIM - (PTSIZE as u32);

// Top of the user-accessible address space, read-only windows included.
pub(crate) const ULIM: u32 = MMIOBASE;

// Read-only, per-env page table self-map: uvpt[PGNUM(va)] gives the PTE
// that maps va, and uvpd[PDX(va)] gives the corresponding PDE.
pub(crate) const UVPT: u32 = ULIM - (PTSIZE as u32);
// Read-only copy of the global env table.
pub(crate) const UENVS: u32 = UVPT - (PTSIZE as u32);
// Read-only copy of the global page-info array.
pub(crate) const UPAGES: u32 = UENVS - (PTSIZE as u32);

// Top of the user-mutable part of the address space.
pub(crate) const UTOP: u32 = UPAGES;
pub(crate) const UXSTACKTOP: u32 = UTOP;
// The normal user stack sits one page below UTOP, leaving room for a guard.
pub(crate) const USTACKTOP: u32 = UTOP - PTSIZE as u32;
pub(crate) const USTACKSIZE: u32 = PGSIZE;

// Fixed scratch VA the user-space COW fork helper uses transiently while it
// copies a faulting page.
pub(crate) const PFTEMP: u32 = 0x7ff000;

// Page-fault error code bit: set if the access that faulted was a write.
pub(crate) const FEC_WR: u32 = 0x2;

// User heap window, this kernel's own addition (not part of the JOS layout).
pub(crate) const UHEAPBASE: u32 = 0x60000000;
pub(crate) const UHEAPSIZE: usize = 16 * 1024 * 1024;

// Kernel heap, backing the linked_list_allocator-based global allocator.
// Lives below the user-visible UVPT/UENVS/UPAGES windows so it cannot
// collide with them.
pub(crate) const KHEAP_SIZE: usize = 3 * PTSIZE;
pub(crate) const KHEAP_BASE: u32 = UPAGES - (KHEAP_SIZE as u32) - (PTSIZE as u32);

// Physical address at which boot_aps() copies the real-mode AP entry trampoline.
pub(crate) const MPENTRY_PADDR: u32 = 0x7000;

// eflags bits.
pub(crate) const FL_IF: u32 = 0x00000200; // Interrupt Enable
pub(crate) const FL_IOPL_MASK: u32 = 0x00003000; // I/O Privilege Level bitmask

// CR0 bits.
pub(crate) const CR0_PE: u32 = 0x00000001; // Protection Enable
pub(crate) const CR0_MP: u32 = 0x00000002; // Monitor coProcessor
pub(crate) const CR0_EM: u32 = 0x00000004; // Emulation
pub(crate) const CR0_TS: u32 = 0x00000008; // Task Switched
pub(crate) const CR0_ET: u32 = 0x00000010; // Extension Type
pub(crate) const CR0_NE: u32 = 0x00000020; // Numeric Error
pub(crate) const CR0_WP: u32 = 0x00010000; // Write Protect
pub(crate) const CR0_AM: u32 = 0x00040000; // Alignment Mask
pub(crate) const CR0_NW: u32 = 0x20000000; // Not Write through
pub(crate) const CR0_CD: u32 = 0x40000000; // Cache Disable
pub(crate) const CR0_PG: u32 = 0x80000000; // Paging

// Error codes returned (as negative i32) from the syscall ABI. See
// syscall::SyscallError for the Result-based equivalent used internally.
pub(crate) const E_BAD_ENV: i32 = -1; // Environment doesn't exist or otherwise cannot be used
pub(crate) const E_INVAL: i32 = -3; // Invalid parameter
pub(crate) const E_NO_MEM: i32 = -4; // Request failed due to memory shortage
pub(crate) const E_NO_FREE_ENV: i32 = -5; // No free environment
pub(crate) const E_IPC_NOT_RECV: i32 = -7; // Attempt to send to env that is not recving
