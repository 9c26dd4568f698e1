//! Program loading: ELF mapping and initial user stack construction.
//!
//! `execve` here is spawn-shaped: it builds a fresh user task from the
//! named image, wires it as a child of the caller, inherits the caller's
//! open files (with refcount bumps and pending dup pairs applied) and
//! queues it. Static executables run at their stated vaddrs; a PT_INTERP
//! request loads the interpreter rebased to 0x4000_0000 and enters through
//! it, with the aux vector still describing the main executable.

extern crate alloc;

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use muon_core::addr::{PhysAddr, VirtAddr};
use muon_core::kdebug;
use muon_elf::{ElfFile, ElfType};

use crate::config::{INTERP_BASE, VFS_MIN_HANDLE};
use crate::fs::{FsError, OpenMode};
use crate::mm::PAGE_SIZE;
use crate::mm::vmm::{HhdmMapper, PageFlags};
use crate::sched::task::{MemMap, Task, TaskMode, TaskRegs, Tid, task_make};

/// Aux vector keys.
const AT_ENTRY: u64 = 10;
const AT_PHDR: u64 = 20;
const AT_PHENT: u64 = 21;
const AT_PHNUM: u64 = 22;

/// What the loader learned about an image.
struct LoadInfo {
    entry: u64,
    phdr: u64,
    phentsize: u64,
    phnum: u64,
    interpreter: Option<String>,
}

/// Reads a whole file through the VFS.
fn read_file(path: &str) -> Result<Vec<u8>, FsError> {
    let handle = crate::fs::vfs::open(path, OpenMode::ReadWrite)?;
    let size = crate::fs::vfs::file_size(handle)?;
    let mut image = vec![0u8; size];
    let mut done = 0;
    while done < size {
        let n = crate::fs::vfs::read(handle, &mut image[done..])?;
        if n == 0 {
            break;
        }
        done += n;
    }
    crate::fs::vfs::close(handle)?;
    if done != size {
        return Err(FsError::IoFailure);
    }
    Ok(image)
}

/// Maps an image's PT_LOAD segments into `task`'s address space at
/// `base` + vaddr (base is 0 for ET_EXEC). Every allocation is recorded
/// in the task's mapping list, so a later `task_free` rolls back a failed
/// exec completely.
fn load_image(task: &mut Task, image: &[u8], base: u64) -> Result<LoadInfo, FsError> {
    let elf = ElfFile::parse(image).map_err(|_| FsError::CorruptImage)?;
    let rebase = match elf.header().etype {
        ElfType::Exec => 0,
        ElfType::Dyn => base.max(INTERP_BASE),
    };

    for seg in elf.load_segments() {
        let pages = seg.page_count();
        let misalign = seg.misalign();
        let virt = seg.vaddr - misalign + rebase;

        let phys = crate::mm::vmm::with_vmm(|_| {
            crate::mm::pmm::with_pmm(|pmm| {
                let phys = pmm.get(pages, 0);
                let space = task.addr_space.as_mut().expect("user task without space");
                space.map(
                    &HhdmMapper,
                    pmm,
                    VirtAddr::new_truncate(virt),
                    PhysAddr::new(phys),
                    pages,
                    PageFlags::USER_DEFAULT,
                );
                phys
            })
        });
        task.mmap_list.push(MemMap {
            vaddr: virt,
            paddr: phys,
            pages,
            flags: PageFlags::USER_DEFAULT,
        });

        let bytes = elf.segment_bytes(&seg).ok_or(FsError::CorruptImage)?;
        // SAFETY: The frames were just allocated for this segment and are
        // visible through the HHDM.
        unsafe {
            let dst = crate::mm::hhdm::phys_to_virt(PhysAddr::new(phys)).as_mut_ptr::<u8>();
            core::ptr::write_bytes(dst, 0, (pages * PAGE_SIZE) as usize);
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), dst.add(misalign as usize), bytes.len());
        }
    }

    Ok(LoadInfo {
        entry: elf.header().entry + rebase,
        phdr: elf.phdr_vaddr().map(|v| v + rebase).unwrap_or(0),
        phentsize: u64::from(elf.header().phentsize),
        phnum: u64::from(elf.header().phnum),
        interpreter: elf.interpreter().map(String::from),
    })
}

/// Writer over the identity-mapped user stack, addressed by the values
/// the user program will see.
struct StackWriter {
    sp: u64,
}

impl StackWriter {
    fn push_bytes(&mut self, bytes: &[u8]) -> u64 {
        self.sp -= bytes.len() as u64;
        // SAFETY: The cursor stays inside the freshly allocated user
        // stack; exec fits well under the stack size.
        unsafe {
            let dst = crate::mm::hhdm::phys_to_virt(PhysAddr::new(self.sp)).as_mut_ptr::<u8>();
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
        }
        self.sp
    }

    fn push_u64(&mut self, value: u64) -> u64 {
        self.push_bytes(&value.to_le_bytes())
    }

    fn align16(&mut self) {
        self.sp &= !0xF;
    }
}

/// Builds the initial user stack per the fixed layout: environment
/// strings, argv strings, alignment, the aux vector, envp, argv, argc.
/// Returns the final user RSP.
fn build_user_stack(task: &Task, info: &LoadInfo, argv: &[String], envp: &[String]) -> u64 {
    let top = task.ustack_phys + crate::config::STACK_SIZE as u64;
    let mut w = StackWriter { sp: top };

    let env_addrs: Vec<u64> = envp
        .iter()
        .map(|e| {
            let mut bytes = e.as_bytes().to_vec();
            bytes.push(0);
            w.push_bytes(&bytes)
        })
        .collect();
    let arg_addrs: Vec<u64> = argv
        .iter()
        .map(|a| {
            let mut bytes = a.as_bytes().to_vec();
            bytes.push(0);
            w.push_bytes(&bytes)
        })
        .collect();

    w.align16();
    // Keep the final RSP 16-byte aligned: the pointer area below holds
    // argc + argv + NULL + envp + NULL + aux words.
    if (argv.len() + envp.len() + 1) % 2 == 1 {
        w.push_u64(0);
    }

    // Aux vector, terminator first (it ends up highest).
    w.push_u64(0);
    w.push_u64(0);
    for (key, value) in [
        (AT_ENTRY, info.entry),
        (AT_PHDR, info.phdr),
        (AT_PHENT, info.phentsize),
        (AT_PHNUM, info.phnum),
    ] {
        w.push_u64(value);
        w.push_u64(key);
    }

    w.push_u64(0);
    for &addr in env_addrs.iter().rev() {
        w.push_u64(addr);
    }
    w.push_u64(0);
    for &addr in arg_addrs.iter().rev() {
        w.push_u64(addr);
    }
    w.push_u64(argv.len() as u64);

    w.sp
}

/// Loads `path` into a fresh user task and queues it.
pub fn execve_with_parent(
    path: &str,
    argv: &[String],
    envp: &[String],
    parent: Option<Tid>,
) -> Result<Tid, FsError> {
    let image = read_file(path)?;

    let mut task = task_make(0, 0, TaskMode::User).ok_or(FsError::OutOfMemory)?;
    let tid = task.tid;

    let result = (|| -> Result<u64, FsError> {
        let main = load_image(&mut task, &image, 0)?;
        let entry = match &main.interpreter {
            Some(interp_path) => {
                let interp_image = read_file(interp_path)?;
                let interp = load_image(&mut task, &interp_image, INTERP_BASE)?;
                interp.entry
            }
            None => main.entry,
        };

        // Capture the seed frame (selectors, flags, RDI = tid) before the
        // stack build overwrites the top of the user stack it sits in.
        // SAFETY: The frame pointer was set by task_make into the task's
        // own stack; the task is not yet queued.
        let template = unsafe { *task.frame_mut() };

        let rsp = build_user_stack(&task, &main, argv, envp);
        task.frame_ptr = rsp - core::mem::size_of::<TaskRegs>() as u64;
        // SAFETY: Same stack, new location below the argument area.
        let frame = unsafe { task.frame_mut() };
        *frame = template;
        frame.rip = entry;
        frame.rsp = rsp;

        kdebug!(
            "exec: {} entry {:#x} phdr {:#x} phnum {} rsp {:#x}",
            path,
            entry,
            main.phdr,
            main.phnum,
            rsp
        );
        Ok(entry)
    })();

    if let Err(e) = result {
        crate::sched::task::task_free(task);
        return Err(e);
    }

    // Inherit files, cwd and pending dup pairs from the parent.
    if parent.is_some() {
        crate::sched::with_current(|p| {
            task.cwd = p.cwd.clone();
            task.open_files = p.open_files.clone();
            task.dup_list = p.dup_list.clone();
            task.ptid = p.tid;
            p.child_list.push(tid);
        });
        crate::fs::vfs::retain_descs(&task.open_files);
        apply_dup_pairs(&mut task);
    }

    crate::sched::enqueue(task);
    Ok(tid)
}

/// Materialises the parent's pending (fd, newfd) pairs in the child's
/// table.
fn apply_dup_pairs(task: &mut Task) {
    let pairs = core::mem::take(&mut task.dup_list);
    for (fd, newfd) in pairs {
        let from = (fd - VFS_MIN_HANDLE) as usize;
        let to = (newfd - VFS_MIN_HANDLE) as usize;
        let Some(desc) = task.open_files.get(from).cloned().flatten() else {
            continue;
        };
        if task.open_files.len() <= to {
            task.open_files.resize(to + 1, None);
        }
        crate::fs::vfs::retain_descs(&vec![Some(desc.clone())]);
        task.open_files[to] = Some(desc);
    }
}
