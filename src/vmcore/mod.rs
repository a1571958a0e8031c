//! ELF vmcore backend.
//!
//! Opens a Linux kernel crash dump in ELF64 format (the `/proc/vmcore`
//! flavor), parses its per-CPU register notes and vmcoreinfo, and resolves
//! memory reads by kernel-virtual, process-virtual or physical address.
//! Everything above this module sees the dump only through the [`Dump`]
//! trait.

mod mmu;
mod notes;

pub use mmu::PhysMem;

use crate::arch::Arch;
use crate::error::Error;
use log::{debug, info};
use memmap2::Mmap;
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

/// Register snapshot of one CPU at crash time, plus the pid that was on it.
#[derive(Debug, Clone)]
pub struct CpuState {
    pub pid: u64,
    pub regs: HashMap<String, u64>,
}

/// The narrow dump contract the server is written against. Memory is a flat
/// kernel-virtual space, or a process-virtual space once a user root page
/// table has been installed.
pub trait Dump {
    fn arch(&self) -> Arch;

    /// Read `buf.len()` bytes at the given virtual address. Any translation
    /// failure or unavailable page is a [`Error::MemoryFault`].
    fn read(&self, vaddr: u64, buf: &mut [u8]) -> Result<(), Error>;

    fn cpu_count(&self) -> usize;

    /// Crash-time state of CPU `cpu`, for `cpu` in `[0, cpu_count())`.
    fn cpu_prstatus(&self, cpu: usize) -> &CpuState;

    /// `KERNELOFFSET` from vmcoreinfo, or 0 when the dump has none.
    fn kernel_offset(&self) -> u64;

    /// Switch the translation context to the user process whose root page
    /// table lives at kernel-virtual `virt`. After this call `read` resolves
    /// user-space virtual addresses.
    fn install_user_rootpgt(&mut self, virt: u64) -> Result<(), Error>;
}

/// One PT_LOAD segment of the dump.
struct Segment {
    vaddr: u64,
    paddr: u64,
    filesz: u64,
    memsz: u64,
    offset: u64,
}

enum Translation {
    /// Kernel-virtual lookup through the segment table.
    Kernel,
    /// Page-table walk from a user process root.
    PageTable { root: u64, walker: mmu::Walker },
}

pub struct Vmcore {
    data: Mmap,
    arch: Arch,
    segments: Vec<Segment>,
    cpus: Vec<CpuState>,
    vmcoreinfo: HashMap<String, String>,
    translation: Translation,
}

impl Vmcore {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let file = File::open(path)?;
        let data = unsafe { Mmap::map(&file)? };
        let parsed = notes::parse(&data)?;
        info!(
            target: "vmcore",
            "opened {}: {}, {} load segments, {} cpus",
            path.display(),
            parsed.arch.name(),
            parsed.segments.len(),
            parsed.cpus.len()
        );
        Ok(Vmcore {
            data,
            arch: parsed.arch,
            segments: parsed.segments,
            cpus: parsed.cpus,
            vmcoreinfo: parsed.vmcoreinfo,
            translation: Translation::Kernel,
        })
    }

    /// Raw vmcoreinfo lookup.
    pub fn info(&self, key: &str) -> Option<&str> {
        self.vmcoreinfo.get(key).map(String::as_str)
    }

    fn copy_out(&self, offset: u64, buf: &mut [u8], fault_addr: u64) -> Result<(), Error> {
        let start = offset as usize;
        let end = start
            .checked_add(buf.len())
            .ok_or(Error::MemoryFault(fault_addr))?;
        if end > self.data.len() {
            return Err(Error::MemoryFault(fault_addr));
        }
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    /// Kernel-virtual read through the segment table, chunked across
    /// segment boundaries.
    fn read_kernel_virt(&self, vaddr: u64, buf: &mut [u8]) -> Result<(), Error> {
        self.read_segments(vaddr, buf, |seg| seg.vaddr)
    }

    fn read_segments(
        &self,
        addr: u64,
        buf: &mut [u8],
        base: impl Fn(&Segment) -> u64,
    ) -> Result<(), Error> {
        let mut done = 0;
        while done < buf.len() {
            let cur = addr + done as u64;
            let seg = self
                .segments
                .iter()
                .find(|s| cur >= base(s) && cur - base(s) < s.memsz)
                .ok_or(Error::MemoryFault(cur))?;
            let in_seg = cur - base(seg);
            // Pages past p_filesz were excluded from the dump.
            if in_seg >= seg.filesz {
                return Err(Error::MemoryFault(cur));
            }
            let avail = (seg.filesz - in_seg).min((buf.len() - done) as u64) as usize;
            self.copy_out(seg.offset + in_seg, &mut buf[done..done + avail], cur)?;
            done += avail;
        }
        Ok(())
    }

    fn read_user_virt(
        &self,
        root: u64,
        walker: &mmu::Walker,
        vaddr: u64,
        buf: &mut [u8],
    ) -> Result<(), Error> {
        let mut done = 0;
        while done < buf.len() {
            let cur = vaddr + done as u64;
            let paddr = walker.translate(self, root, cur)?;
            let in_page = cur & (mmu::PAGE_SIZE - 1);
            let avail = ((mmu::PAGE_SIZE - in_page) as usize).min(buf.len() - done);
            self.read_phys(paddr, &mut buf[done..done + avail])?;
            done += avail;
        }
        Ok(())
    }
}

impl PhysMem for Vmcore {
    fn read_phys(&self, paddr: u64, buf: &mut [u8]) -> Result<(), Error> {
        self.read_segments(paddr, buf, |seg| seg.paddr)
    }
}

impl Dump for Vmcore {
    fn arch(&self) -> Arch {
        self.arch
    }

    fn read(&self, vaddr: u64, buf: &mut [u8]) -> Result<(), Error> {
        match &self.translation {
            Translation::Kernel => self.read_kernel_virt(vaddr, buf),
            Translation::PageTable { root, walker } => {
                self.read_user_virt(*root, walker, vaddr, buf)
            }
        }
    }

    fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    fn cpu_prstatus(&self, cpu: usize) -> &CpuState {
        &self.cpus[cpu]
    }

    fn kernel_offset(&self) -> u64 {
        self.info("KERNELOFFSET")
            .and_then(|v| u64::from_str_radix(v, 16).ok())
            .unwrap_or(0)
    }

    fn install_user_rootpgt(&mut self, virt: u64) -> Result<(), Error> {
        // The root page table lives in the kernel direct map, so the
        // segment table resolves its physical address.
        let seg = self
            .segments
            .iter()
            .find(|s| virt >= s.vaddr && virt - s.vaddr < s.memsz)
            .ok_or(Error::MemoryFault(virt))?;
        let root = seg.paddr + (virt - seg.vaddr);
        let walker = mmu::Walker::new(self.arch, &self.vmcoreinfo)?;
        // Probe the root before committing to it.
        let mut entry = [0u8; 8];
        self.read_phys(root, &mut entry)?;
        debug!(target: "vmcore", "user root page table at {root:#x} ({walker:?})");
        self.translation = Translation::PageTable { root, walker };
        Ok(())
    }
}
