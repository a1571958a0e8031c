//! Page-table walkers for process-mode address translation.
//!
//! All three architectures use 4 KB pages with 512-entry tables here; the
//! level count is the only knob, picked from vmcoreinfo at install time.

use crate::arch::Arch;
use crate::error::Error;
use std::collections::HashMap;

pub const PAGE_SIZE: u64 = 4096;

/// Physical memory access, as the walkers see it. The dump implements this
/// through its PT_LOAD map; tests implement it over plain buffers.
pub trait PhysMem {
    fn read_phys(&self, paddr: u64, buf: &mut [u8]) -> Result<(), Error>;
}

/// Bits 51:12 of an x86_64 paging entry.
const X86_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;
/// Bits 47:12 of an aarch64 descriptor.
const ARM_ADDR_MASK: u64 = 0x0000_ffff_ffff_f000;

#[derive(Debug, Clone, Copy)]
pub struct Walker {
    arch: Arch,
    levels: u32,
}

impl Walker {
    /// Pick the walk shape for `arch` from vmcoreinfo.
    pub fn new(arch: Arch, info: &HashMap<String, String>) -> Result<Self, Error> {
        let levels = match arch {
            Arch::X86_64 => {
                if info_number(info, "pgtable_l5_enabled") == Some(1) {
                    5
                } else {
                    4
                }
            }
            Arch::Aarch64 => {
                if let Some(size) = info.get("PAGESIZE").and_then(|v| v.parse::<u64>().ok()) {
                    if size != PAGE_SIZE {
                        return Err(Error::PageSize(size));
                    }
                }
                // 4 KB granule: VA_BITS 48 walks four levels, 39 walks three.
                let va_bits = info_number(info, "VA_BITS").unwrap_or(48);
                match va_bits {
                    39 => 3,
                    48 => 4,
                    other => return Err(Error::PageTableMode(other)),
                }
            }
            Arch::Riscv64 => match info_number(info, "satp_mode") {
                // Linux defaults to Sv39; newer kernels record the mode.
                None | Some(8) => 3,
                Some(9) => 4,
                Some(10) => 5,
                Some(other) => return Err(Error::PageTableMode(other)),
            },
        };
        Ok(Walker { arch, levels })
    }

    /// Resolve one virtual address against the table rooted at `root`
    /// (physical). Returns the physical address, with large-page offsets
    /// applied.
    pub fn translate(&self, mem: &dyn PhysMem, root: u64, vaddr: u64) -> Result<u64, Error> {
        match self.arch {
            Arch::X86_64 => self.walk_x86_64(mem, root, vaddr),
            Arch::Aarch64 => self.walk_aarch64(mem, root, vaddr),
            Arch::Riscv64 => self.walk_riscv64(mem, root, vaddr),
        }
    }

    fn walk_x86_64(&self, mem: &dyn PhysMem, root: u64, vaddr: u64) -> Result<u64, Error> {
        let mut table = root;
        for level in (0..self.levels).rev() {
            let shift = 12 + 9 * level;
            let entry = read_entry(mem, table + index(vaddr, shift) * 8)?;
            if entry & 1 == 0 {
                return Err(Error::MemoryFault(vaddr));
            }
            if level > 0 && entry & 0x80 != 0 {
                // PS set: 2 MB or 1 GB leaf. Larger leaves do not exist.
                if level > 2 {
                    return Err(Error::MemoryFault(vaddr));
                }
                let span = (1u64 << shift) - 1;
                return Ok((entry & X86_ADDR_MASK & !span) + (vaddr & span));
            }
            if level == 0 {
                return Ok((entry & X86_ADDR_MASK) + (vaddr & (PAGE_SIZE - 1)));
            }
            table = entry & X86_ADDR_MASK;
        }
        unreachable!("level 0 always returns")
    }

    fn walk_aarch64(&self, mem: &dyn PhysMem, root: u64, vaddr: u64) -> Result<u64, Error> {
        let mut table = root;
        for level in (0..self.levels).rev() {
            let shift = 12 + 9 * level;
            let desc = read_entry(mem, table + index(vaddr, shift) * 8)?;
            if desc & 1 == 0 {
                return Err(Error::MemoryFault(vaddr));
            }
            let is_table = desc & 2 != 0;
            if level == 0 {
                // The last level only holds page descriptors (bits 1:0 = 11).
                if !is_table {
                    return Err(Error::MemoryFault(vaddr));
                }
                return Ok((desc & ARM_ADDR_MASK) + (vaddr & (PAGE_SIZE - 1)));
            }
            if !is_table {
                // Block descriptor: valid at the 1 GB and 2 MB levels.
                if level > 2 {
                    return Err(Error::MemoryFault(vaddr));
                }
                let span = (1u64 << shift) - 1;
                return Ok((desc & ARM_ADDR_MASK & !span) + (vaddr & span));
            }
            table = desc & ARM_ADDR_MASK;
        }
        unreachable!("level 0 always returns")
    }

    fn walk_riscv64(&self, mem: &dyn PhysMem, root: u64, vaddr: u64) -> Result<u64, Error> {
        let mut table = root;
        for level in (0..self.levels).rev() {
            let shift = 12 + 9 * level;
            let pte = read_entry(mem, table + index(vaddr, shift) * 8)?;
            if pte & 1 == 0 {
                return Err(Error::MemoryFault(vaddr));
            }
            let target = (pte >> 10) << 12;
            // R or X marks a leaf, at any level.
            if pte & 0b1010 != 0 {
                let span = (1u64 << shift) - 1;
                return Ok((target & !span) + (vaddr & span));
            }
            if level == 0 {
                // Pointer PTE at the last level.
                return Err(Error::MemoryFault(vaddr));
            }
            table = target;
        }
        unreachable!("level 0 always returns")
    }
}

fn info_number(info: &HashMap<String, String>, name: &str) -> Option<u64> {
    info.get(&format!("NUMBER({name})"))?.parse().ok()
}

fn index(vaddr: u64, shift: u32) -> u64 {
    (vaddr >> shift) & 0x1ff
}

fn read_entry(mem: &dyn PhysMem, paddr: u64) -> Result<u64, Error> {
    let mut raw = [0u8; 8];
    mem.read_phys(paddr, &mut raw)?;
    Ok(u64::from_le_bytes(raw))
}

#[cfg(test)]
mod test {
    use super::*;

    /// Flat physical memory starting at 0.
    struct FlatMem(Vec<u8>);

    impl PhysMem for FlatMem {
        fn read_phys(&self, paddr: u64, buf: &mut [u8]) -> Result<(), Error> {
            let start = paddr as usize;
            let end = start + buf.len();
            if end > self.0.len() {
                return Err(Error::MemoryFault(paddr));
            }
            buf.copy_from_slice(&self.0[start..end]);
            Ok(())
        }
    }

    fn put_entry(mem: &mut FlatMem, paddr: u64, value: u64) {
        let at = paddr as usize;
        mem.0[at..at + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn walker(arch: Arch, info: &[(&str, &str)]) -> Walker {
        let info = info
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Walker::new(arch, &info).unwrap()
    }

    #[test]
    fn test_x86_64_four_level_walk() {
        let mut mem = FlatMem(vec![0u8; 0x10000]);
        let vaddr: u64 = 0x7f00_1234_5678;
        // root 0x1000 -> 0x2000 -> 0x3000 -> 0x4000 -> page 0x9000
        put_entry(&mut mem, 0x1000 + ((vaddr >> 39) & 0x1ff) * 8, 0x2000 | 1);
        put_entry(&mut mem, 0x2000 + ((vaddr >> 30) & 0x1ff) * 8, 0x3000 | 1);
        put_entry(&mut mem, 0x3000 + ((vaddr >> 21) & 0x1ff) * 8, 0x4000 | 1);
        put_entry(&mut mem, 0x4000 + ((vaddr >> 12) & 0x1ff) * 8, 0x9000 | 1);

        let w = walker(Arch::X86_64, &[]);
        assert_eq!(w.translate(&mem, 0x1000, vaddr).unwrap(), 0x9000 | 0x678);
        // sibling page is not mapped
        assert!(w.translate(&mem, 0x1000, vaddr + 0x1000).is_err());
    }

    #[test]
    fn test_x86_64_large_page() {
        let mut mem = FlatMem(vec![0u8; 0x10000]);
        let vaddr: u64 = 0x40_0012_3456;
        put_entry(&mut mem, 0x1000 + ((vaddr >> 39) & 0x1ff) * 8, 0x2000 | 1);
        put_entry(&mut mem, 0x2000 + ((vaddr >> 30) & 0x1ff) * 8, 0x3000 | 1);
        // 2 MB leaf at 0x80_0000
        put_entry(
            &mut mem,
            0x3000 + ((vaddr >> 21) & 0x1ff) * 8,
            0x80_0000 | 0x80 | 1,
        );

        let w = walker(Arch::X86_64, &[]);
        assert_eq!(
            w.translate(&mem, 0x1000, vaddr).unwrap(),
            0x80_0000 + (vaddr & 0x1f_ffff)
        );
    }

    #[test]
    fn test_aarch64_three_level_walk() {
        let mut mem = FlatMem(vec![0u8; 0x10000]);
        let vaddr: u64 = 0x0000_003f_8076_5432;
        // VA_BITS=39: levels 1..=3 in ARM terms, three lookups here.
        put_entry(&mut mem, 0x1000 + ((vaddr >> 30) & 0x1ff) * 8, 0x2000 | 3);
        put_entry(&mut mem, 0x2000 + ((vaddr >> 21) & 0x1ff) * 8, 0x3000 | 3);
        put_entry(&mut mem, 0x3000 + ((vaddr >> 12) & 0x1ff) * 8, 0x5000 | 3);

        let w = walker(Arch::Aarch64, &[("NUMBER(VA_BITS)", "39")]);
        assert_eq!(w.translate(&mem, 0x1000, vaddr).unwrap(), 0x5000 | 0x432);
    }

    #[test]
    fn test_aarch64_block_descriptor() {
        let mut mem = FlatMem(vec![0u8; 0x10000]);
        let vaddr: u64 = 0x0000_003f_8076_5432;
        put_entry(&mut mem, 0x1000 + ((vaddr >> 30) & 0x1ff) * 8, 0x2000 | 3);
        // 2 MB block (bits 1:0 = 01)
        put_entry(&mut mem, 0x2000 + ((vaddr >> 21) & 0x1ff) * 8, 0x60_0000 | 1);

        let w = walker(Arch::Aarch64, &[("NUMBER(VA_BITS)", "39")]);
        assert_eq!(
            w.translate(&mem, 0x1000, vaddr).unwrap(),
            0x60_0000 + (vaddr & 0x1f_ffff)
        );
    }

    #[test]
    fn test_riscv64_sv39_walk() {
        let mut mem = FlatMem(vec![0u8; 0x10000]);
        let vaddr: u64 = 0x0000_002a_bcde_f123;
        let pointer = |pa: u64| (pa >> 12) << 10 | 1;
        let leaf = |pa: u64| (pa >> 12) << 10 | 0b1011 /* V+R+X */;
        put_entry(
            &mut mem,
            0x1000 + ((vaddr >> 30) & 0x1ff) * 8,
            pointer(0x2000),
        );
        put_entry(
            &mut mem,
            0x2000 + ((vaddr >> 21) & 0x1ff) * 8,
            pointer(0x3000),
        );
        put_entry(&mut mem, 0x3000 + ((vaddr >> 12) & 0x1ff) * 8, leaf(0x7000));

        let w = walker(Arch::Riscv64, &[]);
        assert_eq!(w.translate(&mem, 0x1000, vaddr).unwrap(), 0x7000 | 0x123);
    }

    #[test]
    fn test_riscv64_gigapage() {
        let mut mem = FlatMem(vec![0u8; 0x10000]);
        let vaddr: u64 = 0x0000_002a_bcde_f123;
        // leaf directly at the first Sv39 level: a 1 GB mapping
        put_entry(
            &mut mem,
            0x1000 + ((vaddr >> 30) & 0x1ff) * 8,
            (0x4000_0000u64 >> 12) << 10 | 0b0011,
        );

        let w = walker(Arch::Riscv64, &[]);
        assert_eq!(
            w.translate(&mem, 0x1000, vaddr).unwrap(),
            0x4000_0000 + (vaddr & 0x3fff_ffff)
        );
    }

    #[test]
    fn test_walker_mode_selection() {
        assert!(matches!(
            Walker::new(
                Arch::Aarch64,
                &HashMap::from([("PAGESIZE".to_string(), "65536".to_string())])
            ),
            Err(Error::PageSize(65536))
        ));
        let w = walker(Arch::Riscv64, &[("NUMBER(satp_mode)", "9")]);
        assert_eq!(w.levels, 4);
        let w = walker(Arch::X86_64, &[("NUMBER(pgtable_l5_enabled)", "1")]);
        assert_eq!(w.levels, 5);
    }

    #[test]
    fn test_not_present_faults() {
        let mem = FlatMem(vec![0u8; 0x3000]);
        let w = walker(Arch::X86_64, &[]);
        assert!(matches!(
            w.translate(&mem, 0x1000, 0x1234),
            Err(Error::MemoryFault(0x1234))
        ));
    }
}
