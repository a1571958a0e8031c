//! ELF program-header and note parsing for vmcores.

use super::{CpuState, Segment};
use crate::arch::Arch;
use crate::error::Error;
use object::elf::{FileHeader64, NT_PRSTATUS, PT_LOAD, PT_NOTE};
use object::read::elf::{FileHeader, ProgramHeader};
use object::Endianness;
use std::collections::HashMap;

/// Offset of pr_pid within struct elf_prstatus on all three architectures.
const PR_PID_OFFSET: usize = 32;
/// Offset of pr_reg (the general-purpose register dump).
const PR_REG_OFFSET: usize = 112;

pub(super) struct ParsedCore {
    pub arch: Arch,
    pub segments: Vec<Segment>,
    pub cpus: Vec<CpuState>,
    pub vmcoreinfo: HashMap<String, String>,
}

pub(super) fn parse(data: &[u8]) -> Result<ParsedCore, Error> {
    let header = FileHeader64::<Endianness>::parse(data)?;
    let endian = header.endian()?;
    let arch = Arch::from_elf_machine(header.e_machine(endian))?;

    let mut segments = Vec::new();
    let mut cpus = Vec::new();
    let mut vmcoreinfo = HashMap::new();

    for ph in header.program_headers(endian, data)? {
        match ph.p_type(endian) {
            PT_LOAD => segments.push(Segment {
                vaddr: ph.p_vaddr(endian),
                paddr: ph.p_paddr(endian),
                filesz: ph.p_filesz(endian),
                memsz: ph.p_memsz(endian),
                offset: ph.p_offset(endian),
            }),
            PT_NOTE => {
                let Some(mut notes) = ph.notes(endian, data)? else {
                    continue;
                };
                while let Some(note) = notes.next()? {
                    let name = trim_nul(note.name());
                    if name == b"CORE" && note.n_type(endian) == NT_PRSTATUS {
                        cpus.push(parse_prstatus(arch, note.desc())?);
                    } else if name == b"VMCOREINFO" {
                        vmcoreinfo = parse_vmcoreinfo(note.desc());
                    }
                }
            }
            _ => {}
        }
    }

    if cpus.is_empty() {
        return Err(Error::BadNote("NT_PRSTATUS"));
    }
    Ok(ParsedCore {
        arch,
        segments,
        cpus,
        vmcoreinfo,
    })
}

fn trim_nul(name: &[u8]) -> &[u8] {
    match name.iter().position(|&b| b == 0) {
        Some(pos) => &name[..pos],
        None => name,
    }
}

/// Register names of pr_reg in memory order. x86_64 follows
/// user_regs_struct; the flags register carries the `rflags` name the dump
/// tooling uses, the thread model derives `eflags` from it through the arch
/// fixup. Same idea for aarch64 `lr` / riscv64 `s0`.
static X86_64_PRSTATUS: [&str; 27] = [
    "r15", "r14", "r13", "r12", "rbp", "rbx", "r11", "r10", "r9", "r8", "rax", "rcx", "rdx",
    "rsi", "rdi", "orig_rax", "rip", "cs", "rflags", "rsp", "ss", "fs_base", "gs_base", "ds",
    "es", "fs", "gs",
];

static AARCH64_PRSTATUS: [&str; 34] = [
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13",
    "x14", "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26",
    "x27", "x28", "x29", "lr", "sp", "pc", "pstate",
];

static RISCV64_PRSTATUS: [&str; 32] = [
    "pc", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "s0", "s1", "a0", "a1", "a2", "a3", "a4",
    "a5", "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11", "t3", "t4",
    "t5", "t6",
];

fn prstatus_reg_names(arch: Arch) -> &'static [&'static str] {
    match arch {
        Arch::Aarch64 => &AARCH64_PRSTATUS,
        Arch::Riscv64 => &RISCV64_PRSTATUS,
        Arch::X86_64 => &X86_64_PRSTATUS,
    }
}

fn parse_prstatus(arch: Arch, desc: &[u8]) -> Result<CpuState, Error> {
    let names = prstatus_reg_names(arch);
    if desc.len() < PR_REG_OFFSET + names.len() * 8 {
        return Err(Error::BadNote("NT_PRSTATUS"));
    }
    let pid = u32::from_le_bytes(
        desc[PR_PID_OFFSET..PR_PID_OFFSET + 4]
            .try_into()
            .expect("slice length is 4"),
    ) as u64;

    let mut regs = HashMap::with_capacity(names.len());
    for (i, name) in names.iter().enumerate() {
        let at = PR_REG_OFFSET + i * 8;
        let value = u64::from_le_bytes(desc[at..at + 8].try_into().expect("slice length is 8"));
        regs.insert(name.to_string(), value);
    }
    Ok(CpuState { pid, regs })
}

/// vmcoreinfo is a text blob of KEY=value lines.
fn parse_vmcoreinfo(desc: &[u8]) -> HashMap<String, String> {
    let text = String::from_utf8_lossy(desc);
    text.lines()
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            Some((key.to_string(), value.trim_end_matches('\0').to_string()))
        })
        .collect()
}
