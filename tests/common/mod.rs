//! Synthetic x86_64 ELF vmcores for end-to-end tests.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

/// pr_reg order of user_regs_struct on x86_64.
const PRSTATUS_REGS: [&str; 27] = [
    "r15", "r14", "r13", "r12", "rbp", "rbx", "r11", "r10", "r9", "r8", "rax", "rcx", "rdx",
    "rsi", "rdi", "orig_rax", "rip", "cs", "rflags", "rsp", "ss", "fs_base", "gs_base", "ds",
    "es", "fs", "gs",
];

const PR_PID_OFFSET: usize = 32;
const PR_REG_OFFSET: usize = 112;
const PRSTATUS_SIZE: usize = 336;

const EM_X86_64: u16 = 62;
const ET_CORE: u16 = 4;
const PT_LOAD: u32 = 1;
const PT_NOTE: u32 = 4;
const NT_PRSTATUS: u32 = 1;

pub struct CoreBuilder {
    cpus: Vec<Vec<u8>>,
    loads: Vec<(u64, u64, Vec<u8>)>,
    vmcoreinfo: Option<String>,
}

impl CoreBuilder {
    pub fn new() -> Self {
        CoreBuilder {
            cpus: Vec::new(),
            loads: Vec::new(),
            vmcoreinfo: None,
        }
    }

    /// Add one CPU's prstatus. Unset registers stay zero.
    pub fn cpu(mut self, pid: u32, regs: &[(&str, u64)]) -> Self {
        let mut desc = vec![0u8; PRSTATUS_SIZE];
        desc[PR_PID_OFFSET..PR_PID_OFFSET + 4].copy_from_slice(&pid.to_le_bytes());
        for (name, value) in regs {
            let slot = PRSTATUS_REGS
                .iter()
                .position(|r| r == name)
                .unwrap_or_else(|| panic!("no such register {name}"));
            let at = PR_REG_OFFSET + slot * 8;
            desc[at..at + 8].copy_from_slice(&value.to_le_bytes());
        }
        self.cpus.push(desc);
        self
    }

    /// Add one dumped memory range.
    pub fn load(mut self, vaddr: u64, paddr: u64, data: &[u8]) -> Self {
        self.loads.push((vaddr, paddr, data.to_vec()));
        self
    }

    pub fn vmcoreinfo(mut self, text: &str) -> Self {
        self.vmcoreinfo = Some(text.to_string());
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut notes = Vec::new();
        for desc in &self.cpus {
            push_note(&mut notes, b"CORE", NT_PRSTATUS, desc);
        }
        if let Some(info) = &self.vmcoreinfo {
            push_note(&mut notes, b"VMCOREINFO", 0, info.as_bytes());
        }

        let phnum = 1 + self.loads.len();
        let headers_end = 64 + 56 * phnum;
        let note_offset = headers_end;
        let mut data_offset = note_offset + notes.len();

        let mut out = Vec::new();
        // ELF header
        out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
        out.extend_from_slice(&[0u8; 8]);
        out.extend_from_slice(&ET_CORE.to_le_bytes());
        out.extend_from_slice(&EM_X86_64.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes()); // e_version
        out.extend_from_slice(&0u64.to_le_bytes()); // e_entry
        out.extend_from_slice(&64u64.to_le_bytes()); // e_phoff
        out.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
        out.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        out.extend_from_slice(&64u16.to_le_bytes()); // e_ehsize
        out.extend_from_slice(&56u16.to_le_bytes()); // e_phentsize
        out.extend_from_slice(&(phnum as u16).to_le_bytes());
        out.extend_from_slice(&[0u8; 6]); // e_shentsize, e_shnum, e_shstrndx

        push_phdr(&mut out, PT_NOTE, note_offset as u64, 0, 0, notes.len() as u64, notes.len() as u64, 4);
        for (vaddr, paddr, data) in &self.loads {
            push_phdr(
                &mut out,
                PT_LOAD,
                data_offset as u64,
                *vaddr,
                *paddr,
                data.len() as u64,
                data.len() as u64,
                0x1000,
            );
            data_offset += data.len();
        }

        out.extend_from_slice(&notes);
        for (_, _, data) in &self.loads {
            out.extend_from_slice(data);
        }
        out
    }

    /// Write the core to a scratch file and return its path.
    pub fn write(&self) -> PathBuf {
        static SEQ: AtomicUsize = AtomicUsize::new(0);
        let path = std::env::temp_dir().join(format!(
            "vmgdb-test-{}-{}.core",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::write(&path, self.build()).expect("write scratch corefile");
        path
    }
}

fn push_note(out: &mut Vec<u8>, name: &[u8], n_type: u32, desc: &[u8]) {
    out.extend_from_slice(&((name.len() + 1) as u32).to_le_bytes());
    out.extend_from_slice(&(desc.len() as u32).to_le_bytes());
    out.extend_from_slice(&n_type.to_le_bytes());
    out.extend_from_slice(name);
    out.push(0);
    while out.len() % 4 != 0 {
        out.push(0);
    }
    out.extend_from_slice(desc);
    while out.len() % 4 != 0 {
        out.push(0);
    }
}

fn push_phdr(
    out: &mut Vec<u8>,
    p_type: u32,
    offset: u64,
    vaddr: u64,
    paddr: u64,
    filesz: u64,
    memsz: u64,
    align: u64,
) {
    out.extend_from_slice(&p_type.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // p_flags
    out.extend_from_slice(&offset.to_le_bytes());
    out.extend_from_slice(&vaddr.to_le_bytes());
    out.extend_from_slice(&paddr.to_le_bytes());
    out.extend_from_slice(&filesz.to_le_bytes());
    out.extend_from_slice(&memsz.to_le_bytes());
    out.extend_from_slice(&align.to_le_bytes()); // p_align
}
