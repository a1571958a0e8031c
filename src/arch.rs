use crate::error::Error;
use object::elf::{EM_AARCH64, EM_RISCV, EM_X86_64};
use std::collections::HashMap;

/// Dump architectures with a registered GDB register layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    Aarch64,
    Riscv64,
    X86_64,
}

/// One slot of the `g` packet: a register name and its width in bytes.
/// Declaration order inside a layout is the wire order and must not change.
pub struct RegisterSlot {
    pub name: &'static str,
    pub width: usize,
}

const fn slot(name: &'static str, width: usize) -> RegisterSlot {
    RegisterSlot { name, width }
}

/// GDB amd64 layout: 16 general registers plus rip at 8 bytes, then the
/// flags and segment registers at 4 bytes each.
static X86_64_LAYOUT: [RegisterSlot; 24] = [
    slot("rax", 8),
    slot("rbx", 8),
    slot("rcx", 8),
    slot("rdx", 8),
    slot("rsi", 8),
    slot("rdi", 8),
    slot("rbp", 8),
    slot("rsp", 8),
    slot("r8", 8),
    slot("r9", 8),
    slot("r10", 8),
    slot("r11", 8),
    slot("r12", 8),
    slot("r13", 8),
    slot("r14", 8),
    slot("r15", 8),
    slot("rip", 8),
    slot("eflags", 4),
    slot("cs", 4),
    slot("ss", 4),
    slot("ds", 4),
    slot("es", 4),
    slot("fs", 4),
    slot("gs", 4),
];

static AARCH64_LAYOUT: [RegisterSlot; 34] = [
    slot("x0", 8),
    slot("x1", 8),
    slot("x2", 8),
    slot("x3", 8),
    slot("x4", 8),
    slot("x5", 8),
    slot("x6", 8),
    slot("x7", 8),
    slot("x8", 8),
    slot("x9", 8),
    slot("x10", 8),
    slot("x11", 8),
    slot("x12", 8),
    slot("x13", 8),
    slot("x14", 8),
    slot("x15", 8),
    slot("x16", 8),
    slot("x17", 8),
    slot("x18", 8),
    slot("x19", 8),
    slot("x20", 8),
    slot("x21", 8),
    slot("x22", 8),
    slot("x23", 8),
    slot("x24", 8),
    slot("x25", 8),
    slot("x26", 8),
    slot("x27", 8),
    slot("x28", 8),
    slot("x29", 8),
    slot("x30", 8),
    slot("sp", 8),
    slot("pc", 8),
    slot("cpsr", 4),
];

static RISCV64_LAYOUT: [RegisterSlot; 33] = [
    slot("zero", 8),
    slot("ra", 8),
    slot("sp", 8),
    slot("gp", 8),
    slot("tp", 8),
    slot("t0", 8),
    slot("t1", 8),
    slot("t2", 8),
    slot("fp", 8),
    slot("s1", 8),
    slot("a0", 8),
    slot("a1", 8),
    slot("a2", 8),
    slot("a3", 8),
    slot("a4", 8),
    slot("a5", 8),
    slot("a6", 8),
    slot("a7", 8),
    slot("s2", 8),
    slot("s3", 8),
    slot("s4", 8),
    slot("s5", 8),
    slot("s6", 8),
    slot("s7", 8),
    slot("s8", 8),
    slot("s9", 8),
    slot("s10", 8),
    slot("s11", 8),
    slot("t3", 8),
    slot("t4", 8),
    slot("t5", 8),
    slot("t6", 8),
    slot("pc", 8),
];

impl Arch {
    pub fn from_elf_machine(e_machine: u16) -> Result<Self, Error> {
        match e_machine {
            EM_AARCH64 => Ok(Arch::Aarch64),
            EM_RISCV => Ok(Arch::Riscv64),
            EM_X86_64 => Ok(Arch::X86_64),
            other => Err(Error::UnsupportedArch(other)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Arch::Aarch64 => "aarch64",
            Arch::Riscv64 => "riscv64",
            Arch::X86_64 => "x86_64",
        }
    }

    /// The ordered register layout of the `g` reply.
    pub fn layout(&self) -> &'static [RegisterSlot] {
        match self {
            Arch::Aarch64 => &AARCH64_LAYOUT,
            Arch::Riscv64 => &RISCV64_LAYOUT,
            Arch::X86_64 => &X86_64_LAYOUT,
        }
    }

    /// Derive the aliased register names GDB asks for from the names the
    /// dump records. Existing entries are never overwritten.
    pub fn fixup(&self, regs: &mut HashMap<String, u64>) {
        match self {
            Arch::Aarch64 => {
                derive_alias(regs, "lr", "x30");
                derive_alias(regs, "pstate", "cpsr");
            }
            Arch::Riscv64 => {
                regs.entry("zero".to_string()).or_insert(0);
                derive_alias(regs, "s0", "fp");
            }
            Arch::X86_64 => {
                derive_alias(regs, "rflags", "eflags");
            }
        }
    }
}

fn derive_alias(regs: &mut HashMap<String, u64>, source: &str, alias: &str) {
    if let Some(&value) = regs.get(source) {
        regs.entry(alias.to_string()).or_insert(value);
    }
}

/// Encode one register slot for the wire: the value's bytes in little-endian
/// order as lowercase hex, or `x` markers when the snapshot lacks the
/// register.
pub fn encode_slot(value: Option<u64>, width: usize) -> String {
    match value {
        Some(v) => v.to_le_bytes()[..width]
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect(),
        None => "x".repeat(width * 2),
    }
}
