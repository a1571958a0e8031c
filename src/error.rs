use crate::threads::ThreadId;
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- startup errors --------------------------------------------
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("corefile parsing error: {0}")]
    Elf(#[from] object::Error),
    #[error("unsupported vmcore architecture (e_machine {0})")]
    UnsupportedArch(u16),
    #[error("malformed {0} note")]
    BadNote(&'static str),
    #[error("task table parsing error: {0}")]
    TaskTable(#[from] serde_json::Error),
    #[error("task table missing {0}")]
    TaskTableMissing(&'static str),
    #[error("socket setup error: {0}")]
    Socket(#[from] nix::Error),

    // --------------------------------- translation errors ----------------------------------------
    #[error("memory fault at {0:#x}")]
    MemoryFault(u64),
    #[error("unsupported page size {0}")]
    PageSize(u64),
    #[error("unsupported page-table mode {0}")]
    PageTableMode(u64),

    // --------------------------------- protocol errors -------------------------------------------
    #[error("unknown thread {0}")]
    UnknownThread(ThreadId),
    #[error("debugger connection closed")]
    ConnectionClosed,
}
