//! vmgdb - a read-only GDB remote-protocol server for Linux kernel crash dumps.
//!
//! A debugger attaches over TCP and inspects the dumped system's register
//! state, thread list and memory through a subset of the GDB Remote Serial
//! Protocol. Memory reads are resolved against the dump's own page tables,
//! either in the kernel address space or, in process mode, in the address
//! space of a chosen user process.

pub mod arch;
pub mod error;
pub mod server;
pub mod sidecar;
pub mod threads;
pub mod vmcore;

pub use error::Error;
