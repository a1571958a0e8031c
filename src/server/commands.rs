//! RSP command dispatch.
//!
//! A received payload is matched first against the exact-literal commands,
//! then against the pattern commands in declared order (most frequent
//! first). Every handler produces a reply payload; unknown packets get the
//! empty reply GDB reads as "unsupported".

use crate::arch::encode_slot;
use crate::error::Error;
use crate::threads::{ThreadId, ThreadTable};
use crate::vmcore::Dump;
use itertools::Itertools;
use log::warn;
use once_cell::sync::Lazy;
use regex::Regex;

/// Upper bound on a single `m` packet, far above what GDB ever asks for.
const MAX_MEMORY_READ: u64 = 1 << 20;

static MEMORY_READ: Lazy<Regex> = Lazy::new(|| re(r"^m([0-9a-f]+),([0-9a-f]+)$"));
static SELECT_THREAD: Lazy<Regex> = Lazy::new(|| re(r"^H[a-z](p?[0-9a-f.]+)$"));
static THREAD_ALIVE: Lazy<Regex> = Lazy::new(|| re(r"^T(p?[0-9a-f.]+)$"));
static SUPPORTED: Lazy<Regex> = Lazy::new(|| re(r"^qSupported:(.+)$"));
static THREAD_EXTRA_INFO: Lazy<Regex> = Lazy::new(|| re(r"^qThreadExtraInfo,(p?[0-9a-f.]+)$"));
static DETACH_PID: Lazy<Regex> = Lazy::new(|| re(r"^D;[0-9a-f]+$"));
static VKILL: Lazy<Regex> = Lazy::new(|| re(r"^vKill;(p?[0-9a-f.]+)$"));
static ATTACHED: Lazy<Regex> = Lazy::new(|| re(r"^qAttached:(.+)$"));

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).expect("static pattern")
}

/// Cursor of a thread enumeration, reset by qfThreadInfo and advanced by
/// qsThreadInfo.
#[derive(Default)]
struct ThreadCursor {
    ids: Vec<ThreadId>,
    pos: usize,
}

/// One debug session: the dump, the thread table, and the protocol flags
/// the client negotiates. Flags only ever move forward; `running` latches
/// false on detach or kill.
pub struct Session {
    dump: Box<dyn Dump>,
    threads: ThreadTable,
    noack_mode: bool,
    multiprocess: bool,
    big_packets: bool,
    running: bool,
    cursor: ThreadCursor,
}

impl Session {
    pub fn new(dump: Box<dyn Dump>, threads: ThreadTable) -> Self {
        Session {
            dump,
            threads,
            noack_mode: false,
            multiprocess: false,
            big_packets: false,
            running: true,
            cursor: ThreadCursor::default(),
        }
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn noack_mode(&self) -> bool {
        self.noack_mode
    }

    /// Dispatch one packet payload to its handler and return the reply
    /// payload. Never fails; faults become RSP error replies.
    pub fn handle(&mut self, payload: &[u8]) -> Vec<u8> {
        let text = String::from_utf8_lossy(payload);
        match text.as_ref() {
            "g" => return self.read_registers(),
            "qfThreadInfo" => return self.threads_first(),
            "qsThreadInfo" => return self.threads_next(),
            "QStartNoAckMode" => {
                self.noack_mode = true;
                return b"OK".to_vec();
            }
            "vMustReplyEmpty" => return Vec::new(),
            "Hc-1" => return b"OK".to_vec(),
            "?" => return self.stop_reason(),
            "D" => {
                self.running = false;
                return b"OK".to_vec();
            }
            "k" => {
                self.running = false;
                return Vec::new();
            }
            _ => {}
        }

        if let Some(c) = MEMORY_READ.captures(&text) {
            self.read_memory(&c[1], &c[2])
        } else if let Some(c) = SELECT_THREAD.captures(&text) {
            if let Some(id) = self.parse_id(&c[1]) {
                // Unknown threads are silently ignored; GDB probes freely.
                self.threads.set_current(id);
            }
            b"OK".to_vec()
        } else if let Some(c) = THREAD_ALIVE.captures(&text) {
            match self.parse_id(&c[1]) {
                Some(id) if self.threads.is_alive(id) => b"OK".to_vec(),
                _ => b"E03".to_vec(),
            }
        } else if let Some(c) = SUPPORTED.captures(&text) {
            self.negotiate(&c[1])
        } else if let Some(c) = THREAD_EXTRA_INFO.captures(&text) {
            self.thread_extra_info(&c[1])
        } else if DETACH_PID.is_match(&text) {
            self.running = false;
            b"OK".to_vec()
        } else if VKILL.is_match(&text) {
            self.running = false;
            b"OK".to_vec()
        } else if ATTACHED.is_match(&text) {
            // Always attached to an existing "process"; never spawned one.
            b"1".to_vec()
        } else {
            Vec::new()
        }
    }

    /// Registers of the current thread, packed in the architecture's wire
    /// order, each value as little-endian bytes in hex. Registers absent
    /// from the snapshot emit GDB's `x` markers.
    fn read_registers(&self) -> Vec<u8> {
        let regs = self.threads.current_regs();
        let mut reply = String::new();
        for slot in self.dump.arch().layout() {
            let value = regs.and_then(|r| r.get(slot.name).copied());
            reply.push_str(&encode_slot(value, slot.width));
        }
        reply.into_bytes()
    }

    fn read_memory(&self, addr: &str, len: &str) -> Vec<u8> {
        let parsed = match (u64::from_str_radix(addr, 16), u64::from_str_radix(len, 16)) {
            (Ok(addr), Ok(len)) if len <= MAX_MEMORY_READ => (addr, len),
            _ => {
                warn!(target: "server", "unreasonable memory read m{addr},{len}");
                return b"E14".to_vec();
            }
        };
        let mut buf = vec![0u8; parsed.1 as usize];
        match self.dump.read(parsed.0, &mut buf) {
            Ok(()) => to_hex(&buf).into_bytes(),
            Err(Error::MemoryFault(at)) => {
                warn!(target: "server", "memory fault at {at:#x}");
                b"E14".to_vec()
            }
            Err(e) => {
                warn!(target: "server", "memory read failed: {e}");
                b"E14".to_vec()
            }
        }
    }

    fn negotiate(&mut self, features: &str) -> Vec<u8> {
        if features.split(';').any(|f| f == "multiprocess+") {
            self.multiprocess = true;
        }
        // A negotiating client handles large replies: thread enumeration
        // can return the whole list at once.
        self.big_packets = true;
        b"multiprocess+;QStartNoAckMode+".to_vec()
    }

    fn stop_reason(&self) -> Vec<u8> {
        // Signal 5 (SIGTRAP): the canonical "stopped for the debugger".
        format!("T05thread:{};", self.wire_id(self.threads.current())).into_bytes()
    }

    fn threads_first(&mut self) -> Vec<u8> {
        self.cursor.ids = self.threads.ids().collect();
        if self.cursor.ids.is_empty() {
            return b"l".to_vec();
        }
        if self.big_packets {
            self.cursor.pos = self.cursor.ids.len();
            let all = self.cursor.ids.iter().map(|id| self.wire_id(*id)).join(",");
            format!("m{all}").into_bytes()
        } else {
            self.cursor.pos = 1;
            format!("m{}", self.wire_id(self.cursor.ids[0])).into_bytes()
        }
    }

    fn threads_next(&mut self) -> Vec<u8> {
        if self.cursor.pos >= self.cursor.ids.len() {
            return b"l".to_vec();
        }
        let id = self.cursor.ids[self.cursor.pos];
        self.cursor.pos += 1;
        format!("m{}", self.wire_id(id)).into_bytes()
    }

    fn thread_extra_info(&self, id: &str) -> Vec<u8> {
        let found = self.parse_id(id).and_then(|id| self.threads.extra(id).ok());
        match found {
            Some(info) => to_hex(info.as_bytes()).into_bytes(),
            None => b"E01".to_vec(),
        }
    }

    /// Thread-ID wire form: `p<pid>.<tid>` once multiprocess is negotiated,
    /// bare `<tid>` before.
    fn wire_id(&self, id: ThreadId) -> String {
        if self.multiprocess {
            format!("p{:x}.{:x}", id.pid, id.tid)
        } else {
            format!("{:x}", id.tid)
        }
    }

    fn parse_id(&self, s: &str) -> Option<ThreadId> {
        if let Some(rest) = s.strip_prefix('p') {
            let (pid, tid) = rest.split_once('.')?;
            Some(ThreadId::new(
                u64::from_str_radix(pid, 16).ok()?,
                u64::from_str_radix(tid, 16).ok()?,
            ))
        } else {
            Some(ThreadId::new(
                self.threads.default_pid(),
                u64::from_str_radix(s, 16).ok()?,
            ))
        }
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
