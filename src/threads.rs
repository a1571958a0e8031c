//! The synthetic thread list a debugger sees.
//!
//! A vmcore has no processes to attach to, so the server synthesizes
//! threads: one per crashed CPU in kernel mode, optionally joined by the
//! tasks of a sidecar table, or one per task of the chosen process in
//! process mode. The table is built once at startup and never changes.

use crate::error::Error;
use crate::sidecar::TaskTable;
use crate::vmcore::Dump;
use log::debug;
use std::collections::{HashMap, HashSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId {
    pub pid: u64,
    pub tid: u64,
}

impl ThreadId {
    pub const fn new(pid: u64, tid: u64) -> Self {
        ThreadId { pid, tid }
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.pid, self.tid)
    }
}

pub struct Thread {
    pub id: ThreadId,
    regs: HashMap<String, u64>,
    info: String,
}

impl Thread {
    pub fn regs(&self) -> &HashMap<String, u64> {
        &self.regs
    }
}

pub struct ThreadTable {
    threads: Vec<Thread>,
    current: ThreadId,
    default_pid: u64,
}

impl ThreadTable {
    /// Kernel mode: one thread per CPU, carrying the crash-time prstatus
    /// registers. With a task table, CPU threads running a known task get
    /// its label and the remaining tasks are appended as extra threads.
    pub fn kernel(dump: &dyn Dump, tasks: Option<&TaskTable>) -> ThreadTable {
        let arch = dump.arch();
        let cpu_count = dump.cpu_count();
        let mut threads = Vec::with_capacity(cpu_count);
        let mut current = None;

        for cpu in 0..cpu_count {
            let state = dump.cpu_prstatus(cpu);
            let id = ThreadId::new(1, cpu as u64 + 1);
            let on_cpu = tasks.and_then(|t| {
                t.threads
                    .iter()
                    .find(|task| state.pid != 0 && task.tid == state.pid)
            });
            let info = match on_cpu {
                Some(task) => task_label(task.tid, task.tid, &task.comm),
                None if state.pid != 0 => format!("CPU #{cpu:x} pid {}", state.pid),
                None => format!("CPU #{cpu:x} idle"),
            };
            if current.is_none() && state.pid != 0 {
                current = Some(id);
            }
            let mut regs = state.regs.clone();
            arch.fixup(&mut regs);
            threads.push(Thread { id, regs, info });
        }

        if let Some(tasks) = tasks {
            let active: HashSet<u64> = (0..cpu_count)
                .map(|c| dump.cpu_prstatus(c).pid)
                .filter(|&pid| pid != 0)
                .collect();
            let mut next_tid = cpu_count as u64;
            for task in &tasks.threads {
                if active.contains(&task.tid) {
                    continue;
                }
                next_tid += 1;
                threads.push(Thread {
                    id: ThreadId::new(1, next_tid),
                    // Sidecar snapshots are taken verbatim.
                    regs: task.registers.clone(),
                    info: task_label(task.pid, task.tid, &task.comm),
                });
            }
        }

        let current = current.unwrap_or(ThreadId::new(1, 1));
        debug!(target: "server", "{} kernel threads, current {current}", threads.len());
        ThreadTable {
            threads,
            current,
            default_pid: 1,
        }
    }

    /// Process mode: one thread per task of the sidecar, addressed in the
    /// process's own address space. Installs the process root page table
    /// before anything reads through the dump.
    pub fn process(dump: &mut dyn Dump, tasks: &TaskTable) -> Result<ThreadTable, Error> {
        let rootpgt = tasks.rootpgt.ok_or(Error::TaskTableMissing("rootpgt"))?;
        dump.install_user_rootpgt(rootpgt)?;
        if tasks.threads.is_empty() {
            return Err(Error::TaskTableMissing("threads"));
        }

        let on_cpu: HashSet<u64> = (0..dump.cpu_count())
            .map(|c| dump.cpu_prstatus(c).pid)
            .filter(|&pid| pid != 0)
            .collect();

        let mut threads = Vec::with_capacity(tasks.threads.len());
        let mut current = None;
        for task in &tasks.threads {
            let id = ThreadId::new(task.pid, task.tid);
            if current.is_none() && on_cpu.contains(&task.tid) {
                current = Some(id);
            }
            threads.push(Thread {
                id,
                regs: task.registers.clone(),
                info: task_label(task.pid, task.tid, &task.comm),
            });
        }

        // No task was on a CPU at crash time: fall back to the last one.
        let current = current.unwrap_or_else(|| threads[threads.len() - 1].id);
        let default_pid = tasks.threads[0].pid;
        debug!(target: "server", "{} process threads, current {current}", threads.len());
        Ok(ThreadTable {
            threads,
            current,
            default_pid,
        })
    }

    /// All thread ids, in construction order.
    pub fn ids(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.threads.iter().map(|t| t.id)
    }

    pub fn get(&self, id: ThreadId) -> Option<&Thread> {
        self.threads.iter().find(|t| t.id == id)
    }

    pub fn is_alive(&self, id: ThreadId) -> bool {
        self.get(id).is_some()
    }

    /// Silent no-op for unknown ids; GDB probes threads it never saw.
    pub fn set_current(&mut self, id: ThreadId) {
        if self.is_alive(id) {
            self.current = id;
        }
    }

    pub fn current(&self) -> ThreadId {
        self.current
    }

    pub fn current_regs(&self) -> Option<&HashMap<String, u64>> {
        self.get(self.current).map(|t| &t.regs)
    }

    pub fn extra(&self, id: ThreadId) -> Result<&str, Error> {
        self.get(id)
            .map(|t| t.info.as_str())
            .ok_or(Error::UnknownThread(id))
    }

    pub fn default_pid(&self) -> u64 {
        self.default_pid
    }
}

fn task_label(pid: u64, tid: u64, comm: &str) -> String {
    format!("pid {pid} LWP {tid} \"{comm}\"")
}
