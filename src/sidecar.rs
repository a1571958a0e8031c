//! Task-table sidecar: a JSON file produced alongside the dump that carries
//! per-task register snapshots the vmcore itself does not have.

use crate::error::Error;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

#[derive(Debug, Deserialize)]
pub struct TaskTable {
    /// Kernel-virtual address of the process root page table. Process mode only.
    pub rootpgt: Option<u64>,
    /// Load address of the process executable. Process mode only, hints only.
    pub loadaddr: Option<u64>,
    #[serde(default)]
    pub threads: Vec<Task>,
}

#[derive(Debug, Deserialize)]
pub struct Task {
    pub pid: u64,
    pub tid: u64,
    pub comm: String,
    #[serde(default)]
    pub registers: HashMap<String, u64>,
}

impl TaskTable {
    /// Load a task table. Malformed JSON is a startup-fatal error.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}
