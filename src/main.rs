//! vmgdb - serve a Linux kernel crash dump to GDB over the remote protocol.

use anyhow::Context;
use clap::Parser;
use log::LevelFilter;
use std::path::PathBuf;

use vmgdb::server::{GdbServer, Session};
use vmgdb::sidecar::TaskTable;
use vmgdb::threads::ThreadTable;
use vmgdb::vmcore::{Dump, Vmcore};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The vmcore to serve.
    #[clap(short = 'f', long = "file")]
    corefile: PathBuf,

    /// Hostname to listen on.
    #[clap(short = 'a', long = "address", default_value = "localhost")]
    hostname: String,

    /// TCP port to listen on.
    #[clap(short = 'p', long = "port", default_value_t = 1234)]
    port: u16,

    /// Task table of a user process; serves that process's address space
    /// instead of the kernel's.
    #[clap(short = 'j', long = "process-json", conflicts_with = "kernel_json")]
    process_json: Option<PathBuf>,

    /// Task table with kernel task register snapshots, merged into the
    /// CPU thread list.
    #[clap(short = 'k', long = "kernel-json")]
    kernel_json: Option<PathBuf>,

    /// vmlinux image, only echoed in the printed GDB hints.
    #[clap(short = 'v', long = "vmlinux")]
    vmlinux: Option<PathBuf>,

    /// Trace every RSP packet on stdout.
    #[clap(short = 'd', long = "debug")]
    debug: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut logger = env_logger::Builder::from_default_env();
    logger
        .target(env_logger::Target::Stdout)
        .filter_level(LevelFilter::Info);
    if args.debug {
        logger.filter(Some("rsp"), LevelFilter::Debug);
    }
    logger.init();

    let mut core = Vmcore::open(&args.corefile)
        .with_context(|| format!("open corefile {}", args.corefile.display()))?;

    let (threads, loadaddr) = if let Some(path) = &args.process_json {
        let tasks = TaskTable::load(path)
            .with_context(|| format!("load task table {}", path.display()))?;
        let threads = ThreadTable::process(&mut core, &tasks).context("build process threads")?;
        (threads, tasks.loadaddr.unwrap_or(0))
    } else {
        let tasks = match &args.kernel_json {
            Some(path) => Some(
                TaskTable::load(path)
                    .with_context(|| format!("load task table {}", path.display()))?,
            ),
            None => None,
        };
        let loadaddr = core.kernel_offset();
        (ThreadTable::kernel(&core, tasks.as_ref()), loadaddr)
    };

    let server =
        GdbServer::bind(&args.hostname, args.port).context("bind the listening socket")?;
    print_hints(&args, loadaddr);

    let mut session = Session::new(Box::new(core), threads);
    server.serve(&mut session)?;
    Ok(())
}

/// GDB needs the symbol file loaded at the dump's relocation before
/// `target remote`; print the exact commands.
fn print_hints(args: &Args, loadaddr: u64) {
    println!(
        "Waiting for incoming connection on {}:{}",
        args.hostname, args.port
    );
    println!("Start gdb with:");
    let vmlinux = args
        .vmlinux
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "<vmlinux>".to_string());
    if args.process_json.is_some() {
        println!("  # For a position-independent executable, gdb must slide the");
        println!("  # file to the address the process actually mapped it at.");
        println!("  file <executable> -o {loadaddr:#x}");
    } else if loadaddr != 0 {
        println!("  file {vmlinux} -o {loadaddr:#x}");
    } else if args.vmlinux.is_some() {
        println!("  file {vmlinux}");
    }
    println!("  target remote {}:{}", args.hostname, args.port);
}
