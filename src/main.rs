use clap::{Parser, Subcommand};
use introspect_engine::error::Result;
use introspect_engine::session::Session;
use introspect_engine::{procfs, EngineError};
use log::info;
use nix::unistd::Pid;
use serde_json::json;

#[derive(Parser)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the parsed /proc/<pid>/maps table as JSON.
    DumpMaps {
        pid: i32,
    },

    /// Print the parsed /proc/<pid>/auxv table as JSON.
    DumpAuxv {
        pid: i32,
    },

    /// Attach, walk the dynamic linker's link map, and print every
    /// loaded module's (load_bias, soname).
    LinkMap {
        pid: i32,
    },

    /// Attach and resolve a runtime symbol's address.
    Symbol {
        pid: i32,
        name: String,
    },

    /// Attach and print every (base, length) pair the heap walker
    /// discovers across the tracee's allocator-owned regions.
    HeapIterate {
        pid: i32,
    },
}

fn dump_maps(pid: i32) -> Result<()> {
    let pid = Pid::from_raw(pid);
    let entries = procfs::read_maps(pid)?;
    let rows: Vec<_> = entries
        .iter()
        .map(|e| {
            json!({
                "start": format!("{:#x}", e.start),
                "end": format!("{:#x}", e.end),
                "read": e.perms.read,
                "write": e.perms.write,
                "exec": e.perms.exec,
                "shared": e.perms.shared,
                "pathname": e.pathname,
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&rows).unwrap());
    Ok(())
}

fn dump_auxv(pid: i32) -> Result<()> {
    let pid = Pid::from_raw(pid);
    let auxv = procfs::read_auxv(pid)?;
    let named = [
        ("AT_PHDR", procfs::AT_PHDR),
        ("AT_PHENT", procfs::AT_PHENT),
        ("AT_PHNUM", procfs::AT_PHNUM),
        ("AT_BASE", procfs::AT_BASE),
        ("AT_ENTRY", procfs::AT_ENTRY),
    ];
    let rows: Vec<_> = named
        .iter()
        .filter_map(|(name, tag)| auxv.get(*tag).map(|v| json!({"tag": name, "value": format!("{:#x}", v)})))
        .collect();
    println!("{}", serde_json::to_string_pretty(&rows).unwrap());
    Ok(())
}

fn link_map(pid: i32) -> Result<()> {
    let session = Session::attach(Pid::from_raw(pid))?;
    info!("attached to {} ({})", pid, session.process_name()?);
    println!("{}", serde_json::to_string_pretty(session.link_map()).unwrap());
    Ok(())
}

fn symbol(pid: i32, name: &str) -> Result<()> {
    let mut session = Session::attach(Pid::from_raw(pid))?;
    let addr = session.address_of(name)?;
    println!("{}", json!({"name": name, "address": format!("{:#x}", addr)}));
    Ok(())
}

fn heap_iterate(pid: i32) -> Result<()> {
    let mut session = Session::attach(Pid::from_raw(pid))?;
    let mut count = 0usize;
    session.heap_iterate(|span| {
        count += 1;
        println!("{}", serde_json::to_string(&span).unwrap());
    })?;
    info!("heap walker reported {} spans", count);
    Ok(())
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::DumpMaps { pid } => dump_maps(pid),
        Command::DumpAuxv { pid } => dump_auxv(pid),
        Command::LinkMap { pid } => link_map(pid),
        Command::Symbol { pid, name } => symbol(pid, &name),
        Command::HeapIterate { pid } => heap_iterate(pid),
    }
}

fn main() {
    env_logger::init();
    let args = Cli::parse();
    if let Err(e) = run(args.command) {
        eprintln!("error: {}", e);
        std::process::exit(exit_code(&e));
    }
}

fn exit_code(e: &EngineError) -> i32 {
    match e {
        EngineError::ProcessNotFound(_) => 2,
        EngineError::PermissionDenied(_) => 3,
        _ => 1,
    }
}
