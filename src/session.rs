//! The engine's single entry point. A `Session` owns everything tied to
//! one attached tracee: the `Tracer`, a memory accessor, the cached
//! auxiliary vector, an `ElfFile` over its executable, the resolved
//! link map, and a lazily built symbol cache.

use crate::elf::ElfFile;
use crate::error::Result;
use crate::heap_walker::{self, HeapSpan};
use crate::libc_locator::RemoteLibcLocator;
use crate::linkmap::{LinkMapEntry, LinkMapWalker};
use crate::memory::RemoteMemory;
use crate::procfs::{self, AuxVec};
use crate::remote_call::{self, OnTrap};
use crate::symbols::SymbolCache;
use crate::tracer::Tracer;
use log::{info, warn};
use nix::unistd::Pid;
use std::fs;

pub struct Session {
    tracer: Tracer,
    mem: RemoteMemory,
    auxv: AuxVec,
    exe: ElfFile,
    link_map: Vec<LinkMapEntry>,
    symbols: Option<SymbolCache>,
}

impl Session {
    /// Attaches to `pid` and eagerly resolves the auxiliary vector, the
    /// executable's ELF header, and the link map — everything a caller
    /// needs before the first symbol lookup. The symbol cache itself is
    /// built lazily since opening every loaded `.so` is comparatively
    /// expensive and not every caller needs it.
    pub fn attach(pid: Pid) -> Result<Session> {
        let tracer = Tracer::attach(pid)?;
        match Self::finish_attach(pid, tracer) {
            Ok(session) => Ok(session),
            Err((mut tracer, e)) => {
                let _ = tracer.detach(None);
                Err(e)
            }
        }
    }

    fn finish_attach(pid: Pid, tracer: Tracer) -> std::result::Result<Session, (Tracer, crate::error::EngineError)> {
        let mem = RemoteMemory::new(pid);
        let auxv = match procfs::read_auxv(pid) {
            Ok(v) => v,
            Err(e) => return Err((tracer, e)),
        };
        let exe = match ElfFile::open(format!("/proc/{}/exe", pid)) {
            Ok(v) => v,
            Err(e) => return Err((tracer, e)),
        };
        let link_map = match LinkMapWalker::walk(&mem, &auxv, exe.is_elf64()) {
            Ok(v) => v,
            Err(e) => return Err((tracer, e)),
        };
        Ok(Session {
            tracer,
            mem,
            auxv,
            exe,
            link_map,
            symbols: None,
        })
    }

    pub fn pid(&self) -> Pid {
        self.tracer.pid()
    }

    /// The tracee's command line, as recorded in `/proc/<pid>/cmdline`
    /// (NUL-separated argv, truncated to argv[0]).
    pub fn process_name(&self) -> Result<String> {
        let raw = fs::read(format!("/proc/{}/cmdline", self.pid()))?;
        let argv0 = raw.split(|&b| b == 0).next().unwrap_or(&[]);
        Ok(String::from_utf8_lossy(argv0).into_owned())
    }

    pub fn auxv(&self) -> &AuxVec {
        &self.auxv
    }

    pub fn link_map(&self) -> &[LinkMapEntry] {
        &self.link_map
    }

    pub fn exe(&self) -> &ElfFile {
        &self.exe
    }

    fn symbols(&mut self) -> Result<&SymbolCache> {
        if self.symbols.is_none() {
            self.symbols = Some(SymbolCache::build(&self.link_map)?);
        }
        Ok(self.symbols.as_ref().expect("just initialized"))
    }

    pub fn address_of(&mut self, name: &str) -> Result<u64> {
        self.symbols()?.address_of(name)
    }

    pub fn symbol_for(&mut self, addr: u64) -> Result<(String, String)> {
        let (module, name) = self.symbols()?.symbol_for(addr)?;
        Ok((module.to_string(), name.to_string()))
    }

    pub fn read_bytes(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        self.mem.read_array::<u8>(addr, len)
    }

    pub fn read_string(&self, addr: u64) -> Result<String> {
        self.mem.read_string(addr)
    }

    pub fn write_bytes(&self, addr: u64, bytes: &[u8]) -> Result<()> {
        self.mem.write_mem(addr, bytes)
    }

    pub fn call_remote(
        &mut self,
        func_addr: u64,
        args: &[u64],
        on_trap: Option<&mut dyn OnTrap>,
    ) -> Result<u64> {
        remote_call::call(&mut self.tracer, &self.mem, func_addr, args, on_trap)
    }

    pub fn locate_libc_symbol(&self, func_name: &str) -> Result<u64> {
        RemoteLibcLocator::locate("libc.so.6", func_name, self.pid())
    }

    pub fn heap_iterate(&mut self, on_span: impl FnMut(HeapSpan)) -> Result<()> {
        heap_walker::walk(&mut self.tracer, &self.mem, on_span)
    }
}

impl Drop for Session {
    /// Best-effort `PTRACE_DETACH` so the tracee never ends the process
    /// stuck in a stopped state. Any in-flight heap-walker scratch pages
    /// are torn down by `heap_iterate` itself before it returns, on
    /// every exit path including errors — there is nothing left for
    /// `Session` to clean up here beyond the tracer attachment.
    fn drop(&mut self) {
        match self.tracer.detach(None) {
            Ok(()) => info!("session: detached from {}", self.pid()),
            Err(e) => warn!("session: failed to detach from {}: {}", self.pid(), e),
        }
    }
}
