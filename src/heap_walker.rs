//! Walks every allocator-owned heap region in the tracee by injecting a
//! small position-independent callback and driving `malloc_iterate`
//! remotely.
//!
//! This never reads heap metadata directly — allocator internals
//! (scudo, GWP-ASan, glibc's malloc) are not a stable ABI across
//! versions. Instead we ask the allocator itself to enumerate its
//! chunks and capture what it reports through a callback running
//! inside the tracee, the same mechanism `malloc_iterate`-based
//! debugging tools use.

use crate::error::{EngineError, Result};
use crate::libc_locator::RemoteLibcLocator;
use crate::memory::RemoteMemory;
use crate::procfs::{read_maps, MapEntry};
use crate::remote_call::{self, OnTrap};
use crate::tracer::Tracer;
use log::{debug, warn};
use nix::unistd::Pid;
use serde::Serialize;

/// One `(base, size)` pair reported by the allocator for a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HeapSpan {
    pub base: u64,
    pub size: u64,
}

const HEADER_SLOTS: u64 = 2; // [0] = capacity, [1] = cursor
const SLOT_SIZE: u64 = 8;

#[cfg(target_arch = "x86_64")]
mod payload {
    // Hand-assembled x86_64, verified instruction-by-instruction against
    // the SysV calling convention (rdi=base, rsi=size, rdx=data ptr):
    //
    //   48 8b 42 08          mov    rax,[rdx+0x8]        ; rax = cursor
    //   48 89 3c c2          mov    [rdx+rax*8],rdi       ; data[cursor] = base
    //   48 89 74 c2 08       mov    [rdx+rax*8+0x8],rsi   ; data[cursor+1] = size
    //   48 83 c0 02          add    rax,0x2               ; cursor += 2
    //   48 89 42 08          mov    [rdx+0x8],rax         ; store cursor
    //   48 8b 0a             mov    rcx,[rdx]             ; rcx = capacity
    //   48 39 c8             cmp    rax,rcx
    //   7c 01                jl     +1                    ; skip the int3 if cursor < capacity
    //   cc                   int3
    //   c3                   ret
    pub const CALLBACK: &[u8] = &[
        0x48, 0x8b, 0x42, 0x08, 0x48, 0x89, 0x3c, 0xc2, 0x48, 0x89, 0x74, 0xc2, 0x08, 0x48, 0x83,
        0xc0, 0x02, 0x48, 0x89, 0x42, 0x08, 0x48, 0x8b, 0x0a, 0x48, 0x39, 0xc8, 0x7c, 0x01, 0xcc,
        0xc3,
    ];
}

#[cfg(target_arch = "aarch64")]
mod payload {
    // Hand-assembled aarch64, AAPCS64 (x0=base, x1=size, x2=data ptr):
    //
    //   ldr x3, [x2, #8]     ; x3 = cursor
    //   lsl x4, x3, #3       ; x4 = cursor * 8
    //   add x5, x2, x4       ; x5 = &data[cursor]
    //   str x0, [x5]         ; data[cursor] = base
    //   str x1, [x5, #8]     ; data[cursor+1] = size
    //   add x3, x3, #2       ; cursor += 2
    //   str x3, [x2, #8]     ; store cursor
    //   ldr x6, [x2]         ; x6 = capacity
    //   cmp x3, x6
    //   b.lt +2              ; skip the brk if cursor < capacity
    //   brk #0
    //   ret
    const WORDS: [u32; 12] = [
        0xF9400443, 0xD37DF044, 0x8B040045, 0xF90000A0, 0xF90004A1, 0x91000863, 0xF9000443,
        0xF9400046, 0xEB06007F, 0x5400004B, 0xD4200000, 0xD65F03C0,
    ];

    pub fn bytes() -> Vec<u8> {
        WORDS.iter().flat_map(|w| w.to_le_bytes()).collect()
    }
}

#[cfg(target_arch = "x86_64")]
fn callback_bytes() -> Vec<u8> {
    payload::CALLBACK.to_vec()
}

#[cfg(target_arch = "aarch64")]
fn callback_bytes() -> Vec<u8> {
    payload::bytes()
}

/// Region pathnames the allocator uses for chunk-bearing mappings. The
/// scudo and GWP-ASan entries carry a variable suffix, hence the prefix
/// match.
fn is_heap_bearing(pathname: &str) -> bool {
    pathname == "[anon:libc_malloc]"
        || pathname.starts_with("[anon:scudo:")
        || pathname.starts_with("[anon:GWP-ASan")
}

/// Drives the whole outer algorithm: set up the two injected pages,
/// disable the allocator, call `malloc_iterate` over every heap-bearing
/// region, drain the buffer through `on_span`, then re-enable the
/// allocator and tear the pages down. Steps 4 and 5's cleanup (steps 7
/// and 8 of the documented algorithm) always run, even if an earlier
/// step failed — only the setup steps (1-3) can leak a page, and only
/// on failure.
pub fn walk(
    tracer: &mut Tracer,
    mem: &RemoteMemory,
    mut on_span: impl FnMut(HeapSpan),
) -> Result<()> {
    let pid = tracer.pid();
    let page_size = page_size()?;

    let data_addr = mmap_page(tracer, mem, libc::PROT_READ | libc::PROT_WRITE)?;
    let capacity = page_size / SLOT_SIZE;
    write_header(mem, data_addr, capacity, HEADER_SLOTS)?;

    let code_addr = match mmap_page(
        tracer,
        mem,
        libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
    ) {
        Ok(addr) => addr,
        Err(e) => {
            // Setup-phase failure: steps 1-3 are allowed to leak per the
            // documented contract, nothing to tear down yet but the data
            // page.
            let _ = munmap_page(tracer, mem, data_addr, page_size);
            return Err(e);
        }
    };
    if let Err(e) = mem.write_mem(code_addr, &callback_bytes()) {
        let _ = munmap_page(tracer, mem, data_addr, page_size);
        let _ = munmap_page(tracer, mem, code_addr, page_size);
        return Err(e);
    }

    let run_result = run_iteration(tracer, mem, pid, data_addr, code_addr, capacity, &mut on_span);

    // Steps 7 and 8: best-effort regardless of what `run_result` was.
    let enable_result = call_allocator(tracer, mem, "malloc_enable", &[]);
    let unmap_data = munmap_page(tracer, mem, data_addr, page_size);
    let unmap_code = munmap_page(tracer, mem, code_addr, page_size);
    if let Err(e) = &enable_result {
        warn!("heap walker: malloc_enable failed during cleanup: {}", e);
    }
    if let Err(e) = &unmap_data {
        warn!("heap walker: munmap of data page failed: {}", e);
    }
    if let Err(e) = &unmap_code {
        warn!("heap walker: munmap of code page failed: {}", e);
    }

    run_result
}

fn run_iteration(
    tracer: &mut Tracer,
    mem: &RemoteMemory,
    pid: Pid,
    data_addr: u64,
    code_addr: u64,
    capacity: u64,
    on_span: &mut impl FnMut(HeapSpan),
) -> Result<()> {
    call_allocator(tracer, mem, "malloc_disable", &[])?;

    let maps = read_maps(pid)?;
    let heap_regions: Vec<&MapEntry> = maps
        .iter()
        .filter(|e| {
            e.perms.read
                && e.pathname
                    .as_deref()
                    .map(is_heap_bearing)
                    .unwrap_or(false)
        })
        .collect();

    for region in heap_regions {
        debug!(
            "heap walker: scanning region {:#x}-{:#x} ({:?})",
            region.start, region.end, region.pathname
        );
        let mut drain = DrainOnTrap {
            mem,
            data_addr,
            capacity,
            on_span,
        };
        let func_addr = RemoteLibcLocator::locate("libc.so.6", "malloc_iterate", pid)?;
        remote_call::call(
            tracer,
            mem,
            func_addr,
            &[region.start, region.len(), code_addr, data_addr],
            Some(&mut drain as &mut dyn OnTrap),
        )?;
        // `malloc_iterate` returned naturally: drain whatever is left in
        // the buffer that never triggered an overflow trap.
        drain_buffer(mem, data_addr, on_span)?;
    }

    Ok(())
}

/// Advances the tracee past the payload's own `brk`/`int3` on every
/// overflow, drains the accumulated pairs, and resets the cursor so the
/// payload can keep writing into the same buffer.
struct DrainOnTrap<'a, F: FnMut(HeapSpan)> {
    mem: &'a RemoteMemory,
    data_addr: u64,
    capacity: u64,
    on_span: &'a mut F,
}

impl<'a, F: FnMut(HeapSpan)> OnTrap for DrainOnTrap<'a, F> {
    fn handle_trap(&mut self, tracer: &mut Tracer, _mem: &RemoteMemory) -> Result<()> {
        drain_buffer(self.mem, self.data_addr, self.on_span)?;
        reset_cursor(self.mem, self.data_addr)?;
        let _ = self.capacity;
        remote_call::advance_past_trap(tracer)
    }
}

fn drain_buffer(mem: &RemoteMemory, data_addr: u64, on_span: &mut impl FnMut(HeapSpan)) -> Result<()> {
    let cursor: u64 = mem.read_struct(data_addr + SLOT_SIZE)?;
    if cursor <= HEADER_SLOTS {
        return Ok(());
    }
    let count = (cursor - HEADER_SLOTS) as usize;
    let pairs: Vec<u64> = mem.read_array(data_addr + HEADER_SLOTS * SLOT_SIZE, count)?;
    for chunk in pairs.chunks_exact(2) {
        on_span(HeapSpan {
            base: chunk[0],
            size: chunk[1],
        });
    }
    Ok(())
}

fn reset_cursor(mem: &RemoteMemory, data_addr: u64) -> Result<()> {
    mem.write_struct(data_addr + SLOT_SIZE, &HEADER_SLOTS)
}

fn write_header(mem: &RemoteMemory, data_addr: u64, capacity: u64, cursor: u64) -> Result<()> {
    mem.write_struct(data_addr, &capacity)?;
    mem.write_struct(data_addr + SLOT_SIZE, &cursor)
}

fn mmap_page(tracer: &mut Tracer, mem: &RemoteMemory, prot: i32) -> Result<u64> {
    let pid = tracer.pid();
    let func_addr = RemoteLibcLocator::locate("libc.so.6", "mmap", pid)?;
    let flags = (libc::MAP_PRIVATE | libc::MAP_ANONYMOUS) as u64;
    let result = remote_call::call(
        tracer,
        mem,
        func_addr,
        &[0, page_size()?, prot as u64, flags, u64::MAX, 0],
        None,
    )?;
    if result == u64::MAX {
        return Err(EngineError::RemoteCallFailed(
            "remote mmap returned MAP_FAILED".to_string(),
        ));
    }
    Ok(result)
}

fn munmap_page(tracer: &mut Tracer, mem: &RemoteMemory, addr: u64, page_size: u64) -> Result<()> {
    let func_addr = RemoteLibcLocator::locate("libc.so.6", "munmap", tracer.pid())?;
    remote_call::call(tracer, mem, func_addr, &[addr, page_size], None).map(|_| ())
}

fn call_allocator(tracer: &mut Tracer, mem: &RemoteMemory, name: &str, args: &[u64]) -> Result<u64> {
    let func_addr = RemoteLibcLocator::locate("libc.so.6", name, tracer.pid())?;
    remote_call::call(tracer, mem, func_addr, args, None)
}

fn page_size() -> Result<u64> {
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if ret <= 0 {
        return Err(EngineError::RemoteCallFailed(
            "sysconf(_SC_PAGESIZE) failed".to_string(),
        ));
    }
    Ok(ret as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_every_documented_heap_region_name() {
        assert!(is_heap_bearing("[anon:libc_malloc]"));
        assert!(is_heap_bearing("[anon:scudo:primary]"));
        assert!(is_heap_bearing("[anon:GWP-ASan Guard Page]"));
        assert!(!is_heap_bearing("[heap]"));
        assert!(!is_heap_bearing("/usr/lib/libc.so.6"));
    }

    #[test]
    fn page_size_is_a_positive_power_of_two() {
        let size = page_size().unwrap();
        assert!(size > 0);
        assert_eq!(size & (size - 1), 0);
    }
}
