//! Finds the address of a libc function inside the tracee without
//! relying on symbol tables being present or exported the same way in
//! both processes. Instead it `dlopen`/`dlsym`s the same library in the
//! tracer, finds which mapped region that address falls in, and looks
//! for an identically-shaped region (same file, permissions, and
//! length) in the tracee's own maps — the ASLR slide cancels out as
//! long as that region is a simple byte-for-byte copy of the same file.

use crate::error::{EngineError, Result};
use crate::procfs::{read_maps, MapEntry};
use nix::unistd::Pid;
use std::ffi::CString;

pub struct RemoteLibcLocator;

impl RemoteLibcLocator {
    /// Resolves `func_name` in `lib_name` (e.g. `("libc.so.6", "malloc")`)
    /// and translates the address into `tracee`'s address space.
    pub fn locate(lib_name: &str, func_name: &str, tracee: Pid) -> Result<u64> {
        let local_addr = resolve_local(lib_name, func_name)?;

        let tracer_maps = read_maps(nix::unistd::getpid())?;
        let tracer_region = containing_region(&tracer_maps, local_addr).ok_or_else(|| {
            EngineError::SymbolNotFound(format!(
                "{} resolved to {:#x} in the tracer but that address is not in any executable, file-backed mapping",
                func_name, local_addr
            ))
        })?;

        let tracee_maps = read_maps(tracee)?;
        let tracee_region = tracee_maps
            .iter()
            .find(|e| {
                e.pathname == tracer_region.pathname
                    && e.perms == tracer_region.perms
                    && e.len() == tracer_region.len()
            })
            .ok_or_else(|| {
                EngineError::SymbolNotFound(format!(
                    "no region in tracee {} matches the tracer's mapping of {:?}",
                    tracee, tracer_region.pathname
                ))
            })?;

        Ok(tracee_region.start + (local_addr - tracer_region.start))
    }
}

fn resolve_local(lib_name: &str, func_name: &str) -> Result<u64> {
    let lib_cstr = CString::new(lib_name)
        .map_err(|e| EngineError::IllegalArgument(format!("library name {:?}: {}", lib_name, e)))?;
    let handle = unsafe { libc::dlopen(lib_cstr.as_ptr(), libc::RTLD_NOW) };
    if handle.is_null() {
        return Err(EngineError::LibraryOpenFailed(
            lib_name.to_string(),
            dlerror_message(),
        ));
    }

    let func_cstr = CString::new(func_name)
        .map_err(|e| EngineError::IllegalArgument(format!("function name {:?}: {}", func_name, e)))?;
    let sym = unsafe { libc::dlsym(handle, func_cstr.as_ptr()) };
    unsafe {
        libc::dlclose(handle);
    }
    if sym.is_null() {
        return Err(EngineError::SymbolNotFound(format!(
            "{} not found in {}",
            func_name, lib_name
        )));
    }
    Ok(sym as u64)
}

fn dlerror_message() -> String {
    let msg = unsafe { libc::dlerror() };
    if msg.is_null() {
        "unknown dlopen failure".to_string()
    } else {
        unsafe { std::ffi::CStr::from_ptr(msg) }
            .to_string_lossy()
            .into_owned()
    }
}

/// The first mapping (in `/proc/<pid>/maps` order) that contains `addr`,
/// is executable, and is backed by a real file — matches how the
/// contract resolves ambiguity for multi-segment libraries.
fn containing_region(maps: &[MapEntry], addr: u64) -> Option<&MapEntry> {
    maps.iter()
        .find(|e| e.contains(addr) && e.perms.exec && e.pathname.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::procfs::Perms;

    fn region(start: u64, end: u64, exec: bool, pathname: Option<&str>) -> MapEntry {
        MapEntry {
            start,
            end,
            perms: Perms {
                read: true,
                write: false,
                exec,
                shared: false,
            },
            offset: 0,
            dev: "08:02".to_string(),
            inode: 1,
            pathname: pathname.map(|s| s.to_string()),
        }
    }

    #[test]
    fn containing_region_requires_exec_and_a_pathname() {
        let maps = vec![
            region(0x1000, 0x2000, false, Some("/lib/libc.so.6")),
            region(0x2000, 0x3000, true, None),
            region(0x3000, 0x4000, true, Some("/lib/libc.so.6")),
        ];
        let found = containing_region(&maps, 0x3500).unwrap();
        assert_eq!(found.start, 0x3000);

        assert!(containing_region(&maps, 0x1500).is_none());
        assert!(containing_region(&maps, 0x2500).is_none());
    }

    #[test]
    fn resolving_a_nonexistent_library_fails_cleanly() {
        let err = resolve_local("definitely-not-a-real-library.so.999", "malloc").unwrap_err();
        assert!(matches!(err, EngineError::LibraryOpenFailed(_, _)));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn resolves_malloc_in_the_tracer_s_own_libc() {
        // We are linked against libc, so dlopen(NULL) exposes our own
        // symbols, including the one we're testing resolution against.
        let addr = resolve_local("libc.so.6", "malloc");
        assert!(addr.is_ok(), "expected malloc to resolve: {:?}", addr);
    }
}
