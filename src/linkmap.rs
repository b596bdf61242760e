//! Reconstructs the dynamic linker's link-map chain in a live tracee by
//! walking its auxiliary vector, program headers, `PT_DYNAMIC` segment, and
//! `r_debug`/`link_map` structures — all read out of the tracee's address
//! space, never off disk.

use crate::error::{EngineError, Result};
use crate::memory::RemoteMemory;
use crate::procfs::{AuxVec, AT_PHDR, AT_PHENT, AT_PHNUM};
use serde::Serialize;

const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;
const DT_NULL: i64 = 0;
const DT_DEBUG: i64 = 21;
const EHDR64_SIZE: u64 = 64;
const PHDR64_SIZE: u64 = 56;

#[repr(C)]
#[derive(Clone, Copy)]
struct RawPhdr64 {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_paddr: u64,
    p_filesz: u64,
    p_memsz: u64,
    p_align: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct DynEntry64 {
    d_tag: i64,
    d_val: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RawRDebug {
    r_version: i32,
    _pad: i32,
    r_map: u64,
    r_brk: u64,
    r_state: i32,
    _pad2: i32,
    r_ldbase: u64,
}

const RT_CONSISTENT: i32 = 0;
const MAX_CONSISTENCY_RETRIES: usize = 50;
const CONSISTENCY_RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(2);

#[repr(C)]
#[derive(Clone, Copy)]
struct RawLinkMap {
    l_addr: u64,
    l_name: u64,
    l_ld: u64,
    l_next: u64,
    l_prev: u64,
}

/// One loaded shared object, in load order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkMapEntry {
    pub load_bias: u64,
    pub soname: Option<String>,
}

/// Walks the tracee's link map to produce every loaded shared object.
pub struct LinkMapWalker;

impl LinkMapWalker {
    /// `elf_is_64` must come from an `ElfFile::is_elf64()` check on the
    /// tracee's own executable; 32-bit targets are explicitly refused per
    /// design (see SPEC_FULL.md open question #3).
    pub fn walk(mem: &RemoteMemory, auxv: &AuxVec, elf_is_64: bool) -> Result<Vec<LinkMapEntry>> {
        if !elf_is_64 {
            return Err(EngineError::MalformedElf(
                "32-bit targets are not supported by the link-map walker".to_string(),
            ));
        }

        let at_phdr = auxv.require(AT_PHDR, "AT_PHDR")?;
        let at_phent = auxv.require(AT_PHENT, "AT_PHENT")?;
        let at_phnum = auxv.require(AT_PHNUM, "AT_PHNUM")?;

        if at_phent != PHDR64_SIZE {
            return Err(EngineError::MalformedElf(format!(
                "AT_PHENT {} does not match expected 64-bit Phdr size {}",
                at_phent, PHDR64_SIZE
            )));
        }

        let phdrs: Vec<RawPhdr64> = mem.read_array(at_phdr, at_phnum as usize)?;

        let base_load = phdrs
            .iter()
            .filter(|p| p.p_type == PT_LOAD)
            .min_by_key(|p| p.p_vaddr)
            .ok_or_else(|| {
                EngineError::MalformedElf("tracee has no PT_LOAD segment".to_string())
            })?;

        let mut dynamics = phdrs.iter().filter(|p| p.p_type == PT_DYNAMIC);
        let dynamic = dynamics
            .next()
            .ok_or_else(|| EngineError::MalformedElf("tracee has no PT_DYNAMIC segment".to_string()))?;
        if dynamics.next().is_some() {
            return Err(EngineError::MalformedElf(
                "tracee has multiple PT_DYNAMIC segments".to_string(),
            ));
        }

        let load_addr = at_phdr.wrapping_sub(EHDR64_SIZE);
        let base_addr = load_addr.wrapping_sub(base_load.p_vaddr);
        let dyn_addr = base_addr.wrapping_add(dynamic.p_vaddr);

        let r_debug_addr = Self::find_r_debug(mem, dyn_addr)?;
        let r_debug = Self::wait_for_consistent_state(mem, r_debug_addr)?;

        let mut entries = Vec::new();
        let mut link_map_addr = r_debug.r_map;
        while link_map_addr != 0 {
            let link_map: RawLinkMap = mem.read_struct(link_map_addr)?;
            let soname = if link_map.l_name != 0 {
                Some(mem.read_string(link_map.l_name)?)
            } else {
                None
            };
            entries.push(LinkMapEntry {
                load_bias: link_map.l_addr,
                soname,
            });
            link_map_addr = link_map.l_next;
        }
        Ok(entries)
    }

    /// The dynamic linker flips `r_state` away from `RT_CONSISTENT` only for
    /// the duration of a single `dlopen`/`dlclose` update; a reader that
    /// lands mid-update retries rather than reporting a bogus empty link
    /// map. `MAX_CONSISTENCY_RETRIES` bounds how long we wait for the
    /// window to close before surfacing it as an error.
    fn wait_for_consistent_state(mem: &RemoteMemory, r_debug_addr: u64) -> Result<RawRDebug> {
        let mut last_state = RT_CONSISTENT;
        for attempt in 0..MAX_CONSISTENCY_RETRIES {
            let r_debug: RawRDebug = mem.read_struct(r_debug_addr)?;
            if r_debug.r_state == RT_CONSISTENT {
                return Ok(r_debug);
            }
            last_state = r_debug.r_state;
            if attempt + 1 < MAX_CONSISTENCY_RETRIES {
                std::thread::sleep(CONSISTENCY_RETRY_DELAY);
            }
        }
        Err(EngineError::LinkMapInconsistent(last_state))
    }

    fn find_r_debug(mem: &RemoteMemory, dyn_addr: u64) -> Result<u64> {
        let mut offset = 0u64;
        loop {
            let entry: DynEntry64 = mem.read_struct(dyn_addr + offset)?;
            if entry.d_tag == DT_DEBUG {
                return Ok(entry.d_val);
            }
            if entry.d_tag == DT_NULL {
                return Err(EngineError::MalformedElf(
                    "DT_DEBUG entry not found in dynamic segment".to_string(),
                ));
            }
            offset += std::mem::size_of::<DynEntry64>() as u64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_32_bit_targets_outright() {
        let mem = RemoteMemory::new(nix::unistd::getpid());
        let auxv = AuxVec::default();
        let err = LinkMapWalker::walk(&mem, &auxv, false).unwrap_err();
        assert!(matches!(err, EngineError::MalformedElf(_)));
    }

    #[test]
    fn rejects_missing_aux_vec_entries() {
        let mem = RemoteMemory::new(nix::unistd::getpid());
        let auxv = AuxVec::default();
        let err = LinkMapWalker::walk(&mem, &auxv, true).unwrap_err();
        assert!(matches!(err, EngineError::MissingAuxVecEntry(_)));
    }
}
