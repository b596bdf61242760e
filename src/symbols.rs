//! Symbol cache: forward (module -> name -> range) and reverse
//! (address-sorted flat array) views over every resolvable symbol in a
//! tracee's loaded modules.

use crate::elf::ElfFile;
use crate::error::{EngineError, Result};
use crate::linkmap::LinkMapEntry;
use log::debug;
use std::collections::HashMap;
use std::path::Path;

/// `[start, end)` in the tracee's address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolRange {
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone)]
struct ReverseEntry {
    start: u64,
    end: u64,
    module: String,
    name: String,
}

/// Two indices over the same symbol set, built eagerly from every
/// link-map entry whose soname names an existing file on disk.
pub struct SymbolCache {
    // A `Vec`, not a `HashMap`, so module order matches link-map
    // (insertion) order: `address_of` relies on this for its documented
    // first-match-in-link-map-order guarantee.
    forward: Vec<(String, HashMap<String, SymbolRange>)>,
    // Always kept sorted by `start` for binary search.
    reverse: Vec<ReverseEntry>,
}

impl SymbolCache {
    /// Builds the cache from the resolved link map: every entry whose
    /// soname points at an existing file is opened as an ELF file and its
    /// symbols are rebased by `load_bias`.
    pub fn build(link_map: &[LinkMapEntry]) -> Result<SymbolCache> {
        let mut forward = Vec::new();
        let mut reverse = Vec::new();

        for entry in link_map {
            let Some(soname) = &entry.soname else {
                continue;
            };
            if !Path::new(soname).exists() {
                debug!("symbol cache: {} does not exist on disk, skipping", soname);
                continue;
            }
            let elf = match ElfFile::open(soname) {
                Ok(elf) => elf,
                Err(e) => {
                    debug!("symbol cache: failed to open {}: {}", soname, e);
                    continue;
                }
            };
            let symbols = elf.load_symbols(entry.load_bias)?;
            let module_name = module_name(soname);
            let mut module_map = HashMap::new();
            for sym in symbols {
                module_map.insert(
                    sym.name.clone(),
                    SymbolRange {
                        start: sym.start,
                        end: sym.end,
                    },
                );
                reverse.push(ReverseEntry {
                    start: sym.start,
                    end: sym.end,
                    module: module_name.clone(),
                    name: sym.name,
                });
            }
            forward.push((module_name, module_map));
        }

        reverse.sort_by_key(|e| e.start);

        Ok(SymbolCache { forward, reverse })
    }

    /// Returns the address of the first matching symbol across modules, in
    /// link-map (insertion) order. For weak/duplicate symbols this is not
    /// deterministic across processes with a different load order — see
    /// SPEC_FULL.md open question #1.
    pub fn address_of(&self, name: &str) -> Result<u64> {
        for (_, module) in &self.forward {
            if let Some(range) = module.get(name) {
                return Ok(range.start);
            }
        }
        Err(EngineError::SymbolNotFound(name.to_string()))
    }

    /// Binary-searches the reverse index for the unique entry with
    /// `start <= addr < end`.
    pub fn symbol_for(&self, addr: u64) -> Result<(&str, &str)> {
        let idx = match self.reverse.binary_search_by(|e| e.start.cmp(&addr)) {
            Ok(i) => i,
            Err(0) => return Err(EngineError::NoSymbolForAddress(addr)),
            Err(i) => i - 1,
        };
        let entry = &self.reverse[idx];
        if entry.start <= addr && addr < entry.end {
            Ok((entry.module.as_str(), entry.name.as_str()))
        } else {
            Err(EngineError::NoSymbolForAddress(addr))
        }
    }

    pub fn module_names(&self) -> impl Iterator<Item = &str> {
        self.forward.iter().map(|(name, _)| name.as_str())
    }
}

fn module_name(soname: &str) -> String {
    Path::new(soname)
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| soname.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(start: u64, end: u64, module: &str, name: &str) -> ReverseEntry {
        ReverseEntry {
            start,
            end,
            module: module.to_string(),
            name: name.to_string(),
        }
    }

    fn cache_with(entries: Vec<ReverseEntry>) -> SymbolCache {
        let mut reverse = entries;
        reverse.sort_by_key(|e| e.start);
        SymbolCache {
            forward: Vec::new(),
            reverse,
        }
    }

    #[test]
    fn reverse_lookup_finds_unique_covering_entry() {
        let cache = cache_with(vec![
            entry(0x1000, 0x1010, "libc.so", "malloc"),
            entry(0x2000, 0x2100, "libc.so", "free"),
        ]);
        let (module, name) = cache.symbol_for(0x1005).unwrap();
        assert_eq!((module, name), ("libc.so", "malloc"));
        let (module, name) = cache.symbol_for(0x2050).unwrap();
        assert_eq!((module, name), ("libc.so", "free"));
    }

    #[test]
    fn reverse_lookup_rejects_addresses_in_gaps() {
        let cache = cache_with(vec![
            entry(0x1000, 0x1010, "libc.so", "malloc"),
            entry(0x2000, 0x2100, "libc.so", "free"),
        ]);
        assert!(cache.symbol_for(0x1500).is_err());
        assert!(cache.symbol_for(0x0500).is_err());
        assert!(cache.symbol_for(0x3000).is_err());
    }

    #[test]
    fn address_of_picks_the_first_module_in_insertion_order() {
        let mut first = HashMap::new();
        first.insert("malloc".to_string(), SymbolRange { start: 0x1000, end: 0x1010 });
        let mut second = HashMap::new();
        second.insert("malloc".to_string(), SymbolRange { start: 0x5000, end: 0x5010 });
        let cache = SymbolCache {
            forward: vec![("a.so".to_string(), first), ("b.so".to_string(), second)],
            reverse: Vec::new(),
        };
        assert_eq!(cache.address_of("malloc").unwrap(), 0x1000);
    }

    #[test]
    fn reverse_index_is_sorted_and_non_overlapping_start() {
        let cache = cache_with(vec![
            entry(0x3000, 0x3100, "a.so", "z"),
            entry(0x1000, 0x1010, "a.so", "a"),
            entry(0x2000, 0x2010, "a.so", "m"),
        ]);
        for w in cache.reverse.windows(2) {
            assert!(w[0].start <= w[1].start);
        }
    }
}
