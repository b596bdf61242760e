//! ELF file reader: header, program headers, section headers, and symbol
//! tables, for files on disk. Supports both 32- and 64-bit classes for
//! library loading; callers that require 64-bit semantics (the link-map
//! walker) check [`ElfFile::is_elf64`] themselves.

use crate::error::{EngineError, Result};
use elf::abi::{PT_DYNAMIC, PT_LOAD, SHN_UNDEF, SHT_DYNSYM, SHT_SYMTAB};
use elf::endian::AnyEndian;
use elf::segment::ProgramHeader;
use elf::ElfBytes;
use std::path::{Path, PathBuf};

const EI_NIDENT: usize = 16;
const EI_CLASS: usize = 4;
const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;
const ELF_MAGIC: &[u8; 4] = b"\x7fELF";
const SHENTSIZE_32: u16 = 40;
const SHENTSIZE_64: u16 = 64;

/// A resolved runtime symbol range: `[start, end)` in whatever address
/// space the caller rebased it into (file-relative if `base == 0`, or
/// rebased by a module's load bias).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolEntry {
    pub name: String,
    pub start: u64,
    pub end: u64,
}

/// An ELF file opened from disk.
pub struct ElfFile {
    path: PathBuf,
    data: Vec<u8>,
}

impl ElfFile {
    /// Opens `path`, validates the ELF identification bytes, and records
    /// the class (32/64-bit) for later dispatch.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = std::fs::read(&path)?;
        if data.len() < EI_NIDENT {
            return Err(EngineError::MalformedElf(format!(
                "{}: file too small to contain e_ident",
                path.display()
            )));
        }
        if &data[0..4] != ELF_MAGIC {
            return Err(EngineError::MalformedElf(format!(
                "{}: bad ELF magic",
                path.display()
            )));
        }
        let class = data[EI_CLASS];
        if class != ELFCLASS32 && class != ELFCLASS64 {
            return Err(EngineError::MalformedElf(format!(
                "{}: unrecognized EI_CLASS {}",
                path.display(),
                class
            )));
        }
        Ok(ElfFile { path, data })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_elf64(&self) -> bool {
        self.data[EI_CLASS] == ELFCLASS64
    }

    fn parse(&self) -> Result<ElfBytes<'_, AnyEndian>> {
        let expected_shentsize = if self.is_elf64() {
            SHENTSIZE_64
        } else {
            SHENTSIZE_32
        };
        let parsed = ElfBytes::<AnyEndian>::minimal_parse(&self.data)
            .map_err(|e| EngineError::MalformedElf(format!("{}: {}", self.path.display(), e)))?;
        if parsed.ehdr.e_shentsize != 0 && parsed.ehdr.e_shentsize != expected_shentsize {
            return Err(EngineError::MalformedElf(format!(
                "{}: e_shentsize {} does not match class",
                self.path.display(),
                parsed.ehdr.e_shentsize
            )));
        }
        Ok(parsed)
    }

    /// Program headers (`Phdr` table), in file order.
    pub fn program_headers(&self) -> Result<Vec<ProgramHeader>> {
        let elf = self.parse()?;
        let segments = elf
            .segments()
            .ok_or_else(|| EngineError::MalformedElf(format!("{}: no segments", self.path.display())))?;
        Ok(segments.iter().collect())
    }

    /// The sole `PT_DYNAMIC` segment. Rejects files with more than one.
    pub fn dynamic_segment(&self) -> Result<ProgramHeader> {
        let phdrs = self.program_headers()?;
        let mut dynamic = phdrs.into_iter().filter(|p| p.p_type == PT_DYNAMIC);
        let first = dynamic.next().ok_or_else(|| {
            EngineError::MalformedElf(format!("{}: no PT_DYNAMIC segment", self.path.display()))
        })?;
        if dynamic.next().is_some() {
            return Err(EngineError::MalformedElf(format!(
                "{}: multiple PT_DYNAMIC segments",
                self.path.display()
            )));
        }
        Ok(first)
    }

    /// The `PT_LOAD` segment with the lowest virtual address — the base
    /// load segment, typically (but not necessarily) vaddr 0.
    pub fn base_load_segment(&self) -> Result<ProgramHeader> {
        let phdrs = self.program_headers()?;
        phdrs
            .into_iter()
            .filter(|p| p.p_type == PT_LOAD)
            .min_by_key(|p| p.p_vaddr)
            .ok_or_else(|| {
                EngineError::MalformedElf(format!("{}: no PT_LOAD segment", self.path.display()))
            })
    }

    /// Enumerates `SHT_SYMTAB` and `SHT_DYNSYM`, rebasing every defined,
    /// nonzero-sized symbol by `base` and recording `(start, end)`. Later
    /// duplicate names win over earlier ones, matching link order.
    pub fn load_symbols(&self, base: u64) -> Result<Vec<SymbolEntry>> {
        let elf = self.parse()?;
        let mut out = Vec::new();

        for table in [elf.symbol_table(), elf.dynamic_symbol_table()] {
            let Ok(Some((symtab, strtab))) = table else {
                continue;
            };
            for sym in symtab.iter() {
                if sym.st_shndx == SHN_UNDEF || sym.st_value == 0 || sym.st_size == 0 {
                    continue;
                }
                let name = strtab
                    .get(sym.st_name as usize)
                    .map_err(|e| {
                        EngineError::MalformedElf(format!(
                            "{}: bad symbol name offset: {}",
                            self.path.display(),
                            e
                        ))
                    })?
                    .to_string();
                let start = sym.st_value.wrapping_add(base);
                let end = start.wrapping_add(sym.st_size);
                out.push(SymbolEntry { name, start, end });
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_garbage(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(bytes).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn rejects_non_elf_files() {
        let f = write_garbage(b"not an elf file at all, far too short");
        let err = ElfFile::open(f.path()).unwrap_err();
        assert!(matches!(err, EngineError::MalformedElf(_)));
    }

    #[test]
    fn rejects_truncated_ident() {
        let f = write_garbage(b"\x7fEL");
        let err = ElfFile::open(f.path()).unwrap_err();
        assert!(matches!(err, EngineError::MalformedElf(_)));
    }

    #[test]
    fn rejects_unknown_class() {
        let mut bytes = vec![0u8; EI_NIDENT];
        bytes[0..4].copy_from_slice(ELF_MAGIC);
        bytes[EI_CLASS] = 9;
        let f = write_garbage(&bytes);
        let err = ElfFile::open(f.path()).unwrap_err();
        assert!(matches!(err, EngineError::MalformedElf(_)));
    }
}
