//! Parsing of `/proc/<pid>/maps` and `/proc/<pid>/auxv`.

use crate::error::{EngineError, Result};
use log::warn;
use nix::unistd::Pid;
use std::collections::HashMap;
use std::fs;

/// Permission flags on a single mapped region, read straight off the
/// four-character permission string (`r`/`w`/`x`/`s`|`p`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Perms {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
    pub shared: bool,
}

impl Perms {
    fn parse(s: &str) -> Result<Perms> {
        let bytes = s.as_bytes();
        if bytes.len() != 4 {
            return Err(EngineError::IllegalArgument(format!(
                "permission string {:?} is not 4 characters",
                s
            )));
        }
        Ok(Perms {
            read: bytes[0] == b'r',
            write: bytes[1] == b'w',
            exec: bytes[2] == b'x',
            shared: bytes[3] == b's',
        })
    }
}

/// One line of `/proc/<pid>/maps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapEntry {
    pub start: u64,
    pub end: u64,
    pub perms: Perms,
    pub offset: u64,
    pub dev: String,
    pub inode: u64,
    pub pathname: Option<String>,
}

impl MapEntry {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }

    fn parse(line: &str) -> Option<MapEntry> {
        let mut fields = line.splitn(6, char::is_whitespace);
        let addr_range = fields.next()?;
        let perms = fields.next()?;
        let offset = fields.next()?;
        let dev = fields.next()?;
        let rest = fields.next()?;

        let (start_str, end_str) = addr_range.split_once('-')?;
        let start = u64::from_str_radix(start_str, 16).ok()?;
        let end = u64::from_str_radix(end_str, 16).ok()?;
        let perms = Perms::parse(perms).ok()?;
        let offset = u64::from_str_radix(offset, 16).ok()?;

        // `rest` is "<inode>  <pathname...>" or just "<inode>" with trailing
        // whitespace already stripped of the pathname split above; re-split.
        let rest = rest.trim_start();
        let (inode_str, pathname) = match rest.split_once(char::is_whitespace) {
            Some((inode_str, path)) => (inode_str, Some(path.trim().to_string())),
            None => (rest, None),
        };
        let inode = inode_str.parse::<u64>().ok()?;
        let pathname = pathname.filter(|p| !p.is_empty());

        if start >= end {
            return None;
        }

        Some(MapEntry {
            start,
            end,
            perms,
            offset,
            dev: dev.to_string(),
            inode,
            pathname,
        })
    }
}

/// Parse `/proc/<pid>/maps` into an ordered sequence of regions. Malformed
/// lines are skipped with a logged warning rather than aborting the whole
/// read.
pub fn read_maps(pid: Pid) -> Result<Vec<MapEntry>> {
    let path = format!("/proc/{}/maps", pid);
    let contents = fs::read_to_string(&path).map_err(|e| map_io_error(e, pid))?;
    Ok(parse_maps(&contents))
}

fn parse_maps(contents: &str) -> Vec<MapEntry> {
    let mut entries = Vec::new();
    for line in contents.lines() {
        match MapEntry::parse(line) {
            Some(entry) => entries.push(entry),
            None => warn!("skipping malformed /proc/<pid>/maps line: {:?}", line),
        }
    }
    entries
}

/// Well-known auxiliary-vector tags used by the link-map walker and the
/// remote-call engine. Values outside this set are retained in the table
/// under their raw tag but never interpreted.
pub const AT_NULL: u64 = 0;
pub const AT_PHDR: u64 = 3;
pub const AT_PHENT: u64 = 4;
pub const AT_PHNUM: u64 = 5;
pub const AT_BASE: u64 = 7;
pub const AT_ENTRY: u64 = 9;

/// `/proc/<pid>/auxv` decoded as a tag -> value table.
#[derive(Debug, Clone, Default)]
pub struct AuxVec {
    entries: HashMap<u64, u64>,
}

impl AuxVec {
    pub fn get(&self, tag: u64) -> Option<u64> {
        self.entries.get(&tag).copied()
    }

    pub fn require(&self, tag: u64, name: &'static str) -> Result<u64> {
        self.get(tag).ok_or(EngineError::MissingAuxVecEntry(name))
    }
}

/// Reads `/proc/<pid>/auxv` as a stream of 16-byte `(tag, value)` pairs on a
/// 64-bit host, stopping at `AT_NULL`.
pub fn read_auxv(pid: Pid) -> Result<AuxVec> {
    let path = format!("/proc/{}/auxv", pid);
    let bytes = fs::read(&path).map_err(|e| map_io_error(e, pid))?;
    Ok(parse_auxv(&bytes))
}

fn parse_auxv(bytes: &[u8]) -> AuxVec {
    const PAIR_SIZE: usize = 16;
    let mut entries = HashMap::new();
    for chunk in bytes.chunks_exact(PAIR_SIZE) {
        let tag = u64::from_ne_bytes(chunk[0..8].try_into().unwrap());
        let value = u64::from_ne_bytes(chunk[8..16].try_into().unwrap());
        if tag == AT_NULL {
            break;
        }
        entries.insert(tag, value);
    }
    AuxVec { entries }
}

fn map_io_error(e: std::io::Error, pid: Pid) -> EngineError {
    match e.kind() {
        std::io::ErrorKind::NotFound => EngineError::ProcessNotFound(pid),
        std::io::ErrorKind::PermissionDenied => EngineError::PermissionDenied(pid),
        _ => EngineError::Io(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
00400000-00452000 r-xp 00000000 08:02 173521                            /usr/bin/dbus-daemon
00e03000-00e24000 rw-p 00000000 00:00 0                                 [heap]
7f07987cd000-7f07987ce000 rw-p 00000000 00:00 0                         [anon:scudo:primary]
7fffb2d48000-7fffb2d49000 r-xp 00000000 00:00 0                         [vdso]
this is not a valid line at all
";

    #[test]
    fn parses_well_formed_lines_and_skips_malformed_ones() {
        let entries = parse_maps(SAMPLE);
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].start, 0x00400000);
        assert_eq!(entries[0].end, 0x00452000);
        assert!(entries[0].perms.read && entries[0].perms.exec);
        assert_eq!(entries[0].pathname.as_deref(), Some("/usr/bin/dbus-daemon"));
        assert_eq!(entries[1].pathname.as_deref(), Some("[heap]"));
        assert_eq!(
            entries[2].pathname.as_deref(),
            Some("[anon:scudo:primary]")
        );
    }

    #[test]
    fn entries_do_not_overlap_and_are_well_ordered() {
        let entries = parse_maps(SAMPLE);
        for e in &entries {
            assert!(e.start < e.end);
        }
        for pair in entries.windows(2) {
            assert!(pair[0].end <= pair[1].start || pair[0].start >= pair[1].end);
        }
    }

    #[test]
    fn rejects_permission_strings_with_wrong_length() {
        assert!(Perms::parse("rwx").is_err());
        assert!(Perms::parse("rwxps").is_err());
        assert!(Perms::parse("rwxp").is_ok());
    }

    #[test]
    fn parses_auxv_pairs_and_stops_at_at_null() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&AT_PHDR.to_ne_bytes());
        bytes.extend_from_slice(&0x400040u64.to_ne_bytes());
        bytes.extend_from_slice(&AT_PHNUM.to_ne_bytes());
        bytes.extend_from_slice(&9u64.to_ne_bytes());
        bytes.extend_from_slice(&AT_NULL.to_ne_bytes());
        bytes.extend_from_slice(&0u64.to_ne_bytes());
        // trailing garbage after AT_NULL must be ignored
        bytes.extend_from_slice(&999u64.to_ne_bytes());
        bytes.extend_from_slice(&999u64.to_ne_bytes());

        let auxv = parse_auxv(&bytes);
        assert_eq!(auxv.get(AT_PHDR), Some(0x400040));
        assert_eq!(auxv.get(AT_PHNUM), Some(9));
        assert_eq!(auxv.get(999), None);
    }

    #[test]
    fn require_reports_missing_tag_by_name() {
        let auxv = AuxVec::default();
        let err = auxv.require(AT_PHDR, "AT_PHDR").unwrap_err();
        assert!(matches!(err, EngineError::MissingAuxVecEntry("AT_PHDR")));
    }
}
