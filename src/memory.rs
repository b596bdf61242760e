//! Cross-process memory access via `process_vm_readv`/`process_vm_writev`.

use crate::error::{EngineError, Result};
use nix::sys::uio::{process_vm_readv, process_vm_writev, RemoteIoVec};
use nix::unistd::Pid;
use std::ffi::CString;
use std::io::{IoSlice, IoSliceMut};
use std::mem;

/// Accessor for a single tracee's address space.
#[derive(Debug, Clone, Copy)]
pub struct RemoteMemory {
    pid: Pid,
}

impl RemoteMemory {
    pub fn new(pid: Pid) -> Self {
        RemoteMemory { pid }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Reads up to `up_to` elements of `T` starting at `addr`. One
    /// `process_vm_readv` call is issued for the full request; if the
    /// region ends early, the prefix that did transfer is returned. Zero
    /// bytes transferred is a failure.
    pub fn read_array<T: Copy>(&self, addr: u64, up_to: usize) -> Result<Vec<T>> {
        let stride = mem::size_of::<T>();
        let want = stride * up_to;
        if want == 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; want];
        let mut local = [IoSliceMut::new(&mut buf)];
        let remote = [RemoteIoVec {
            base: addr as usize,
            len: want,
        }];
        let got = process_vm_readv(self.pid, &mut local, &remote).map_err(|_| {
            EngineError::MemoryReadFailed {
                addr,
                size: want,
            }
        })?;
        if got == 0 {
            return Err(EngineError::MemoryReadFailed { addr, size: want });
        }
        let whole_elems = got / stride;
        buf.truncate(whole_elems * stride);
        Ok(buf
            .chunks_exact(stride)
            .map(|chunk| unsafe { std::ptr::read_unaligned(chunk.as_ptr() as *const T) })
            .collect())
    }

    /// Reads exactly one `T` at `addr`.
    pub fn read_struct<T: Copy>(&self, addr: u64) -> Result<T> {
        let mut v = self.read_array::<T>(addr, 1)?;
        v.pop()
            .ok_or(EngineError::MemoryReadFailed {
                addr,
                size: mem::size_of::<T>(),
            })
    }

    /// Reads a NUL-terminated string starting at `addr`, halving the read
    /// chunk size on failure (64 -> 32 -> 16 -> 8 -> 4 -> 2 -> 1 bytes)
    /// before giving up, stopping at the first NUL byte encountered.
    pub fn read_string(&self, addr: u64) -> Result<String> {
        let mut out = Vec::new();
        let mut cursor = addr;
        'outer: loop {
            let mut chunk_size: usize = 64;
            loop {
                match self.read_array::<u8>(cursor, chunk_size) {
                    Ok(bytes) if !bytes.is_empty() => {
                        let got = bytes.len() as u64;
                        for b in bytes {
                            if b == 0 {
                                break 'outer;
                            }
                            out.push(b);
                        }
                        cursor += got;
                        break;
                    }
                    _ => {
                        if chunk_size == 1 {
                            return Err(EngineError::MemoryReadFailed {
                                addr: cursor,
                                size: 1,
                            });
                        }
                        chunk_size /= 2;
                    }
                }
            }
        }
        CString::new(out)
            .map_err(|e| EngineError::MalformedElf(format!("embedded NUL while reading string: {}", e)))
            .map(|c| c.to_string_lossy().into_owned())
    }

    /// Writes `local` to `remote`; fails unless every byte transferred.
    pub fn write_mem(&self, remote: u64, local: &[u8]) -> Result<()> {
        if local.is_empty() {
            return Ok(());
        }
        let local_iov = [IoSlice::new(local)];
        let remote_iov = [RemoteIoVec {
            base: remote as usize,
            len: local.len(),
        }];
        let written = process_vm_writev(self.pid, &local_iov, &remote_iov).map_err(|_| {
            EngineError::MemoryWriteFailed {
                addr: remote,
                size: local.len(),
            }
        })?;
        if written != local.len() {
            return Err(EngineError::MemoryWriteFailed {
                addr: remote,
                size: local.len(),
            });
        }
        Ok(())
    }

    /// Writes a single `T` to `remote`.
    pub fn write_struct<T: Copy>(&self, remote: u64, value: &T) -> Result<()> {
        let bytes = unsafe {
            std::slice::from_raw_parts(value as *const T as *const u8, mem::size_of::<T>())
        };
        self.write_mem(remote, bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // process_vm_readv/writev against our own pid works on Linux when the
    // kernel allows self-ptrace-equivalent access (it always does for same
    // uid, same process).
    #[cfg(target_os = "linux")]
    #[test]
    fn round_trips_bytes_against_self() {
        let pid = nix::unistd::getpid();
        let mem = RemoteMemory::new(pid);
        let mut buf = [0u8; 16];
        for (i, b) in buf.iter_mut().enumerate() {
            *b = i as u8;
        }
        let addr = buf.as_ptr() as u64;
        let read_back: Vec<u8> = mem.read_array(addr, 16).unwrap();
        assert_eq!(read_back, buf);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn write_then_read_round_trips() {
        let pid = nix::unistd::getpid();
        let mem = RemoteMemory::new(pid);
        let mut buf = [0u8; 8];
        let addr = buf.as_mut_ptr() as u64;
        let payload: [u8; 8] = [1, 2, 3, 4, 5, 6, 7, 8];
        mem.write_mem(addr, &payload).unwrap();
        let read_back: Vec<u8> = mem.read_array(addr, 8).unwrap();
        assert_eq!(read_back, payload);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn read_string_stops_at_nul() {
        let pid = nix::unistd::getpid();
        let mem = RemoteMemory::new(pid);
        let s = b"hello world\0trailing garbage";
        let addr = s.as_ptr() as u64;
        let got = mem.read_string(addr).unwrap();
        assert_eq!(got, "hello world");
    }
}
