//! C ABI shim exposed to the external reflection library: five
//! callbacks over an opaque `Session` context pointer, matching the
//! contract the reflection library demands. Each function is a thin
//! dispatch onto a `Session` method; the only real work here is
//! pointer/error marshalling at the FFI boundary.
//!
//! Buffers returned by `ReadBytes` transfer ownership to the caller,
//! which is expected to release them through `Free` — the Rust side
//! leaks a `Box<[u8]>` via `Box::into_raw` and reclaims it via
//! `Box::from_raw`, never touching the memory again in between.
#![allow(non_snake_case)]

use crate::session::Session;
use log::warn;
use std::os::raw::c_void;
use std::slice;

/// `queryKind` values accepted by `QueryDataLayout`.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataLayoutQuery {
    PointerSize = 0,
    WordSize = 1,
    LeastValidPointer = 2,
}

impl DataLayoutQuery {
    fn from_raw(v: i32) -> Option<DataLayoutQuery> {
        match v {
            0 => Some(DataLayoutQuery::PointerSize),
            1 => Some(DataLayoutQuery::WordSize),
            2 => Some(DataLayoutQuery::LeastValidPointer),
            _ => None,
        }
    }
}

const POINTER_SIZE: u64 = 8;
const WORD_SIZE: u64 = 8;
/// The kernel never maps the zero page under default
/// `mmap_min_addr`; anything below it cannot be a real pointer.
const LEAST_VALID_POINTER: u64 = 0x1000;

/// Returns pointer size, word size, or the least plausible pointer
/// value, depending on `query_kind`. Returns `1` on success, `0` if the
/// context, `out`, or `query_kind` is invalid.
///
/// # Safety
/// `ctx` must be a live `*mut Session` obtained from `Box::into_raw` (or
/// an equivalent stable address) and `out` must point to a writable
/// `u64`.
#[no_mangle]
pub unsafe extern "C" fn QueryDataLayout(
    ctx: *mut c_void,
    query_kind: i32,
    _reserved: u64,
    out: *mut u64,
) -> i32 {
    if ctx.is_null() || out.is_null() {
        return 0;
    }
    let value = match DataLayoutQuery::from_raw(query_kind) {
        Some(DataLayoutQuery::PointerSize) => POINTER_SIZE,
        Some(DataLayoutQuery::WordSize) => WORD_SIZE,
        Some(DataLayoutQuery::LeastValidPointer) => LEAST_VALID_POINTER,
        None => {
            warn!("QueryDataLayout: unrecognized query kind {}", query_kind);
            return 0;
        }
    };
    *out = value;
    1
}

/// Releases a buffer previously returned by `ReadBytes`.
///
/// # Safety
/// `bytes`/`size` must be exactly the pointer and length `ReadBytes`
/// returned; calling this twice on the same buffer, or with a buffer
/// not obtained from `ReadBytes`, is undefined behavior.
#[no_mangle]
pub unsafe extern "C" fn Free(_ctx: *mut c_void, bytes: *mut u8, size: u64) {
    if bytes.is_null() {
        return;
    }
    let fat: *mut [u8] = slice::from_raw_parts_mut(bytes, size as usize);
    drop(Box::from_raw(fat));
}

/// Allocates and populates a tracer-side buffer copied from the
/// tracee's memory at `addr`. Returns null on any read failure,
/// including a short read where the target region ends before `size`
/// bytes were available — a non-null result is always exactly `size`
/// bytes, so `Free` can reconstruct the allocation from `size` alone.
/// Ownership of a non-null result transfers to the caller, which must
/// eventually pass it to `Free`.
///
/// # Safety
/// `ctx` must be a live `*mut Session`.
#[no_mangle]
pub unsafe extern "C" fn ReadBytes(
    ctx: *mut c_void,
    addr: u64,
    size: u64,
    _reserved: u64,
) -> *mut u8 {
    if ctx.is_null() {
        return std::ptr::null_mut();
    }
    let session = &*(ctx as *const Session);
    match session.read_bytes(addr, size as usize) {
        Ok(bytes) if bytes.len() == size as usize => {
            let boxed: Box<[u8]> = bytes.into_boxed_slice();
            Box::into_raw(boxed) as *mut u8
        }
        Ok(bytes) => {
            warn!(
                "ReadBytes: short read at {:#x}: got {} of {} requested bytes",
                addr,
                bytes.len(),
                size
            );
            std::ptr::null_mut()
        }
        Err(e) => {
            warn!("ReadBytes: failed to read {} bytes at {:#x}: {}", size, addr, e);
            std::ptr::null_mut()
        }
    }
}

/// Counts bytes to the first NUL starting at `addr`. Returns 0 on any
/// read failure, which is indistinguishable from a zero-length string
/// — callers that need to tell the two apart should call `ReadBytes`
/// directly.
///
/// # Safety
/// `ctx` must be a live `*mut Session`.
#[no_mangle]
pub unsafe extern "C" fn GetStringLength(ctx: *mut c_void, addr: u64) -> u64 {
    if ctx.is_null() {
        return 0;
    }
    let session = &*(ctx as *const Session);
    session.read_string(addr).map(|s| s.len() as u64).unwrap_or(0)
}

/// Resolves `name` (a non-NUL-terminated byte slice of length
/// `name_len`) to a tracee address via the session's symbol cache.
/// Returns 0 if the context is invalid, the name is not valid UTF-8, or
/// no symbol matches.
///
/// # Safety
/// `ctx` must be a live `*mut Session`; `name_ptr`/`name_len` must
/// describe a valid, readable byte slice.
#[no_mangle]
pub unsafe extern "C" fn GetSymbolAddress(
    ctx: *mut c_void,
    name_ptr: *const u8,
    name_len: u64,
) -> u64 {
    if ctx.is_null() || name_ptr.is_null() {
        return 0;
    }
    let session = &mut *(ctx as *mut Session);
    let raw = slice::from_raw_parts(name_ptr, name_len as usize);
    let name = match std::str::from_utf8(raw) {
        Ok(s) => s,
        Err(e) => {
            warn!("GetSymbolAddress: symbol name is not valid UTF-8: {}", e);
            return 0;
        }
    };
    session.address_of(name).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_data_layout_rejects_unknown_kinds() {
        assert_eq!(DataLayoutQuery::from_raw(0), Some(DataLayoutQuery::PointerSize));
        assert_eq!(DataLayoutQuery::from_raw(99), None);
    }

    #[test]
    fn query_data_layout_reports_zero_on_null_context() {
        let mut out: u64 = 0xdead;
        let ret = unsafe { QueryDataLayout(std::ptr::null_mut(), 0, 0, &mut out as *mut u64) };
        assert_eq!(ret, 0);
    }

    #[test]
    fn free_of_null_is_a_no_op() {
        unsafe { Free(std::ptr::null_mut(), std::ptr::null_mut(), 0) };
    }
}
