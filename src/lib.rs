//! Remote process introspection: ptrace-based heap walking, ELF/link-map
//! parsing, and remote function call synthesis for Linux and Android
//! targets on `arm64` and `x86_64`.

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("introspect_engine only supports x86_64 and aarch64 targets");

#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("introspect_engine only supports Linux and Android targets");

pub mod abi;
pub mod elf;
pub mod error;
pub mod heap_walker;
pub mod libc_locator;
pub mod linkmap;
pub mod memory;
pub mod procfs;
pub mod remote_call;
pub mod session;
pub mod symbols;
pub mod tracer;

pub use error::{EngineError, Result};
pub use session::Session;
