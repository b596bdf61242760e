use nix::unistd::Pid;
use thiserror::Error;

/// Every fallible outcome the engine can produce, matching the error-kind
/// taxonomy the introspection contract defines.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("process {0} not found")]
    ProcessNotFound(Pid),

    #[error("permission denied accessing process {0}")]
    PermissionDenied(Pid),

    #[error("failed to attach to process {0}: {1}")]
    AttachFailed(Pid, #[source] nix::Error),

    #[error("waitpid failed: {0}")]
    WaitFailed(#[source] nix::Error),

    #[error("register access failed: {0}")]
    RegisterAccessFailed(#[source] nix::Error),

    #[error("failed to read {size} bytes at {addr:#x}")]
    MemoryReadFailed { addr: u64, size: usize },

    #[error("failed to write {size} bytes at {addr:#x}")]
    MemoryWriteFailed { addr: u64, size: usize },

    #[error("malformed ELF: {0}")]
    MalformedElf(String),

    #[error("missing auxiliary vector entry: {0}")]
    MissingAuxVecEntry(&'static str),

    #[error("r_debug stayed in a non-consistent state ({0}) across every retry")]
    LinkMapInconsistent(i32),

    #[error("symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("failed to open library {0}: {1}")]
    LibraryOpenFailed(String, String),

    #[error("no symbol covers address {0:#x}")]
    NoSymbolForAddress(u64),

    #[error("remote call failed: {0}")]
    RemoteCallFailed(String),

    #[error("unexpected signal {signal} at address {addr:#x}")]
    UnexpectedSignal { signal: i32, addr: u64 },

    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
