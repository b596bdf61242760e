//! Ptrace-based tracer: attach/continue/detach state machine plus
//! register, signal, and single-word memory access on a stopped tracee.
//!
//! Register access goes through `PTRACE_GETREGSET`/`PTRACE_SETREGSET`
//! with `NT_PRSTATUS` rather than `nix`'s `getregs`/`setregs`, which nix
//! only implements for x86/x86_64 — this engine runs on arm64 targets
//! too, and `GETREGSET` is the portable path on both.

use crate::error::{EngineError, Result};
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use std::mem::{self, MaybeUninit};

/// The tracer's view of a single tracee thread. There is no `Running`
/// variant of the tracee we can observe directly — once we call `cont`
/// the tracee runs until its next signal-delivery stop, at which point
/// the tracer is `Stopped` again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracerState {
    Detached,
    Stopped,
    Running,
}

#[cfg(target_arch = "x86_64")]
pub type UserRegs = libc::user_regs_struct;
#[cfg(target_arch = "aarch64")]
pub type UserRegs = libc::user_regs_struct;

/// A ptrace attachment to one thread, tracking which of the three
/// states described in the introspection contract it is currently in.
/// The calling thread must be the one that issued `PTRACE_ATTACH` —
/// Linux ptrace is per-tracer-thread, not per-process.
pub struct Tracer {
    pid: Pid,
    state: TracerState,
}

impl Tracer {
    /// `PTRACE_ATTACH` followed by a `waitpid` loop that retries on
    /// `EINTR` until the tracee reports `WIFSTOPPED`.
    pub fn attach(pid: Pid) -> Result<Tracer> {
        ptrace::attach(pid).map_err(|e| EngineError::AttachFailed(pid, e))?;
        wait_for_stop(pid)?;
        Ok(Tracer {
            pid,
            state: TracerState::Stopped,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn state(&self) -> TracerState {
        self.state
    }

    /// `PTRACE_CONT`, optionally redelivering `sig`. Moves
    /// `Stopped -> Running`.
    pub fn cont(&mut self, sig: Option<Signal>) -> Result<()> {
        self.require_stopped()?;
        ptrace::cont(self.pid, sig).map_err(EngineError::RegisterAccessFailed)?;
        self.state = TracerState::Running;
        Ok(())
    }

    /// Blocks on `waitpid` for this tracee's next stop, retrying on
    /// `EINTR`. Moves `Running -> Stopped`. Returns the delivered
    /// signal, if any.
    pub fn wait_for_stop(&mut self) -> Result<Option<Signal>> {
        let sig = wait_for_stop(self.pid)?;
        self.state = TracerState::Stopped;
        Ok(sig)
    }

    /// `PTRACE_DETACH`, optionally delivering `sig` on resume. Moves
    /// `Stopped -> Detached`.
    pub fn detach(&mut self, sig: Option<Signal>) -> Result<()> {
        self.require_stopped()?;
        ptrace::detach(self.pid, sig).map_err(EngineError::RegisterAccessFailed)?;
        self.state = TracerState::Detached;
        Ok(())
    }

    /// `PTRACE_GETREGSET` with `NT_PRSTATUS`.
    pub fn getregs(&self) -> Result<UserRegs> {
        self.require_stopped()?;
        let mut regs = MaybeUninit::<UserRegs>::uninit();
        let mut iov = libc::iovec {
            iov_base: regs.as_mut_ptr() as *mut libc::c_void,
            iov_len: mem::size_of::<UserRegs>(),
        };
        let ret = unsafe {
            libc::ptrace(
                libc::PTRACE_GETREGSET,
                self.pid.as_raw(),
                libc::NT_PRSTATUS as *mut libc::c_void,
                &mut iov as *mut libc::iovec as *mut libc::c_void,
            )
        };
        if ret == -1 {
            return Err(EngineError::RegisterAccessFailed(Errno::last()));
        }
        Ok(unsafe { regs.assume_init() })
    }

    /// `PTRACE_SETREGSET` with `NT_PRSTATUS`.
    pub fn setregs(&self, regs: &UserRegs) -> Result<()> {
        self.require_stopped()?;
        let mut iov = libc::iovec {
            iov_base: regs as *const UserRegs as *mut libc::c_void,
            iov_len: mem::size_of::<UserRegs>(),
        };
        let ret = unsafe {
            libc::ptrace(
                libc::PTRACE_SETREGSET,
                self.pid.as_raw(),
                libc::NT_PRSTATUS as *mut libc::c_void,
                &mut iov as *mut libc::iovec as *mut libc::c_void,
            )
        };
        if ret == -1 {
            return Err(EngineError::RegisterAccessFailed(Errno::last()));
        }
        Ok(())
    }

    /// `PTRACE_GETSIGINFO` — the signal that caused the current stop.
    pub fn getsiginfo(&self) -> Result<libc::siginfo_t> {
        self.require_stopped()?;
        ptrace::getsiginfo(self.pid).map_err(EngineError::RegisterAccessFailed)
    }

    /// Reads one word at `addr` via `PTRACE_PEEKDATA`.
    pub fn peek_word(&self, addr: u64) -> Result<i64> {
        self.require_stopped()?;
        ptrace::read(self.pid, addr as ptrace::AddressType)
            .map_err(EngineError::RegisterAccessFailed)
    }

    /// Writes one word at `addr` via `PTRACE_POKEDATA`.
    pub fn poke_word(&self, addr: u64, data: i64) -> Result<()> {
        self.require_stopped()?;
        unsafe {
            ptrace::write(self.pid, addr as ptrace::AddressType, data as *mut libc::c_void)
                .map_err(EngineError::RegisterAccessFailed)
        }
    }

    #[cfg(test)]
    pub(crate) fn for_test(pid: Pid, state: TracerState) -> Tracer {
        Tracer { pid, state }
    }

    fn require_stopped(&self) -> Result<()> {
        if self.state != TracerState::Stopped {
            return Err(EngineError::RemoteCallFailed(format!(
                "tracer for {} is not stopped (state: {:?})",
                self.pid, self.state
            )));
        }
        Ok(())
    }
}

/// Blocks on `waitpid(pid)` until a stop is reported, retrying
/// transparently on `EINTR`. Returns the delivered signal, if any.
fn wait_for_stop(pid: Pid) -> Result<Option<Signal>> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Stopped(_, sig)) => return Ok(Some(sig)),
            Ok(WaitStatus::PtraceEvent(_, sig, _)) => return Ok(Some(sig)),
            Ok(WaitStatus::Exited(p, code)) => {
                return Err(EngineError::RemoteCallFailed(format!(
                    "process {} exited with code {} while waiting for a stop",
                    p, code
                )))
            }
            Ok(WaitStatus::Signaled(p, sig, _)) => {
                return Err(EngineError::RemoteCallFailed(format!(
                    "process {} was killed by signal {} while waiting for a stop",
                    p, sig
                )))
            }
            Ok(other) => {
                return Err(EngineError::RemoteCallFailed(format!(
                    "unexpected wait status while waiting for a stop: {:?}",
                    other
                )))
            }
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(EngineError::WaitFailed(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_tracer_state_machine_rejects_operations_when_detached() {
        let tracer = Tracer::for_test(nix::unistd::getpid(), TracerState::Detached);
        assert!(tracer.getregs().is_err());
        assert!(tracer.peek_word(0).is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn attach_cont_detach_round_trip_on_a_child_process() {
        use nix::sys::signal::kill;
        use nix::sys::wait::waitpid as wp;
        use nix::unistd::{fork, ForkResult};

        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                // Busy-loop until the parent detaches and kills us.
                loop {
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
            }
            ForkResult::Parent { child } => {
                let mut tracer = Tracer::attach(child).unwrap();
                assert_eq!(tracer.state(), TracerState::Stopped);
                let regs = tracer.getregs().unwrap();
                tracer.setregs(&regs).unwrap();
                tracer.detach(None).unwrap();
                assert_eq!(tracer.state(), TracerState::Detached);
                let _ = kill(child, Signal::SIGKILL);
                let _ = wp(child, None);
            }
        }
    }
}
