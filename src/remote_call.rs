//! Synthesizes a call to an arbitrary function inside the tracee: builds
//! a register frame that sends control to `func_addr` with up to six
//! arguments and a sentinel zero return address, resumes the tracee,
//! and interprets the resulting stop.
//!
//! The sentinel is what makes this work without injecting a trampoline:
//! when the called function returns, it jumps to address 0, which
//! always faults with `SIGSEGV` at `si_addr == 0` — a stop we can
//! distinguish from every other kind of crash.

use crate::error::{EngineError, Result};
use crate::memory::RemoteMemory;
use crate::tracer::{Tracer, UserRegs};
use log::trace;
use nix::sys::signal::Signal;

const MAX_ARGS: usize = 6;

/// Invoked on every `SIGTRAP` stop encountered before the sentinel
/// return. Must advance the tracee's program counter past the
/// breakpoint instruction before returning `Ok`; the engine does not
/// do this for the caller, since the instruction width is
/// callback-specific (a `malloc_iterate` overflow trap vs. a plain
/// `brk`/`int3`).
pub trait OnTrap {
    fn handle_trap(&mut self, tracer: &mut Tracer, mem: &RemoteMemory) -> Result<()>;
}

impl<F> OnTrap for F
where
    F: FnMut(&mut Tracer, &RemoteMemory) -> Result<()>,
{
    fn handle_trap(&mut self, tracer: &mut Tracer, mem: &RemoteMemory) -> Result<()> {
        self(tracer, mem)
    }
}

/// Calls `func_addr(args[0], .., args[args.len()-1])` inside the
/// tracee, returning the callee's `x0`/`rax` on success. `tracer` must
/// already be `Stopped`; it is left `Stopped` again on both success and
/// failure, with the pre-call registers restored on every exit path.
pub fn call(
    tracer: &mut Tracer,
    mem: &RemoteMemory,
    func_addr: u64,
    args: &[u64],
    mut on_trap: Option<&mut dyn OnTrap>,
) -> Result<u64> {
    if args.len() > MAX_ARGS {
        return Err(EngineError::IllegalArgument(format!(
            "remote call takes at most {} arguments, got {}",
            MAX_ARGS,
            args.len()
        )));
    }

    let orig = tracer.getregs()?;
    let new_regs = arch::setup_call(&orig, func_addr, args);
    arch::prepare_return_sentinel(mem, &new_regs)?;
    tracer.setregs(&new_regs)?;

    let result = run_until_sentinel(tracer, mem, &mut on_trap);

    // Whatever happened, the tracee's register state must not leak past
    // this call — restore the snapshot taken before we touched anything.
    let restore_result = tracer.setregs(&orig);
    match (result, restore_result) {
        (Ok(v), Ok(())) => Ok(v),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), _) => Err(e),
    }
}

fn run_until_sentinel(
    tracer: &mut Tracer,
    mem: &RemoteMemory,
    on_trap: &mut Option<&mut dyn OnTrap>,
) -> Result<u64> {
    loop {
        tracer.cont(None)?;
        let sig = tracer.wait_for_stop()?;
        match sig {
            Some(Signal::SIGSEGV) => {
                let siginfo = tracer.getsiginfo()?;
                let addr = unsafe { siginfo.si_addr() } as u64;
                if addr == 0 {
                    let regs = tracer.getregs()?;
                    return Ok(arch::return_value(&regs));
                }
                return Err(EngineError::UnexpectedSignal {
                    signal: Signal::SIGSEGV as i32,
                    addr,
                });
            }
            Some(Signal::SIGTRAP) => match on_trap {
                Some(handler) => {
                    handler.handle_trap(tracer, mem)?;
                    trace!("remote call: SIGTRAP handled, resuming toward sentinel");
                    continue;
                }
                None => {
                    return Err(EngineError::UnexpectedSignal {
                        signal: Signal::SIGTRAP as i32,
                        addr: 0,
                    })
                }
            },
            Some(other) => {
                return Err(EngineError::UnexpectedSignal {
                    signal: other as i32,
                    addr: 0,
                })
            }
            None => {
                return Err(EngineError::RemoteCallFailed(
                    "tracee stopped with no signal while awaiting sentinel return".to_string(),
                ))
            }
        }
    }
}

#[cfg(target_arch = "x86_64")]
mod arch {
    use super::*;

    /// Breakpoint trap width for `int3`; used by callers that advance
    /// past an engine-inserted breakpoint rather than a payload-owned
    /// one.
    pub const TRAP_WIDTH: u64 = 1;

    pub fn setup_call(orig: &UserRegs, func_addr: u64, args: &[u64]) -> UserRegs {
        let mut regs = *orig;
        let slots = [
            &mut regs.rdi,
            &mut regs.rsi,
            &mut regs.rdx,
            &mut regs.rcx,
            &mut regs.r8,
            &mut regs.r9,
        ];
        for (slot, arg) in slots.into_iter().zip(args.iter()) {
            *slot = *arg;
        }
        regs.rip = func_addr;
        regs.rax = 0;
        regs.rsp = orig.rsp.wrapping_sub(8);
        regs
    }

    /// `ret` pops its target off the stack, so the sentinel has to be
    /// written to the new top-of-stack word rather than into a link
    /// register.
    pub fn prepare_return_sentinel(mem: &RemoteMemory, regs: &UserRegs) -> Result<()> {
        mem.write_struct(regs.rsp, &0u64)
    }

    pub fn return_value(regs: &UserRegs) -> u64 {
        regs.rax
    }

    pub fn advance_past_trap(regs: &mut UserRegs) {
        regs.rip += TRAP_WIDTH;
    }
}

#[cfg(target_arch = "aarch64")]
mod arch {
    use super::*;

    /// `brk #0` is a fixed 4-byte instruction on arm64.
    pub const TRAP_WIDTH: u64 = 4;

    pub fn setup_call(orig: &UserRegs, func_addr: u64, args: &[u64]) -> UserRegs {
        let mut regs = *orig;
        for (i, arg) in args.iter().enumerate() {
            regs.regs[i] = *arg;
        }
        regs.pc = func_addr;
        regs.regs[30] = 0; // lr
        regs
    }

    /// arm64 returns via `lr`, already zeroed in `setup_call` — nothing
    /// to write to the stack.
    pub fn prepare_return_sentinel(_mem: &RemoteMemory, _regs: &UserRegs) -> Result<()> {
        Ok(())
    }

    pub fn return_value(regs: &UserRegs) -> u64 {
        regs.regs[0]
    }

    pub fn advance_past_trap(regs: &mut UserRegs) {
        regs.pc += TRAP_WIDTH;
    }
}

/// Advances `tracer`'s program counter past a breakpoint instruction of
/// the current architecture's fixed width and writes the registers
/// back. Shared helper for `onTrap` callbacks that hit a plain
/// engine-inserted breakpoint rather than a payload-specific one.
pub fn advance_past_trap(tracer: &mut Tracer) -> Result<()> {
    let mut regs = tracer.getregs()?;
    arch::advance_past_trap(&mut regs);
    tracer.setregs(&regs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn x86_64_frame_places_args_and_zeroes_return_slot() {
        let orig: UserRegs = unsafe { std::mem::zeroed() };
        let regs = arch::setup_call(&orig, 0x4000, &[1, 2, 3]);
        assert_eq!(regs.rdi, 1);
        assert_eq!(regs.rsi, 2);
        assert_eq!(regs.rdx, 3);
        assert_eq!(regs.rip, 0x4000);
        assert_eq!(regs.rax, 0);
        assert_eq!(regs.rsp, orig.rsp.wrapping_sub(8));
    }

    #[cfg(target_arch = "aarch64")]
    #[test]
    fn aarch64_frame_places_args_and_zeroes_lr() {
        let orig: UserRegs = unsafe { std::mem::zeroed() };
        let regs = arch::setup_call(&orig, 0x4000, &[1, 2, 3]);
        assert_eq!(regs.regs[0], 1);
        assert_eq!(regs.regs[1], 2);
        assert_eq!(regs.regs[2], 3);
        assert_eq!(regs.pc, 0x4000);
        assert_eq!(regs.regs[30], 0);
    }

    #[test]
    fn rejects_too_many_arguments() {
        use crate::tracer::TracerState;
        let mut tracer = Tracer::for_test(nix::unistd::getpid(), TracerState::Stopped);
        let mem = RemoteMemory::new(nix::unistd::getpid());
        let err = call(&mut tracer, &mem, 0, &[1, 2, 3, 4, 5, 6, 7], None).unwrap_err();
        assert!(matches!(err, EngineError::IllegalArgument(_)));
    }
}
