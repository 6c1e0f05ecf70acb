//! Signal plumbing: one real OS handler per signal that does nothing but
//! write the signal number to the owning loop's self-pipe. User callbacks
//! always run on the loop thread, never in signal context.

use crate::error::LoopError;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

pub(crate) const MAX_SIGNAL: usize = 32;

/// Write end of the self-pipe of the loop that registered each signal.
/// Read by the async handler, so plain atomics only.
static SIGNAL_PIPE: [AtomicI32; MAX_SIGNAL] = {
    const INIT: AtomicI32 = AtomicI32::new(-1);
    [INIT; MAX_SIGNAL]
};

extern "C" fn forward_signal(sig: libc::c_int) {
    let idx = sig as usize;
    if idx >= MAX_SIGNAL {
        return;
    }
    let fd = SIGNAL_PIPE[idx].load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = sig as u8;
        // write(2) is async-signal-safe; a full pipe just coalesces.
        unsafe { libc::write(fd, &byte as *const u8 as *const libc::c_void, 1) };
    }
}

/// Routes `sig` to `pipe_wr` and installs the forwarding handler.
pub(crate) fn install(sig: i32, pipe_wr: RawFd) -> Result<(), LoopError> {
    if !(1..MAX_SIGNAL as i32).contains(&sig) {
        return Err(LoopError::Invalid("signal number out of range"));
    }
    let signal = Signal::try_from(sig).map_err(LoopError::from)?;
    SIGNAL_PIPE[sig as usize].store(pipe_wr, Ordering::SeqCst);
    let action = SigAction::new(
        SigHandler::Handler(forward_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    unsafe { sigaction(signal, &action) }.map_err(LoopError::from)?;
    Ok(())
}

/// Restores the default disposition once no loop wants `sig` anymore.
pub(crate) fn uninstall(sig: i32) -> Result<(), LoopError> {
    if !(1..MAX_SIGNAL as i32).contains(&sig) {
        return Err(LoopError::Invalid("signal number out of range"));
    }
    let signal = Signal::try_from(sig).map_err(LoopError::from)?;
    SIGNAL_PIPE[sig as usize].store(-1, Ordering::SeqCst);
    let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    unsafe { sigaction(signal, &action) }.map_err(LoopError::from)?;
    Ok(())
}
