//! Interrupting a thread blocked in a system call.
//!
//! A thread waiting for a transfer to complete is blocked inside the reap ioctl.
//! Sending it `SIGALRM` makes the ioctl return `EINTR`, provided a handler is
//! installed without `SA_RESTART`.

use nix::sys::{
    pthread::{pthread_kill, pthread_self, Pthread},
    signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal},
};
use std::sync::Once;

/// Signal used for interrupting.
const SIGNAL: Signal = Signal::SIGALRM;

extern "C" fn ignore(_: libc::c_int) {}

/// Installs the no-op signal handler.
///
/// Must have been called before [`Interruptible::interrupt`] is used, since
/// the default action of the signal terminates the process.
pub fn init() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let action = SigAction::new(SigHandler::Handler(ignore), SaFlags::empty(), SigSet::empty());
        match unsafe { sigaction(SIGNAL, &action) } {
            Ok(_) => log::trace!("installed {SIGNAL} handler"),
            Err(err) => log::warn!("cannot install {SIGNAL} handler: {err}"),
        }
    });
}

/// Identity of a thread that can be interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interruptible(Pthread);

impl Interruptible {
    /// The calling thread.
    pub fn current() -> Self {
        Self(pthread_self())
    }

    /// Interrupts the blocking system call the thread is executing.
    ///
    /// The thread must still be alive.
    pub fn interrupt(&self) {
        if let Err(err) = pthread_kill(self.0, SIGNAL) {
            log::debug!("cannot signal reaper thread: {err}");
        }
    }
}
