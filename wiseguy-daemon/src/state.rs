use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Error};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

// Set from the signal handler; per-instance flags cannot be reached
// from an async-signal context.
static SIGNALED_QUIT: AtomicBool = AtomicBool::new(false);

extern "C" fn quit_signal_handler(_signal: libc::c_int) {
    SIGNALED_QUIT.store(true, Ordering::Release);
}

/// Shared quit flag for a worker process.
///
/// Once set, the accept loop exits after the current connection and
/// keep-alive decisions flip to `close_connection`. Clones share state.
#[derive(Clone, Debug, Default)]
pub struct QuitFlag {
    flag: Arc<AtomicBool>,
}

impl QuitFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_quit(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_quit_requested(&self) -> bool {
        self.flag.load(Ordering::Acquire) || SIGNALED_QUIT.load(Ordering::Acquire)
    }

    /// Route SIGTERM and SIGINT to the quit flag.
    ///
    /// Workers call this right after the fork, once the dispositions
    /// inherited from the supervisor have been reset to their defaults,
    /// so a TERM aimed at the worker is observed between requests
    /// instead of killing it mid-request. Installed directly through
    /// `sigaction`: the handler registry a fork copies from the
    /// supervisor belongs to the supervisor, and a worker must not
    /// run any of it.
    pub fn register_signals(&self) -> Result<(), Error> {
        let action = SigAction::new(
            SigHandler::Handler(quit_signal_handler),
            SaFlags::empty(),
            SigSet::empty(),
        );
        unsafe { sigaction(Signal::SIGTERM, &action) }
            .context("failed to install SIGTERM handler")?;
        unsafe { sigaction(Signal::SIGINT, &action) }
            .context("failed to install SIGINT handler")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quit_flag_is_shared_across_clones() {
        let flag = QuitFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_quit_requested());
        flag.request_quit();
        assert!(clone.is_quit_requested());
    }
}
