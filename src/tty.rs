//! Raw-mode guard for the host terminal.
//!
//! The guest console wants every keystroke immediately and unechoed, so
//! the controlling terminal goes raw for the emulator's lifetime. The
//! guard restores the previous state on drop, which covers both the
//! fatal-exception exit and a panic unwinding out of the run loop.

use crossterm::terminal;
use log::warn;

pub struct TtyGuard {
    raw: bool,
}

impl TtyGuard {
    /// Switch the terminal to raw mode until the guard is dropped.
    /// Without a tty (tests, redirected stdin) this is a no-op.
    pub fn new() -> TtyGuard {
        let raw = match terminal::enable_raw_mode() {
            Ok(()) => true,
            Err(e) => {
                warn!("terminal not switched to raw mode: {}", e);
                false
            }
        };
        TtyGuard { raw }
    }

    /// Restore the terminal; safe to call more than once.
    pub fn restore(&mut self) {
        if self.raw {
            if let Err(e) = terminal::disable_raw_mode() {
                warn!("failed to restore the terminal: {}", e);
            }
            self.raw = false;
        }
    }
}

impl Drop for TtyGuard {
    fn drop(&mut self) {
        self.restore();
    }
}
