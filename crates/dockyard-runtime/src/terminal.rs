//! Host terminal handling for interactive shell sessions.
//!
//! [`TerminalGuard`] restores the caller's terminal attributes when a session
//! ends, however it ends. [`ResizeRelay`] polls the window size and reports
//! changes so they can be forwarded to the attached process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

pub const RESIZE_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[allow(unsafe_code)]
pub fn stdin_is_terminal() -> bool {
    // SAFETY: isatty() only inspects the descriptor and has no side effects.
    unsafe { libc::isatty(libc::STDIN_FILENO) != 0 }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
}

/// Current size of the terminal on standard output, if there is one.
#[allow(unsafe_code)]
pub fn window_size() -> Option<WindowSize> {
    let mut ws = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: TIOCGWINSZ writes into the winsize struct we own; failure leaves it untouched.
    let rc = unsafe { libc::ioctl(libc::STDOUT_FILENO, libc::TIOCGWINSZ, &mut ws) };
    if rc != 0 || ws.ws_row == 0 || ws.ws_col == 0 {
        return None;
    }
    Some(WindowSize {
        rows: ws.ws_row,
        cols: ws.ws_col,
    })
}

/// Saves the terminal attributes of standard input and restores them on drop.
pub struct TerminalGuard {
    original: Option<libc::termios>,
}

impl TerminalGuard {
    #[allow(unsafe_code)]
    pub fn capture() -> Self {
        if !stdin_is_terminal() {
            return Self { original: None };
        }
        // SAFETY: termios is plain old data; tcgetattr fully initializes it on success.
        let mut attrs: libc::termios = unsafe { std::mem::zeroed() };
        // SAFETY: valid descriptor and a pointer to a termios we own.
        let rc = unsafe { libc::tcgetattr(libc::STDIN_FILENO, &mut attrs) };
        Self {
            original: (rc == 0).then_some(attrs),
        }
    }

    pub fn is_active(&self) -> bool {
        self.original.is_some()
    }
}

impl Drop for TerminalGuard {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        if let Some(attrs) = self.original.as_ref() {
            // SAFETY: restores attributes previously read from the same descriptor.
            let rc = unsafe { libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, attrs) };
            if rc != 0 {
                tracing::warn!("failed to restore terminal attributes");
            }
        }
    }
}

/// Background thread that calls `on_resize` whenever the window size changes.
pub struct ResizeRelay {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ResizeRelay {
    pub fn spawn<F>(interval: Duration, mut on_resize: F) -> Self
    where
        F: FnMut(WindowSize) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            let mut last = window_size();
            while !flag.load(Ordering::Relaxed) {
                std::thread::sleep(interval);
                let current = window_size();
                if current != last {
                    if let Some(size) = current {
                        on_resize(size);
                    }
                    last = current;
                }
            }
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for ResizeRelay {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Deliver SIGWINCH to `pid` so the attached client re-reads the window size.
#[allow(unsafe_code)]
pub fn signal_resize(pid: u32) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill() with a valid signal number has no memory-safety preconditions.
    unsafe {
        libc::kill(pid, libc::SIGWINCH);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_without_terminal_is_inert() {
        // Test harnesses usually run without a terminal on stdin.
        let guard = TerminalGuard::capture();
        if !stdin_is_terminal() {
            assert!(!guard.is_active());
        }
    }

    #[test]
    fn relay_stops_on_drop() {
        let relay = ResizeRelay::spawn(Duration::from_millis(5), |_| {});
        std::thread::sleep(Duration::from_millis(20));
        drop(relay);
    }

    #[test]
    fn window_size_does_not_panic() {
        let _ = window_size();
    }
}
