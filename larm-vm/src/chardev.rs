//! Character backends for the UART.
//!
//! A backend is the host side of a byte stream: it accepts bytes written by
//! the guest and feeds bytes typed by the user (or injected by a test) to
//! the attached frontend, asynchronously, from whatever thread it owns.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

/// Receiving side of a character stream (the device).
pub trait CharFrontend: Send + Sync {
    /// Number of bytes the frontend can take right now.
    fn can_receive(&self) -> usize;

    /// Deliver bytes. Never called with more than `can_receive()` bytes.
    fn receive(&self, buf: &[u8]);
}

/// Host side of a character stream.
pub trait CharBackend: Send + Sync {
    /// Blocking write of the whole buffer.
    fn write_all(&self, buf: &[u8]) -> io::Result<()>;

    /// Attach the frontend that receives input. Input produced before a
    /// frontend is attached, or after it is gone, is discarded.
    fn attach(&self, _frontend: Weak<dyn CharFrontend>) -> io::Result<()> {
        Ok(())
    }
}

/// Feed `bytes` to `frontend` one at a time, honouring its capacity.
///
/// Returns the number of bytes delivered; the rest are discarded.
pub fn deliver(frontend: &dyn CharFrontend, bytes: &[u8]) -> usize {
    let mut delivered = 0;
    for chunk in bytes.chunks(1) {
        if frontend.can_receive() == 0 {
            break;
        }
        frontend.receive(chunk);
        delivered += 1;
    }
    delivered
}

/// Discards output, never produces input.
pub struct NullBackend;

impl CharBackend for NullBackend {
    fn write_all(&self, _buf: &[u8]) -> io::Result<()> {
        Ok(())
    }
}

/// In-memory backend: records output and lets the caller inject input.
pub struct CaptureBackend {
    output: Mutex<Vec<u8>>,
    frontend: Mutex<Option<Weak<dyn CharFrontend>>>,
}

impl CaptureBackend {
    pub fn new() -> Self {
        Self {
            output: Mutex::new(Vec::new()),
            frontend: Mutex::new(None),
        }
    }

    /// Everything written so far.
    pub fn output(&self) -> Vec<u8> {
        self.output.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut *self.output.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Push input towards the attached frontend, as if typed by a user.
    pub fn inject(&self, bytes: &[u8]) -> usize {
        let frontend = self
            .frontend
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(Weak::upgrade);
        match frontend {
            Some(frontend) => deliver(frontend.as_ref(), bytes),
            None => 0,
        }
    }
}

impl Default for CaptureBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CharBackend for CaptureBackend {
    fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        self.output
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(buf);
        Ok(())
    }

    fn attach(&self, frontend: Weak<dyn CharFrontend>) -> io::Result<()> {
        *self.frontend.lock().unwrap_or_else(|e| e.into_inner()) = Some(frontend);
        Ok(())
    }
}

/// Escape prefix on the console: `Ctrl-A x` asks the machine to quit.
const ESCAPE_PREFIX: u8 = 0x01;

/// Host terminal backend.
///
/// Output goes to stdout. Input is read from stdin on a background thread
/// with the terminal in raw mode; the mode is restored when the backend is
/// dropped.
pub struct StdioBackend {
    quit: Arc<AtomicBool>,
    #[cfg(unix)]
    raw_mode: Mutex<Option<RawModeGuard>>,
}

impl StdioBackend {
    pub fn new() -> Self {
        Self::with_quit_flag(Arc::new(AtomicBool::new(false)))
    }

    /// `quit` is raised when the user types the quit escape or stdin closes.
    pub fn with_quit_flag(quit: Arc<AtomicBool>) -> Self {
        Self {
            quit,
            #[cfg(unix)]
            raw_mode: Mutex::new(None),
        }
    }
}

impl Default for StdioBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CharBackend for StdioBackend {
    fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        stdout.write_all(buf)?;
        stdout.flush()
    }

    fn attach(&self, frontend: Weak<dyn CharFrontend>) -> io::Result<()> {
        #[cfg(unix)]
        {
            *self.raw_mode.lock().unwrap_or_else(|e| e.into_inner()) = RawModeGuard::new();
        }

        let quit = Arc::clone(&self.quit);
        thread::Builder::new()
            .name("console-input".to_string())
            .spawn(move || {
                let stdin = io::stdin();
                let mut buffer = [0u8; 1];
                let mut escaped = false;
                loop {
                    match stdin.lock().read(&mut buffer) {
                        Ok(1) => {
                            let Some(frontend) = frontend.upgrade() else {
                                break;
                            };
                            let byte = buffer[0];
                            if escaped {
                                escaped = false;
                                if byte == b'x' {
                                    quit.store(true, Ordering::Release);
                                    break;
                                }
                                if byte != ESCAPE_PREFIX {
                                    deliver(frontend.as_ref(), &[ESCAPE_PREFIX]);
                                }
                            } else if byte == ESCAPE_PREFIX {
                                escaped = true;
                                continue;
                            }
                            if deliver(frontend.as_ref(), &buffer) == 0 {
                                log::trace!("[Console] frontend busy, dropped {:#04x}", byte);
                            }
                        }
                        Ok(0) => {
                            // EOF
                            quit.store(true, Ordering::Release);
                            break;
                        }
                        Err(e) => {
                            if e.kind() != io::ErrorKind::Interrupted {
                                log::warn!("[Console] stdin read failed: {}", e);
                                break;
                            }
                        }
                        _ => {}
                    }
                }
            })?;
        Ok(())
    }
}

/// RAII guard for Unix raw terminal mode.
#[cfg(unix)]
struct RawModeGuard {
    original: libc::termios,
}

#[cfg(unix)]
impl RawModeGuard {
    /// Switch stdin to raw mode. Returns `None` when stdin is not a terminal.
    fn new() -> Option<Self> {
        use std::mem::MaybeUninit;
        use std::os::unix::io::AsRawFd;

        let fd = io::stdin().as_raw_fd();
        let mut original = MaybeUninit::<libc::termios>::uninit();

        // SAFETY: `fd` is a valid descriptor for the lifetime of the
        // process and `original` is only read after tcgetattr filled it.
        unsafe {
            if libc::isatty(fd) != 1 || libc::tcgetattr(fd, original.as_mut_ptr()) != 0 {
                return None;
            }
            let original = original.assume_init();

            let mut raw = original;
            // Disable canonical mode and echo
            raw.c_lflag &= !(libc::ICANON | libc::ECHO);
            // Read returns after 1 byte
            raw.c_cc[libc::VMIN] = 1;
            raw.c_cc[libc::VTIME] = 0;

            libc::tcsetattr(fd, libc::TCSANOW, &raw);

            Some(Self { original })
        }
    }
}

#[cfg(unix)]
impl Drop for RawModeGuard {
    fn drop(&mut self) {
        use std::os::unix::io::AsRawFd;
        let fd = io::stdin().as_raw_fd();
        // SAFETY: restores the attributes captured in `new`.
        unsafe {
            libc::tcsetattr(fd, libc::TCSANOW, &self.original);
        }
        let _ = io::stdout().flush();
    }
}
