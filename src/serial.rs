//! Serial transport: a framed byte pipe over a termios-configured fd.
//!
//! This layer does no interpretation of content — [`AtDialogue`](crate::at::AtDialogue)
//! owns the AT protocol on top of it. Kept deliberately low-level (raw
//! `nix::fcntl`/`nix::sys::termios` over a fd we own) rather than wrapped in
//! an async serial crate, so the blocking read/write primitives can be
//! offloaded to a dedicated thread the way §5 describes.

use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use nix::sys::termios::{self, BaudRate, SetArg, SpecialCharacterIndices};
use nix::unistd;

use crate::error::SmsError;

/// Safety: caller must ensure `fd` stays open for the lifetime of the
/// returned `BorrowedFd`.
unsafe fn borrow_fd(fd: RawFd) -> BorrowedFd<'static> {
    BorrowedFd::borrow_raw(fd)
}

/// A single open serial port, 8N1 framing at a configured baud rate.
///
/// Not `Clone` — exactly one owner drives the fd at a time. The modem
/// session wraps this behind a dedicated OS thread (see `modem::session`).
pub struct SerialTransport {
    fd: RawFd,
    device: String,
}

impl SerialTransport {
    /// Open `device` and configure raw 8N1 framing at `baud`.
    ///
    /// `PortUnavailable` on open failure; `TransportBroken` if termios
    /// configuration fails on an otherwise-open fd.
    pub fn open(device: &str, baud: u32) -> Result<Self, SmsError> {
        let fd = fcntl::open(
            device,
            OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_NONBLOCK,
            Mode::empty(),
        )
        .map_err(|e| SmsError::PortUnavailable(format!("open {device}: {e}")))?;

        let flags = fcntl::fcntl(fd, fcntl::FcntlArg::F_GETFL)
            .map_err(|e| SmsError::TransportBroken(format!("F_GETFL {device}: {e}")))?;
        let mut oflags = OFlag::from_bits_truncate(flags);
        oflags.remove(OFlag::O_NONBLOCK);
        fcntl::fcntl(fd, fcntl::FcntlArg::F_SETFL(oflags))
            .map_err(|e| SmsError::TransportBroken(format!("F_SETFL {device}: {e}")))?;

        configure_termios(fd, baud)
            .map_err(|e| SmsError::TransportBroken(format!("termios {device}: {e}")))?;

        // SAFETY: fd was just opened above and is owned by this function.
        unsafe {
            termios::tcflush(borrow_fd(fd), termios::FlushArg::TCIOFLUSH)
                .map_err(|e| SmsError::TransportBroken(format!("tcflush {device}: {e}")))?;
        }

        Ok(Self {
            fd,
            device: device.to_string(),
        })
    }

    /// Write raw bytes. Blocking.
    pub fn write(&self, bytes: &[u8]) -> Result<(), SmsError> {
        // SAFETY: self.fd is open for the lifetime of self.
        let bfd = unsafe { borrow_fd(self.fd) };
        unistd::write(bfd, bytes)
            .map_err(|e| SmsError::TransportBroken(format!("write {}: {e}", self.device)))?;
        Ok(())
    }

    /// Read whatever is available right now (one VTIME-bounded read), never
    /// blocking longer than the termios idle timeout configured at open.
    pub fn read_available(&self) -> Result<Vec<u8>, SmsError> {
        let mut buf = [0u8; 1024];
        match unistd::read(self.fd, &mut buf) {
            Ok(n) => Ok(buf[..n].to_vec()),
            Err(nix::errno::Errno::EAGAIN) => Ok(Vec::new()),
            Err(e) => Err(SmsError::TransportBroken(format!(
                "read {}: {e}",
                self.device
            ))),
        }
    }

    /// Poll `read_available` in a loop until `deadline`, calling `on_chunk`
    /// for each non-empty chunk. Returns once `on_chunk` reports it has seen
    /// a terminator (returns `true`) or the deadline passes.
    pub fn poll_until(
        &self,
        deadline: Instant,
        mut on_chunk: impl FnMut(&[u8]) -> bool,
    ) -> Result<(), SmsError> {
        loop {
            if Instant::now() >= deadline {
                return Ok(());
            }
            let chunk = self.read_available()?;
            if !chunk.is_empty() && on_chunk(&chunk) {
                return Ok(());
            }
        }
    }

    pub fn flush_input(&self) -> Result<(), SmsError> {
        let bfd = unsafe { borrow_fd(self.fd) };
        termios::tcflush(bfd, termios::FlushArg::TCIFLUSH)
            .map_err(|e| SmsError::TransportBroken(format!("flush_input {}: {e}", self.device)))
    }

    pub fn flush_output(&self) -> Result<(), SmsError> {
        let bfd = unsafe { borrow_fd(self.fd) };
        termios::tcflush(bfd, termios::FlushArg::TCOFLUSH)
            .map_err(|e| SmsError::TransportBroken(format!("flush_output {}: {e}", self.device)))
    }

    #[must_use]
    pub fn device(&self) -> &str {
        &self.device
    }

    /// A transport over `/dev/null` with no termios configuration, for
    /// tests that need a session holding a real fd without a physical
    /// modem attached. Never used outside `#[cfg(test)]` callers.
    #[cfg(test)]
    pub(crate) fn open_null() -> Self {
        let fd = fcntl::open("/dev/null", OFlag::O_RDWR, Mode::empty())
            .expect("open /dev/null for test transport");
        Self {
            fd,
            device: "/dev/null".to_string(),
        }
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        let _ = unistd::close(self.fd);
    }
}

/// Configure raw mode, the given baud, 8N1, no flow control. `VMIN=0,
/// VTIME=1` → reads return after ~100ms of silence, giving the caller a
/// bounded-latency poll loop rather than an indefinite block.
fn configure_termios(fd: RawFd, baud: u32) -> Result<(), String> {
    let borrowed = unsafe { borrow_fd(fd) };
    let mut tio = termios::tcgetattr(borrowed).map_err(|e| format!("tcgetattr: {e}"))?;

    termios::cfmakeraw(&mut tio);

    let rate = baud_rate(baud)?;
    termios::cfsetispeed(&mut tio, rate).map_err(|e| format!("cfsetispeed: {e}"))?;
    termios::cfsetospeed(&mut tio, rate).map_err(|e| format!("cfsetospeed: {e}"))?;

    tio.control_flags |= termios::ControlFlags::CLOCAL | termios::ControlFlags::CREAD;
    tio.control_flags &= !termios::ControlFlags::CRTSCTS;

    tio.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
    tio.control_chars[SpecialCharacterIndices::VTIME as usize] = 1;

    termios::tcsetattr(borrowed, SetArg::TCSANOW, &tio).map_err(|e| format!("tcsetattr: {e}"))?;
    Ok(())
}

fn baud_rate(baud: u32) -> Result<BaudRate, String> {
    match baud {
        9600 => Ok(BaudRate::B9600),
        19200 => Ok(BaudRate::B19200),
        38400 => Ok(BaudRate::B38400),
        57600 => Ok(BaudRate::B57600),
        115_200 => Ok(BaudRate::B115200),
        230_400 => Ok(BaudRate::B230400),
        other => Err(format!("unsupported baud rate {other}")),
    }
}

/// Wall-clock deadline `duration_ms` milliseconds from now.
#[must_use]
pub fn deadline_ms(duration_ms: u64) -> Instant {
    Instant::now() + Duration::from_millis(duration_ms)
}
