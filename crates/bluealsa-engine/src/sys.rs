//! Thin wrappers over the raw descriptors the I/O threads poll.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Retry-on-EINTR poll over a set of descriptors. A negative timeout
/// blocks indefinitely.
pub fn poll(fds: &mut [libc::pollfd], timeout_ms: i32) -> io::Result<usize> {
    loop {
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if ret >= 0 {
            return Ok(ret as usize);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }
}

/// Build a pollfd entry; a fd of -1 is skipped by the kernel.
pub fn pollfd(fd: RawFd, events: libc::c_short) -> libc::pollfd {
    libc::pollfd { fd, events, revents: 0 }
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let ret = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if ret >= 0 {
            return Ok(ret as usize);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }
}

pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    loop {
        let ret = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if ret >= 0 {
            return Ok(ret as usize);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }
}

/// A non-blocking unidirectional pipe, the transport control channel.
pub struct Pipe {
    pub rx: OwnedFd,
    pub tx: OwnedFd,
}

impl Pipe {
    pub fn new() -> io::Result<Self> {
        let mut fds = [0 as RawFd; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        unsafe { Ok(Pipe { rx: OwnedFd::from_raw_fd(fds[0]), tx: OwnedFd::from_raw_fd(fds[1]) }) }
    }
}

/// A blocking pipe pair for PCM audio; the reader side is made
/// non-blocking so the I/O threads never stall on a slow client.
pub fn audio_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    let (rx, tx) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    Ok((rx, tx))
}

/// A connected SOCK_SEQPACKET pair used for the PCM control protocol.
pub fn control_socketpair() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    let ret = unsafe {
        libc::socketpair(libc::AF_UNIX, libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC, 0, fds.as_mut_ptr())
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}

pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// One-shot timer descriptor, armed in milliseconds, polled alongside
/// the transport sockets.
pub struct TimerFd(OwnedFd);

impl TimerFd {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_CLOEXEC | libc::TFD_NONBLOCK)
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        unsafe { Ok(TimerFd(OwnedFd::from_raw_fd(fd))) }
    }

    fn settime(&self, msec: i64) -> io::Result<()> {
        let spec = libc::itimerspec {
            it_interval: libc::timespec { tv_sec: 0, tv_nsec: 0 },
            it_value: libc::timespec {
                tv_sec: msec / 1000,
                tv_nsec: (msec % 1000) * 1_000_000,
            },
        };
        let ret = unsafe { libc::timerfd_settime(self.0.as_raw_fd(), 0, &spec, std::ptr::null_mut()) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Arm the timer to expire once after `msec` milliseconds.
    pub fn arm(&self, msec: u64) -> io::Result<()> {
        self.settime(msec.max(1) as i64)
    }

    /// Disarm without reading a pending expiration.
    pub fn cancel(&self) -> io::Result<()> {
        self.settime(0)
    }

    /// Consume a pending expiration; false when none was pending.
    pub fn acknowledge(&self) -> bool {
        let mut buf = [0u8; 8];
        matches!(read(self.0.as_raw_fd(), &mut buf), Ok(8))
    }
}

impl AsRawFd for TimerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn pipe_transfers_bytes() {
        let pipe = Pipe::new().unwrap();
        assert_eq!(write(pipe.tx.as_raw_fd(), &[0x42]).unwrap(), 1);
        let mut buf = [0u8; 4];
        assert_eq!(read(pipe.rx.as_raw_fd(), &mut buf).unwrap(), 1);
        assert_eq!(buf[0], 0x42);
    }

    #[test]
    fn pipe_read_is_nonblocking() {
        let pipe = Pipe::new().unwrap();
        let mut buf = [0u8; 1];
        let err = read(pipe.rx.as_raw_fd(), &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn control_socketpair_preserves_datagrams() {
        let (a, b) = control_socketpair().unwrap();
        write(a.as_raw_fd(), b"Drain").unwrap();
        write(a.as_raw_fd(), b"OK").unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(read(b.as_raw_fd(), &mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"Drain");
        assert_eq!(read(b.as_raw_fd(), &mut buf).unwrap(), 2);
    }

    #[test]
    fn timerfd_expires_once() {
        let timer = TimerFd::new().unwrap();
        timer.arm(30).unwrap();
        let mut fds = [pollfd(timer.as_raw_fd(), libc::POLLIN)];
        let begin = Instant::now();
        let n = poll(&mut fds, 1000).unwrap();
        assert_eq!(n, 1);
        assert!(begin.elapsed() >= Duration::from_millis(25));
        assert!(timer.acknowledge());
        assert!(!timer.acknowledge());
    }

    #[test]
    fn timer_cancel_prevents_expiry() {
        let timer = TimerFd::new().unwrap();
        timer.arm(20).unwrap();
        timer.cancel().unwrap();
        let mut fds = [pollfd(timer.as_raw_fd(), libc::POLLIN)];
        assert_eq!(poll(&mut fds, 60).unwrap(), 0);
    }

    #[test]
    fn poll_times_out() {
        let pipe = Pipe::new().unwrap();
        let mut fds = [pollfd(pipe.rx.as_raw_fd(), libc::POLLIN)];
        let begin = Instant::now();
        assert_eq!(poll(&mut fds, 50).unwrap(), 0);
        assert!(begin.elapsed() >= Duration::from_millis(45));
    }
}
