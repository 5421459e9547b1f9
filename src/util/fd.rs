//! Thin owners of the Linux descriptors the engines multiplex on.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;
use std::{io, mem, ptr};

#[inline]
fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Read one 8-byte counter from a non-blocking eventfd/timerfd.
/// Returns 0 if nothing was pending.
fn read_counter(fd: RawFd) -> io::Result<u64> {
    let mut val = 0u64;
    // SAFETY: FFI; the buffer is 8 bytes as required by eventfd/timerfd.
    let ret = unsafe { libc::read(fd, &mut val as *mut u64 as *mut libc::c_void, 8) };
    if ret == 8 {
        return Ok(val);
    }
    let err = io::Error::last_os_error();
    match err.kind() {
        io::ErrorKind::WouldBlock => Ok(0),
        _ => Err(err),
    }
}

/// A non-blocking eventfd used as a one-shot cross-thread (or cross-boundary)
/// notification.
#[derive(Debug)]
pub struct EventFd {
    fd: OwnedFd,
}

impl EventFd {
    pub fn new() -> io::Result<Self> {
        // SAFETY: FFI.
        let raw = cvt(unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) })?;
        // SAFETY: fresh descriptor owned by us.
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(raw) },
        })
    }

    /// Add one to the counter, waking any waiter.
    pub fn signal(&self) -> io::Result<()> {
        let one = 1u64;
        // SAFETY: FFI with an 8-byte buffer.
        let ret = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                8,
            )
        };
        if ret == 8 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    /// Reset the counter and return how many signals were pending.
    pub fn drain(&self) -> io::Result<u64> {
        read_counter(self.fd.as_raw_fd())
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// A non-blocking monotonic timerfd.
#[derive(Debug)]
pub struct TimerFd {
    fd: OwnedFd,
    armed: bool,
}

impl TimerFd {
    pub fn new() -> io::Result<Self> {
        // SAFETY: FFI.
        let raw = cvt(unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        })?;
        // SAFETY: fresh descriptor owned by us.
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(raw) },
            armed: false,
        })
    }

    fn settime(&self, value: Duration, interval: Duration) -> io::Result<()> {
        let ts = |d: Duration| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        };
        let spec = libc::itimerspec {
            it_interval: ts(interval),
            it_value: ts(value),
        };
        // SAFETY: FFI with a valid itimerspec.
        cvt(unsafe { libc::timerfd_settime(self.fd.as_raw_fd(), 0, &spec, ptr::null_mut()) })?;
        Ok(())
    }

    /// Start firing every `interval`.
    pub fn arm(&mut self, interval: Duration) -> io::Result<()> {
        // A zero `it_value` would disarm instead.
        let interval = interval.max(Duration::from_nanos(1));
        self.settime(interval, interval)?;
        self.armed = true;
        Ok(())
    }

    pub fn disarm(&mut self) -> io::Result<()> {
        self.settime(Duration::ZERO, Duration::ZERO)?;
        self.armed = false;
        Ok(())
    }

    #[inline]
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Consume pending expirations. Returns their count.
    pub fn drain(&self) -> io::Result<u64> {
        read_counter(self.fd.as_raw_fd())
    }
}

impl AsRawFd for TimerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Level-triggered epoll set keyed by caller-chosen `u64` tokens.
pub struct Epoll {
    fd: OwnedFd,
    events: Vec<libc::epoll_event>,
}

impl Epoll {
    const MAX_EVENTS: usize = 64;

    pub fn new() -> io::Result<Self> {
        // SAFETY: FFI.
        let raw = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        Ok(Self {
            // SAFETY: fresh descriptor owned by us.
            fd: unsafe { OwnedFd::from_raw_fd(raw) },
            // SAFETY: `epoll_event` is plain old data.
            events: vec![unsafe { mem::zeroed() }; Self::MAX_EVENTS],
        })
    }

    /// Watch `fd` for readability, reporting it as `token`.
    pub fn add(&self, fd: RawFd, token: u64) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: token,
        };
        // SAFETY: FFI with a valid event.
        cvt(unsafe { libc::epoll_ctl(self.fd.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut ev) })?;
        Ok(())
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        // SAFETY: FFI; a null event is allowed for EPOLL_CTL_DEL since 2.6.9.
        cvt(unsafe {
            libc::epoll_ctl(
                self.fd.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                ptr::null_mut(),
            )
        })?;
        Ok(())
    }

    /// Block for at most `timeout` and append ready tokens to `ready`.
    /// Interrupted waits report nothing.
    pub fn wait(&mut self, timeout: Duration, ready: &mut Vec<u64>) -> io::Result<usize> {
        // SAFETY: FFI; the buffer holds `MAX_EVENTS` entries.
        let n = unsafe {
            libc::epoll_wait(
                self.fd.as_raw_fd(),
                self.events.as_mut_ptr(),
                Self::MAX_EVENTS as libc::c_int,
                timeout.as_millis().min(i32::MAX as u128) as libc::c_int,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::Interrupted => Ok(0),
                _ => Err(err),
            };
        }
        let n = n as usize;
        ready.extend(self.events[..n].iter().map(|ev| ev.u64));
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eventfd_counts_signals() {
        let efd = EventFd::new().unwrap();
        assert_eq!(efd.drain().unwrap(), 0);
        efd.signal().unwrap();
        efd.signal().unwrap();
        assert_eq!(efd.drain().unwrap(), 2);
        assert_eq!(efd.drain().unwrap(), 0);
    }

    #[test]
    fn epoll_reports_token() {
        let mut ep = Epoll::new().unwrap();
        let efd = EventFd::new().unwrap();
        ep.add(efd.as_raw_fd(), 42).unwrap();

        let mut ready = Vec::new();
        assert_eq!(ep.wait(Duration::ZERO, &mut ready).unwrap(), 0);

        efd.signal().unwrap();
        ep.wait(Duration::from_millis(100), &mut ready).unwrap();
        assert_eq!(ready, vec![42]);
    }

    #[test]
    fn timer_fires_and_disarms() {
        let mut timer = TimerFd::new().unwrap();
        timer.arm(Duration::from_millis(1)).unwrap();
        assert!(timer.is_armed());
        std::thread::sleep(Duration::from_millis(5));
        assert!(timer.drain().unwrap() >= 1);

        timer.disarm().unwrap();
        let _ = timer.drain().unwrap();
        std::thread::sleep(Duration::from_millis(3));
        assert_eq!(timer.drain().unwrap(), 0);
    }
}
