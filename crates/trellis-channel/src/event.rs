//! Event-notify plumbing for fd-less work.
//!
//! A [`Notify`] is a nonblocking socket pair used as a wakeup primitive: the
//! producing side writes a byte, the consuming side exposes the read end as
//! a pollable fd and drains it once the buffered work is gone. Writes
//! coalesce — a full pipe already means "wake up", so `WouldBlock` on notify
//! is success.

use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

use trellis_types::{Error, Result};

/// Pollable wakeup primitive built on a nonblocking socket pair.
#[derive(Debug)]
pub struct Notify {
    rx: UnixStream,
    tx: UnixStream,
}

/// Cloneable producer half of a [`Notify`].
#[derive(Debug)]
pub struct Notifier {
    tx: UnixStream,
}

impl Notify {
    /// Creates a disarmed notify pair.
    pub fn new() -> Result<Self> {
        let (tx, rx) = UnixStream::pair()
            .map_err(|e| Error::invalid(format!("socket pair failed: {e}")))?;
        for s in [&tx, &rx] {
            s.set_nonblocking(true)
                .map_err(|e| Error::invalid(format!("set_nonblocking failed: {e}")))?;
        }
        Ok(Self { rx, tx })
    }

    /// The pollable fd: readable while armed.
    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.rx.as_raw_fd()
    }

    /// Arms the notify.
    pub fn notify(&self) -> Result<()> {
        notify_stream(&self.tx)
    }

    /// A producer handle usable from another thread.
    pub fn notifier(&self) -> Result<Notifier> {
        let tx = self
            .tx
            .try_clone()
            .map_err(|e| Error::invalid(format!("clone notify fd failed: {e}")))?;
        Ok(Notifier { tx })
    }

    /// Drains the armed state, then re-arms if `pending` says buffered work
    /// remains. Covers the race where a producer arms between the drain and
    /// the check.
    pub fn clear_if(&mut self, pending: impl Fn() -> bool) -> Result<()> {
        let mut buf = [0u8; 64];
        loop {
            match self.rx.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::invalid(format!("notify drain failed: {e}"))),
            }
        }
        if pending() {
            self.notify()?;
        }
        Ok(())
    }
}

impl Notifier {
    /// Arms the paired [`Notify`].
    pub fn notify(&self) -> Result<()> {
        notify_stream(&self.tx)
    }
}

fn notify_stream(tx: &UnixStream) -> Result<()> {
    match (&*tx).write(&[1u8]) {
        Ok(_) => Ok(()),
        // a full pipe is already armed
        Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(()),
        Err(e) => Err(Error::invalid(format!("notify failed: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn readable(notify: &Notify) -> bool {
        let mut probe = [0u8; 1];
        match (&notify.rx).read(&mut probe) {
            Ok(n) => n > 0,
            Err(_) => false,
        }
    }

    #[test]
    fn notify_then_clear() {
        let mut notify = Notify::new().unwrap();
        assert!(!readable(&notify));
        notify.notify().unwrap();
        assert!(readable(&notify));
        notify.clear_if(|| false).unwrap();
        assert!(!readable(&notify));
    }

    #[test]
    fn clear_rearms_when_pending() {
        let mut notify = Notify::new().unwrap();
        notify.notify().unwrap();
        notify.clear_if(|| true).unwrap();
        assert!(readable(&notify));
    }

    #[test]
    fn cross_thread_notifier() {
        let mut notify = Notify::new().unwrap();
        let notifier = notify.notifier().unwrap();
        std::thread::spawn(move || notifier.notify().unwrap())
            .join()
            .unwrap();
        notify.clear_if(|| false).unwrap();
    }

    #[test]
    fn notify_coalesces_when_full() {
        let notify = Notify::new().unwrap();
        // saturate the pipe; every notify after that must still succeed
        for _ in 0..100_000 {
            notify.notify().unwrap();
        }
    }
}
