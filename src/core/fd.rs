/*
 * Copyright (C) 2023 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::core::event::{Direction, Multiplexer};
use crate::core::log::Logger;
use mio::Interest;
use std::cell::RefCell;
use std::fmt;
use std::io::{self, Read, Write};
use std::mem;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};

#[derive(Debug, thiserror::Error)]
pub enum FdError {
    #[error("descriptor already assigned")]
    AlreadyAssigned,

    #[error("descriptor not assigned")]
    NotAssigned,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// State shared by every guard of one event loop: the multiplexer, and the
/// list of descriptors released since the owner last looked, so it can
/// drop them from its lookup tables.
pub struct FdContext {
    mux: Box<dyn Multiplexer>,
    released: RefCell<Vec<RawFd>>,
    log: Logger,
}

impl FdContext {
    pub fn new(mux: Box<dyn Multiplexer>, log: Logger) -> Rc<Self> {
        Rc::new(Self {
            mux,
            released: RefCell::new(Vec::new()),
            log,
        })
    }

    pub fn take_released(&self) -> Vec<RawFd> {
        mem::take(&mut *self.released.borrow_mut())
    }

    fn notify_released(&self, fd: RawFd) {
        self.released.borrow_mut().push(fd);
    }
}

/// Sole owner of one descriptor.
///
/// Registration is tracked per direction and the multiplexer is only asked
/// to change anything when the tracked state actually changes. Releasing
/// the guard, explicitly or on drop, deregisters the descriptor before it
/// is closed.
pub struct FdGuard {
    ctx: Weak<FdContext>,
    fd: Option<OwnedFd>,
    registered_in: bool,
    registered_out: bool,
}

impl FdGuard {
    pub fn new(ctx: &Rc<FdContext>) -> Self {
        Self {
            ctx: Rc::downgrade(ctx),
            fd: None,
            registered_in: false,
            registered_out: false,
        }
    }

    pub fn with_fd<T: Into<OwnedFd>>(ctx: &Rc<FdContext>, fd: T) -> Self {
        let mut g = Self::new(ctx);
        g.fd = Some(fd.into());

        g
    }

    pub fn assign<T: Into<OwnedFd>>(&mut self, fd: T) -> Result<(), FdError> {
        if self.fd.is_some() {
            return Err(FdError::AlreadyAssigned);
        }

        self.fd = Some(fd.into());

        Ok(())
    }

    pub fn is_set(&self) -> bool {
        self.fd.is_some()
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|fd| fd.as_raw_fd())
    }

    pub fn as_fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(|fd| fd.as_fd())
    }

    pub fn is_registered(&self, dir: Direction) -> bool {
        match dir {
            Direction::In => self.registered_in,
            Direction::Out => self.registered_out,
        }
    }

    fn interest(registered_in: bool, registered_out: bool) -> Option<Interest> {
        match (registered_in, registered_out) {
            (true, true) => Some(Interest::READABLE.add(Interest::WRITABLE)),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    fn set_registered(&mut self, dir: Direction, value: bool) {
        match dir {
            Direction::In => self.registered_in = value,
            Direction::Out => self.registered_out = value,
        }
    }

    pub fn register_for(&mut self, dir: Direction) -> Result<(), FdError> {
        let ctx = match self.ctx.upgrade() {
            Some(ctx) => ctx,
            None => return Err(FdError::Io(io::Error::from(io::ErrorKind::NotConnected))),
        };

        let fd = match self.raw_fd() {
            Some(fd) => fd,
            None => {
                ctx.log.warn(format_args!("register {:?}: unset fd", dir));

                return Ok(());
            }
        };

        if self.is_registered(dir) {
            return Ok(());
        }

        let was_registered = self.registered_in || self.registered_out;

        let (mut want_in, mut want_out) = (self.registered_in, self.registered_out);
        match dir {
            Direction::In => want_in = true,
            Direction::Out => want_out = true,
        }

        // at least one direction is wanted here
        let interest = match Self::interest(want_in, want_out) {
            Some(i) => i,
            None => return Ok(()),
        };

        if was_registered {
            ctx.mux.modify(fd, interest)?;
        } else {
            ctx.mux.add(fd, interest)?;
        }

        self.set_registered(dir, true);

        Ok(())
    }

    pub fn deregister_for(&mut self, dir: Direction) -> Result<(), FdError> {
        let fd = match self.raw_fd() {
            Some(fd) => fd,
            None => return Ok(()),
        };

        if !self.is_registered(dir) {
            return Ok(());
        }

        let ctx = match self.ctx.upgrade() {
            Some(ctx) => ctx,
            None => return Err(FdError::Io(io::Error::from(io::ErrorKind::NotConnected))),
        };

        let (mut want_in, mut want_out) = (self.registered_in, self.registered_out);
        match dir {
            Direction::In => want_in = false,
            Direction::Out => want_out = false,
        }

        match Self::interest(want_in, want_out) {
            Some(interest) => ctx.mux.modify(fd, interest)?,
            None => ctx.mux.remove(fd)?,
        }

        self.set_registered(dir, false);

        Ok(())
    }

    // deregister from the multiplexer and let the context know the fd is
    // leaving its tables. returns the fd so the caller decides its fate
    fn detach(&mut self) -> Option<OwnedFd> {
        let fd = self.fd.take()?;
        let raw = fd.as_raw_fd();

        if let Some(ctx) = self.ctx.upgrade() {
            if self.registered_in || self.registered_out {
                if let Err(e) = ctx.mux.remove(raw) {
                    ctx.log.error(format_args!(
                        "failed to deregister fd {}: {}",
                        raw, e
                    ));
                }
            }

            ctx.notify_released(raw);
        }

        self.registered_in = false;
        self.registered_out = false;

        Some(fd)
    }

    /// Deregister, close, and return to the unset state. No-op if unset.
    pub fn release(&mut self) {
        // close happens when the OwnedFd is dropped
        self.detach();
    }

    /// Give up ownership without closing.
    pub fn take(&mut self) -> Option<OwnedFd> {
        self.detach()
    }
}

impl Drop for FdGuard {
    fn drop(&mut self) {
        self.release();
    }
}

impl PartialEq for FdGuard {
    fn eq(&self, other: &Self) -> bool {
        match (self.raw_fd(), other.raw_fd()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for FdGuard {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FdGuard")
            .field("fd", &self.raw_fd())
            .field("in", &self.registered_in)
            .field("out", &self.registered_out)
            .finish()
    }
}

impl Read for &FdGuard {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, io::Error> {
        let fd = match self.raw_fd() {
            Some(fd) => fd,
            None => return Err(io::Error::from(io::ErrorKind::NotConnected)),
        };

        // SAFETY: fd is owned by the guard and buf is valid for buf.len() bytes
        let ret = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };

        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(ret as usize)
    }
}

impl Write for &FdGuard {
    fn write(&mut self, buf: &[u8]) -> Result<usize, io::Error> {
        let fd = match self.raw_fd() {
            Some(fd) => fd,
            None => return Err(io::Error::from(io::ErrorKind::NotConnected)),
        };

        // SAFETY: fd is owned by the guard and buf is valid for buf.len() bytes
        let ret = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };

        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(ret as usize)
    }

    fn flush(&mut self) -> Result<(), io::Error> {
        Ok(())
    }
}

#[cfg(test)]
pub mod testutil {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum MuxOp {
        Add(RawFd, Interest),
        Modify(RawFd, Interest),
        Remove(RawFd),
    }

    /// Multiplexer that records calls instead of touching the kernel.
    #[derive(Clone, Default)]
    pub struct RecordingMux {
        pub ops: Rc<RefCell<Vec<MuxOp>>>,
    }

    impl Multiplexer for RecordingMux {
        fn add(&self, fd: RawFd, interest: Interest) -> Result<(), io::Error> {
            self.ops.borrow_mut().push(MuxOp::Add(fd, interest));

            Ok(())
        }

        fn modify(&self, fd: RawFd, interest: Interest) -> Result<(), io::Error> {
            self.ops.borrow_mut().push(MuxOp::Modify(fd, interest));

            Ok(())
        }

        fn remove(&self, fd: RawFd) -> Result<(), io::Error> {
            self.ops.borrow_mut().push(MuxOp::Remove(fd));

            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use crate::core::log::testutil::CaptureSink;
    use std::os::unix::net::UnixStream;
    use std::sync::Arc;

    fn setup() -> (Rc<FdContext>, RecordingMux, Arc<CaptureSink>) {
        let mux = RecordingMux::default();
        let sink = Arc::new(CaptureSink::default());
        let ctx = FdContext::new(Box::new(mux.clone()), Logger::new(sink.clone()));

        (ctx, mux, sink)
    }

    #[test]
    fn register_is_idempotent() {
        let (ctx, mux, _) = setup();
        let (a, _b) = UnixStream::pair().unwrap();

        let mut g = FdGuard::new(&ctx);
        g.assign(a).unwrap();
        let fd = g.raw_fd().unwrap();

        g.register_for(Direction::In).unwrap();
        g.register_for(Direction::In).unwrap();
        assert_eq!(*mux.ops.borrow(), vec![MuxOp::Add(fd, Interest::READABLE)]);

        g.register_for(Direction::Out).unwrap();
        assert_eq!(
            mux.ops.borrow()[1],
            MuxOp::Modify(fd, Interest::READABLE.add(Interest::WRITABLE))
        );

        g.deregister_for(Direction::In).unwrap();
        g.deregister_for(Direction::In).unwrap();
        assert_eq!(mux.ops.borrow().len(), 3);
        assert_eq!(mux.ops.borrow()[2], MuxOp::Modify(fd, Interest::WRITABLE));

        g.deregister_for(Direction::Out).unwrap();
        assert_eq!(mux.ops.borrow()[3], MuxOp::Remove(fd));
        assert!(!g.is_registered(Direction::Out));
    }

    #[test]
    fn release_is_idempotent() {
        let (ctx, mux, _) = setup();
        let (a, _b) = UnixStream::pair().unwrap();

        let mut g = FdGuard::with_fd(&ctx, a);
        let fd = g.raw_fd().unwrap();
        g.register_for(Direction::In).unwrap();

        g.release();
        g.release();

        assert!(!g.is_set());
        assert_eq!(
            *mux.ops.borrow(),
            vec![MuxOp::Add(fd, Interest::READABLE), MuxOp::Remove(fd)]
        );
        assert_eq!(ctx.take_released(), vec![fd]);
        assert!(ctx.take_released().is_empty());

        // fd is closed
        let ret = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        assert_eq!(ret, -1);
    }

    #[test]
    fn drop_releases() {
        let (ctx, mux, _) = setup();
        let (a, _b) = UnixStream::pair().unwrap();

        let fd = {
            let mut g = FdGuard::with_fd(&ctx, a);
            g.register_for(Direction::Out).unwrap();

            g.raw_fd().unwrap()
        };

        assert_eq!(mux.ops.borrow().last(), Some(&MuxOp::Remove(fd)));
        assert_eq!(ctx.take_released(), vec![fd]);
    }

    #[test]
    fn unregistered_release_skips_mux() {
        let (ctx, mux, _) = setup();
        let (a, _b) = UnixStream::pair().unwrap();

        let mut g = FdGuard::with_fd(&ctx, a);
        g.release();

        assert!(mux.ops.borrow().is_empty());
        assert_eq!(ctx.take_released().len(), 1);
    }

    #[test]
    fn assign_twice() {
        let (ctx, _, _) = setup();
        let (a, b) = UnixStream::pair().unwrap();

        let mut g = FdGuard::new(&ctx);
        g.assign(a).unwrap();

        assert!(matches!(g.assign(b), Err(FdError::AlreadyAssigned)));
    }

    #[test]
    fn unset_register_logs() {
        let (ctx, mux, sink) = setup();

        let mut g = FdGuard::new(&ctx);
        g.register_for(Direction::In).unwrap();

        assert!(mux.ops.borrow().is_empty());
        assert!(sink.contains(log::Level::Warn, "unset descriptor"));
    }

    #[test]
    fn take_keeps_fd_open() {
        let (ctx, _, _) = setup();
        let (a, _b) = UnixStream::pair().unwrap();

        let mut g = FdGuard::with_fd(&ctx, a);
        let fd = FdGuard::take(&mut g).unwrap();

        assert!(!g.is_set());

        let ret = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFD) };
        assert!(ret >= 0);
    }

    #[test]
    fn read_write() {
        let (ctx, _, _) = setup();
        let (a, b) = UnixStream::pair().unwrap();

        let ga = FdGuard::with_fd(&ctx, a);
        let gb = FdGuard::with_fd(&ctx, b);

        assert_eq!((&ga).write(b"ping").unwrap(), 4);

        let mut buf = [0; 8];
        assert_eq!((&gb).read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");

        assert!(ga != gb);
    }
}
