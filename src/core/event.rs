/*
 * Copyright (C) 2020-2023 Fanout, Inc.
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

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token};
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn interest(self) -> Interest {
        match self {
            Self::In => Interest::READABLE,
            Self::Out => Interest::WRITABLE,
        }
    }
}

/// Registration primitives over a readiness multiplexer.
///
/// All three calls are idempotent: adding an already registered descriptor
/// replaces its interest, modifying an unknown descriptor registers it, and
/// removing an unknown descriptor succeeds.
pub trait Multiplexer {
    fn add(&self, fd: RawFd, interest: Interest) -> Result<(), io::Error>;

    fn modify(&self, fd: RawFd, interest: Interest) -> Result<(), io::Error>;

    fn remove(&self, fd: RawFd) -> Result<(), io::Error>;
}

pub fn fd_token(fd: RawFd) -> Token {
    Token(fd as usize)
}

pub struct MioMultiplexer {
    registry: Registry,
}

impl MioMultiplexer {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }
}

impl Multiplexer for MioMultiplexer {
    fn add(&self, fd: RawFd, interest: Interest) -> Result<(), io::Error> {
        let mut source = SourceFd(&fd);
        let token = fd_token(fd);

        match self.registry.register(&mut source, token, interest) {
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                self.registry.reregister(&mut source, token, interest)
            }
            ret => ret,
        }
    }

    fn modify(&self, fd: RawFd, interest: Interest) -> Result<(), io::Error> {
        let mut source = SourceFd(&fd);
        let token = fd_token(fd);

        match self.registry.reregister(&mut source, token, interest) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.registry.register(&mut source, token, interest)
            }
            ret => ret,
        }
    }

    fn remove(&self, fd: RawFd) -> Result<(), io::Error> {
        match self.registry.deregister(&mut SourceFd(&fd)) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            ret => ret,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
    pub hup: bool,
    pub error: bool,
}

impl Event {
    fn from_mio(e: &mio::event::Event) -> Self {
        Self {
            fd: e.token().0 as RawFd,
            readable: e.is_readable(),
            writable: e.is_writable(),
            hup: e.is_read_closed() || e.is_write_closed(),
            error: e.is_error(),
        }
    }
}

pub struct Poller {
    poll: Poll,
    events: Events,
}

impl Poller {
    pub fn new(events_max: usize) -> Result<Self, io::Error> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(events_max),
        })
    }

    pub fn multiplexer(&self) -> Result<MioMultiplexer, io::Error> {
        Ok(MioMultiplexer::new(self.poll.registry().try_clone()?))
    }

    /// Wait for readiness. A signal interrupting the wait yields an empty
    /// batch rather than an error.
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<Vec<Event>, io::Error> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }

        Ok(self.events.iter().map(Event::from_mio).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn readable_after_write() {
        let mut poller = Poller::new(16).unwrap();
        let mux = poller.multiplexer().unwrap();

        let (mut a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();

        mux.add(b.as_raw_fd(), Interest::READABLE).unwrap();

        a.write_all(b"hi").unwrap();

        let events = poller.poll(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].fd, b.as_raw_fd());
        assert!(events[0].readable);

        mux.remove(b.as_raw_fd()).unwrap();
    }

    #[test]
    fn idempotent_registration() {
        let poller = Poller::new(16).unwrap();
        let mux = poller.multiplexer().unwrap();

        let (_a, b) = UnixStream::pair().unwrap();
        let fd = b.as_raw_fd();

        // modify of an unknown fd registers it
        mux.modify(fd, Interest::WRITABLE).unwrap();

        // adding again replaces the interest
        mux.add(fd, Interest::READABLE).unwrap();
        let both = Interest::READABLE.add(Interest::WRITABLE);
        mux.add(fd, both).unwrap();

        mux.remove(fd).unwrap();
        mux.remove(fd).unwrap();
    }

    #[test]
    fn writable_and_hup() {
        let mut poller = Poller::new(16).unwrap();
        let mux = poller.multiplexer().unwrap();

        let (a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();

        mux.add(b.as_raw_fd(), Interest::READABLE.add(Interest::WRITABLE))
            .unwrap();

        drop(a);

        let events = poller.poll(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].hup);

        mux.remove(b.as_raw_fd()).unwrap();
    }
}
