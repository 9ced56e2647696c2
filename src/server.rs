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

use crate::config::ServerConfig;
use crate::connection::{Connection, Outcome, Services};
use crate::core::event::{Direction, Event};
use crate::core::fd::{FdContext, FdError, FdGuard};
use crate::core::http1::Limits;
use crate::core::log::Logger;
use crate::handler::{Handler, Renderer};
use slab::Slab;
use std::os::unix::io::{OwnedFd, RawFd};
use std::rc::Rc;
use std::time::{Duration, Instant};

/// The connections accepted on one listening port, and the server
/// configurations sharing that port.
pub struct Server {
    vhosts: Vec<ServerConfig>,
    limits: Limits,
    request_timeout: Duration,
    heartbeat_timeout: Duration,
    conns: Slab<Connection>,
    log: Logger,
}

impl Server {
    /// `vhosts` must not be empty. The first entry supplies the limits and
    /// is the fallback for unknown host names.
    pub fn new(vhosts: Vec<ServerConfig>, log: Logger) -> Self {
        let (limits, request_timeout, heartbeat_timeout) = match vhosts.first() {
            Some(s) => (
                Limits {
                    max_headers_size: s.max_headers_size,
                    max_body_size: s.max_request_size,
                },
                s.request_timeout,
                s.heartbeat_timeout,
            ),
            None => (
                Limits {
                    max_headers_size: 0,
                    max_body_size: 0,
                },
                Duration::from_millis(0),
                Duration::from_millis(0),
            ),
        };

        Self {
            vhosts,
            limits,
            request_timeout,
            heartbeat_timeout,
            conns: Slab::new(),
            log,
        }
    }

    pub fn port(&self) -> u16 {
        self.vhosts.first().map(|s| s.port).unwrap_or(0)
    }

    pub fn vhosts(&self) -> &[ServerConfig] {
        &self.vhosts
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn add_connection(
        &mut self,
        ctx: &Rc<FdContext>,
        socket: OwnedFd,
        now: Instant,
    ) -> (usize, Outcome) {
        let port = self.port();
        let entry = self.conns.vacant_entry();
        let key = entry.key();

        let conn = entry.insert(Connection::new(
            FdGuard::with_fd(ctx, socket),
            FdGuard::new(ctx),
            FdGuard::new(ctx),
            self.limits,
            port,
            now,
            self.log.clone(),
        ));

        (key, conn.start())
    }

    pub fn socket_fd(&self, key: usize) -> Option<RawFd> {
        self.conns.get(key).and_then(|c| c.socket_fd())
    }

    /// Route one event to the connection at `key`.
    pub fn handle_event(
        &mut self,
        key: usize,
        ev: &Event,
        handler: &mut dyn Handler,
        renderer: &dyn Renderer,
        now: Instant,
    ) -> Option<Outcome> {
        let conn = match self.conns.get_mut(key) {
            Some(conn) => conn,
            None => {
                self.log.error(format_args!("no connection {}", key));

                return None;
            }
        };

        let mut svc = Services {
            handler,
            renderer,
            vhosts: &self.vhosts,
        };

        if conn.socket_fd() == Some(ev.fd) {
            Some(conn.on_socket_event(ev, &mut svc, now))
        } else {
            Some(conn.on_aux_event(ev.fd, ev, &mut svc, now))
        }
    }

    pub fn set_interest(
        &mut self,
        key: usize,
        fd: RawFd,
        dir: Direction,
        enable: bool,
    ) -> Result<(), FdError> {
        match self.conns.get_mut(key) {
            Some(conn) => conn.set_interest(fd, dir, enable),
            None => Err(FdError::NotAssigned),
        }
    }

    /// Drop the connection. Its descriptors are deregistered and closed.
    pub fn remove(&mut self, key: usize) -> Option<Connection> {
        self.conns.try_remove(key)
    }

    /// Terminate every connection past its deadlines. Returns how many.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let expired: Vec<usize> = self
            .conns
            .iter()
            .filter(|(_, c)| c.is_expired(now, self.request_timeout, self.heartbeat_timeout))
            .map(|(key, _)| key)
            .collect();

        for key in expired.iter() {
            if let Some(mut conn) = self.conns.try_remove(*key) {
                conn.expire();

                self.log.info(format_args!(
                    "fd {:?}: timed out ({:?})",
                    conn.socket_fd(),
                    conn.error()
                ));
            }
        }

        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::core::fd::testutil::{MuxOp, RecordingMux};
    use crate::core::log::testutil::CaptureSink;
    use crate::handler::{DefaultHandler, DefaultRenderer};
    use log::Level;
    use std::os::unix::net::UnixStream;
    use std::sync::Arc;

    const CONFIG: &str = r#"{
        "global_request_timeout": 1000,
        "max_heartbeat_timeout": 500,
        "servers": [
            { "server_name": "a.com", "port": 8080, "locations": { "/": { "root": "/nonexistent" } } },
            { "server_name": "b.com", "port": 8080, "locations": { "/": { "root": "/nonexistent" } } }
        ]
    }"#;

    fn setup() -> (Rc<FdContext>, RecordingMux, Server) {
        let mux = RecordingMux::default();
        let log = Logger::new(Arc::new(CaptureSink::default()));
        let ctx = FdContext::new(Box::new(mux.clone()), log.clone());
        let server = Server::new(Config::from_json(CONFIG).unwrap().servers, log);

        (ctx, mux, server)
    }

    #[test]
    fn add_and_remove() {
        let (ctx, mux, mut server) = setup();
        assert_eq!(server.port(), 8080);
        assert_eq!(server.vhosts().len(), 2);

        let (a, _b) = UnixStream::pair().unwrap();
        let (key, out) = server.add_connection(&ctx, a.into(), Instant::now());
        let fd = server.socket_fd(key).unwrap();

        assert_eq!(out.register.as_slice(), &[(fd, Direction::In)]);
        server.set_interest(key, fd, Direction::In, true).unwrap();
        assert_eq!(server.len(), 1);

        assert!(server.remove(key).is_some());
        assert!(server.is_empty());
        assert_eq!(mux.ops.borrow().last(), Some(&MuxOp::Remove(fd)));
        assert_eq!(ctx.take_released(), vec![fd]);

        assert!(server.set_interest(key, fd, Direction::In, true).is_err());
    }

    #[test]
    fn sweep_expires() {
        let (ctx, _mux, mut server) = setup();
        let now = Instant::now();

        let (a, _b) = UnixStream::pair().unwrap();
        server.add_connection(&ctx, a.into(), now);
        let (c, _d) = UnixStream::pair().unwrap();
        server.add_connection(&ctx, c.into(), now + Duration::from_millis(400));

        assert_eq!(server.sweep(now + Duration::from_millis(300)), 0);
        assert_eq!(server.sweep(now + Duration::from_millis(600)), 1);
        assert_eq!(server.len(), 1);
        assert_eq!(server.sweep(now + Duration::from_millis(1000)), 1);
        assert!(server.is_empty());
    }

    #[test]
    fn event_for_missing_key() {
        let sink = Arc::new(CaptureSink::default());
        let mut server = Server::new(
            Config::from_json(CONFIG).unwrap().servers,
            Logger::new(sink.clone()),
        );
        let mut handler = DefaultHandler::new(Logger::global());
        let renderer = DefaultRenderer::default();

        let ev = Event {
            fd: 0,
            readable: true,
            writable: false,
            hup: false,
            error: false,
        };

        assert!(server
            .handle_event(3, &ev, &mut handler, &renderer, Instant::now())
            .is_none());
        assert!(sink.contains(Level::Error, "no connection 3"));
    }
}
