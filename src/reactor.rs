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

//! The event loop: one thread waits on the multiplexer, accepts clients,
//! routes readiness to connections, applies their registration changes and
//! evicts the ones that ran out of time.

use crate::config::{Config, ServerConfig};
use crate::connection::Outcome;
use crate::core::event::{Direction, Poller};
use crate::core::fd::{FdContext, FdError, FdGuard};
use crate::core::log::Logger;
use crate::core::net::{self, LISTEN_BACKLOG};
use crate::handler::{Handler, Renderer};
use crate::server::Server;
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    #[error("failed to listen on {0}: {1}")]
    Listen(SocketAddr, io::Error),

    #[error("multiplexer failure: {0}")]
    Poll(io::Error),

    #[error(transparent)]
    Fd(#[from] FdError),
}

struct Listener {
    guard: FdGuard,
    server: usize,
    // the backlog may still hold clients. readiness is reported once per
    // edge, so accepting resumes from here when there is room again
    pending: bool,
}

pub struct Reactor {
    poller: Poller,
    ctx: Rc<FdContext>,
    listeners: HashMap<RawFd, Listener>,
    servers: Vec<Server>,
    owners: HashMap<RawFd, (usize, usize)>,
    handler: Box<dyn Handler>,
    renderer: Box<dyn Renderer>,
    max_connections: usize,
    poll_timeout: Duration,
    stop: Arc<AtomicBool>,
    children: Arc<AtomicBool>,
    log: Logger,
}

impl Reactor {
    pub fn new(
        config: &Config,
        handler: Box<dyn Handler>,
        renderer: Box<dyn Renderer>,
        log: Logger,
    ) -> Result<Self, ReactorError> {
        let poller = Poller::new(config.max_poll_events).map_err(ReactorError::Poll)?;
        let mux = poller.multiplexer().map_err(ReactorError::Poll)?;
        let ctx = FdContext::new(Box::new(mux), log.clone());

        // one listener per port, in configuration order
        let mut groups: Vec<Vec<ServerConfig>> = Vec::new();
        for s in config.servers.iter() {
            match groups.iter_mut().find(|g| g[0].port == s.port) {
                Some(g) => g.push(s.clone()),
                None => groups.push(vec![s.clone()]),
            }
        }

        let mut listeners = HashMap::new();
        let mut servers = Vec::new();

        for vhosts in groups {
            let addr = SocketAddr::new(vhosts[0].host, vhosts[0].port);

            let fd = net::bind_listener(addr, LISTEN_BACKLOG)
                .map_err(|e| ReactorError::Listen(addr, e))?;

            let mut guard = FdGuard::with_fd(&ctx, fd);
            guard.register_for(Direction::In)?;

            let raw = match guard.raw_fd() {
                Some(raw) => raw,
                None => return Err(ReactorError::Fd(FdError::NotAssigned)),
            };

            log.info(format_args!(
                "listening on {} for {}",
                addr,
                vhosts
                    .iter()
                    .map(|s| s.name.as_str())
                    .collect::<Vec<&str>>()
                    .join(", ")
            ));

            listeners.insert(
                raw,
                Listener {
                    guard,
                    server: servers.len(),
                    pending: true,
                },
            );

            servers.push(Server::new(vhosts, log.with_target("webserv::server")));
        }

        Ok(Self {
            poller,
            ctx,
            listeners,
            servers,
            owners: HashMap::new(),
            handler,
            renderer,
            max_connections: config.max_connections,
            poll_timeout: config.max_poll_timeout,
            stop: Arc::new(AtomicBool::new(false)),
            children: Arc::new(AtomicBool::new(false)),
            log,
        })
    }

    /// Bound addresses, in no particular order.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .values()
            .filter_map(|l| l.guard.as_fd())
            .filter_map(|fd| net::local_addr(fd).ok())
            .collect()
    }

    /// Set to stop the loop after the current iteration.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Set when children may be waiting to be reaped.
    pub fn children_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.children)
    }

    pub fn connection_count(&self) -> usize {
        self.servers.iter().map(|s| s.len()).sum()
    }

    pub fn run(&mut self) -> Result<(), ReactorError> {
        while !self.stop.load(Ordering::Relaxed) {
            self.run_once()?;
        }

        self.log.info(format_args!(
            "stopping with {} connections open",
            self.connection_count()
        ));

        Ok(())
    }

    /// One wait on the multiplexer and everything that follows from it.
    pub fn run_once(&mut self) -> Result<(), ReactorError> {
        let events = self
            .poller
            .poll(Some(self.poll_timeout))
            .map_err(ReactorError::Poll)?;

        let now = Instant::now();

        // descriptors closed during this batch. later events for them
        // describe the old descriptor, even if the number was reused
        let mut stale = HashSet::new();

        for ev in events.iter() {
            if stale.contains(&ev.fd) {
                self.log.debug(format_args!("fd {}: stale event", ev.fd));

                continue;
            }

            if let Some(l) = self.listeners.get_mut(&ev.fd) {
                l.pending = true;

                continue;
            }

            let (server, key) = match self.owners.get(&ev.fd) {
                Some(owner) => *owner,
                None => {
                    self.log.error(format_args!("fd {}: unowned event", ev.fd));

                    continue;
                }
            };

            let out = self.servers[server].handle_event(
                key,
                ev,
                self.handler.as_mut(),
                self.renderer.as_ref(),
                now,
            );

            self.collect_released(&mut stale);

            if let Some(out) = out {
                self.apply(server, key, out);
                self.collect_released(&mut stale);
            }
        }

        self.accept_pending(now);

        for server in self.servers.iter_mut() {
            server.sweep(now);
        }

        self.collect_released(&mut stale);

        if self.children.swap(false, Ordering::Relaxed) {
            reap_children(&self.log);
        }

        Ok(())
    }

    fn accept_pending(&mut self, now: Instant) {
        let mut count = self.connection_count();

        for (fd, l) in self.listeners.iter_mut() {
            while l.pending {
                if count >= self.max_connections {
                    // retried on the next iteration
                    return;
                }

                let listener = match l.guard.as_fd() {
                    Some(listener) => listener,
                    None => break,
                };

                let (socket, peer) = match net::accept(listener, &self.log) {
                    Ok(Some(ret)) => ret,
                    Ok(None) => {
                        l.pending = false;

                        break;
                    }
                    Err(e) => {
                        self.log.error(format_args!("fd {}: accept failed: {}", fd, e));

                        match accept_retry(&e) {
                            AcceptRetry::Next => continue,
                            AcceptRetry::Later => break,
                            AcceptRetry::Drop => {
                                l.pending = false;

                                break;
                            }
                        }
                    }
                };

                let server = &mut self.servers[l.server];
                let (key, out) = server.add_connection(&self.ctx, socket, now);

                if let Some(sock) = server.socket_fd(key) {
                    self.owners.insert(sock, (l.server, key));

                    self.log.debug(format_args!(
                        "fd {}: accepted {:?} on port {}",
                        sock,
                        peer,
                        server.port()
                    ));
                }

                count += 1;

                apply_outcome(
                    &mut self.servers[l.server],
                    &mut self.owners,
                    &self.log,
                    l.server,
                    key,
                    out,
                );
            }
        }
    }

    fn apply(&mut self, server: usize, key: usize, out: Outcome) {
        apply_outcome(
            &mut self.servers[server],
            &mut self.owners,
            &self.log,
            server,
            key,
            out,
        );
    }

    fn collect_released(&mut self, stale: &mut HashSet<RawFd>) {
        for fd in self.ctx.take_released() {
            self.owners.remove(&fd);
            stale.insert(fd);
        }
    }
}

fn apply_outcome(
    server: &mut Server,
    owners: &mut HashMap<RawFd, (usize, usize)>,
    log: &Logger,
    server_id: usize,
    key: usize,
    out: Outcome,
) {
    if out.finished {
        server.remove(key);

        return;
    }

    let changes = out
        .register
        .iter()
        .map(|c| (c, true))
        .chain(out.deregister.iter().map(|c| (c, false)));

    for (&(fd, dir), enable) in changes {
        if let Err(e) = server.set_interest(key, fd, dir, enable) {
            log.error(format_args!("fd {}: registration failed: {}", fd, e));

            server.remove(key);

            return;
        }

        if enable {
            owners.insert(fd, (server_id, key));
        }
    }
}

#[derive(Debug, PartialEq)]
enum AcceptRetry {
    // the failure concerned one client. the backlog may hold more
    Next,
    // out of resources. keep the backlog pending for the next iteration
    Later,
    Drop,
}

fn accept_retry(e: &io::Error) -> AcceptRetry {
    match e.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted => return AcceptRetry::Next,
        _ => {}
    }

    match e.raw_os_error() {
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM) => {
            AcceptRetry::Later
        }
        Some(libc::EPROTO) | Some(libc::EPERM) => AcceptRetry::Next,
        _ => AcceptRetry::Drop,
    }
}

fn reap_children(log: &Logger) {
    loop {
        let mut status: libc::c_int = 0;

        // SAFETY: non-blocking wait for any child
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };

        if pid <= 0 {
            break;
        }

        log.debug(format_args!("reaped child {} (status {})", pid, status));
    }
}
