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

//! Per-client state machine.
//!
//! A connection moves through the states of `ConnectionState` as readiness
//! arrives on its socket and on the pipes of any delegated process. It
//! never touches the multiplexer: every call returns an `Outcome` listing
//! the registration changes the owner has to apply.

use crate::config::ServerConfig;
use crate::core::buffer::{ChunkedBuffer, DrainStatus, FillStatus};
use crate::core::event::{Direction, Event};
use crate::core::fd::{FdError, FdGuard};
use crate::core::http1::util::find_subslice;
use crate::core::http1::{
    BodySize, Limits, ParseStatus, ParsedRequest, RequestError, RequestParser, Version,
};
use crate::core::log::Logger;
use crate::handler::{Handler, Payload, Renderer, Response, ResponseHead};
use arrayvec::ArrayVec;
use std::cmp;
use std::fs::File;
use std::io::{self, Read};
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

pub const BUFFER_CAPACITY: usize = 16384;
pub const BUFFER_BLOCK_SIZE: usize = 1024;

const OUTCOME_MAX: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    HeaderParsing,
    HeaderProcessing,
    BodyProcessing,
    ResponseHeaderProcessing,
    Responding,
    Done,
    Terminated,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Fd(#[from] FdError),

    #[error("event for descriptor {0} which the connection does not own")]
    UnknownDescriptor(RawFd),

    #[error("auxiliary event while {0:?}")]
    UnexpectedAuxEvent(ConnectionState),
}

/// Side effects for the owner to apply after an event call.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Outcome {
    pub finished: bool,
    pub register: ArrayVec<(RawFd, Direction), OUTCOME_MAX>,
    pub deregister: ArrayVec<(RawFd, Direction), OUTCOME_MAX>,
}

/// Collaborators and configuration a connection needs while handling an
/// event. `vhosts` holds every server configured on the connection's port;
/// the first one is the default.
pub struct Services<'a> {
    pub handler: &'a mut dyn Handler,
    pub renderer: &'a dyn Renderer,
    pub vhosts: &'a [ServerConfig],
}

// pick the server by host name, falling back to the port's first server
fn vhost<'a>(vhosts: &'a [ServerConfig], host: Option<&str>) -> Option<&'a ServerConfig> {
    if let Some(host) = host {
        if let Some(s) = vhosts.iter().find(|s| s.name == host) {
            return Some(s);
        }
    }

    vhosts.first()
}

enum Body {
    None,
    Generated { data: Vec<u8>, pos: usize },
    File { file: File, remaining: u64 },
    Process(ProcessOutput),
}

struct ProcessOutput {
    head: Vec<u8>,
    head_done: bool,
    eof: bool,
}

// readiness seen but not yet consumed. the multiplexer reports edges, so
// each flag stays set until an operation hits WouldBlock
#[derive(Default)]
struct Readiness {
    socket_read: bool,
    socket_write: bool,
    input_write: bool,
    output_read: bool,
}

pub struct Connection {
    socket: FdGuard,
    input: FdGuard,
    output: FdGuard,
    state: ConnectionState,
    error: Option<u16>,
    created: Instant,
    last_active: Instant,
    body_expected: usize,
    body_received: usize,
    response_expected: Option<usize>,
    response_sent: usize,
    read_buf: ChunkedBuffer,
    write_buf: ChunkedBuffer,
    aux_buf: ChunkedBuffer,
    parser: RequestParser,
    request: Option<ParsedRequest>,
    head: Vec<u8>,
    head_pos: usize,
    body: Body,
    input_pos: usize,
    version: Version,
    keep_alive: bool,
    ready: Readiness,
    log: Logger,
}

impl Connection {
    pub fn new(
        socket: FdGuard,
        input: FdGuard,
        output: FdGuard,
        limits: Limits,
        default_port: u16,
        now: Instant,
        log: Logger,
    ) -> Self {
        Self {
            socket,
            input,
            output,
            state: ConnectionState::HeaderParsing,
            error: None,
            created: now,
            last_active: now,
            body_expected: 0,
            body_received: 0,
            response_expected: None,
            response_sent: 0,
            read_buf: ChunkedBuffer::new(BUFFER_CAPACITY, BUFFER_BLOCK_SIZE),
            write_buf: ChunkedBuffer::new(BUFFER_CAPACITY, BUFFER_BLOCK_SIZE),
            aux_buf: ChunkedBuffer::new(BUFFER_CAPACITY, BUFFER_BLOCK_SIZE),
            parser: RequestParser::new(limits, default_port),
            request: None,
            head: Vec::new(),
            head_pos: 0,
            body: Body::None,
            input_pos: 0,
            version: Version::Http11,
            keep_alive: true,
            ready: Readiness::default(),
            log,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn error(&self) -> Option<u16> {
        self.error
    }

    pub fn socket_fd(&self) -> Option<RawFd> {
        self.socket.raw_fd()
    }

    pub fn owns(&self, fd: RawFd) -> bool {
        [&self.socket, &self.input, &self.output]
            .iter()
            .any(|g| g.raw_fd() == Some(fd))
    }

    pub fn response_sent(&self) -> usize {
        self.response_sent
    }

    pub fn body_received(&self) -> usize {
        self.body_received
    }

    /// Initial registrations after accept.
    pub fn start(&mut self) -> Outcome {
        self.ready.socket_read = true;

        self.outcome()
    }

    pub fn on_socket_event(&mut self, ev: &Event, svc: &mut Services, now: Instant) -> Outcome {
        if ev.error {
            self.log.debug(format_args!(
                "fd {:?}: socket error reported",
                self.socket.raw_fd()
            ));

            return self.terminate();
        }

        if ev.readable || ev.hup {
            self.ready.socket_read = true;
        }

        if ev.writable {
            self.ready.socket_write = true;
        }

        self.drive(svc, now)
    }

    pub fn on_aux_event(
        &mut self,
        fd: RawFd,
        ev: &Event,
        svc: &mut Services,
        now: Instant,
    ) -> Outcome {
        if let Err(e) = self.note_aux_readiness(fd, ev) {
            self.log.error(format_args!(
                "fd {:?}: internal error: {}",
                self.socket.raw_fd(),
                e
            ));

            self.error = Some(500);

            return self.terminate();
        }

        self.last_active = now;

        self.drive(svc, now)
    }

    fn note_aux_readiness(&mut self, fd: RawFd, ev: &Event) -> Result<(), ConnectionError> {
        if self.input.raw_fd() == Some(fd) {
            if self.state != ConnectionState::Responding {
                return Err(ConnectionError::UnexpectedAuxEvent(self.state));
            }

            // a write attempt reports what went wrong
            if ev.writable || ev.error || ev.hup {
                self.ready.input_write = true;
            }

            Ok(())
        } else if self.output.raw_fd() == Some(fd) {
            if self.state != ConnectionState::Responding {
                return Err(ConnectionError::UnexpectedAuxEvent(self.state));
            }

            if ev.readable || ev.error || ev.hup {
                self.ready.output_read = true;
            }

            Ok(())
        } else {
            Err(ConnectionError::UnknownDescriptor(fd))
        }
    }

    /// Whether the connection outlived its request or idle ceilings.
    pub fn is_expired(
        &self,
        now: Instant,
        request_timeout: Duration,
        idle_timeout: Duration,
    ) -> bool {
        now.saturating_duration_since(self.created) > request_timeout
            || now.saturating_duration_since(self.last_active) > idle_timeout
    }

    /// Forced termination by the timeout sweep.
    pub fn expire(&mut self) -> Outcome {
        self.error = Some(408);

        self.terminate()
    }

    fn terminate(&mut self) -> Outcome {
        self.state = ConnectionState::Terminated;

        self.input.release();
        self.output.release();

        self.outcome()
    }

    fn drive(&mut self, svc: &mut Services, now: Instant) -> Outcome {
        loop {
            let ret = match self.state {
                ConnectionState::HeaderParsing | ConnectionState::BodyProcessing => {
                    self.process_request_bytes(now)
                }
                ConnectionState::HeaderProcessing => Ok(self.process_head()),
                ConnectionState::ResponseHeaderProcessing => {
                    self.prepare_response(svc);

                    Ok(true)
                }
                ConnectionState::Responding => self.respond(svc, now),
                ConnectionState::Done => {
                    self.finish_cycle(now);

                    Ok(true)
                }
                ConnectionState::Terminated => break,
            };

            match ret {
                Ok(true) => {}
                Ok(false) => break,
                Err(DriveError::Request(e)) => {
                    self.log.debug(format_args!(
                        "fd {:?}: bad request: {}",
                        self.socket.raw_fd(),
                        e
                    ));

                    self.fail(e.status());
                }
                Err(DriveError::Connection(e)) => {
                    self.log.debug(format_args!(
                        "fd {:?}: connection error: {}",
                        self.socket.raw_fd(),
                        e
                    ));

                    return self.terminate();
                }
            }
        }

        self.outcome()
    }

    // feed buffered bytes to the parser, reading more while the socket has
    // data. returns whether the state changed
    fn process_request_bytes(&mut self, now: Instant) -> Result<bool, DriveError> {
        loop {
            while !self.read_buf.is_empty() && !self.parser.is_complete() {
                let (size, status) = self.parser.feed(self.read_buf.read_buf())?;

                self.read_buf.read_commit(size);

                if self.state == ConnectionState::BodyProcessing {
                    self.body_received = self.parser.body_len();
                }

                if status == ParseStatus::HeadComplete {
                    self.state = ConnectionState::HeaderProcessing;

                    return Ok(true);
                }

                if size == 0 {
                    break;
                }
            }

            if self.parser.is_complete() {
                self.parser.check_excess(self.read_buf.len())?;

                self.request = self.parser.take_request();
                self.state = ConnectionState::ResponseHeaderProcessing;

                return Ok(true);
            }

            if !self.ready.socket_read {
                return Ok(false);
            }

            match self.read_buf.fill_from(&mut &self.socket)? {
                FillStatus::Read(_) => self.last_active = now,
                FillStatus::Eof => {
                    if self.parser.is_started() {
                        self.error = Some(RequestError::Truncated.status());
                    }

                    self.log.debug(format_args!(
                        "fd {:?}: peer closed",
                        self.socket.raw_fd()
                    ));

                    self.state = ConnectionState::Terminated;

                    return Ok(true);
                }
                FillStatus::WouldBlock => {
                    self.ready.socket_read = false;

                    return Ok(false);
                }
                FillStatus::Full => return Ok(false),
            }
        }
    }

    fn process_head(&mut self) -> bool {
        let req = match self.parser.request() {
            Some(req) => req,
            None => {
                self.state = ConnectionState::Terminated;

                return true;
            }
        };

        self.version = req.version;
        self.keep_alive = req.keep_alive;
        self.body_received = 0;
        self.body_expected = match req.body_size {
            BodySize::Known(len) => len,
            BodySize::NoBody => 0,
            BodySize::Chunked => self.parser.limits().max_body_size,
        };

        self.state = if self.parser.is_complete() {
            ConnectionState::ResponseHeaderProcessing
        } else {
            ConnectionState::BodyProcessing
        };

        if self.state == ConnectionState::ResponseHeaderProcessing {
            self.request = self.parser.take_request();
        }

        true
    }

    // protocol errors abandon the request and answer with a status page
    fn fail(&mut self, status: u16) {
        self.error = Some(status);
        self.keep_alive = false;
        self.request = None;
        self.parser.reset();
        self.read_buf.clear();
        self.state = ConnectionState::ResponseHeaderProcessing;
    }

    fn prepare_response(&mut self, svc: &mut Services) {
        let config = vhost(svc.vhosts, self.request.as_ref().map(|r| r.host.as_str()));

        let response = match (self.error, &self.request, config) {
            (Some(status), _, _) => svc.renderer.error_page(status, config),
            (None, Some(req), Some(config)) => match svc.handler.handle(req, config) {
                Ok(resp) => resp,
                Err(e) => {
                    self.log.debug(format_args!("{} {}: {}", req.method, req.target, e));

                    svc.renderer.error_page(e.status, Some(config))
                }
            },
            (None, _, _) => svc.renderer.error_page(500, config),
        };

        if let Some(req) = &self.request {
            self.log.info(format_args!(
                "{} {} {} -> {}",
                req.method,
                req.target,
                req.version.as_str(),
                response.status
            ));
        }

        self.set_response(response, svc);
    }

    fn set_response(&mut self, response: Response, svc: &Services) {
        self.write_buf.clear();
        self.head.clear();
        self.head_pos = 0;
        self.response_sent = 0;

        let mut head = ResponseHead {
            status: response.status,
            headers: Vec::new(),
            content_length: None,
        };

        if let Some(ct) = response.content_type {
            head.headers.push(("Content-Type".to_string(), ct));
        }

        match response.payload {
            Payload::Generated { data } => {
                head.content_length = Some(data.len() as u64);
                self.head = svc.renderer.response_head(&head, self.version, self.keep_alive);
                self.response_expected = Some(self.head.len() + data.len());
                self.body = Body::Generated { data, pos: 0 };
            }
            Payload::File { file, size } => {
                head.content_length = Some(size);
                self.head = svc.renderer.response_head(&head, self.version, self.keep_alive);
                self.response_expected = Some(self.head.len() + size as usize);
                self.body = Body::File {
                    file,
                    remaining: size,
                };
            }
            Payload::Process { input, output } => {
                self.input_pos = 0;
                self.aux_buf.clear();

                if let Some(fd) = input {
                    if let Err(e) = self.input.assign(fd) {
                        self.log.error(format_args!("input pipe: {}", e));
                    }
                }

                if let Err(e) = self.output.assign(output) {
                    self.log.error(format_args!("output pipe: {}", e));
                }

                self.ready.input_write = true;
                self.ready.output_read = true;

                // known once the process wrote its header block
                self.response_expected = None;
                self.body = Body::Process(ProcessOutput {
                    head: Vec::new(),
                    head_done: false,
                    eof: false,
                });
            }
        }

        self.ready.socket_write = true;
        self.state = ConnectionState::Responding;
    }

    fn respond(&mut self, svc: &mut Services, now: Instant) -> Result<bool, DriveError> {
        loop {
            if let Body::Process(_) = self.body {
                self.pump_input()?;

                if let Some(status) = self.pump_output(svc)? {
                    // the process failed before producing a response head
                    self.input.release();
                    self.output.release();
                    self.keep_alive = false;
                    self.error = Some(status);

                    let config =
                        vhost(svc.vhosts, self.request.as_ref().map(|r| r.host.as_str()));
                    let page = svc.renderer.error_page(status, config);
                    self.set_response(page, svc);

                    return Ok(true);
                }
            }

            self.fill_write_buf()?;

            if self.write_buf.is_empty() {
                if self.response_complete() {
                    self.state = ConnectionState::Done;

                    return Ok(true);
                }

                return Ok(false);
            }

            if !self.ready.socket_write {
                return Ok(false);
            }

            match self.write_buf.drain_to(&mut &self.socket)? {
                DrainStatus::Wrote(size) => {
                    self.response_sent += size;
                    self.last_active = now;
                }
                DrainStatus::Empty => {}
                DrainStatus::WouldBlock => {
                    self.ready.socket_write = false;

                    return Ok(false);
                }
            }
        }
    }

    fn response_complete(&self) -> bool {
        if self.head_pos < self.head.len() {
            return false;
        }

        match &self.body {
            Body::None => true,
            Body::Generated { data, pos } => *pos == data.len(),
            Body::File { remaining, .. } => *remaining == 0,
            Body::Process(p) => p.head_done && p.eof,
        }
    }

    // move pending head and body bytes into the write buffer
    fn fill_write_buf(&mut self) -> Result<(), ConnectionError> {
        while self.head_pos < self.head.len() && !self.write_buf.is_full() {
            let size = io::Write::write(&mut self.write_buf, &self.head[self.head_pos..])?;
            self.head_pos += size;
        }

        if self.head_pos < self.head.len() {
            return Ok(());
        }

        match &mut self.body {
            Body::Generated { data, pos } => {
                while *pos < data.len() && !self.write_buf.is_full() {
                    let size = io::Write::write(&mut self.write_buf, &data[*pos..])?;
                    *pos += size;
                }
            }
            Body::File { file, remaining } => {
                while *remaining > 0 && !self.write_buf.is_full() {
                    let mut limited = Read::take(&mut *file, *remaining);

                    match self.write_buf.fill_from(&mut limited)? {
                        FillStatus::Read(size) => *remaining -= size as u64,
                        FillStatus::Eof => {
                            // file shrank underneath us; the declared length
                            // can no longer be honored
                            return Err(ConnectionError::Io(io::Error::from(
                                io::ErrorKind::UnexpectedEof,
                            )));
                        }
                        FillStatus::WouldBlock | FillStatus::Full => break,
                    }
                }
            }
            Body::None | Body::Process(_) => {}
        }

        Ok(())
    }

    // copy the request body to the process' stdin
    fn pump_input(&mut self) -> Result<(), ConnectionError> {
        if !self.input.is_set() {
            return Ok(());
        }

        let body = match &self.request {
            Some(req) => &req.body,
            None => {
                self.input.release();

                return Ok(());
            }
        };

        while self.ready.input_write {
            while self.input_pos < body.len() && !self.aux_buf.is_full() {
                let size = io::Write::write(&mut self.aux_buf, &body[self.input_pos..])?;
                self.input_pos += size;
            }

            match self.aux_buf.drain_to(&mut &self.input) {
                Ok(DrainStatus::Wrote(_)) => {}
                Ok(DrainStatus::Empty) => {
                    // all written, close so the process sees eof
                    self.input.release();

                    break;
                }
                Ok(DrainStatus::WouldBlock) => self.ready.input_write = false,
                Err(e) => {
                    // the process stopped reading. its output decides the response
                    self.log.debug(format_args!("process stdin closed early: {}", e));

                    self.input.release();

                    break;
                }
            }
        }

        Ok(())
    }

    // read process output. returns Some(status) if the process failed
    // before a response head could be produced
    fn pump_output(&mut self, svc: &mut Services) -> Result<Option<u16>, ConnectionError> {
        let head_max = self.parser.limits().max_headers_size;

        let proc = match &mut self.body {
            Body::Process(p) => p,
            _ => return Ok(None),
        };

        while self.ready.output_read && !proc.eof {
            if !proc.head_done {
                let mut chunk = [0; 1024];

                let size = match (&self.output).read(&mut chunk) {
                    Ok(size) => size,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        self.ready.output_read = false;

                        break;
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                };

                if size == 0 {
                    proc.eof = true;
                    self.output.release();

                    return Ok(Some(502));
                }

                proc.head.extend_from_slice(&chunk[..size]);

                let crlf = find_subslice(&proc.head, b"\r\n\r\n").map(|pos| pos + 4);
                let lf = find_subslice(&proc.head, b"\n\n").map(|pos| pos + 2);

                // the earliest blank line ends the head
                let end = match (crlf, lf) {
                    (Some(a), Some(b)) => Some(cmp::min(a, b)),
                    (a, b) => a.or(b),
                };

                let end = match end {
                    Some(end) => end,
                    None => {
                        if proc.head.len() > head_max {
                            return Ok(Some(502));
                        }

                        continue;
                    }
                };

                let head = match svc.renderer.process_head(&proc.head[..end]) {
                    Ok(head) => head,
                    Err(e) => {
                        self.log.debug(format_args!("bad process output: {}", e));

                        return Ok(Some(502));
                    }
                };

                // without a length the response is delimited by closing
                if head.content_length.is_none() {
                    self.keep_alive = false;
                }

                self.head = svc
                    .renderer
                    .response_head(&head, self.version, self.keep_alive);
                self.head_pos = 0;
                self.head.extend_from_slice(&proc.head[end..]);

                let head_len = self.head.len() - (proc.head.len() - end);
                self.response_expected = head.content_length.map(|len| head_len + len as usize);

                proc.head_done = true;
                proc.head.clear();

                continue;
            }

            // body bytes go through the head buffer first
            if self.head_pos < self.head.len() || self.write_buf.is_full() {
                break;
            }

            match self.write_buf.fill_from(&mut &self.output)? {
                FillStatus::Read(_) => {}
                FillStatus::Eof => {
                    proc.eof = true;
                    self.output.release();
                }
                FillStatus::WouldBlock => self.ready.output_read = false,
                FillStatus::Full => break,
            }
        }

        Ok(None)
    }

    fn finish_cycle(&mut self, now: Instant) {
        if let Some(expected) = self.response_expected {
            if self.response_sent != expected {
                self.log.error(format_args!(
                    "fd {:?}: sent {} of {} response bytes",
                    self.socket.raw_fd(),
                    self.response_sent,
                    expected
                ));

                self.keep_alive = false;
            }
        }

        if !self.keep_alive {
            self.state = ConnectionState::Terminated;

            return;
        }

        self.input.release();
        self.output.release();

        self.parser.reset();
        self.request = None;
        self.body = Body::None;
        self.head.clear();
        self.head_pos = 0;
        self.input_pos = 0;
        self.aux_buf.clear();
        self.write_buf.clear();
        self.error = None;
        self.body_expected = 0;
        self.body_received = 0;
        self.response_expected = None;
        self.response_sent = 0;
        self.created = now;
        self.last_active = now;
        self.keep_alive = true;
        self.version = Version::Http11;

        // bytes of a pipelined request may already be waiting
        self.ready.socket_read = true;
        self.state = ConnectionState::HeaderParsing;
    }

    // registration changes needed for the current state
    fn outcome(&self) -> Outcome {
        let mut out = Outcome::default();

        if self.state == ConnectionState::Terminated {
            out.finished = true;

            return out;
        }

        let reading = matches!(
            self.state,
            ConnectionState::HeaderParsing
                | ConnectionState::HeaderProcessing
                | ConnectionState::BodyProcessing
        );
        let responding = self.state == ConnectionState::Responding;

        let wants = [
            (&self.socket, Direction::In, reading),
            (&self.socket, Direction::Out, responding),
            (&self.input, Direction::Out, responding),
            (&self.output, Direction::In, responding),
        ];

        for (guard, dir, want) in wants.iter() {
            let fd = match guard.raw_fd() {
                Some(fd) => fd,
                None => continue,
            };

            let registered = guard.is_registered(*dir);

            if *want && !registered {
                out.register.push((fd, *dir));
            } else if !*want && registered {
                out.deregister.push((fd, *dir));
            }
        }

        out
    }

    /// Apply one registration change on the guard owning `fd`.
    pub fn set_interest(&mut self, fd: RawFd, dir: Direction, enable: bool) -> Result<(), FdError> {
        let guard = if self.socket.raw_fd() == Some(fd) {
            &mut self.socket
        } else if self.input.raw_fd() == Some(fd) {
            &mut self.input
        } else if self.output.raw_fd() == Some(fd) {
            &mut self.output
        } else {
            return Err(FdError::NotAssigned);
        };

        if enable {
            guard.register_for(dir)
        } else {
            guard.deregister_for(dir)
        }
    }

    pub fn bytes_expected(&self) -> (usize, Option<usize>) {
        (self.body_expected, self.response_expected)
    }
}

enum DriveError {
    Request(RequestError),
    Connection(ConnectionError),
}

impl From<RequestError> for DriveError {
    fn from(e: RequestError) -> Self {
        Self::Request(e)
    }
}

impl From<ConnectionError> for DriveError {
    fn from(e: ConnectionError) -> Self {
        Self::Connection(e)
    }
}

impl From<io::Error> for DriveError {
    fn from(e: io::Error) -> Self {
        Self::Connection(ConnectionError::Io(e))
    }
}
