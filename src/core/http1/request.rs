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

use crate::core::http1::util::{
    find_subslice, parse_as_int, percent_decode, split_host, FORBIDDEN_TARGET_CHARS, HEADERS_MAX,
};
use std::cmp;
use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::str;

const HEAD_END: &[u8] = b"\r\n\r\n";
const CRLF: &[u8] = b"\r\n";
const CHUNK_LINE_MAX: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error(transparent)]
    Parse(#[from] httparse::Error),

    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),

    #[error("unsupported version")]
    UnsupportedVersion,

    #[error("invalid request target")]
    InvalidTarget,

    #[error("invalid header value: {0}")]
    InvalidHeaderValue(String),

    #[error("duplicate header: {0}")]
    DuplicateHeader(&'static str),

    #[error("missing host")]
    MissingHost,

    #[error("invalid host")]
    InvalidHost,

    #[error("missing content length")]
    MissingContentLength,

    #[error("unexpected body")]
    UnexpectedBody,

    #[error("invalid content length")]
    InvalidContentLength,

    #[error("unsupported transfer encoding")]
    UnsupportedTransferEncoding,

    #[error("invalid connection header")]
    InvalidConnection,

    #[error("invalid chunk size")]
    InvalidChunkSize,

    #[error("invalid chunk suffix")]
    InvalidChunkSuffix,

    #[error("body exceeds declared length")]
    ExcessBody,

    #[error("request truncated")]
    Truncated,

    #[error("headers too large")]
    HeadersTooLarge,

    #[error("body too large")]
    BodyTooLarge,
}

impl RequestError {
    pub fn status(&self) -> u16 {
        match self {
            Self::HeadersTooLarge => 431,
            Self::BodyTooLarge => 413,
            _ => 400,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Delete,
}

impl Method {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(Self::Get),
            "POST" => Some(Self::Post),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodySize {
    NoBody,
    Known(usize),
    Chunked,
}

#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_headers_size: usize,
    pub max_body_size: usize,
}

#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub method: Method,
    pub target: String,
    pub path: String,
    pub query: String,
    pub version: Version,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub body_fields: HashMap<String, String>,
    pub host: String,
    pub port: u16,
    pub body_size: BodySize,
    pub keep_alive: bool,
    pub head_size: usize,
}

impl ParsedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|s| s.as_str())
    }

    pub fn is_chunked(&self) -> bool {
        self.body_size == BodySize::Chunked
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    NeedMore,
    HeadComplete,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(usize),
    DataEnd,
    Trailer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Head,
    Body,
    Chunks(ChunkState),
    Done,
}

/// Incremental request reader.
///
/// Bytes are pushed with `feed`, which consumes only what belongs to the
/// current request. Anything left over belongs to whatever follows on the
/// connection.
pub struct RequestParser {
    limits: Limits,
    default_port: u16,
    state: State,
    head: Vec<u8>,
    line: Vec<u8>,
    trailer_size: usize,
    body_remaining: usize,
    consumed: usize,
    request: Option<ParsedRequest>,
}

impl RequestParser {
    pub fn new(limits: Limits, default_port: u16) -> Self {
        Self {
            limits,
            default_port,
            state: State::Head,
            head: Vec::new(),
            line: Vec::new(),
            trailer_size: 0,
            body_remaining: 0,
            consumed: 0,
            request: None,
        }
    }

    pub fn reset(&mut self) {
        self.state = State::Head;
        self.head.clear();
        self.line.clear();
        self.trailer_size = 0;
        self.body_remaining = 0;
        self.consumed = 0;
        self.request = None;
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    /// Any bytes of a request received so far.
    pub fn is_started(&self) -> bool {
        self.consumed > 0
    }

    pub fn is_complete(&self) -> bool {
        self.state == State::Done
    }

    /// Bytes consumed for the current request.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    pub fn request(&self) -> Option<&ParsedRequest> {
        self.request.as_ref()
    }

    /// Decoded body bytes received so far. Chunk framing is not counted.
    pub fn body_len(&self) -> usize {
        self.request.as_ref().map(|req| req.body.len()).unwrap_or(0)
    }

    pub fn take_request(&mut self) -> Option<ParsedRequest> {
        self.request.take()
    }

    /// Consume bytes of the current request from the front of `src`.
    /// Returns how many bytes were used and where parsing stands.
    pub fn feed(&mut self, src: &[u8]) -> Result<(usize, ParseStatus), RequestError> {
        let mut pos = 0;

        loop {
            match self.state {
                State::Head => {
                    let (size, done) = self.feed_head(&src[pos..])?;
                    pos += size;

                    if !done {
                        break;
                    }

                    self.consumed += pos;

                    return Ok((pos, ParseStatus::HeadComplete));
                }
                State::Body => {
                    let size = cmp::min(self.body_remaining, src.len() - pos);

                    if let Some(req) = &mut self.request {
                        req.body.extend_from_slice(&src[pos..(pos + size)]);
                    }

                    self.body_remaining -= size;
                    pos += size;

                    if self.body_remaining == 0 {
                        self.finish();
                    }

                    break;
                }
                State::Chunks(cstate) => {
                    if pos == src.len() {
                        break;
                    }

                    pos += self.feed_chunked(cstate, &src[pos..])?;
                }
                State::Done => break,
            }
        }

        self.consumed += pos;

        if self.state == State::Done {
            Ok((pos, ParseStatus::Complete))
        } else {
            Ok((pos, ParseStatus::NeedMore))
        }
    }

    /// A request with a declared length owns everything up to that length
    /// and nothing more. Bytes still pending once it completed are an error.
    pub fn check_excess(&self, pending: usize) -> Result<(), RequestError> {
        match &self.request {
            Some(req) if self.state == State::Done && pending > 0 => match req.body_size {
                BodySize::Known(len) if len > 0 => Err(RequestError::ExcessBody),
                _ => Ok(()),
            },
            _ => Ok(()),
        }
    }

    // returns (bytes used, boundary found)
    fn feed_head(&mut self, src: &[u8]) -> Result<(usize, bool), RequestError> {
        // resume the boundary search a few bytes back, in case it straddles
        let search_start = self.head.len().saturating_sub(HEAD_END.len() - 1);

        let room = self.limits.max_headers_size.saturating_sub(self.head.len());
        let take = cmp::min(src.len(), room + HEAD_END.len());

        self.head.extend_from_slice(&src[..take]);

        let end = match find_subslice(&self.head[search_start..], HEAD_END) {
            Some(pos) => search_start + pos + HEAD_END.len(),
            None => {
                if self.head.len() > self.limits.max_headers_size {
                    return Err(RequestError::HeadersTooLarge);
                }

                return Ok((take, false));
            }
        };

        if end > self.limits.max_headers_size {
            return Err(RequestError::HeadersTooLarge);
        }

        // give back whatever followed the boundary
        let extra = self.head.len() - end;
        self.head.truncate(end);

        let req = self.parse_head()?;

        self.state = match req.body_size {
            BodySize::NoBody | BodySize::Known(0) => State::Done,
            BodySize::Known(len) => {
                self.body_remaining = len;

                State::Body
            }
            BodySize::Chunked => State::Chunks(ChunkState::Size),
        };

        self.request = Some(req);

        Ok((take - extra, true))
    }

    fn parse_head(&self) -> Result<ParsedRequest, RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; HEADERS_MAX];
        let mut req = httparse::Request::new(&mut headers);

        match req.parse(&self.head)? {
            httparse::Status::Complete(_) => {}
            httparse::Status::Partial => return Err(RequestError::Truncated),
        }

        let method = req.method.unwrap_or("");
        let method = match Method::parse(method) {
            Some(m) => m,
            None => return Err(RequestError::UnsupportedMethod(method.to_string())),
        };

        let version = match req.version {
            Some(0) => Version::Http10,
            Some(1) => Version::Http11,
            _ => return Err(RequestError::UnsupportedVersion),
        };

        let target = req.path.unwrap_or("");

        if target.is_empty()
            || !target.starts_with('/')
            || target.bytes().any(|b| FORBIDDEN_TARGET_CHARS.contains(&b))
        {
            return Err(RequestError::InvalidTarget);
        }

        let (raw_path, query) = match target.find('?') {
            Some(pos) => (&target[..pos], &target[(pos + 1)..]),
            None => (target, ""),
        };

        let path = percent_decode(raw_path).map_err(|_| RequestError::InvalidTarget)?;

        // the query stays encoded but must be well formed
        percent_decode(query).map_err(|_| RequestError::InvalidTarget)?;

        let mut map: HashMap<String, String> = HashMap::new();

        for h in req.headers.iter() {
            let name = h.name.to_ascii_lowercase();

            let value = match str::from_utf8(h.value) {
                Ok(v) => v.trim().to_string(),
                Err(_) => return Err(RequestError::InvalidHeaderValue(name)),
            };

            if map.contains_key(&name) {
                match name.as_str() {
                    "host" => return Err(RequestError::DuplicateHeader("host")),
                    "content-length" => {
                        return Err(RequestError::DuplicateHeader("content-length"))
                    }
                    _ => {
                        // fold repeated fields
                        if let Some(cur) = map.get_mut(&name) {
                            cur.push_str(", ");
                            cur.push_str(&value);
                        }

                        continue;
                    }
                }
            }

            map.insert(name, value);
        }

        let (host, port) = match map.get("host") {
            Some(v) => match split_host(v) {
                Ok((name, port)) => (
                    name.to_ascii_lowercase(),
                    port.unwrap_or(self.default_port),
                ),
                Err(_) => return Err(RequestError::InvalidHost),
            },
            None => return Err(RequestError::MissingHost),
        };

        let chunked = match map.get("transfer-encoding") {
            Some(v) if v.eq_ignore_ascii_case("chunked") => true,
            Some(_) => return Err(RequestError::UnsupportedTransferEncoding),
            None => false,
        };

        let content_len = match map.get("content-length") {
            Some(v) => match parse_as_int(v.as_bytes()) {
                Ok(len) => Some(len),
                Err(_) => return Err(RequestError::InvalidContentLength),
            },
            None => None,
        };

        let body_size = match (method, content_len, chunked) {
            (_, Some(_), true) => return Err(RequestError::InvalidContentLength),
            (Method::Get, Some(_), _) | (Method::Get, _, true) => {
                return Err(RequestError::UnexpectedBody)
            }
            (Method::Get, None, false) => BodySize::NoBody,
            (_, None, false) => return Err(RequestError::MissingContentLength),
            (_, None, true) => BodySize::Chunked,
            (_, Some(len), false) => {
                if len > self.limits.max_body_size {
                    return Err(RequestError::BodyTooLarge);
                }

                BodySize::Known(len)
            }
        };

        let keep_alive = match map.get("connection") {
            Some(v) if v.eq_ignore_ascii_case("keep-alive") => true,
            Some(v) if v.eq_ignore_ascii_case("close") => false,
            Some(_) => return Err(RequestError::InvalidConnection),
            None => true,
        };

        Ok(ParsedRequest {
            method,
            target: target.to_string(),
            path,
            query: query.to_string(),
            version,
            headers: map,
            body: Vec::new(),
            body_fields: HashMap::new(),
            host,
            port,
            body_size,
            keep_alive,
            head_size: self.head.len(),
        })
    }

    // returns bytes used. progresses at most one chunk state
    fn feed_chunked(&mut self, cstate: ChunkState, src: &[u8]) -> Result<usize, RequestError> {
        match cstate {
            ChunkState::Size => {
                let (size, line) = match self.take_line(src, CHUNK_LINE_MAX)? {
                    (size, Some(line)) => (size, line),
                    (size, None) => return Ok(size),
                };

                let chunk_size = match httparse::parse_chunk_size(&line) {
                    Ok(httparse::Status::Complete((_, size))) => size,
                    _ => return Err(RequestError::InvalidChunkSize),
                };

                if chunk_size == 0 {
                    self.state = State::Chunks(ChunkState::Trailer);

                    return Ok(size);
                }

                let received = self.request.as_ref().map(|r| r.body.len()).unwrap_or(0);
                let allowance = self.limits.max_body_size.saturating_sub(received);

                if chunk_size > allowance as u64 {
                    return Err(RequestError::BodyTooLarge);
                }

                self.state = State::Chunks(ChunkState::Data(chunk_size as usize));

                Ok(size)
            }
            ChunkState::Data(left) => {
                let size = cmp::min(left, src.len());

                if let Some(req) = &mut self.request {
                    req.body.extend_from_slice(&src[..size]);
                }

                self.state = if size == left {
                    State::Chunks(ChunkState::DataEnd)
                } else {
                    State::Chunks(ChunkState::Data(left - size))
                };

                Ok(size)
            }
            ChunkState::DataEnd => {
                let size = cmp::min(CRLF.len() - self.line.len(), src.len());

                self.line.extend_from_slice(&src[..size]);

                if self.line.len() == CRLF.len() {
                    if self.line != CRLF {
                        return Err(RequestError::InvalidChunkSuffix);
                    }

                    self.line.clear();
                    self.state = State::Chunks(ChunkState::Size);
                }

                Ok(size)
            }
            ChunkState::Trailer => {
                let (size, line) = match self.take_line(src, self.limits.max_headers_size)? {
                    (size, Some(line)) => (size, line),
                    (size, None) => return Ok(size),
                };

                self.trailer_size += line.len();

                if self.trailer_size > self.limits.max_headers_size {
                    return Err(RequestError::HeadersTooLarge);
                }

                // trailer fields are read and dropped
                if line == CRLF {
                    self.finish();
                }

                Ok(size)
            }
        }
    }

    // accumulate up to and including the next CRLF
    fn take_line(
        &mut self,
        src: &[u8],
        max: usize,
    ) -> Result<(usize, Option<Vec<u8>>), RequestError> {
        for (i, &b) in src.iter().enumerate() {
            self.line.push(b);

            if self.line.len() > max {
                return Err(RequestError::InvalidChunkSize);
            }

            if b == b'\n' && self.line.ends_with(CRLF) {
                return Ok((i + 1, Some(mem::take(&mut self.line))));
            }
        }

        Ok((src.len(), None))
    }

    fn finish(&mut self) {
        self.state = State::Done;

        if let Some(req) = &mut self.request {
            let form = req
                .header("content-type")
                .map(|v| {
                    v.split(';')
                        .next()
                        .unwrap_or("")
                        .trim()
                        .eq_ignore_ascii_case("application/x-www-form-urlencoded")
                })
                .unwrap_or(false);

            if form {
                req.body_fields = url::form_urlencoded::parse(&req.body)
                    .into_owned()
                    .collect();
            }
        }
    }
}
