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

//! Collaborators the connection engine calls into once a request has been
//! read: method execution and response rendering.

pub mod cgi;
pub mod files;
pub mod render;

use crate::config::ServerConfig;
use crate::core::http1::{ParsedRequest, Version};
use std::fs::File;
use std::os::unix::io::OwnedFd;

pub use files::DefaultHandler;
pub use render::DefaultRenderer;

#[derive(Debug, thiserror::Error)]
#[error("{status}: {message}")]
pub struct MethodError {
    pub status: u16,
    pub message: String,
}

impl MethodError {
    pub fn new<S: Into<String>>(status: u16, message: S) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

#[derive(Debug)]
pub enum Payload {
    /// Content produced in memory.
    Generated { data: Vec<u8> },

    /// A regular file of known size.
    File { file: File, size: u64 },

    /// A delegated process. Its response head is produced by the process
    /// itself. `input` receives the request body, if there is one.
    Process {
        input: Option<OwnedFd>,
        output: OwnedFd,
    },
}

#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub content_type: Option<String>,
    pub payload: Payload,
}

impl Response {
    pub fn generated(status: u16, content_type: &str, data: Vec<u8>) -> Self {
        Self {
            status,
            content_type: Some(content_type.to_string()),
            payload: Payload::Generated { data },
        }
    }

    pub fn empty(status: u16) -> Self {
        Self {
            status,
            content_type: None,
            payload: Payload::Generated { data: Vec::new() },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub content_length: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("malformed process header block")]
    MalformedHead,

    #[error("invalid process status: {0}")]
    InvalidStatus(String),

    #[error("invalid process content length")]
    InvalidContentLength,
}

/// Executes a parsed request against a server configuration.
pub trait Handler {
    fn handle(&mut self, req: &ParsedRequest, server: &ServerConfig)
        -> Result<Response, MethodError>;
}

/// Produces the bytes that frame a response.
pub trait Renderer {
    fn response_head(&self, head: &ResponseHead, version: Version, keep_alive: bool) -> Vec<u8>;

    fn error_page(&self, status: u16, server: Option<&ServerConfig>) -> Response;

    /// Translate the header block written by a delegated process.
    fn process_head(&self, block: &[u8]) -> Result<ResponseHead, RenderError>;
}
