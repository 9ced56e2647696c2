/*
 * Copyright (C) 2024 Fastly, Inc.
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

use crate::core::http1::Method;
use config::{File, FileFormat};
use serde::Deserialize;
use std::cmp;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const MAX_POLL_EVENTS: usize = 1024;
pub const MAX_POLL_TIMEOUT: u64 = 1000; // ms
pub const MAX_CONNECTIONS: usize = 1024;
pub const GLOBAL_REQUEST_TIMEOUT: u64 = 5000; // ms
pub const GLOBAL_HEARTBEAT_TIMEOUT: u64 = 2000; // ms
pub const MAX_REQUEST_SIZE: usize = 1_048_576;
pub const MAX_HEADERS_SIZE: usize = 8192;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Source(#[from] config::ConfigError),

    #[error("config file must have a .json extension: {0}")]
    Extension(String),

    #[error("no servers configured")]
    NoServers,

    #[error("invalid port for server {0}")]
    InvalidPort(String),

    #[error("invalid listen address for server {0}: {1}")]
    InvalidListen(String, String),

    #[error("servers on port {0} must share one listen address")]
    ListenConflict(u16),

    #[error("duplicated port and server name: {1}:{0}")]
    Duplicate(u16, String),

    #[error("invalid method in location {0}: {1}")]
    InvalidMethod(String, String),

    #[error("location {0} must start with /")]
    InvalidLocation(String),

    #[error("server {0} is cgi but has no cgi_config")]
    MissingCgiConfig(String),

    #[error("invalid error page code: {0}")]
    InvalidErrorCode(String),
}

#[derive(Debug, Deserialize, Default)]
struct LocationFile {
    root: String,
    index: Option<String>,
    #[serde(default)]
    methods: Vec<String>,
    #[serde(default)]
    autoindex: bool,
}

#[derive(Debug, Deserialize, Default)]
struct ServerFile {
    server_name: Option<String>,
    host: Option<String>,
    port: i64,
    max_request_timeout: Option<u64>,
    max_heartbeat_timeout: Option<u64>,
    max_request_size: Option<usize>,
    max_headers_size: Option<usize>,
    #[serde(default)]
    is_cgi: bool,
    #[serde(default)]
    cgi_config: HashMap<String, String>,
    #[serde(default)]
    locations: HashMap<String, LocationFile>,
    #[serde(default)]
    error_pages: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    max_poll_events: Option<usize>,
    max_poll_timeout: Option<u64>,
    max_connections: Option<usize>,
    global_request_timeout: Option<u64>,
    max_heartbeat_timeout: Option<u64>,
    max_request_size: Option<usize>,
    max_headers_size: Option<usize>,
    #[serde(default)]
    servers: Vec<ServerFile>,
}

#[derive(Debug, Clone)]
pub struct LocationConfig {
    pub root: PathBuf,
    pub index: Option<String>,
    pub methods: Vec<Method>,
    pub autoindex: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub host: IpAddr,
    pub port: u16,
    pub request_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub max_request_size: usize,
    pub max_headers_size: usize,
    pub is_cgi: bool,

    // extension (with dot) -> interpreter
    pub cgi: HashMap<String, PathBuf>,

    pub locations: BTreeMap<String, LocationConfig>,
    pub error_pages: HashMap<u16, PathBuf>,
}

impl ServerConfig {
    /// Longest prefix match on path segments, falling back to `/`.
    pub fn match_location(&self, path: &str) -> Option<(&str, &LocationConfig)> {
        let mut best: Option<(&str, &LocationConfig)> = None;

        for (prefix, loc) in self.locations.iter() {
            let trimmed = prefix.trim_end_matches('/');

            let matches = trimmed.is_empty()
                || path == trimmed
                || (path.starts_with(trimmed) && path.as_bytes().get(trimmed.len()) == Some(&b'/'));

            if !matches {
                continue;
            }

            match best {
                Some((cur, _)) if cur.trim_end_matches('/').len() >= trimmed.len() => {}
                _ => best = Some((prefix.as_str(), loc)),
            }
        }

        best
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub max_poll_events: usize,
    pub max_poll_timeout: Duration,
    pub max_connections: usize,
    pub global_request_timeout: Duration,
    pub max_heartbeat_timeout: Duration,
    pub max_request_size: usize,
    pub max_headers_size: usize,
    pub servers: Vec<ServerConfig>,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            return Err(ConfigError::Extension(path.display().to_string()));
        }

        let raw = config::Config::builder()
            .add_source(File::from(path).format(FileFormat::Json))
            .build()?;

        Self::from_raw(raw.try_deserialize()?)
    }

    pub fn from_json(s: &str) -> Result<Self, ConfigError> {
        let raw = config::Config::builder()
            .add_source(File::from_str(s, FileFormat::Json))
            .build()?;

        Self::from_raw(raw.try_deserialize()?)
    }

    fn from_raw(raw: ConfigFile) -> Result<Self, ConfigError> {
        let global_request_timeout = raw.global_request_timeout.unwrap_or(GLOBAL_REQUEST_TIMEOUT);
        let max_heartbeat_timeout = raw
            .max_heartbeat_timeout
            .unwrap_or(GLOBAL_HEARTBEAT_TIMEOUT);
        let max_request_size = raw.max_request_size.unwrap_or(MAX_REQUEST_SIZE);
        let max_headers_size = raw.max_headers_size.unwrap_or(MAX_HEADERS_SIZE);

        if raw.servers.is_empty() {
            return Err(ConfigError::NoServers);
        }

        let mut servers: Vec<ServerConfig> = Vec::new();

        for (i, s) in raw.servers.into_iter().enumerate() {
            let name = match s.server_name {
                Some(name) => name.to_lowercase(),
                None => format!("server_{}", i + 1),
            };

            if !(1..=65535).contains(&s.port) {
                return Err(ConfigError::InvalidPort(name));
            }

            let port = s.port as u16;

            let host = match s.host.as_deref() {
                Some(h) => match h.parse() {
                    Ok(addr) => addr,
                    Err(_) => return Err(ConfigError::InvalidListen(name, h.to_string())),
                },
                None => IpAddr::from([0, 0, 0, 0]),
            };

            if s.is_cgi && s.cgi_config.is_empty() {
                return Err(ConfigError::MissingCgiConfig(name));
            }

            let mut cgi = HashMap::new();
            for (ext, interpreter) in s.cgi_config {
                let ext = if ext.starts_with('.') {
                    ext
                } else {
                    format!(".{}", ext)
                };

                cgi.insert(ext, PathBuf::from(interpreter));
            }

            let mut locations = BTreeMap::new();
            for (prefix, loc) in s.locations {
                if !prefix.starts_with('/') {
                    return Err(ConfigError::InvalidLocation(prefix));
                }

                let mut methods = Vec::new();
                for m in loc.methods.iter() {
                    match Method::parse(&m.to_uppercase()) {
                        Some(m) => methods.push(m),
                        None => return Err(ConfigError::InvalidMethod(prefix, m.clone())),
                    }
                }

                if methods.is_empty() {
                    methods.push(Method::Get);
                }

                locations.insert(
                    prefix,
                    LocationConfig {
                        root: PathBuf::from(loc.root),
                        index: loc.index.filter(|s| !s.is_empty()),
                        methods,
                        autoindex: loc.autoindex,
                    },
                );
            }

            let mut error_pages = HashMap::new();
            for (code, page) in s.error_pages {
                match code.parse::<u16>() {
                    Ok(c) if (300..600).contains(&c) => {
                        error_pages.insert(c, PathBuf::from(page));
                    }
                    _ => return Err(ConfigError::InvalidErrorCode(code)),
                }
            }

            for other in servers.iter() {
                if other.port == port {
                    if other.name == name {
                        return Err(ConfigError::Duplicate(port, name));
                    }

                    if other.host != host {
                        return Err(ConfigError::ListenConflict(port));
                    }
                }
            }

            servers.push(ServerConfig {
                name,
                host,
                port,
                request_timeout: Duration::from_millis(cmp::min(
                    s.max_request_timeout.unwrap_or(global_request_timeout),
                    global_request_timeout,
                )),
                heartbeat_timeout: Duration::from_millis(cmp::min(
                    s.max_heartbeat_timeout.unwrap_or(max_heartbeat_timeout),
                    max_heartbeat_timeout,
                )),
                max_request_size: cmp::min(
                    s.max_request_size.unwrap_or(max_request_size),
                    max_request_size,
                ),
                max_headers_size: cmp::min(
                    s.max_headers_size.unwrap_or(max_headers_size),
                    max_headers_size,
                ),
                is_cgi: s.is_cgi,
                cgi,
                locations,
                error_pages,
            });
        }

        Ok(Self {
            max_poll_events: raw.max_poll_events.unwrap_or(MAX_POLL_EVENTS).max(1),
            max_poll_timeout: Duration::from_millis(
                raw.max_poll_timeout.unwrap_or(MAX_POLL_TIMEOUT),
            ),
            max_connections: raw.max_connections.unwrap_or(MAX_CONNECTIONS),
            global_request_timeout: Duration::from_millis(global_request_timeout),
            max_heartbeat_timeout: Duration::from_millis(max_heartbeat_timeout),
            max_request_size,
            max_headers_size,
            servers,
        })
    }
}
