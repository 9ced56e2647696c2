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

use crate::config::ServerConfig;
use crate::core::http1::util::{parse_as_int, HEADERS_MAX};
use crate::core::http1::Version;
use crate::core::log::Logger;
use crate::handler::{Payload, RenderError, Renderer, Response, ResponseHead};
use std::fs::File;
use std::io::Write;
use std::str;
use time::macros::format_description;
use time::OffsetDateTime;

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

fn http_date() -> String {
    let format = format_description!(
        "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
    );

    OffsetDateTime::now_utc()
        .format(&format)
        .unwrap_or_default()
}

// headers the renderer owns; a process cannot override them
fn is_framing_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("content-length")
        || name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("date")
        || name.eq_ignore_ascii_case("server")
}

pub struct DefaultRenderer {
    server_name: String,
    log: Logger,
}

impl DefaultRenderer {
    pub fn new(server_name: &str, log: Logger) -> Self {
        Self {
            server_name: server_name.to_string(),
            log,
        }
    }

    fn builtin_page(&self, status: u16) -> Vec<u8> {
        let reason = reason_phrase(status);

        format!(
            "<!DOCTYPE html>\n<html>\n<head><title>{status} {reason}</title></head>\n\
             <body>\n<h1>{status} {reason}</h1>\n<hr>\n<p>{name}</p>\n</body>\n</html>\n",
            status = status,
            reason = reason,
            name = self.server_name
        )
        .into_bytes()
    }
}

impl Default for DefaultRenderer {
    fn default() -> Self {
        Self::new("webserv", Logger::global())
    }
}

impl Renderer for DefaultRenderer {
    fn response_head(&self, head: &ResponseHead, version: Version, keep_alive: bool) -> Vec<u8> {
        let mut out = Vec::new();

        // writes to a Vec cannot fail
        let _ = write!(
            out,
            "{} {} {}\r\n",
            version.as_str(),
            head.status,
            reason_phrase(head.status)
        );
        let _ = write!(out, "Date: {}\r\n", http_date());
        let _ = write!(out, "Server: {}\r\n", self.server_name);

        for (name, value) in head.headers.iter() {
            if is_framing_header(name) {
                continue;
            }

            let _ = write!(out, "{}: {}\r\n", name, value);
        }

        if let Some(len) = head.content_length {
            let _ = write!(out, "Content-Length: {}\r\n", len);
        }

        let connection = if keep_alive { "keep-alive" } else { "close" };
        let _ = write!(out, "Connection: {}\r\n\r\n", connection);

        out
    }

    fn error_page(&self, status: u16, server: Option<&ServerConfig>) -> Response {
        if let Some(path) = server.and_then(|s| s.error_pages.get(&status)) {
            if let Ok(file) = File::open(path) {
                if let Ok(meta) = file.metadata() {
                    if meta.is_file() {
                        return Response {
                            status,
                            content_type: Some("text/html".to_string()),
                            payload: Payload::File {
                                file,
                                size: meta.len(),
                            },
                        };
                    }
                }
            }

            self.log.debug(format_args!(
                "error page for {} not usable: {}",
                status,
                path.display()
            ));
        }

        Response::generated(status, "text/html", self.builtin_page(status))
    }

    fn process_head(&self, block: &[u8]) -> Result<ResponseHead, RenderError> {
        let mut headers = [httparse::EMPTY_HEADER; HEADERS_MAX];

        let parsed = match httparse::parse_headers(block, &mut headers) {
            Ok(httparse::Status::Complete((_, parsed))) => parsed,
            _ => return Err(RenderError::MalformedHead),
        };

        if parsed.is_empty() {
            return Err(RenderError::MalformedHead);
        }

        let mut status = None;
        let mut content_length = None;
        let mut has_location = false;
        let mut out = Vec::new();

        for h in parsed.iter() {
            let value = match str::from_utf8(h.value) {
                Ok(v) => v.trim(),
                Err(_) => return Err(RenderError::MalformedHead),
            };

            if h.name.eq_ignore_ascii_case("status") {
                let code = value.split(' ').next().unwrap_or("");

                match code.parse::<u16>() {
                    Ok(c) if (100..600).contains(&c) => status = Some(c),
                    _ => return Err(RenderError::InvalidStatus(value.to_string())),
                }
            } else if h.name.eq_ignore_ascii_case("content-length") {
                match parse_as_int(value.as_bytes()) {
                    Ok(len) => content_length = Some(len as u64),
                    Err(_) => return Err(RenderError::InvalidContentLength),
                }
            } else {
                if h.name.eq_ignore_ascii_case("location") {
                    has_location = true;
                }

                out.push((h.name.to_string(), value.to_string()));
            }
        }

        let status = match status {
            Some(s) => s,
            None if has_location => 302,
            None => 200,
        };

        Ok(ResponseHead {
            status,
            headers: out,
            content_length,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::core::log::testutil::CaptureSink;
    use log::Level;
    use std::sync::Arc;

    #[test]
    fn head_format() {
        let r = DefaultRenderer::new("test", Logger::global());

        let head = ResponseHead {
            status: 404,
            headers: vec![
                ("Content-Type".to_string(), "text/html".to_string()),
                ("Content-Length".to_string(), "999".to_string()),
            ],
            content_length: Some(12),
        };

        let out = String::from_utf8(r.response_head(&head, Version::Http11, false)).unwrap();

        assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(out.contains("\r\nServer: test\r\n"));
        assert!(out.contains("\r\nContent-Type: text/html\r\n"));
        assert!(out.contains("\r\nContent-Length: 12\r\n"));
        assert!(!out.contains("999"));
        assert!(out.ends_with("Connection: close\r\n\r\n"));
    }

    #[test]
    fn builtin_error_page() {
        let r = DefaultRenderer::default();

        let resp = r.error_page(413, None);
        assert_eq!(resp.status, 413);

        match resp.payload {
            Payload::Generated { data } => {
                let s = String::from_utf8(data).unwrap();
                assert!(s.contains("413 Payload Too Large"));
            }
            _ => panic!("expected generated page"),
        }
    }

    #[test]
    fn unusable_error_page() {
        let sink = Arc::new(CaptureSink::default());
        let r = DefaultRenderer::new("test", Logger::new(sink.clone()));

        let config = Config::from_json(
            r#"{
                "servers": [
                    {
                        "port": 8080,
                        "locations": { "/": { "root": "/nonexistent" } },
                        "error_pages": { "404": "/nonexistent/404.html" }
                    }
                ]
            }"#,
        )
        .unwrap();

        let resp = r.error_page(404, config.servers.first());
        assert_eq!(resp.status, 404);
        assert!(matches!(resp.payload, Payload::Generated { .. }));
        assert!(sink.contains(Level::Debug, "error page for 404 not usable"));
    }

    #[test]
    fn process_headers() {
        let r = DefaultRenderer::default();

        let head = r
            .process_head(b"Status: 201 Created\r\nContent-Type: text/plain\r\n\r\n")
            .unwrap();
        assert_eq!(head.status, 201);
        assert_eq!(
            head.headers,
            vec![("Content-Type".to_string(), "text/plain".to_string())]
        );
        assert_eq!(head.content_length, None);

        let head = r
            .process_head(b"Content-Type: text/html\nContent-Length: 5\n\n")
            .unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(head.content_length, Some(5));

        let head = r.process_head(b"Location: /x\r\n\r\n").unwrap();
        assert_eq!(head.status, 302);

        assert!(r.process_head(b"\r\n").is_err());
        assert!(r.process_head(b"Status: abc\r\n\r\n").is_err());
        assert!(r.process_head(b"not a header\r\n\r\n").is_err());
    }
}
