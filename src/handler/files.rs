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

use crate::config::{LocationConfig, ServerConfig};
use crate::core::http1::{Method, ParsedRequest};
use crate::core::log::Logger;
use crate::handler::{cgi, Handler, MethodError, Payload, Response};
use std::fmt::Write as _;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

pub fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match ext.as_deref() {
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("txt") => "text/plain",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}

fn io_error(e: io::Error) -> MethodError {
    let status = match e.kind() {
        io::ErrorKind::NotFound => 404,
        io::ErrorKind::PermissionDenied => 403,
        io::ErrorKind::AlreadyExists => 409,
        _ => 500,
    };

    MethodError::new(status, e.to_string())
}

fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());

    for c in s.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }

    out
}

/// Map a request path onto the filesystem below the location's root.
/// Parent components are refused.
pub fn resolve_path(
    prefix: &str,
    loc: &LocationConfig,
    path: &str,
) -> Result<PathBuf, MethodError> {
    let rest = path
        .strip_prefix(prefix.trim_end_matches('/'))
        .unwrap_or(path);

    let rel = Path::new(rest.trim_start_matches('/'));

    let mut out = loc.root.clone();

    for c in rel.components() {
        match c {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return Err(MethodError::new(403, "path escapes location root")),
        }
    }

    Ok(out)
}

/// Serves, stores and deletes files below each location's root, and hands
/// scripts to the process invoker on servers flagged for it.
pub struct DefaultHandler {
    log: Logger,
}

impl DefaultHandler {
    pub fn new(log: Logger) -> Self {
        Self { log }
    }

    fn get(
        &self,
        req: &ParsedRequest,
        loc: &LocationConfig,
        path: &Path,
    ) -> Result<Response, MethodError> {
        let meta = fs::symlink_metadata(path).map_err(io_error)?;

        if meta.file_type().is_symlink() {
            return Err(MethodError::new(403, "refusing to follow symlink"));
        }

        if meta.is_dir() {
            if let Some(index) = &loc.index {
                let index_path = path.join(index);

                if index_path.is_file() {
                    return self.open_file(&index_path);
                }
            }

            if loc.autoindex {
                return self.listing(&req.path, path);
            }

            return Err(MethodError::new(403, "directory listing disabled"));
        }

        if !meta.is_file() {
            return Err(MethodError::new(403, "not a regular file"));
        }

        self.open_file(path)
    }

    fn open_file(&self, path: &Path) -> Result<Response, MethodError> {
        let file = File::open(path).map_err(io_error)?;
        let size = file
            .metadata()
            .map_err(|e| MethodError::new(500, e.to_string()))?
            .len();

        Ok(Response {
            status: 200,
            content_type: Some(content_type(path).to_string()),
            payload: Payload::File { file, size },
        })
    }

    fn listing(&self, url_path: &str, dir: &Path) -> Result<Response, MethodError> {
        let mut names = Vec::new();

        let entries = fs::read_dir(dir).map_err(io_error)?;

        for entry in entries {
            let entry = entry.map_err(|e| MethodError::new(500, e.to_string()))?;
            let mut name = entry.file_name().to_string_lossy().into_owned();

            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                name.push('/');
            }

            names.push(name);
        }

        names.sort();

        let base = if url_path.ends_with('/') {
            url_path.to_string()
        } else {
            format!("{}/", url_path)
        };

        let title = html_escape(&base);

        let mut body = String::new();
        let _ = write!(
            body,
            "<!DOCTYPE html>\n<html>\n<head><title>Index of {0}</title></head>\n<body>\n<h1>Index of {0}</h1>\n<ul>\n",
            title
        );

        for name in names {
            let escaped = html_escape(&name);
            let _ = writeln!(body, "<li><a href=\"{}{}\">{}</a></li>", title, escaped, escaped);
        }

        body.push_str("</ul>\n</body>\n</html>\n");

        Ok(Response::generated(200, "text/html", body.into_bytes()))
    }

    fn post(&self, req: &ParsedRequest, path: &Path) -> Result<Response, MethodError> {
        if path.is_dir() {
            return Err(MethodError::new(409, "target is a directory"));
        }

        match path.parent() {
            Some(parent) if parent.is_dir() => {}
            _ => return Err(MethodError::new(404, "parent directory does not exist")),
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(io_error)?;

        file.write_all(&req.body)
            .map_err(|e| MethodError::new(500, e.to_string()))?;

        self.log.info(format_args!(
            "stored {} bytes at {}",
            req.body.len(),
            path.display()
        ));

        let body = format!("created {}\n", req.path);

        Ok(Response::generated(201, "text/plain", body.into_bytes()))
    }

    fn delete(&self, path: &Path) -> Result<Response, MethodError> {
        let meta = fs::symlink_metadata(path).map_err(io_error)?;

        if meta.file_type().is_symlink() || meta.is_dir() || !meta.is_file() {
            return Err(MethodError::new(403, "only regular files can be deleted"));
        }

        fs::remove_file(path).map_err(io_error)?;

        self.log.info(format_args!("deleted {}", path.display()));

        Ok(Response::empty(204))
    }
}

impl Handler for DefaultHandler {
    fn handle(
        &mut self,
        req: &ParsedRequest,
        server: &ServerConfig,
    ) -> Result<Response, MethodError> {
        let (prefix, loc) = match server.match_location(&req.path) {
            Some(ret) => ret,
            None => return Err(MethodError::new(404, "no matching location")),
        };

        if !loc.methods.contains(&req.method) {
            return Err(MethodError::new(405, format!("{} not allowed", req.method)));
        }

        let path = resolve_path(prefix, loc, &req.path)?;

        if server.is_cgi {
            if let Some(interpreter) = cgi::interpreter_for(server, &path) {
                return cgi::spawn(req, server, interpreter, &path, &self.log);
            }
        }

        match req.method {
            Method::Get => self.get(req, loc, &path),
            Method::Post => self.post(req, &path),
            Method::Delete => self.delete(&path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::core::http1::{Limits, ParseStatus, RequestParser};
    use std::io::Read;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("webserv-files-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();

        dir
    }

    fn server(root: &Path) -> ServerConfig {
        let json = format!(
            r#"{{ "servers": [ {{ "port": 8080, "locations": {{
                "/": {{ "root": "{0}", "index": "index.html", "methods": ["GET"] }},
                "/files": {{ "root": "{0}/files", "methods": ["GET", "POST", "DELETE"], "autoindex": true }}
            }} }} ] }}"#,
            root.display()
        );

        Config::from_json(&json).unwrap().servers.remove(0)
    }

    fn request(data: &[u8]) -> ParsedRequest {
        let mut p = RequestParser::new(
            Limits {
                max_headers_size: 8192,
                max_body_size: 1024,
            },
            8080,
        );

        let mut pos = 0;
        while !p.is_complete() {
            let (size, status) = p.feed(&data[pos..]).unwrap();
            pos += size;
            assert!(status != ParseStatus::NeedMore || pos == data.len());
        }

        p.take_request().unwrap()
    }

    fn body_of(resp: Response) -> Vec<u8> {
        match resp.payload {
            Payload::Generated { data } => data,
            Payload::File { mut file, .. } => {
                let mut out = Vec::new();
                file.read_to_end(&mut out).unwrap();
                out
            }
            Payload::Process { .. } => panic!("unexpected process"),
        }
    }

    #[test]
    fn get_index_and_file() {
        let root = temp_dir("get");
        fs::write(root.join("index.html"), "<p>home</p>").unwrap();
        fs::create_dir(root.join("files")).unwrap();
        fs::write(root.join("files/a.txt"), "aaa").unwrap();

        let s = server(&root);
        let mut h = DefaultHandler::new(Logger::global());

        let resp = h.handle(&request(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n"), &s).unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.content_type.as_deref(), Some("text/html"));
        assert_eq!(body_of(resp), b"<p>home</p>");

        let resp = h
            .handle(&request(b"GET /files/a.txt HTTP/1.1\r\nHost: x\r\n\r\n"), &s)
            .unwrap();
        assert_eq!(resp.content_type.as_deref(), Some("text/plain"));
        assert_eq!(body_of(resp), b"aaa");

        let resp = h
            .handle(&request(b"GET /files/ HTTP/1.1\r\nHost: x\r\n\r\n"), &s)
            .unwrap();
        let listing = String::from_utf8(body_of(resp)).unwrap();
        assert!(listing.contains("Index of /files/"));
        assert!(listing.contains("a.txt"));

        let e = h
            .handle(&request(b"GET /missing HTTP/1.1\r\nHost: x\r\n\r\n"), &s)
            .unwrap_err();
        assert_eq!(e.status, 404);

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn method_not_allowed() {
        let root = temp_dir("405");
        let s = server(&root);
        let mut h = DefaultHandler::new(Logger::global());

        let e = h
            .handle(
                &request(b"DELETE /index.html HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\n\r\n"),
                &s,
            )
            .unwrap_err();
        assert_eq!(e.status, 405);

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn post_then_delete() {
        let root = temp_dir("post");
        fs::create_dir(root.join("files")).unwrap();

        let s = server(&root);
        let mut h = DefaultHandler::new(Logger::global());

        let post = b"POST /files/new.txt HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\n\r\ndata";

        let resp = h.handle(&request(post), &s).unwrap();
        assert_eq!(resp.status, 201);
        assert_eq!(fs::read(root.join("files/new.txt")).unwrap(), b"data");

        // already exists
        let e = h.handle(&request(post), &s).unwrap_err();
        assert_eq!(e.status, 409);

        let del = b"DELETE /files/new.txt HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\n\r\n";
        let resp = h.handle(&request(del), &s).unwrap();
        assert_eq!(resp.status, 204);
        assert!(!root.join("files/new.txt").exists());

        let e = h.handle(&request(del), &s).unwrap_err();
        assert_eq!(e.status, 404);

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn parent_components_refused() {
        let root = temp_dir("escape");
        let s = server(&root);
        let (prefix, loc) = s.match_location("/files/../x").unwrap();

        let e = resolve_path(prefix, loc, "/files/../x").unwrap_err();
        assert_eq!(e.status, 403);

        let p = resolve_path(prefix, loc, "/files/sub/./b").unwrap();
        assert_eq!(p, root.join("files/sub/b"));

        let _ = fs::remove_dir_all(&root);
    }
}
