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
use crate::core::http1::ParsedRequest;
use crate::core::log::Logger;
use crate::core::net::set_nonblocking;
use crate::handler::{MethodError, Payload, Response};
use std::fs;
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::path::Path;
use std::process::{Command, Stdio};

pub fn interpreter_for<'a>(server: &'a ServerConfig, script: &Path) -> Option<&'a Path> {
    let ext = script.extension()?.to_str()?;

    server
        .cgi
        .get(&format!(".{}", ext))
        .map(|p| p.as_path())
}

fn env_key(name: &str) -> String {
    name.chars()
        .map(|c| if c == '-' { '_' } else { c.to_ascii_uppercase() })
        .collect()
}

/// CGI/1.1 environment for a request.
pub fn environment(
    req: &ParsedRequest,
    server: &ServerConfig,
    script: &Path,
) -> Vec<(String, String)> {
    let mut env = Vec::new();

    for (name, value) in req.headers.iter() {
        env.push((env_key(name), value.clone()));
    }

    let fixed = [
        ("GATEWAY_INTERFACE", "CGI/1.1".to_string()),
        ("REQUEST_METHOD", req.method.as_str().to_string()),
        ("REQUEST_URI", req.target.clone()),
        ("PATH_INFO", req.path.clone()),
        ("QUERY_STRING", req.query.clone()),
        ("SCRIPT_FILENAME", script.display().to_string()),
        ("SCRIPT_NAME", req.path.clone()),
        ("SERVER_NAME", req.host.clone()),
        ("SERVER_PORT", server.port.to_string()),
        ("SERVER_PROTOCOL", req.version.as_str().to_string()),
        ("SERVER_SOFTWARE", "webserv".to_string()),
        ("CONTENT_LENGTH", req.body.len().to_string()),
    ];

    for (k, v) in fixed {
        env.retain(|(name, _)| name != k);
        env.push((k.to_string(), v));
    }

    env
}

/// Start the interpreter on `script` with non-blocking pipes for its stdin
/// and stdout. The child is not waited on here; exited children are reaped
/// by the event loop.
pub fn spawn(
    req: &ParsedRequest,
    server: &ServerConfig,
    interpreter: &Path,
    script: &Path,
    log: &Logger,
) -> Result<Response, MethodError> {
    let meta = match fs::symlink_metadata(script) {
        Ok(meta) => meta,
        Err(_) => return Err(MethodError::new(404, "script does not exist")),
    };

    if meta.file_type().is_symlink() {
        return Err(MethodError::new(403, "script is a symlink"));
    }

    if !meta.is_file() {
        return Err(MethodError::new(403, "script is not a regular file"));
    }

    let mut cmd = Command::new(interpreter);
    cmd.arg(script)
        .env_clear()
        .envs(environment(req, server, script))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    if let Some(dir) = script.parent() {
        cmd.current_dir(dir);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| {
            MethodError::new(
                500,
                format!("failed to start {}: {}", interpreter.display(), e),
            )
        })?;

    let stdin = child.stdin.take().map(OwnedFd::from);
    let stdout = match child.stdout.take() {
        Some(out) => OwnedFd::from(out),
        None => return Err(MethodError::new(500, "process has no stdout")),
    };

    set_nonblocking(stdout.as_raw_fd()).map_err(|e| MethodError::new(500, e.to_string()))?;

    // with no body to send, closing stdin right away gives the script EOF
    let input = match stdin {
        Some(fd) if !req.body.is_empty() => {
            set_nonblocking(fd.as_raw_fd()).map_err(|e| MethodError::new(500, e.to_string()))?;

            Some(fd)
        }
        _ => None,
    };

    log.debug(format_args!(
        "started {} {} pid={}",
        interpreter.display(),
        script.display(),
        child.id()
    ));

    Ok(Response {
        status: 200,
        content_type: None,
        payload: Payload::Process {
            input,
            output: stdout,
        },
    })
}
