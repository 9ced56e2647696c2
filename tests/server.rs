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

use std::fs;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use test_log::test;
use webserv::config::Config;
use webserv::core::log::Logger;
use webserv::handler::{DefaultHandler, DefaultRenderer};
use webserv::reactor::Reactor;

struct TestServer {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl TestServer {
    fn new(root: &Path) -> Self {
        let json = format!(
            r#"{{
                "max_poll_timeout": 20,
                "servers": [
                    {{
                        "server_name": "localhost",
                        "host": "127.0.0.1",
                        "port": 1,
                        "is_cgi": true,
                        "cgi_config": {{ "sh": "/bin/sh" }},
                        "locations": {{
                            "/": {{ "root": "{0}/www", "index": "index.html" }},
                            "/upload": {{ "root": "{0}/upload", "methods": ["GET", "POST", "DELETE"] }},
                            "/cgi": {{ "root": "{0}/cgi", "methods": ["GET", "POST"] }}
                        }}
                    }}
                ]
            }}"#,
            root.display()
        );

        let mut config = Config::from_json(&json).unwrap();
        config.servers[0].port = 0;

        let (s, r) = mpsc::channel();

        // the reactor is bound to the thread that built it
        let thread = thread::spawn(move || {
            let log = Logger::global();

            let mut reactor = Reactor::new(
                &config,
                Box::new(DefaultHandler::new(log.clone())),
                Box::new(DefaultRenderer::default()),
                log,
            )
            .unwrap();

            s.send((reactor.local_addrs()[0], reactor.stop_handle()))
                .unwrap();

            reactor.run().unwrap();
        });

        let (addr, stop) = r.recv().unwrap();

        Self {
            addr,
            stop,
            thread: Some(thread),
        }
    }

    fn connect(&self) -> TcpStream {
        let client = TcpStream::connect(self.addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        client
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);

        if let Some(thread) = self.thread.take() {
            thread.join().unwrap();
        }
    }
}

fn setup(name: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!("webserv-it-{}-{}", name, std::process::id()));
    let _ = fs::remove_dir_all(&root);

    fs::create_dir_all(root.join("www")).unwrap();
    fs::create_dir_all(root.join("upload")).unwrap();
    fs::create_dir_all(root.join("cgi")).unwrap();

    fs::write(root.join("www/index.html"), "<p>home</p>").unwrap();
    fs::write(root.join("www/hello.txt"), "hello world").unwrap();

    fs::write(
        root.join("cgi/query.sh"),
        "printf 'Content-Type: text/plain\\r\\n\\r\\n'\nprintf 'query=%s method=%s' \"$QUERY_STRING\" \"$REQUEST_METHOD\"\n",
    )
    .unwrap();

    fs::write(
        root.join("cgi/echo.sh"),
        "printf 'Status: 201 Created\\r\\n\\r\\n'\ncat\n",
    )
    .unwrap();

    fs::write(root.join("cgi/broken.sh"), "printf 'no header block'\n").unwrap();

    root
}

// read one response framed by its Content-Length
fn read_response(client: &mut TcpStream) -> String {
    let mut data = Vec::new();
    let mut buf = [0; 1];

    while !data.ends_with(b"\r\n\r\n") {
        let size = client.read(&mut buf).unwrap();
        assert_eq!(size, 1, "connection closed mid head");
        data.push(buf[0]);
    }

    let head = String::from_utf8(data.clone()).unwrap();
    let len: usize = head
        .lines()
        .find_map(|l| l.strip_prefix("Content-Length: "))
        .map(|v| v.trim().parse().unwrap())
        .unwrap_or(0);

    let mut body = vec![0; len];
    client.read_exact(&mut body).unwrap();
    data.extend_from_slice(&body);

    String::from_utf8(data).unwrap()
}

fn read_to_close(client: &mut TcpStream) -> String {
    let mut out = Vec::new();
    client.read_to_end(&mut out).unwrap();

    String::from_utf8(out).unwrap()
}

#[test]
fn keep_alive_pipelining() {
    let root = setup("keepalive");
    let server = TestServer::new(&root);
    let mut client = server.connect();

    client
        .write_all(
            b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n\
              GET /hello.txt HTTP/1.1\r\nHost: localhost\r\n\r\n",
        )
        .unwrap();

    let first = read_response(&mut client);
    assert!(first.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(first.contains("Content-Type: text/html\r\n"));
    assert!(first.ends_with("<p>home</p>"));

    let second = read_response(&mut client);
    assert!(second.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(second.contains("Connection: keep-alive\r\n"));
    assert!(second.ends_with("hello world"));

    client
        .write_all(b"GET /hello.txt HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .unwrap();

    let last = read_to_close(&mut client);
    assert!(last.contains("Connection: close\r\n"));
    assert!(last.ends_with("hello world"));
}

#[test]
fn upload_and_delete() {
    let root = setup("upload");
    let server = TestServer::new(&root);
    let mut client = server.connect();

    client
        .write_all(b"POST /upload/new.txt HTTP/1.1\r\nHost: localhost\r\nContent-Length: 4\r\n\r\ndata")
        .unwrap();
    assert!(read_response(&mut client).starts_with("HTTP/1.1 201 Created\r\n"));
    assert_eq!(fs::read(root.join("upload/new.txt")).unwrap(), b"data");

    client
        .write_all(
            b"POST /upload/new.txt HTTP/1.1\r\nHost: localhost\r\nTransfer-Encoding: chunked\r\n\r\n\
              2\r\nab\r\n0\r\n\r\n",
        )
        .unwrap();
    assert!(read_response(&mut client).starts_with("HTTP/1.1 409 Conflict\r\n"));

    client
        .write_all(b"DELETE /upload/new.txt HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\n\r\n")
        .unwrap();
    assert!(read_response(&mut client).starts_with("HTTP/1.1 204 No Content\r\n"));
    assert!(!root.join("upload/new.txt").exists());

    client
        .write_all(b"DELETE /hello.txt HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\n\r\n")
        .unwrap();
    assert!(read_response(&mut client).starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
}

#[test]
fn bad_requests_close() {
    let root = setup("bad");
    let server = TestServer::new(&root);

    let mut client = server.connect();
    client.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
    let resp = read_to_close(&mut client);
    assert!(resp.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert!(resp.contains("Connection: close\r\n"));

    let mut client = server.connect();
    client
        .write_all(b"PUT / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    assert!(read_to_close(&mut client).starts_with("HTTP/1.1 400 Bad Request\r\n"));

    let mut client = server.connect();
    client
        .write_all(b"POST /upload/x HTTP/1.1\r\nHost: localhost\r\nContent-Length: 99999999\r\n\r\n")
        .unwrap();
    assert!(read_to_close(&mut client).starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
}

#[test]
fn cgi_scripts() {
    let root = setup("cgi");
    let server = TestServer::new(&root);

    let mut client = server.connect();
    client
        .write_all(b"GET /cgi/query.sh?a=1&b=2 HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let resp = read_to_close(&mut client);
    assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(resp.contains("Content-Type: text/plain\r\n"));
    assert!(resp.ends_with("query=a=1&b=2 method=GET"));

    let mut client = server.connect();
    client
        .write_all(b"POST /cgi/echo.sh HTTP/1.1\r\nHost: localhost\r\nContent-Length: 5\r\n\r\nhello")
        .unwrap();
    let resp = read_to_close(&mut client);
    assert!(resp.starts_with("HTTP/1.1 201 Created\r\n"));
    assert!(resp.ends_with("\r\n\r\nhello"));

    let mut client = server.connect();
    client
        .write_all(b"GET /cgi/broken.sh HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    assert!(read_to_close(&mut client).starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
}
