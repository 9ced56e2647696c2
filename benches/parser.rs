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

use criterion::{criterion_group, criterion_main, Criterion};
use webserv::core::buffer::ChunkedBuffer;
use webserv::core::http1::{Limits, RequestParser};

const LIMITS: Limits = Limits {
    max_headers_size: 8192,
    max_body_size: 1024 * 1024,
};

const GET: &[u8] = b"GET /static/img/logo.png?v=3 HTTP/1.1\r\n\
    Host: example.com\r\n\
    User-Agent: bench\r\n\
    Accept: */*\r\n\
    Accept-Encoding: gzip, deflate\r\n\
    Connection: keep-alive\r\n\
    \r\n";

fn chunked_post(chunks: usize) -> Vec<u8> {
    let mut out = b"POST /upload/f HTTP/1.1\r\nHost: example.com\r\nTransfer-Encoding: chunked\r\n\r\n"
        .to_vec();

    for _ in 0..chunks {
        out.extend_from_slice(b"40\r\n");
        out.extend_from_slice(&[b'x'; 64]);
        out.extend_from_slice(b"\r\n");
    }

    out.extend_from_slice(b"0\r\n\r\n");

    out
}

fn parse_all(p: &mut RequestParser, data: &[u8]) {
    p.reset();

    let mut pos = 0;
    while !p.is_complete() {
        let (size, _) = p.feed(&data[pos..]).unwrap();
        pos += size;
    }

    assert!(p.take_request().is_some());
}

fn criterion_benchmark(c: &mut Criterion) {
    let mut p = RequestParser::new(LIMITS, 80);

    c.bench_function("parse get", |b| b.iter(|| parse_all(&mut p, GET)));

    const CHUNK_COUNT: usize = 256;
    let post = chunked_post(CHUNK_COUNT);

    c.bench_function(&format!("parse chunked post {CHUNK_COUNT}"), |b| {
        b.iter(|| parse_all(&mut p, &post))
    });

    // the way a connection feeds it: block by block out of its read buffer
    c.bench_function(&format!("buffered chunked post {CHUNK_COUNT}"), |b| {
        let mut buf = ChunkedBuffer::new(post.len(), 1024);

        b.iter(|| {
            let mut src = &post[..];
            while !src.is_empty() {
                let size = std::io::Write::write(&mut buf, src).unwrap();
                src = &src[size..];
            }

            p.reset();
            while !p.is_complete() {
                let (size, _) = p.feed(buf.read_buf()).unwrap();
                buf.read_commit(size);
            }

            buf.clear();
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
