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

use std::io;
use std::str;

// some reasonable number
pub const HEADERS_MAX: usize = 64;

pub const FORBIDDEN_TARGET_CHARS: &[u8] = b" <>\"{}|\\^`";

pub fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

// digits only, no sign or whitespace
pub fn parse_as_int(src: &[u8]) -> Result<usize, io::Error> {
    if src.is_empty() || !src.iter().all(|b| b.is_ascii_digit()) {
        return Err(io::Error::from(io::ErrorKind::InvalidData));
    }

    let int_str = match str::from_utf8(src) {
        Ok(int_str) => int_str,
        Err(_) => {
            return Err(io::Error::from(io::ErrorKind::InvalidData));
        }
    };

    match int_str.parse() {
        Ok(x) => Ok(x),
        Err(_) => Err(io::Error::from(io::ErrorKind::InvalidData)),
    }
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Decode `%XX` escapes. Any `%` not followed by two hex digits, or a
/// result that is not utf-8, is an error.
pub fn percent_decode(src: &str) -> Result<String, io::Error> {
    let src = src.as_bytes();
    let mut out = Vec::with_capacity(src.len());

    let mut pos = 0;
    while pos < src.len() {
        if src[pos] == b'%' {
            if pos + 2 >= src.len() {
                return Err(io::Error::from(io::ErrorKind::InvalidData));
            }

            let hi = hex_value(src[pos + 1]);
            let lo = hex_value(src[pos + 2]);

            match (hi, lo) {
                (Some(hi), Some(lo)) => out.push((hi << 4) | lo),
                _ => return Err(io::Error::from(io::ErrorKind::InvalidData)),
            }

            pos += 3;
        } else {
            out.push(src[pos]);
            pos += 1;
        }
    }

    String::from_utf8(out).map_err(|_| io::Error::from(io::ErrorKind::InvalidData))
}

/// Split a host header value into name and optional port. Bracketed IPv6
/// literals keep their brackets.
pub fn split_host(value: &str) -> Result<(&str, Option<u16>), io::Error> {
    let invalid = || io::Error::from(io::ErrorKind::InvalidData);

    let (name, port) = if value.starts_with('[') {
        let end = value.find(']').ok_or_else(invalid)?;
        let (name, rest) = value.split_at(end + 1);

        match rest {
            "" => (name, None),
            _ => match rest.strip_prefix(':') {
                Some(port) => (name, Some(port)),
                None => return Err(invalid()),
            },
        }
    } else {
        match value.rfind(':') {
            Some(pos) => (&value[..pos], Some(&value[(pos + 1)..])),
            None => (value, None),
        }
    };

    if name.is_empty() || name.bytes().any(|b| b.is_ascii_whitespace() || b == b'/') {
        return Err(invalid());
    }

    let port = match port {
        Some(port) => {
            let port = parse_as_int(port.as_bytes())?;

            if !(1..=65535).contains(&port) {
                return Err(invalid());
            }

            Some(port as u16)
        }
        None => None,
    };

    Ok((name, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ints() {
        assert_eq!(parse_as_int(b"42").unwrap(), 42);
        assert!(parse_as_int(b"").is_err());
        assert!(parse_as_int(b"+5").is_err());
        assert!(parse_as_int(b"-1").is_err());
        assert!(parse_as_int(b" 5").is_err());
    }

    #[test]
    fn percent() {
        assert_eq!(percent_decode("/a%20b").unwrap(), "/a b");
        assert_eq!(percent_decode("/%E2%82%AC").unwrap(), "/\u{20ac}");
        assert!(percent_decode("/a%2").is_err());
        assert!(percent_decode("/a%").is_err());
        assert!(percent_decode("/a%zz").is_err());
        assert!(percent_decode("/%ff").is_err());
    }

    #[test]
    fn hosts() {
        assert_eq!(split_host("x.com").unwrap(), ("x.com", None));
        assert_eq!(split_host("x.com:8080").unwrap(), ("x.com", Some(8080)));
        assert_eq!(split_host("[::1]:80").unwrap(), ("[::1]", Some(80)));
        assert_eq!(split_host("[::1]").unwrap(), ("[::1]", None));
        assert!(split_host("x.com:0").is_err());
        assert!(split_host("x.com:65536").is_err());
        assert!(split_host("x.com:").is_err());
        assert!(split_host(":80").is_err());
        assert!(split_host("[::1]x").is_err());
    }
}
