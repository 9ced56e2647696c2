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

use crate::core::log::Logger;
use socket2::{Domain, SockRef, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{BorrowedFd, OwnedFd, RawFd};

pub const LISTEN_BACKLOG: i32 = 128;

/// Create a non-blocking listening socket.
pub fn bind_listener(addr: SocketAddr, backlog: i32) -> Result<OwnedFd, io::Error> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

pub fn local_addr(fd: BorrowedFd<'_>) -> Result<SocketAddr, io::Error> {
    let sock = SockRef::from(&fd);

    match sock.local_addr()?.as_socket() {
        Some(addr) => Ok(addr),
        None => Err(io::Error::from(io::ErrorKind::InvalidInput)),
    }
}

fn set_socket_opts(socket: &Socket, log: &Logger) {
    if let Err(e) = socket.set_nodelay(true) {
        log.error(format_args!("set nodelay failed: {:?}", e));
    }

    if let Err(e) = socket.set_keepalive(true) {
        log.error(format_args!("set keepalive failed: {:?}", e));
    }
}

/// Accept one pending connection. Returns `None` once the backlog is empty.
pub fn accept(
    listener: BorrowedFd<'_>,
    log: &Logger,
) -> Result<Option<(OwnedFd, Option<SocketAddr>)>, io::Error> {
    let sock = SockRef::from(&listener);

    let (socket, peer) = match sock.accept() {
        Ok(ret) => ret,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
        Err(e) => return Err(e),
    };

    socket.set_nonblocking(true)?;
    set_socket_opts(&socket, log);

    Ok(Some((socket.into(), peer.as_socket())))
}

pub fn set_nonblocking(fd: RawFd) -> Result<(), io::Error> {
    // SAFETY: fcntl on a caller-owned descriptor
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: as above
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}
