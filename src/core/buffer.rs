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

use std::cmp;
use std::collections::VecDeque;
use std::io::{self, Read, Write};

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum FillStatus {
    Read(usize),
    Eof,
    WouldBlock,
    Full,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum DrainStatus {
    Wrote(usize),
    Empty,
    WouldBlock,
}

/// Byte queue made of fixed size blocks, sitting between a non-blocking
/// descriptor and in-memory consumers.
///
/// Bytes are appended at the fill position of the back block and consumed
/// from the drain position of the front block. A block is only dropped
/// once it has been fully drained, and a new one is only allocated when the
/// back block is full and the total stays within capacity.
pub struct ChunkedBuffer {
    blocks: VecDeque<Box<[u8]>>,
    block_size: usize,
    fill_pos: usize,
    drain_pos: usize,
    size: usize,
    capacity: usize,
}

impl ChunkedBuffer {
    pub fn new(capacity: usize, block_size: usize) -> Self {
        assert!(block_size > 0);
        assert!(capacity >= block_size);

        Self {
            blocks: VecDeque::new(),
            block_size,
            fill_pos: 0,
            drain_pos: 0,
            size: 0,
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_full(&self) -> bool {
        self.size >= self.capacity
    }

    pub fn write_avail(&self) -> usize {
        self.capacity - self.size
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
        self.fill_pos = 0;
        self.drain_pos = 0;
        self.size = 0;
    }

    /// Undrained bytes of the front block.
    pub fn read_buf(&self) -> &[u8] {
        match self.blocks.front() {
            Some(block) => {
                let end = if self.blocks.len() == 1 {
                    self.fill_pos
                } else {
                    self.block_size
                };

                &block[self.drain_pos..end]
            }
            None => &[],
        }
    }

    pub fn read_commit(&mut self, amount: usize) {
        assert!(amount <= self.read_buf().len());

        self.drain_pos += amount;
        self.size -= amount;

        self.release_drained();
    }

    /// Copy everything out, front to back.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size);

        let last = self.blocks.len().saturating_sub(1);

        for (i, block) in self.blocks.iter().enumerate() {
            let start = if i == 0 { self.drain_pos } else { 0 };
            let end = if i == last {
                self.fill_pos
            } else {
                self.block_size
            };

            out.extend_from_slice(&block[start..end]);
        }

        out
    }

    /// One read from `r` into the back block.
    pub fn fill_from<R: Read>(&mut self, r: &mut R) -> Result<FillStatus, io::Error> {
        if self.is_full() {
            return Ok(FillStatus::Full);
        }

        let dest = self.fill_buf();

        match r.read(dest) {
            Ok(0) => Ok(FillStatus::Eof),
            Ok(size) => {
                self.fill_commit(size);

                Ok(FillStatus::Read(size))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(FillStatus::WouldBlock),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(FillStatus::WouldBlock),
            Err(e) => Err(e),
        }
    }

    /// One write of the front block's undrained bytes to `w`.
    pub fn drain_to<W: Write>(&mut self, w: &mut W) -> Result<DrainStatus, io::Error> {
        if self.is_empty() {
            return Ok(DrainStatus::Empty);
        }

        match w.write(self.read_buf()) {
            Ok(0) => Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(size) => {
                self.read_commit(size);

                Ok(DrainStatus::Wrote(size))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(DrainStatus::WouldBlock),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(DrainStatus::WouldBlock),
            Err(e) => Err(e),
        }
    }

    // writable region of the back block, bounded by remaining capacity.
    // allocates a new block if the back block is full
    fn fill_buf(&mut self) -> &mut [u8] {
        if self.blocks.is_empty() || self.fill_pos == self.block_size {
            self.blocks
                .push_back(vec![0; self.block_size].into_boxed_slice());
            self.fill_pos = 0;
        }

        let avail = cmp::min(self.block_size - self.fill_pos, self.write_avail());
        let start = self.fill_pos;

        // non-empty: checked above
        let block = self.blocks.back_mut().map(|b| &mut b[..]).unwrap_or(&mut []);

        &mut block[start..(start + avail)]
    }

    fn fill_commit(&mut self, amount: usize) {
        assert!(self.fill_pos + amount <= self.block_size);

        self.fill_pos += amount;
        self.size += amount;
    }

    fn release_drained(&mut self) {
        if self.blocks.len() > 1 && self.drain_pos == self.block_size {
            self.blocks.pop_front();
            self.drain_pos = 0;
        } else if self.blocks.len() == 1 && self.drain_pos == self.fill_pos {
            self.blocks.clear();
            self.drain_pos = 0;
            self.fill_pos = 0;
        }
    }
}

impl Read for ChunkedBuffer {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, io::Error> {
        let mut total = 0;

        while total < buf.len() {
            let src = self.read_buf();
            if src.is_empty() {
                break;
            }

            let size = cmp::min(src.len(), buf.len() - total);

            buf[total..(total + size)].copy_from_slice(&src[..size]);

            self.read_commit(size);
            total += size;
        }

        Ok(total)
    }
}

impl Write for ChunkedBuffer {
    fn write(&mut self, buf: &[u8]) -> Result<usize, io::Error> {
        if !buf.is_empty() && self.is_full() {
            return Err(io::Error::from(io::ErrorKind::WriteZero));
        }

        let mut total = 0;

        while total < buf.len() && !self.is_full() {
            let dest = self.fill_buf();
            let size = cmp::min(dest.len(), buf.len() - total);

            dest[..size].copy_from_slice(&buf[total..(total + size)]);

            self.fill_commit(size);
            total += size;
        }

        Ok(total)
    }

    fn flush(&mut self) -> Result<(), io::Error> {
        Ok(())
    }
}
