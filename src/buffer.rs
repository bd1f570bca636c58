// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Inbound byte chain for a connection
//!
//! Incoming reads land in per-read chunks rather than one growing buffer, so
//! consuming a parsed prefix is O(chunks consumed) instead of shifting the
//! remainder on every request.

use std::borrow::Cow;
use std::collections::VecDeque;

/// Ordered sequence of received byte chunks with a logical read cursor.
///
/// `append` is O(1); `consume` drops exhausted chunks from the head and
/// keeps the suffix of a partially-consumed head chunk.
#[derive(Debug, Default)]
pub struct ChunkChain {
    chunks: VecDeque<Vec<u8>>,
    head_offset: usize,
    remaining: usize,
}

impl ChunkChain {
    /// Creates an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies `buf` into a new chunk at the tail.
    pub fn append(&mut self, buf: &[u8]) {
        if buf.is_empty() {
            return;
        }
        self.chunks.push_back(buf.to_vec());
        self.remaining += buf.len();
    }

    /// Unconsumed byte count.
    #[inline]
    pub fn len(&self) -> usize {
        self.remaining
    }

    /// True when every appended byte has been consumed.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.remaining == 0
    }

    /// Contiguous view of the unconsumed bytes, for parser input.
    ///
    /// Borrows when a single chunk holds everything; otherwise concatenates.
    /// Materialization happens at most once per request and is bounded by the
    /// request-size cap.
    pub fn coalesced(&self) -> Cow<'_, [u8]> {
        match self.chunks.len() {
            0 => Cow::Borrowed(&[]),
            1 => Cow::Borrowed(&self.chunks[0][self.head_offset..]),
            _ => {
                let mut flat = Vec::with_capacity(self.remaining);
                let mut chunks = self.chunks.iter();
                if let Some(head) = chunks.next() {
                    flat.extend_from_slice(&head[self.head_offset..]);
                }
                for chunk in chunks {
                    flat.extend_from_slice(chunk);
                }
                Cow::Owned(flat)
            }
        }
    }

    /// Advances the read cursor by `n` bytes, discarding exhausted chunks.
    /// `n` past the end clamps to the end.
    pub fn consume(&mut self, n: usize) {
        let mut n = n.min(self.remaining);
        self.remaining -= n;

        while n > 0 {
            let head_len = self.chunks[0].len() - self.head_offset;
            if n >= head_len {
                self.chunks.pop_front();
                self.head_offset = 0;
                n -= head_len;
            } else {
                self.head_offset += n;
                n = 0;
            }
        }
    }

    /// Drops everything, consumed or not.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.head_offset = 0;
        self.remaining = 0;
    }
}
