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

//! Byte cursor over a buffered request

/// Cursor over the raw bytes of a request's header section. Tracks a read
/// position so callers can take delimited tokens without copying.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    inner: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(slice: &'a [u8]) -> Self {
        Cursor { inner: slice, pos: 0 }
    }

    #[inline]
    pub fn pos(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pos == self.inner.len()
    }

    #[inline]
    pub fn peek(&self) -> Option<u8> {
        self.inner.get(self.pos).copied()
    }

    #[inline]
    pub fn bump(&mut self) -> Option<u8> {
        let b = self.inner.get(self.pos).copied();
        if b.is_some() {
            self.pos += 1;
        }
        b
    }

    /// Takes the bytes up to (excluding) the next occurrence of `delim` and
    /// positions the cursor after the delimiter. `None` if the delimiter does
    /// not occur in the remainder.
    pub fn take_until(&mut self, delim: u8) -> Option<&'a [u8]> {
        let rest = &self.inner[self.pos..];
        let at = rest.iter().position(|&b| b == delim)?;
        let token = &rest[..at];
        self.pos += at + 1;
        Some(token)
    }

    /// Takes the bytes up to (excluding) the next CRLF and positions the
    /// cursor after it. A bare CR or LF does not terminate a line.
    pub fn take_line(&mut self) -> Option<&'a [u8]> {
        let rest = &self.inner[self.pos..];
        let at = rest.windows(2).position(|w| w == b"\r\n")?;
        let line = &rest[..at];
        self.pos += at + 2;
        Some(line)
    }

    /// Remainder of the buffer from the current position.
    #[inline]
    pub fn rest(&self) -> &'a [u8] {
        &self.inner[self.pos..]
    }
}

#[cfg(test)]
mod test {
    use super::Cursor;

    #[test]
    fn cursor_constructs_at_start() {
        let cur = Cursor::new(b"GET / HTTP/1.1");
        assert_eq!(0, cur.pos());
        assert!(!cur.is_empty());
    }

    #[test]
    fn cursor_take_until_consumes_token_and_delimiter() {
        let mut cur = Cursor::new(b"GET / HTTP/1.1");
        assert_eq!(Some(b"GET" as &[u8]), cur.take_until(b' '));
        assert_eq!(4, cur.pos());
        assert_eq!(Some(b'/'), cur.peek());
    }

    #[test]
    fn cursor_take_until_returns_none_without_delimiter() {
        let mut cur = Cursor::new(b"HTTP/1.1");
        assert_eq!(None, cur.take_until(b' '));
        assert_eq!(0, cur.pos());
    }

    #[test]
    fn cursor_take_until_yields_empty_token_between_delimiters() {
        let mut cur = Cursor::new(b"a  b");
        assert_eq!(Some(b"a" as &[u8]), cur.take_until(b' '));
        assert_eq!(Some(b"" as &[u8]), cur.take_until(b' '));
    }

    #[test]
    fn cursor_take_line_stops_at_crlf_only() {
        let mut cur = Cursor::new(b"Host: x\rstill\r\nnext");
        assert_eq!(Some(b"Host: x\rstill" as &[u8]), cur.take_line());
        assert_eq!(b"next", cur.rest());
    }

    #[test]
    fn cursor_take_line_exhausts_to_empty() {
        let mut cur = Cursor::new(b"a\r\n\r\n");
        assert_eq!(Some(b"a" as &[u8]), cur.take_line());
        assert_eq!(Some(b"" as &[u8]), cur.take_line());
        assert!(cur.is_empty());
    }
}
