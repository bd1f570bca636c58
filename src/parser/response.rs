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

//! Response model and wire framing

use std::io::Write;

use super::headers::HeaderMap;
use super::status::Status;

/// Response handed back by a router, framed to bytes by [`Response::serialize`].
#[derive(Debug, Clone)]
pub struct Response {
    status: Status,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl Response {
    /// Creates an empty response with the given status.
    pub fn new(status: Status) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    /// Minimal error response: plain-text reason phrase as the body.
    pub fn error(status: Status) -> Self {
        Self::new(status)
            .header("Content-Type", "text/plain")
            .body(status.reason())
    }

    /// Appends a header. Values are raw bytes; strings coerce.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Replaces the body.
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Response status.
    #[inline]
    pub fn status(&self) -> Status {
        self.status
    }

    /// Response headers in insertion order.
    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Response body bytes.
    #[inline]
    pub fn body_bytes(&self) -> &[u8] {
        &self.body
    }

    /// Frames the response into one contiguous byte vector: status line,
    /// headers in insertion order, then the body.
    ///
    /// `Content-Length` and `Connection` are filled in when the caller has
    /// not set them; user-provided values win.
    pub fn serialize(&self, keep_alive: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.body.len());

        // infallible: Write for Vec<u8> cannot error
        let _ = write!(
            out,
            "HTTP/1.1 {} {}\r\n",
            self.status.code(),
            self.status.reason()
        );
        for (name, value) in self.headers.iter() {
            let _ = write!(out, "{name}: ");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }
        if !self.headers.contains("Content-Length") {
            let _ = write!(out, "Content-Length: {}\r\n", self.body.len());
        }
        if !self.headers.contains("Connection") {
            let connection = if keep_alive { "keep-alive" } else { "close" };
            let _ = write!(out, "Connection: {connection}\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn serializes_status_line_headers_and_body_in_order() {
        let raw = Response::new(Status::Ok)
            .header("Content-Type", "text/plain")
            .header("X-B", "2")
            .body("hi")
            .serialize(true);
        assert_eq!(
            b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nX-B: 2\r\n\
              Content-Length: 2\r\nConnection: keep-alive\r\n\r\nhi" as &[u8],
            raw.as_slice()
        );
    }

    #[test]
    fn close_decision_reflected_in_connection_header() {
        let raw = Response::new(Status::NotFound).serialize(false);
        let text = String::from_utf8(raw).unwrap();
        assert!(text.contains("\r\nConnection: close\r\n"));
    }

    #[test]
    fn caller_provided_length_and_connection_win() {
        let raw = Response::new(Status::Ok)
            .header("Content-Length", "0")
            .header("Connection", "close")
            .serialize(true);
        let text = String::from_utf8(raw).unwrap();
        assert_eq!(1, text.matches("Content-Length").count());
        assert_eq!(1, text.matches("Connection").count());
        assert!(text.contains("Connection: close"));
    }

    #[test]
    fn frame_reparses_to_the_same_fields() {
        let raw = Response::new(Status::Created)
            .header("X-One", "a")
            .header("x-one", "b")
            .body("payload")
            .serialize(true);
        let text = String::from_utf8(raw).unwrap();
        let (head, body) = text.split_once("\r\n\r\n").unwrap();
        let mut lines = head.split("\r\n");
        assert_eq!("HTTP/1.1 201 Created", lines.next().unwrap());
        let parsed: Vec<(&str, &str)> =
            lines.map(|l| l.split_once(": ").unwrap()).collect();
        assert_eq!(
            vec![
                ("X-One", "a"),
                ("x-one", "b"),
                ("Content-Length", "7"),
                ("Connection", "keep-alive"),
            ],
            parsed
        );
        assert_eq!("payload", body);
    }
}
