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

//! HTTP/1.1 Request
//! IETF RFC 9112

use super::cursor::Cursor;
use super::headers::HeaderMap;
use super::{Method, ParseError, ParseResult, Version};

/// Parsed H1 request. Immutable once constructed.
#[derive(Debug)]
pub struct Request {
    method: Method,
    target: String,
    version: Version,
    headers: HeaderMap,
    body: Vec<u8>,
    keep_alive: bool,
}

impl Request {
    /// Request method.
    #[inline]
    pub fn method(&self) -> Method {
        self.method
    }

    /// Request target, verbatim as received. No normalization is applied.
    #[inline]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Protocol version from the request line.
    #[inline]
    pub fn version(&self) -> Version {
        self.version
    }

    /// Request headers in arrival order.
    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Request body. Empty unless a `Content-Length` body was received in
    /// full.
    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Keep-Alive decision derived at parse time (RFC 9112 9.3). Re-evaluated
    /// against the response status before the response is framed.
    #[inline]
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }
}

/// Outcome of an incremental parse attempt.
#[derive(Debug)]
pub enum ParseOutcome {
    /// A full request was recognized; `consumed` bytes of the input belong to
    /// it and must be released from the connection's inbound chain.
    Complete {
        /// The parsed request.
        request: Request,
        /// Header and body bytes belonging to this request.
        consumed: usize,
    },
    /// More bytes are required. Nothing was consumed.
    Partial,
}

/// Locates the end of the header section: the index just past the first
/// CRLFCRLF, scanning forward.
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Attempts to parse one request from `buf`.
///
/// Yields `Partial` until the header terminator and any `Content-Length`
/// body have fully arrived. `max_size` caps the combined header and body
/// size; crossing it fails with `ParseError::TooLarge`.
///
/// # Example
/// ```
/// # use snar::parser::{parse_request, Method, ParseOutcome};
/// # fn main() -> Result<(), snar::parser::ParseError> {
/// let outcome = parse_request(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n", 1 << 20)?;
/// match outcome {
///     ParseOutcome::Complete { request, consumed } => {
///         assert_eq!(Method::Get, request.method());
///         assert_eq!(27, consumed);
///     }
///     ParseOutcome::Partial => unreachable!(),
/// }
/// # Ok(())
/// # }
/// ```
pub fn parse_request(buf: &[u8], max_size: usize) -> ParseResult<ParseOutcome> {
    let head_end = match find_header_end(buf) {
        Some(end) => end,
        None => {
            if buf.len() > max_size {
                return Err(ParseError::TooLarge);
            }
            return Ok(ParseOutcome::Partial);
        }
    };

    if head_end > max_size {
        return Err(ParseError::TooLarge);
    }

    let mut head = Cursor::new(&buf[..head_end]);
    let (method, target, version) = parse_request_line(&mut head)?;
    let headers = parse_header_lines(&mut head)?;

    if headers.contains("Transfer-Encoding") {
        return Err(ParseError::UnsupportedEncoding);
    }

    let content_length = match headers.get("Content-Length") {
        Some(v) => std::str::from_utf8(v)
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .ok_or(ParseError::Malformed)?,
        None => 0,
    };

    let total = head_end
        .checked_add(content_length)
        .ok_or(ParseError::TooLarge)?;
    if total > max_size {
        return Err(ParseError::TooLarge);
    }
    if buf.len() < total {
        return Ok(ParseOutcome::Partial);
    }

    let body = buf[head_end..total].to_vec();
    let keep_alive = decide_keep_alive(version, &headers);

    Ok(ParseOutcome::Complete {
        request: Request {
            method,
            target,
            version,
            headers,
            body,
            keep_alive,
        },
        consumed: total,
    })
}

/// Splits the request line on single spaces into exactly three tokens.
fn parse_request_line(head: &mut Cursor<'_>) -> ParseResult<(Method, String, Version)> {
    let line = head.take_line().ok_or(ParseError::Malformed)?;
    let mut line = Cursor::new(line);

    let method_token = line.take_until(b' ').ok_or(ParseError::Malformed)?;
    if method_token.is_empty() {
        return Err(ParseError::Malformed);
    }
    let method = Method::from_bytes(method_token)?;

    let target_token = line.take_until(b' ').ok_or(ParseError::Malformed)?;
    if target_token.is_empty() {
        return Err(ParseError::Malformed);
    }
    let target = String::from_utf8(target_token.to_vec()).map_err(|_| ParseError::Malformed)?;

    let version_token = line.rest();
    if version_token.is_empty() || version_token.contains(&b' ') {
        return Err(ParseError::Malformed);
    }
    let version = Version::from_bytes(version_token)?;

    Ok((method, target, version))
}

/// Parses `name ":" OWS value OWS` lines until the blank terminator line.
fn parse_header_lines(head: &mut Cursor<'_>) -> ParseResult<HeaderMap> {
    let mut headers = HeaderMap::new();

    loop {
        let line = head.take_line().ok_or(ParseError::Malformed)?;
        if line.is_empty() {
            return Ok(headers);
        }

        let mut line = Cursor::new(line);
        let name = line.take_until(b':').ok_or(ParseError::Malformed)?;
        if name.is_empty() || !name.iter().all(|&b| is_header_name_token(b)) {
            return Err(ParseError::Malformed);
        }

        // the tchar check above guarantees the name is ASCII; values stay raw
        // bytes since field content may carry obs-text
        let value = trim_ows(line.rest());
        let name = String::from_utf8(name.to_vec()).map_err(|_| ParseError::Malformed)?;
        headers.append(name, value.to_vec());
    }
}

/// tchar per RFC 9110 Section 5.6.2.
fn is_header_name_token(b: u8) -> bool {
    matches!(b,
        b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9'
        | b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.'
        | b'^' | b'_' | b'`' | b'|' | b'~')
}

/// OWS = *( SP / HTAB ), RFC 9110 Section 5.6.3.
fn trim_ows(mut value: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = value {
        value = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = value {
        value = rest;
    }
    value
}

/// RFC 9112 9.3: HTTP/1.1 persists unless `Connection: close`; HTTP/1.0
/// persists only with `Connection: keep-alive`.
fn decide_keep_alive(version: Version, headers: &HeaderMap) -> bool {
    let connection = headers.get("Connection");
    match version {
        Version::H1_1 => !matches!(connection, Some(v) if v.eq_ignore_ascii_case(b"close")),
        Version::H1_0 => {
            matches!(connection, Some(v) if v.eq_ignore_ascii_case(b"keep-alive"))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SIZE_CAP: usize = 1 << 20;

    fn complete(buf: &[u8]) -> (Request, usize) {
        match parse_request(buf, SIZE_CAP) {
            Ok(ParseOutcome::Complete { request, consumed }) => (request, consumed),
            other => panic!("expected complete parse, got {other:?}"),
        }
    }

    fn assert_partial(buf: &[u8]) {
        assert!(
            matches!(parse_request(buf, SIZE_CAP), Ok(ParseOutcome::Partial)),
            "expected partial for {:?}",
            String::from_utf8_lossy(buf)
        );
    }

    #[test]
    fn parses_get_without_body() {
        let (req, consumed) = complete(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(Method::Get, req.method());
        assert_eq!("/hello", req.target());
        assert_eq!(Version::H1_1, req.version());
        assert_eq!(Some(b"x" as &[u8]), req.headers().get("host"));
        assert!(req.body().is_empty());
        assert!(req.keep_alive());
        assert_eq!(32, consumed);
    }

    #[test]
    fn every_prefix_of_a_full_request_is_partial() {
        let full = b"POST /submit HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\n\r\nabcd";
        for n in 0..full.len() {
            assert_partial(&full[..n]);
        }
        let (req, consumed) = complete(full);
        assert_eq!(b"abcd", req.body());
        assert_eq!(full.len(), consumed);
    }

    #[test]
    fn split_points_agree_with_concatenated_parse() {
        // Parsing any prefix must never produce a different final request
        // than parsing the whole stream at once.
        let full = b"PUT /x HTTP/1.1\r\nA: 1\r\nB: 2\r\nContent-Length: 2\r\n\r\nhi";
        let (whole, _) = complete(full);
        for n in 1..full.len() {
            // arrival in two chunks: first n bytes, then the rest
            let mut buf = full[..n].to_vec();
            assert_partial(&buf);
            buf.extend_from_slice(&full[n..]);
            let (req, _) = complete(&buf);
            assert_eq!(whole.target(), req.target());
            assert_eq!(whole.body(), req.body());
            assert_eq!(
                whole.headers().iter().collect::<Vec<_>>(),
                req.headers().iter().collect::<Vec<_>>()
            );
        }
    }

    #[test]
    fn trailing_bytes_beyond_content_length_are_not_consumed() {
        let (req, consumed) =
            complete(b"POST / HTTP/1.1\r\nContent-Length: 3\r\n\r\nabcGET /next");
        assert_eq!(b"abc", req.body());
        assert_eq!(b"POST / HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc".len(), consumed);
    }

    #[test]
    fn duplicate_headers_preserved_in_order() {
        let (req, _) = complete(b"GET / HTTP/1.1\r\nX-Tag: a\r\nHost: h\r\nX-Tag: b\r\n\r\n");
        assert_eq!(
            vec![b"a" as &[u8], b"b" as &[u8]],
            req.headers().get_all("x-tag").collect::<Vec<_>>()
        );
    }

    #[test]
    fn header_value_ows_is_trimmed_name_case_preserved() {
        let (req, _) = complete(b"GET / HTTP/1.1\r\nX-Pad: \t padded \t\r\n\r\n");
        assert_eq!(Some("padded"), req.headers().get_str("X-Pad"));
        assert_eq!(
            vec![("X-Pad", b"padded" as &[u8])],
            req.headers().iter().collect::<Vec<_>>()
        );
    }

    #[test]
    fn obs_text_header_values_parse_as_raw_bytes() {
        let (req, _) = complete(b"GET / HTTP/1.1\r\nX-Raw: caf\xe9\r\n\r\n");
        assert_eq!(Some(b"caf\xe9" as &[u8]), req.headers().get("x-raw"));
        assert_eq!(None, req.headers().get_str("x-raw"));
    }

    #[test]
    fn http11_defaults_to_keep_alive() {
        let (req, _) = complete(b"GET / HTTP/1.1\r\n\r\n");
        assert!(req.keep_alive());
    }

    #[test]
    fn http11_connection_close_honored() {
        let (req, _) = complete(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n");
        assert!(!req.keep_alive());
    }

    #[test]
    fn http10_defaults_to_close() {
        let (req, _) = complete(b"GET / HTTP/1.0\r\n\r\n");
        assert!(!req.keep_alive());
    }

    #[test]
    fn http10_keep_alive_honored() {
        let (req, _) = complete(b"GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n");
        assert!(req.keep_alive());
    }

    #[test]
    fn unknown_method_is_rejected() {
        assert_eq!(
            Err(ParseError::UnsupportedMethod),
            parse_request(b"BREW /pot HTTP/1.1\r\n\r\n", SIZE_CAP).map(|_| ())
        );
    }

    #[test]
    fn chunked_transfer_encoding_is_refused() {
        assert_eq!(
            Err(ParseError::UnsupportedEncoding),
            parse_request(
                b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n",
                SIZE_CAP
            )
            .map(|_| ())
        );
    }

    #[test]
    fn request_line_must_have_three_tokens() {
        for raw in [
            b"GET /\r\n\r\n" as &[u8],
            b"GET  / HTTP/1.1\r\n\r\n",
            b"GET / HTTP/1.1 extra\r\n\r\n",
            b" GET / HTTP/1.1\r\n\r\n",
        ] {
            assert_eq!(
                Err(ParseError::Malformed),
                parse_request(raw, SIZE_CAP).map(|_| ()),
                "{:?}",
                String::from_utf8_lossy(raw)
            );
        }
    }

    #[test]
    fn unsupported_version_is_malformed() {
        assert_eq!(
            Err(ParseError::Malformed),
            parse_request(b"GET / HTTP/2.0\r\n\r\n", SIZE_CAP).map(|_| ())
        );
    }

    #[test]
    fn header_line_without_colon_is_malformed() {
        assert_eq!(
            Err(ParseError::Malformed),
            parse_request(b"GET / HTTP/1.1\r\nNoColonHere\r\n\r\n", SIZE_CAP).map(|_| ())
        );
    }

    #[test]
    fn header_name_with_space_is_malformed() {
        assert_eq!(
            Err(ParseError::Malformed),
            parse_request(b"GET / HTTP/1.1\r\nBad Name: x\r\n\r\n", SIZE_CAP).map(|_| ())
        );
    }

    #[test]
    fn non_numeric_content_length_is_malformed() {
        assert_eq!(
            Err(ParseError::Malformed),
            parse_request(b"POST / HTTP/1.1\r\nContent-Length: ten\r\n\r\n", SIZE_CAP).map(|_| ())
        );
    }

    #[test]
    fn headers_of_exactly_the_cap_succeed() {
        let mut raw = b"GET / HTTP/1.1\r\nX-Fill: ".to_vec();
        let line_end = b"\r\n\r\n";
        let cap = raw.len() + 100 + line_end.len();
        raw.extend(std::iter::repeat(b'a').take(100));
        raw.extend_from_slice(line_end);
        assert_eq!(cap, raw.len());
        assert!(matches!(
            parse_request(&raw, cap),
            Ok(ParseOutcome::Complete { .. })
        ));
    }

    #[test]
    fn one_byte_over_the_cap_fails_with_too_large() {
        // terminator never arrives; buffered bytes exceed the cap by one
        let raw = vec![b'a'; 101];
        assert_eq!(
            Err(ParseError::TooLarge),
            parse_request(&raw, 100).map(|_| ())
        );
        // a body crossing the cap is also refused even though headers fit
        assert_eq!(
            Err(ParseError::TooLarge),
            parse_request(b"POST / HTTP/1.1\r\nContent-Length: 90\r\n\r\n", 100).map(|_| ())
        );
    }

    #[test]
    fn malformed_prefix_never_yields_a_request() {
        // before the terminator arrives the parser may only say "not yet"
        let raw = b"GARBAGE!!!\r\n";
        assert_partial(raw);
        // once the section terminates, the verdict is a definite error
        assert!(parse_request(b"GARBAGE!!!\r\n\r\n", SIZE_CAP).is_err());
    }
}
