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

//! Incremental HTTP/1.1 parsing and response framing

use std::fmt::Display;

mod cursor;
pub mod headers;
pub mod request;
pub mod response;
pub mod status;

pub use headers::HeaderMap;
pub use request::{parse_request, ParseOutcome, Request};
pub use response::Response;
pub use status::Status;

/// Representation of the requested HTTP Method
/// [IETF RFC 9110 Section 9](https://www.rfc-editor.org/rfc/rfc9110#section-9)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// RFC 9110 9.3.1
    Get,
    /// RFC 9110 9.3.2
    Head,
    /// RFC 9110 9.3.3
    Post,
    /// RFC 9110 9.3.4
    Put,
    /// RFC 9110 9.3.5
    Delete,
    /// RFC 9110 9.3.7
    Options,
    /// RFC 9110 9.3.8
    Trace,
    /// RFC 5789
    Patch,
}

impl Method {
    /// Maps a request-line token to a method. Unrecognized tokens are a
    /// `ParseError::UnsupportedMethod`.
    pub fn from_bytes(token: &[u8]) -> ParseResult<Self> {
        match token {
            b"GET" => Ok(Method::Get),
            b"HEAD" => Ok(Method::Head),
            b"POST" => Ok(Method::Post),
            b"PUT" => Ok(Method::Put),
            b"DELETE" => Ok(Method::Delete),
            b"OPTIONS" => Ok(Method::Options),
            b"TRACE" => Ok(Method::Trace),
            b"PATCH" => Ok(Method::Patch),
            _ => Err(ParseError::UnsupportedMethod),
        }
    }
}

impl Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Options => "OPTIONS",
            Self::Trace => "TRACE",
            Self::Patch => "PATCH",
        })
    }
}

/// Representation of the requested HTTP version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    /// HTTP/1.0
    H1_0,
    /// HTTP/1.1
    H1_1,
}

impl Version {
    /// Maps a request-line version token. Anything other than HTTP/1.0 or
    /// HTTP/1.1 is malformed for this server.
    pub fn from_bytes(token: &[u8]) -> ParseResult<Self> {
        match token {
            b"HTTP/1.0" => Ok(Version::H1_0),
            b"HTTP/1.1" => Ok(Version::H1_1),
            _ => Err(ParseError::Malformed),
        }
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::H1_0 => "HTTP/1.0",
            Self::H1_1 => "HTTP/1.1",
        })
    }
}

/// Represents possible failures while parsing
#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    /// Request line or header section violates the grammar.
    Malformed,
    /// Buffered bytes exceed the configured request-size cap.
    TooLarge,
    /// Method token is not one this server recognizes.
    UnsupportedMethod,
    /// Transfer-Encoding the server refuses to decode.
    UnsupportedEncoding,
}

impl ParseError {
    fn description_str(&self) -> &'static str {
        match *self {
            ParseError::Malformed => "Malformed request",
            ParseError::TooLarge => "Request exceeds size cap",
            ParseError::UnsupportedMethod => "Unrecognized method",
            ParseError::UnsupportedEncoding => "Unsupported transfer encoding",
        }
    }

    /// Status code the failed connection is answered with before close.
    pub fn status(&self) -> Status {
        match *self {
            ParseError::Malformed => Status::BadRequest,
            ParseError::TooLarge => Status::ContentTooLarge,
            ParseError::UnsupportedMethod => Status::BadRequest,
            ParseError::UnsupportedEncoding => Status::NotImplemented,
        }
    }
}

impl Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description_str())
    }
}

impl std::error::Error for ParseError {}

/// Result whose Err variant is `ParseError`
pub type ParseResult<T> = std::result::Result<T, ParseError>;
