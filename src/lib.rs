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

#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_imports
)]
// Disallow warnings in examples.
#![doc(test(attr(deny(warnings))))]

//! snar is a single-threaded, selector-driven HTTP/1.1 server core.
//!
//! One loop thread services every socket: it polls for readiness, parses
//! requests incrementally across arbitrary read boundaries, hands them to a
//! user [`Router`], and writes responses back without ever blocking. Foreign
//! threads reach the loop only through the [`TaskQueue`].
//!
//! ## Examples
//!
//! A runnable server lives in the `demos` directory of the source code.

pub mod buffer;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod event_loop;
pub mod metrics;
pub mod parser;
pub mod queue;
pub mod reactor;

pub use config::{Config, ConfigError};
pub use dispatcher::Router;
pub use event_loop::EventLoop;
pub use metrics::{MetricsSnapshot, ServerMetrics};
pub use parser::{HeaderMap, Method, Request, Response, Status};
pub use queue::{Promise, TaskError, TaskQueue, TaskResult};

use thiserror::Error as ThisError;

/// Top-level failures constructing or starting the server.
#[derive(Debug, ThisError)]
pub enum Error {
    /// Socket setup or reactor creation failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The loop was already shut down and cannot be restarted.
    #[error("event loop already shut down")]
    Stopped,
}
