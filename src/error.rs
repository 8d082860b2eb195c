// Copyright 2022 jmjoy
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

//! Error types and result type aliases for the process manager.
//!
//! Errors are split by origin: the wire codec, the connection protocol,
//! request dispatch, and startup. Errors during one request never
//! propagate to other requests; the connection handler decides per
//! variant whether the connection survives.

use crate::meta::RecordType;
use std::path::PathBuf;

/// Result type alias for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Error types that can occur while serving FastCGI requests.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Wrapper of `tokio::io::Error`.
    #[error(transparent)]
    Io(#[from] tokio::io::Error),

    /// Stream ended in the middle of a record.
    #[error("Unexpected end of stream inside a record")]
    WireShort,

    /// Record header carried a protocol version other than 1.
    #[error("Unsupported FastCGI version `{version}`")]
    WireVersion {
        /// The version byte received
        version: u8,
    },

    /// A record arrived where a different type was required.
    #[error("Unexpected record type `{record_type}`, expected `{expected}`")]
    ProtoUnexpected {
        /// The record type received
        record_type: RecordType,
        /// The record type the protocol state required
        expected: RecordType,
    },

    /// The client sent ABORT_REQUEST for the in-flight request.
    #[error("Request `{id}` aborted by peer")]
    RequestAborted {
        /// The aborted request ID
        id: u16,
    },

    /// No idle worker could take the request.
    #[error("No available workers in pool `{pool}`")]
    PoolOverloaded {
        /// Name of the overloaded pool
        pool: String,
    },

    /// The worker serving the request went away before completion.
    #[error("Worker serving request `{id}` terminated before completion")]
    WorkerLost {
        /// The request ID that was in flight
        id: u16,
    },

    /// Configuration rejected during validation.
    #[error("Invalid configuration: {reason}")]
    ConfigInvalid {
        /// Human readable rejection reason
        reason: String,
    },

    /// The listen address could not be bound.
    #[error("Failed to bind `{addr}`: {source}")]
    BindFail {
        /// The configured listen address
        addr: String,
        /// The underlying I/O error
        source: tokio::io::Error,
    },

    /// The PID file could not be written.
    #[error("Failed to write pid file `{}`: {source}", path.display())]
    PidWriteFail {
        /// The configured pid file path
        path: PathBuf,
        /// The underlying I/O error
        source: tokio::io::Error,
    },
}

impl ServerError {
    /// Maps premature-EOF I/O errors onto `WireShort`, leaving other I/O
    /// errors untouched.
    pub(crate) fn from_read(err: tokio::io::Error) -> Self {
        if err.kind() == tokio::io::ErrorKind::UnexpectedEof {
            ServerError::WireShort
        } else {
            ServerError::Io(err)
        }
    }
}
