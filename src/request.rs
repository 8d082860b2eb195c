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

//! The assembled FastCGI request.
//!
//! A request exists per (connection, request-id) between BEGIN_REQUEST
//! and END_REQUEST. Params keys are unique (last write wins); stdin is
//! the STDIN content concatenated in arrival order.

use crate::meta::Role;
use bytes::Bytes;
use std::collections::HashMap;

/// One fully assembled FastCGI request.
#[derive(Debug, Clone)]
pub struct FcgiRequest {
    /// The request id from the BEGIN_REQUEST record
    pub id: u16,
    /// The role requested by the web server
    pub role: Option<Role>,
    /// Flags byte of the BEGIN_REQUEST body
    pub flags: u8,
    /// Decoded params mapping
    pub params: HashMap<String, String>,
    /// Concatenated STDIN content
    pub stdin: Bytes,
}

impl FcgiRequest {
    /// Whether the connection stays open after END_REQUEST.
    pub fn keep_conn(&self) -> bool {
        self.flags & crate::meta::BeginRequest::KEEP_CONN != 0
    }

    /// Returns a param value, treating the empty string as absent.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}
