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

//! Connection protocol: assembles one request at a time from the record
//! stream of a single connection and writes the response streams back.
//!
//! The server does not multiplex (FCGI_MPXS_CONNS = 0): at most one
//! request is in flight per connection, and records whose request-id does
//! not match the in-flight request are discarded. Management records
//! (request-id 0) are answered inline.

use crate::{
    error::{ServerError, ServerResult},
    meta::{
        self, BeginRequest, EndRequest, Header, MANAGEMENT_ID, ProtocolStatus, RecordType,
        UnknownType,
    },
    request::FcgiRequest,
};
use bytes::BytesMut;
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tracing::debug;

/// Wraps a bidirectional byte stream with buffered read and buffered
/// write, exposing the request/response operations of the protocol.
pub struct FcgiConnection<S> {
    stream: BufStream<S>,
    max_conns: usize,
}

impl<S: AsyncRead + AsyncWrite + Unpin> FcgiConnection<S> {
    /// Wraps a stream, such as `tokio::net::TcpStream` or
    /// `tokio::net::UnixStream`.
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufStream::new(stream),
            max_conns: 1,
        }
    }

    /// Sets the connection limit advertised in GET_VALUES_RESULT.
    pub fn set_max_conns(&mut self, max_conns: usize) {
        self.max_conns = max_conns;
    }

    /// Reads records until one full request is assembled.
    ///
    /// Returns `Ok(None)` when the peer closed the connection at a record
    /// boundary. The first application record must be BEGIN_REQUEST;
    /// anything else fails with `ProtoUnexpected`. PARAMS content is
    /// accumulated until a zero-length PARAMS record, STDIN likewise.
    pub async fn read_request(&mut self) -> ServerResult<Option<FcgiRequest>> {
        let (header, begin) = loop {
            let header = match self.read_header_or_eof().await? {
                Some(header) => header,
                None => return Ok(None),
            };

            if header.request_id == MANAGEMENT_ID {
                self.answer_management(&header).await?;
                continue;
            }

            match header.r#type {
                RecordType::BeginRequest => {
                    let content = header.read_content_from_stream(&mut self.stream).await?;
                    break (header, BeginRequest::new_from_buf(&content)?);
                }
                r#type => {
                    return Err(ServerError::ProtoUnexpected {
                        record_type: r#type,
                        expected: RecordType::BeginRequest,
                    });
                }
            }
        };

        let id = header.request_id;
        debug!(id, flags = begin.flags, "Begin request.");

        let mut params_buf = BytesMut::new();
        let mut stdin_buf = BytesMut::new();
        let mut params_done = false;
        let mut stdin_done = false;

        while !(params_done && stdin_done) {
            let header = Header::new_from_stream(&mut self.stream).await?;

            if header.request_id == MANAGEMENT_ID {
                self.answer_management(&header).await?;
                continue;
            }
            if header.request_id != id {
                // Stray record on a reused connection; not multiplexing.
                debug!(id, stray = header.request_id, "Discard stray record.");
                header.read_content_from_stream(&mut self.stream).await?;
                continue;
            }

            match header.r#type {
                RecordType::Params => {
                    let content = header.read_content_from_stream(&mut self.stream).await?;
                    if content.is_empty() {
                        params_done = true;
                    } else {
                        params_buf.extend_from_slice(&content);
                    }
                }
                RecordType::Stdin => {
                    let content = header.read_content_from_stream(&mut self.stream).await?;
                    if content.is_empty() {
                        stdin_done = true;
                    } else {
                        stdin_buf.extend_from_slice(&content);
                    }
                }
                RecordType::AbortRequest => {
                    header.read_content_from_stream(&mut self.stream).await?;
                    self.end_request(id, 1, ProtocolStatus::RequestComplete)
                        .await?;
                    return Err(ServerError::RequestAborted { id });
                }
                r#type => {
                    debug!(id, %r#type, "Discard record of unexpected type.");
                    header.read_content_from_stream(&mut self.stream).await?;
                }
            }
        }

        let mut params = HashMap::new();
        for (name, value) in meta::decode_pairs(&params_buf)? {
            params.insert(
                String::from_utf8_lossy(&name).into_owned(),
                String::from_utf8_lossy(&value).into_owned(),
            );
        }

        Ok(Some(FcgiRequest {
            id,
            role: begin.role,
            flags: begin.flags,
            params,
            stdin: stdin_buf.freeze(),
        }))
    }

    /// Writes `bytes` as a STDOUT stream: content records of at most
    /// 65535 bytes plus the mandatory zero-length terminator.
    pub async fn write_stdout(&mut self, id: u16, bytes: &[u8]) -> ServerResult<()> {
        Header::write_stream_batches(RecordType::Stdout, id, &mut self.stream, bytes).await?;
        Ok(())
    }

    /// Writes `bytes` as a STDERR stream, terminator included.
    pub async fn write_stderr(&mut self, id: u16, bytes: &[u8]) -> ServerResult<()> {
        Header::write_stream_batches(RecordType::Stderr, id, &mut self.stream, bytes).await?;
        Ok(())
    }

    /// Writes a single END_REQUEST record and flushes.
    pub async fn end_request(
        &mut self, id: u16, app_status: u32, protocol_status: ProtocolStatus,
    ) -> ServerResult<()> {
        let body = EndRequest::new(app_status, protocol_status).encode();
        Header::new(RecordType::EndRequest, id, &body)
            .write_to_stream(&mut self.stream, &body)
            .await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Writes the complete response: stdout stream (if nonempty), stderr
    /// stream (if nonempty), then END_REQUEST with the exit code as
    /// app-status.
    pub async fn send_response(
        &mut self, id: u16, stdout: &[u8], stderr: &[u8], exit_code: u32,
    ) -> ServerResult<()> {
        if !stdout.is_empty() {
            self.write_stdout(id, stdout).await?;
        }
        if !stderr.is_empty() {
            self.write_stderr(id, stderr).await?;
        }
        self.end_request(id, exit_code, ProtocolStatus::RequestComplete)
            .await
    }

    /// Reads one header, distinguishing a clean close at a record
    /// boundary from a truncated record.
    async fn read_header_or_eof(&mut self) -> ServerResult<Option<Header>> {
        let mut first = [0u8; 1];
        let n = self.stream.read(&mut first).await?;
        if n == 0 {
            return Ok(None);
        }

        let mut rest = [0u8; meta::HEADER_LEN - 1];
        self.stream
            .read_exact(&mut rest)
            .await
            .map_err(ServerError::from_read)?;

        let mut buf = [0u8; meta::HEADER_LEN];
        buf[0] = first[0];
        buf[1..].copy_from_slice(&rest);

        let header = Header::new_from_buf(&buf);
        if header.version != meta::VERSION_1 {
            return Err(ServerError::WireVersion {
                version: header.version,
            });
        }
        Ok(Some(header))
    }

    /// Answers a management record: GET_VALUES gets the values the server
    /// knows, anything else gets UNKNOWN_TYPE.
    async fn answer_management(&mut self, header: &Header) -> ServerResult<()> {
        let content = header.read_content_from_stream(&mut self.stream).await?;
        match header.r#type {
            RecordType::GetValues => {
                let max_conns = self.max_conns.to_string();
                let mut body = Vec::new();
                for (name, _) in meta::decode_pairs(&content)? {
                    let value = match name.as_slice() {
                        b"FCGI_MAX_CONNS" | b"FCGI_MAX_REQS" => max_conns.as_str(),
                        b"FCGI_MPXS_CONNS" => "0",
                        _ => continue,
                    };
                    meta::encode_pair(&mut body, &name, value.as_bytes());
                }
                Header::new(RecordType::GetValuesResult, MANAGEMENT_ID, &body)
                    .write_to_stream(&mut self.stream, &body)
                    .await?;
            }
            r#type => {
                debug!(%r#type, "Unknown management record.");
                let body = UnknownType {
                    r#type: r#type as u8,
                }
                .encode();
                Header::new(RecordType::UnknownType, MANAGEMENT_ID, &body)
                    .write_to_stream(&mut self.stream, &body)
                    .await?;
            }
        }
        self.stream.flush().await?;
        Ok(())
    }
}
