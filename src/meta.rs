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

//! FastCGI wire codec: records, typed bodies and name-value pairs.
//!
//! Everything on the wire is big-endian; the total on-wire size of a
//! record is a multiple of 8, with `(-content_length) & 7` zero bytes of
//! padding after the content.

use crate::error::{ServerError, ServerResult};
use std::fmt::{self, Display};
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// FastCGI protocol version 1
pub const VERSION_1: u8 = 1;
/// Maximum content length of a single record
pub const MAX_LENGTH: usize = 0xffff;
/// Length of a FastCGI record header in bytes
pub const HEADER_LEN: usize = 8;
/// Request id of management records
pub const MANAGEMENT_ID: u16 = 0;

/// FastCGI record types as defined in the protocol specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Begin request record type
    BeginRequest = 1,
    /// Abort request record type
    AbortRequest = 2,
    /// End request record type
    EndRequest = 3,
    /// Parameters record type
    Params = 4,
    /// Stdin record type
    Stdin = 5,
    /// Stdout record type
    Stdout = 6,
    /// Stderr record type
    Stderr = 7,
    /// Data record type
    Data = 8,
    /// Get values record type
    GetValues = 9,
    /// Get values result record type
    GetValuesResult = 10,
    /// Unknown type record type
    UnknownType = 11,
}

impl RecordType {
    /// Converts a u8 value to RecordType.
    fn from_u8(u: u8) -> Self {
        match u {
            1 => RecordType::BeginRequest,
            2 => RecordType::AbortRequest,
            3 => RecordType::EndRequest,
            4 => RecordType::Params,
            5 => RecordType::Stdin,
            6 => RecordType::Stdout,
            7 => RecordType::Stderr,
            8 => RecordType::Data,
            9 => RecordType::GetValues,
            10 => RecordType::GetValuesResult,
            _ => RecordType::UnknownType,
        }
    }
}

impl Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        Display::fmt(&(*self as u8), f)
    }
}

/// One record header, the atom of the wire protocol.
#[derive(Debug, Clone)]
pub struct Header {
    /// FastCGI protocol version
    pub version: u8,
    /// Type of the FastCGI record
    pub r#type: RecordType,
    /// Request ID for this record
    pub request_id: u16,
    /// Length of the content data
    pub content_length: u16,
    /// Length of padding data
    pub padding_length: u8,
    /// Reserved byte
    pub reserved: u8,
}

impl Header {
    /// Creates a new header for the given content, computing the padding
    /// that aligns the record to a multiple of 8 bytes.
    pub fn new(r#type: RecordType, request_id: u16, content: &[u8]) -> Self {
        let content_length = content.len().min(MAX_LENGTH) as u16;
        Self {
            version: VERSION_1,
            r#type,
            request_id,
            content_length,
            padding_length: (content_length.wrapping_neg() & 7) as u8,
            reserved: 0,
        }
    }

    /// Encodes the header to its 8-byte wire form.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let id = self.request_id.to_be_bytes();
        let len = self.content_length.to_be_bytes();
        [
            self.version,
            self.r#type as u8,
            id[0],
            id[1],
            len[0],
            len[1],
            self.padding_length,
            self.reserved,
        ]
    }

    /// Creates a new header from an 8-byte buffer.
    #[inline]
    pub fn new_from_buf(buf: &[u8; HEADER_LEN]) -> Self {
        Self {
            version: buf[0],
            r#type: RecordType::from_u8(buf[1]),
            request_id: u16::from_be_bytes([buf[2], buf[3]]),
            content_length: u16::from_be_bytes([buf[4], buf[5]]),
            padding_length: buf[6],
            reserved: buf[7],
        }
    }

    /// Reads exactly one header from a stream. Fails with `WireShort` on
    /// premature EOF and `WireVersion` on a version byte other than 1.
    pub async fn new_from_stream<R: AsyncRead + Unpin>(reader: &mut R) -> ServerResult<Self> {
        let mut buf: [u8; HEADER_LEN] = [0; HEADER_LEN];
        reader
            .read_exact(&mut buf)
            .await
            .map_err(ServerError::from_read)?;

        let header = Self::new_from_buf(&buf);
        if header.version != VERSION_1 {
            return Err(ServerError::WireVersion {
                version: header.version,
            });
        }
        Ok(header)
    }

    /// Reads the record content and discards the padding.
    pub async fn read_content_from_stream<R: AsyncRead + Unpin>(
        &self, reader: &mut R,
    ) -> ServerResult<Vec<u8>> {
        let mut buf = vec![0; self.content_length as usize];
        reader
            .read_exact(&mut buf)
            .await
            .map_err(ServerError::from_read)?;
        if self.padding_length > 0 {
            let mut padding_buf = vec![0; self.padding_length as usize];
            reader
                .read_exact(&mut padding_buf)
                .await
                .map_err(ServerError::from_read)?;
        }
        Ok(buf)
    }

    /// Writes the header, content and padding to a stream.
    pub async fn write_to_stream<W: AsyncWrite + Unpin>(
        &self, writer: &mut W, content: &[u8],
    ) -> io::Result<()> {
        writer.write_all(&self.encode()).await?;
        writer.write_all(content).await?;
        if self.padding_length > 0 {
            writer
                .write_all(&vec![0; self.padding_length as usize])
                .await?;
        }
        Ok(())
    }

    /// Writes `content` as a sequence of records of at most [`MAX_LENGTH`]
    /// content bytes each, followed by one terminating record with zero
    /// content length. Empty content produces only the terminator.
    pub async fn write_stream_batches<W: AsyncWrite + Unpin>(
        r#type: RecordType, request_id: u16, writer: &mut W, content: &[u8],
    ) -> io::Result<()> {
        for chunk in content.chunks(MAX_LENGTH) {
            Header::new(r#type, request_id, chunk)
                .write_to_stream(writer, chunk)
                .await?;
        }
        Header::new(r#type, request_id, &[])
            .write_to_stream(writer, &[])
            .await?;
        Ok(())
    }
}

/// FastCGI application roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Role {
    /// Responder role - produces the full HTTP response
    Responder = 1,
    /// Authorizer role - performs authorization checks
    Authorizer = 2,
    /// Filter role - filters data between web server and application
    Filter = 3,
}

impl Role {
    /// Converts a u16 value to Role.
    pub fn from_u16(u: u16) -> Option<Self> {
        match u {
            1 => Some(Role::Responder),
            2 => Some(Role::Authorizer),
            3 => Some(Role::Filter),
            _ => None,
        }
    }
}

/// BEGIN_REQUEST body (8 bytes): role, flags, 5 reserved bytes.
#[derive(Debug, Clone)]
pub struct BeginRequest {
    /// The role requested by the web server
    pub role: Option<Role>,
    /// Flags byte (bit 0 = keep connection)
    pub flags: u8,
}

impl BeginRequest {
    /// Bit 0 of the flags byte.
    pub const KEEP_CONN: u8 = 1;

    /// Decodes a BEGIN_REQUEST body; undersized buffers fail the decode.
    pub fn new_from_buf(buf: &[u8]) -> ServerResult<Self> {
        if buf.len() < 8 {
            return Err(ServerError::WireShort);
        }
        let role = Role::from_u16(u16::from_be_bytes([buf[0], buf[1]]));
        Ok(Self {
            role,
            flags: buf[2],
        })
    }

    /// Whether the web server asked the connection to stay open after
    /// END_REQUEST.
    pub fn keep_conn(&self) -> bool {
        self.flags & Self::KEEP_CONN != 0
    }
}

/// FastCGI protocol status codes carried by END_REQUEST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtocolStatus {
    /// Request completed successfully
    RequestComplete = 0,
    /// This app can't multiplex connections
    CantMpxConn = 1,
    /// New request rejected; too busy
    Overloaded = 2,
    /// Role value not known
    UnknownRole = 3,
}

/// END_REQUEST body (8 bytes): app status, protocol status, 3 reserved.
#[derive(Debug, Clone)]
pub struct EndRequest {
    /// The application status code
    pub app_status: u32,
    /// The protocol status
    pub protocol_status: ProtocolStatus,
}

impl EndRequest {
    /// Creates a new end request body.
    pub fn new(app_status: u32, protocol_status: ProtocolStatus) -> Self {
        Self {
            app_status,
            protocol_status,
        }
    }

    /// Encodes the body; always emits 8 bytes.
    pub fn encode(&self) -> [u8; 8] {
        let app = self.app_status.to_be_bytes();
        [
            app[0],
            app[1],
            app[2],
            app[3],
            self.protocol_status as u8,
            0,
            0,
            0,
        ]
    }
}

/// UNKNOWN_TYPE body (8 bytes): the unrecognized type, 7 reserved.
#[derive(Debug, Clone)]
pub struct UnknownType {
    /// The record type that was not recognized
    pub r#type: u8,
}

impl UnknownType {
    /// Encodes the body; always emits 8 bytes.
    pub fn encode(&self) -> [u8; 8] {
        [self.r#type, 0, 0, 0, 0, 0, 0, 0]
    }
}

/// Name-value pair length encoding: 1 byte below 128, otherwise 4 bytes
/// big-endian with the top bit of the first byte set.
#[derive(Debug, Clone, Copy)]
pub enum PairLength {
    /// Short length (0-127 bytes)
    Short(u8),
    /// Long length (128+ bytes, 31 bits)
    Long(u32),
}

impl PairLength {
    /// Creates the encoding for a length.
    pub fn new(length: usize) -> Self {
        if length < 128 {
            PairLength::Short(length as u8)
        } else {
            PairLength::Long(length as u32 | 1 << 31)
        }
    }

    /// Appends the encoded length to a buffer.
    pub fn encode_to(self, buf: &mut Vec<u8>) {
        match self {
            PairLength::Short(l) => buf.push(l),
            PairLength::Long(l) => buf.extend_from_slice(&l.to_be_bytes()),
        }
    }

    /// Decodes a length field, returning the length and the number of
    /// bytes consumed.
    fn decode(buf: &[u8]) -> ServerResult<(usize, usize)> {
        match buf.first() {
            None => Err(ServerError::WireShort),
            Some(&first) if first < 0x80 => Ok((first as usize, 1)),
            Some(_) if buf.len() < 4 => Err(ServerError::WireShort),
            Some(&first) => {
                let len = u32::from_be_bytes([first & 0x7f, buf[1], buf[2], buf[3]]);
                Ok((len as usize, 4))
            }
        }
    }
}

/// Appends one encoded name-value pair to a buffer.
pub fn encode_pair(buf: &mut Vec<u8>, name: &[u8], value: &[u8]) {
    PairLength::new(name.len()).encode_to(buf);
    PairLength::new(value.len()).encode_to(buf);
    buf.extend_from_slice(name);
    buf.extend_from_slice(value);
}

/// Decodes name-value pairs until the buffer is exhausted. Truncated
/// name or value ranges fail the decode.
pub fn decode_pairs(data: &[u8]) -> ServerResult<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut pairs = Vec::new();
    let mut pos = 0;

    while pos < data.len() {
        let (name_len, consumed) = PairLength::decode(&data[pos..])?;
        pos += consumed;
        let (value_len, consumed) = PairLength::decode(&data[pos..])?;
        pos += consumed;

        if pos + name_len + value_len > data.len() {
            return Err(ServerError::WireShort);
        }
        let name = data[pos..pos + name_len].to_vec();
        pos += name_len;
        let value = data[pos..pos + value_len].to_vec();
        pos += value_len;
        pairs.push((name, value));
    }

    Ok(pairs)
}
