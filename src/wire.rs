// Copyright 2024-2026 David Allison
// All Rights Reserved
// See LICENSE file for licensing information.

//! Byte-exact handshake request codec.
//!
//! One request packet per handshake, laid out host-endian with no byte
//! swapping:
//!
//! | offset | size | field |
//! |---|---|---|
//! | 0 | 1 | requester type: 0 reader, 1 writer |
//! | 1 | pointer width | max payload size, unsigned |
//! | 1 + pw | 1 | topic name length |
//! | 2 + pw | name length | topic name bytes, UTF-8 |

use crate::error::{FastIpcError, Result};

const WORD: usize = std::mem::size_of::<usize>();

/// Smallest valid request: type byte, payload size, zero-length topic name.
pub const MIN_REQUEST_SIZE: usize = 1 + WORD + 1;

/// Largest valid request: a 255-byte topic name.
pub const MAX_REQUEST_SIZE: usize = MIN_REQUEST_SIZE + u8::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequesterType {
    Reader = 0,
    Writer = 1,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRequest {
    pub requester_type: RequesterType,
    pub max_payload_size: usize,
    pub topic_name: String,
}

impl ClientRequest {
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.topic_name.len() > u8::MAX as usize {
            return Err(FastIpcError::InvalidArgument(format!(
                "topic name is {} bytes, limit is {}",
                self.topic_name.len(),
                u8::MAX
            )));
        }

        let mut buf = Vec::with_capacity(MIN_REQUEST_SIZE + self.topic_name.len());
        buf.push(self.requester_type as u8);
        buf.extend_from_slice(&self.max_payload_size.to_ne_bytes());
        buf.push(self.topic_name.len() as u8);
        buf.extend_from_slice(self.topic_name.as_bytes());
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < MIN_REQUEST_SIZE {
            return Err(FastIpcError::MalformedRequest(format!(
                "packet is {} bytes, minimum is {}",
                buf.len(),
                MIN_REQUEST_SIZE
            )));
        }

        let requester_type = match buf[0] {
            0 => RequesterType::Reader,
            1 => RequesterType::Writer,
            other => {
                return Err(FastIpcError::MalformedRequest(format!(
                    "unknown requester type {other}"
                )))
            }
        };

        let mut word = [0u8; WORD];
        word.copy_from_slice(&buf[1..1 + WORD]);
        let max_payload_size = usize::from_ne_bytes(word);

        let name_len = buf[1 + WORD] as usize;
        let name_bytes = &buf[MIN_REQUEST_SIZE..];
        if name_len > name_bytes.len() {
            return Err(FastIpcError::MalformedRequest(format!(
                "topic name length {} exceeds packet remainder {}",
                name_len,
                name_bytes.len()
            )));
        }

        let topic_name = std::str::from_utf8(&name_bytes[..name_len])
            .map_err(|_| FastIpcError::MalformedRequest("topic name is not UTF-8".into()))?
            .to_owned();

        Ok(Self {
            requester_type,
            max_payload_size,
            topic_name,
        })
    }
}
