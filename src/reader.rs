// Copyright 2024-2026 David Allison
// All Rights Reserved
// See LICENSE file for licensing information.

use crate::channel::{ChannelMapping, ChannelPage};
use crate::error::Result;
use crate::socket::{self, BROKER_SOCKET_PATH};
use crate::wire::{ClientRequest, RequesterType};

/// Consuming endpoint of a channel. Owns one mapping of the channel's
/// segment; samples borrow the mapping and must be released before the
/// reader goes away.
#[derive(Debug)]
pub struct Reader {
    mapping: ChannelMapping,
}

impl Reader {
    /// Connects to the broker at the well-known path and attaches to
    /// `channel_name`, validating the expected payload size.
    pub fn new(channel_name: &str, max_payload_size: usize) -> Result<Self> {
        Self::connect(BROKER_SOCKET_PATH, channel_name, max_payload_size)
    }

    /// Same as `new` with an explicit broker socket path.
    pub fn connect(
        broker_socket: &str,
        channel_name: &str,
        max_payload_size: usize,
    ) -> Result<Self> {
        let request = ClientRequest {
            requester_type: RequesterType::Reader,
            max_payload_size,
            topic_name: channel_name.to_owned(),
        };
        Ok(Self {
            mapping: socket::attach(broker_socket, &request)?,
        })
    }

    fn page(&self) -> &ChannelPage {
        self.mapping.page()
    }

    /// Whether a sample with a sequence id greater than `sequence_id` has
    /// been published.
    pub fn has_new_data(&self, sequence_id: u64) -> bool {
        self.page().has_new_data(sequence_id)
    }

    /// Acquires the latest available sample. Never blocks.
    pub fn acquire(&self) -> ReadSample<'_> {
        let page = self.page();
        let index = page.acquire();
        ReadSample { page, index }
    }

    /// Releases a sample obtained from `acquire`.
    ///
    /// Dropping the sample has the same effect; this spelling keeps the
    /// hand-back explicit at call sites.
    pub fn release(&self, sample: ReadSample<'_>) {
        drop(sample);
    }
}

/// A read-only view of one published sample. Holds a reference on the slot
/// until released or dropped.
pub struct ReadSample<'a> {
    page: &'a ChannelPage,
    index: usize,
}

impl ReadSample<'_> {
    pub fn sequence_id(&self) -> u64 {
        self.page.sample(self.index).sequence_id
    }

    /// Wall-clock submit time, nanoseconds since the Unix epoch.
    pub fn timestamp_ns(&self) -> u64 {
        self.page.sample(self.index).timestamp
    }

    /// Valid payload length recorded by the writer. Informational; the full
    /// region returned by `payload` is always readable.
    pub fn payload_len(&self) -> usize {
        self.page.sample(self.index).size as usize
    }

    /// The sample's payload region, `max_payload_size` bytes.
    pub fn payload(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(
                self.page.payload_ptr(self.index),
                self.page.max_payload_size as usize,
            )
        }
    }
}

impl Drop for ReadSample<'_> {
    fn drop(&mut self) {
        self.page.release(self.index);
    }
}
