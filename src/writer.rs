// Copyright 2024-2026 David Allison
// All Rights Reserved
// See LICENSE file for licensing information.

use crate::channel::{ChannelMapping, ChannelPage};
use crate::error::Result;
use crate::socket::{self, BROKER_SOCKET_PATH};
use crate::wire::{ClientRequest, RequesterType};

/// Producing endpoint of a channel. Owns one mapping of the channel's
/// segment; prepared samples borrow the mapping and must be submitted (or
/// dropped to abandon the reservation) before the writer goes away.
#[derive(Debug)]
pub struct Writer {
    mapping: ChannelMapping,
}

impl Writer {
    /// Connects to the broker at the well-known path and attaches to
    /// `channel_name`, fixing the payload size if the channel is new.
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
            requester_type: RequesterType::Writer,
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

    /// Reserves a slot to fill.
    ///
    /// Worst-case latency is non-deterministic: if every slot is held this
    /// spins, yielding the scheduler, until one frees up.
    pub fn prepare(&self) -> WriteSample<'_> {
        let page = self.page();
        let index = page.prepare();
        WriteSample { page, index }
    }

    /// Publishes a sample obtained from `prepare`, stamping its timestamp
    /// and designating it the channel's latest.
    pub fn submit(&self, sample: WriteSample<'_>) {
        let index = sample.index;
        std::mem::forget(sample);
        self.page().submit(index);
    }
}

/// An exclusively owned slot being filled. Dropping it without submitting
/// abandons the reservation and frees the slot.
pub struct WriteSample<'a> {
    page: &'a ChannelPage,
    index: usize,
}

impl WriteSample<'_> {
    pub fn sequence_id(&self) -> u64 {
        self.page.sample(self.index).sequence_id
    }

    /// Records the valid payload length for readers. Must not exceed the
    /// channel's payload size.
    pub fn set_payload_len(&mut self, len: usize) {
        assert!(len <= self.page.max_payload_size as usize);
        unsafe { (*self.page.sample_ptr(self.index)).size = len as u64 };
    }

    /// The slot's payload region, `max_payload_size` bytes, writable.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(
                self.page.payload_ptr(self.index),
                self.page.max_payload_size as usize,
            )
        }
    }
}

impl Drop for WriteSample<'_> {
    fn drop(&mut self) {
        // Abandoned before submit: hand the reservation back.
        self.page.release(self.index);
    }
}
