// Copyright 2024-2026 David Allison
// All Rights Reserved
// See LICENSE file for licensing information.

pub mod bitset;
pub mod channel;
pub mod error;
pub mod reader;
pub mod socket;
pub mod tower;
pub mod wire;
pub mod writer;

pub use error::{FastIpcError, Result};
pub use reader::{ReadSample, Reader};
pub use socket::BROKER_SOCKET_PATH;
pub use tower::Tower;
pub use wire::{ClientRequest, RequesterType};
pub use writer::{WriteSample, Writer};
