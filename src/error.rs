// Copyright 2024-2026 David Allison
// All Rights Reserved
// See LICENSE file for licensing information.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum FastIpcError {
    #[error("internal error: {0}")]
    Internal(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error(
        "payload size mismatch on channel '{channel}': channel has {channel_size} bytes, \
         requested {requested}"
    )]
    PayloadSizeMismatch {
        channel: String,
        channel_size: usize,
        requested: usize,
    },

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("nix error: {0}")]
    Nix(#[from] nix::Error),
}

pub type Result<T> = std::result::Result<T, FastIpcError>;
