// Copyright 2024-2026 David Allison
// All Rights Reserved
// See LICENSE file for licensing information.

//! Demo: print the latest sample on the "channel" topic.

use fastipc::Reader;

const MAX_PAYLOAD_SIZE: usize = 256;

fn main() {
    if let Err(err) = run() {
        eprintln!("fastipc-read: {err}");
        std::process::exit(1);
    }
}

fn run() -> fastipc::Result<()> {
    let reader = Reader::new("channel", MAX_PAYLOAD_SIZE)?;

    let sample = reader.acquire();
    let text = String::from_utf8_lossy(&sample.payload()[..sample.payload_len()]);
    println!("value for seq-id {}: {}", sample.sequence_id(), text);
    reader.release(sample);

    Ok(())
}
