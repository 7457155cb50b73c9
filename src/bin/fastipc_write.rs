// Copyright 2024-2026 David Allison
// All Rights Reserved
// See LICENSE file for licensing information.

//! Interactive demo: publish one line of text on the "channel" topic.

use fastipc::Writer;
use std::io::{self, BufRead, Write as _};

const MAX_PAYLOAD_SIZE: usize = 256;

fn main() {
    if let Err(err) = run() {
        eprintln!("fastipc-write: {err}");
        std::process::exit(1);
    }
}

fn run() -> fastipc::Result<()> {
    let writer = Writer::new("channel", MAX_PAYLOAD_SIZE)?;

    let mut sample = writer.prepare();
    print!("Enter value for seq-id {}: ", sample.sequence_id());
    io::stdout().flush()?;

    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let bytes = line.trim_end().as_bytes();
    let len = bytes.len().min(MAX_PAYLOAD_SIZE);

    sample.payload_mut()[..len].copy_from_slice(&bytes[..len]);
    sample.set_payload_len(len);
    writer.submit(sample);

    Ok(())
}
