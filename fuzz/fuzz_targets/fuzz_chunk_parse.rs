#![no_main]

use libfuzzer_sys::fuzz_target;
use opcport::{ChunkAssembly, ChunkLimits, FrameBuffer};

fuzz_target!(|data: &[u8]| {
    let limits = ChunkLimits {
        max_chunk_size: 4096,
        max_chunk_count: 16,
        max_message_size: 65536,
    };

    let mut buffer = FrameBuffer::new(limits.max_chunk_size);
    let mut assembly = ChunkAssembly::new();
    buffer.push(data);
    while let Ok(Some(frame)) = buffer.next_frame() {
        if let Ok((header, body)) = opcport::split_frame(&frame) {
            let _ = assembly.accept(&header, body, &limits);
        }
    }
});
