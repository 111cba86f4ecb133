use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use opcport::{
    split_frame, Accepted, ChunkAssembly, ChunkLimits, FrameBuffer, MessageKind, Sequencer,
};

const LIMITS: ChunkLimits = ChunkLimits {
    max_chunk_size: 65535,
    max_chunk_count: 64,
    max_message_size: 1 << 21,
};

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_message");
    for size in [256usize, 4096, 262144] {
        let payload = vec![0xa5u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            let mut seq = Sequencer::new();
            b.iter(|| {
                opcport::encode_message(&mut seq, MessageKind::Message, 7, 1, 42, payload, &LIMITS)
                    .unwrap()
            });
        });
    }
    group.finish();
}

fn bench_reassemble(c: &mut Criterion) {
    let mut group = c.benchmark_group("reassemble");
    for size in [4096usize, 262144] {
        let payload = vec![0x5au8; size];
        let mut seq = Sequencer::new();
        let frames =
            opcport::encode_message(&mut seq, MessageKind::Message, 7, 1, 42, &payload, &LIMITS)
                .unwrap();
        let mut stream = Vec::new();
        for frame in &frames {
            stream.extend_from_slice(frame);
        }
        group.throughput(Throughput::Bytes(stream.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &stream, |b, stream| {
            b.iter(|| {
                let mut buffer = FrameBuffer::new(LIMITS.max_chunk_size);
                let mut assembly = ChunkAssembly::new();
                buffer.push(stream);
                loop {
                    match buffer.next_frame().unwrap() {
                        Some(frame) => {
                            let (header, body) = split_frame(&frame).unwrap();
                            if let Accepted::Complete(message) =
                                assembly.accept(&header, body, &LIMITS).unwrap()
                            {
                                break message;
                            }
                        }
                        None => panic!("stream truncated"),
                    }
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_reassemble);
criterion_main!(benches);
