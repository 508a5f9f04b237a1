use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use dagflow_core::remote::messages::{TaskDispatchRequest, TaskExecutionContext};
use dagflow_core::remote::{Command, CommandBody, CommandDecoder, CommandEncoder, CommandType};
use std::collections::BTreeMap;

fn dispatch_request() -> Command {
    let request = TaskDispatchRequest {
        master_address: "10.0.0.100:5678".to_string(),
        context: TaskExecutionContext {
            task_instance_id: 42,
            workflow_instance_id: 7,
            task_name: "transform".to_string(),
            task_kind: "shell".to_string(),
            params: serde_json::json!({"command": "echo ${setValue(rows=100)}"}),
            var_pool: BTreeMap::from([("batch".to_string(), "2024-01-01".to_string())]),
            worker_group: "default".to_string(),
            generation: 1,
            timeout_ms: Some(60_000),
        },
    };
    request.to_command().unwrap_or_else(|e| panic!("encode body: {e}"))
}

fn benchmark_encode(c: &mut Criterion) {
    let command = dispatch_request();
    let encoder = CommandEncoder;
    c.bench_function("encode_dispatch_request", |b| {
        b.iter(|| encoder.encode_to_bytes(black_box(&command)))
    });
}

fn benchmark_decode(c: &mut Criterion) {
    let encoder = CommandEncoder;
    let frame = encoder
        .encode_to_bytes(&dispatch_request())
        .unwrap_or_else(|e| panic!("encode frame: {e}"));

    c.bench_function("decode_dispatch_request", |b| {
        b.iter(|| {
            let mut decoder = CommandDecoder::default();
            let mut buffer = BytesMut::from(&frame[..]);
            decoder.decode(black_box(&mut buffer))
        })
    });

    // A burst of small pings arriving in 7-byte reads
    let mut burst = BytesMut::new();
    for _ in 0..64 {
        encoder
            .encode(&Command::new(CommandType::Ping, &b"ping"[..]), &mut burst)
            .unwrap_or_else(|e| panic!("encode ping: {e}"));
    }
    let burst = burst.freeze();
    c.bench_function("decode_fragmented_pings", |b| {
        b.iter(|| {
            let mut decoder = CommandDecoder::default();
            let mut buffer = BytesMut::new();
            let mut count = 0;
            for chunk in burst.chunks(7) {
                buffer.extend_from_slice(chunk);
                while let Ok(Some(_)) = decoder.decode(&mut buffer) {
                    count += 1;
                }
            }
            black_box(count)
        })
    });
}

criterion_group!(benches, benchmark_encode, benchmark_decode);
criterion_main!(benches);
