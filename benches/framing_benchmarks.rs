//! Framing benchmarks
//!
//! Header parsing and the chunked codec, the per-request hot paths

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use sidegate::http::chunked::{encode_chunk, encode_end};
use sidegate::http::{ChunkEvent, ChunkedDecoder, Request, Response};

fn bench_header_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("header_parsing");

    let small_request = b"GET http://example.com/api/users?id=123 HTTP/1.1\r\nHost: example.com\r\nUser-Agent: Mozilla/5.0\r\nAccept: application/json\r\n\r\n";
    group.bench_function("small_request", |b| {
        b.iter(|| Request::parse(black_box(small_request)).unwrap())
    });

    let mut large_request =
        b"POST http://example.com/upload HTTP/1.1\r\nHost: example.com\r\nContent-Length: 0\r\n".to_vec();
    for i in 0..50 {
        large_request.extend_from_slice(format!("X-Header-{}: {}\r\n", i, "v".repeat(40)).as_bytes());
    }
    large_request.extend_from_slice(b"\r\n");
    group.bench_function("request_50_headers", |b| {
        b.iter(|| Request::parse(black_box(&large_request)).unwrap())
    });

    let response = b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 1024\r\nCache-Control: no-cache\r\n\r\n";
    group.bench_function("response", |b| {
        b.iter(|| Response::parse(black_box(response), "GET").unwrap())
    });

    group.finish();
}

fn encoded_body(chunk_size: usize, chunks: usize) -> BytesMut {
    let payload = vec![b'x'; chunk_size];
    let mut out = BytesMut::new();
    for _ in 0..chunks {
        encode_chunk(&payload, &mut out);
    }
    encode_end(&[], &mut out);
    out
}

fn bench_chunked_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunked_codec");

    for (name, chunk_size) in [("1kb_chunks", 1024), ("16kb_chunks", 16 * 1024)] {
        let body = encoded_body(chunk_size, 64);
        group.throughput(Throughput::Bytes(body.len() as u64));
        group.bench_function(format!("decode_{}", name), |b| {
            b.iter(|| {
                let mut buf = body.clone();
                let mut decoder = ChunkedDecoder::default();
                let mut total = 0usize;
                while let Some(event) = decoder.decode(&mut buf).unwrap() {
                    match event {
                        ChunkEvent::Data(data) => total += data.len(),
                        ChunkEvent::Trailer(_) => {}
                        ChunkEvent::End => break,
                    }
                }
                black_box(total)
            })
        });
        group.bench_function(format!("encode_{}", name), |b| {
            b.iter(|| black_box(encoded_body(black_box(chunk_size), 64)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_header_parsing, bench_chunked_codec);
criterion_main!(benches);
