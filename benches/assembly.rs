//! Assembly Benchmarks
//!
//! Measures stage + finalize throughput for a multi-chunk upload.
//!
//! Run with: `cargo bench --bench assembly`

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;

use asset_upload_server::upload::{
    InitUploadRequest, LocalChunkStorage, PathSandbox, ServiceOptions, UploadService,
};

const CHUNK_SIZE: usize = 1024 * 1024;

async fn upload_and_finalize(service: &UploadService, chunks: usize, payload: &[u8]) {
    let init = service
        .initialize(
            "bench",
            &InitUploadRequest {
                file_name: "bench.bin".to_string(),
                relative_path: None,
                upload_type: "client".to_string(),
                total_size: (chunks * CHUNK_SIZE) as i64,
                chunk_size: CHUNK_SIZE as i64,
            },
        )
        .await
        .unwrap();

    for index in (0..chunks).rev() {
        service
            .upload_chunk(&init.session_id, index as i64, payload)
            .await
            .unwrap();
    }

    service.finalize(&init.session_id).await.unwrap();
}

fn bench_finalize(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let staging = tempfile::TempDir::new().unwrap();
    let assets = tempfile::TempDir::new().unwrap();
    let service = UploadService::new(
        Arc::new(LocalChunkStorage::new(staging.path())),
        PathSandbox::new(assets.path()),
        ServiceOptions::default(),
    );
    let payload = vec![0xA5u8; CHUNK_SIZE];

    let mut group = c.benchmark_group("upload_finalize");
    group.sample_size(10);

    for chunks in [4usize, 16] {
        group.throughput(Throughput::Bytes((chunks * CHUNK_SIZE) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(chunks), &chunks, |b, &chunks| {
            b.to_async(&rt)
                .iter(|| upload_and_finalize(&service, chunks, &payload));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_finalize);
criterion_main!(benches);
