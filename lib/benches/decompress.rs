use std::hint::black_box;

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use seekarc::{CodecParams, Lz4Params, ReadOptions, Reader, WriteOptions};

fn corpus(len: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(len + 64);
    let mut i = 0u64;
    while data.len() < len {
        data.extend_from_slice(
            format!("record {i}: the seekable archive benchmark corpus line\n").as_bytes(),
        );
        i = i.wrapping_mul(6364136223846793005).wrapping_add(1);
    }
    data.truncate(len);
    data
}

fn archive(data: &[u8], codec: CodecParams) -> Vec<u8> {
    let mut sink = Vec::new();
    let mut writer = WriteOptions::new()
        .codec(codec)
        .min_frame_size(128 * 1024)
        .into_writer(&mut sink)
        .unwrap();
    writer.write(data).unwrap();
    writer.finish().unwrap();
    sink
}

fn read_everything(reader: &Reader<&[u8]>, len: usize, buf: &mut [u8]) {
    let mut offset = 0u64;
    while (offset as usize) < len {
        let n = reader.pread(buf, offset).unwrap();
        if n == 0 {
            break;
        }
        offset += n as u64;
    }
}

fn random_reads(reader: &Reader<&[u8]>, len: usize, buf: &mut [u8]) {
    let mut state = 0x9E37_79B9u64;
    for _ in 0..1024 {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        let offset = state % len as u64;
        reader.pread(buf, offset).unwrap();
    }
}

fn decompression(c: &mut Criterion) {
    let data = corpus(8 * 1024 * 1024);
    let mut buf = vec![0; 64 * 1024];

    let zstd = archive(&data, CodecParams::default());
    let lz4 = archive(&data, CodecParams::Lz4(Lz4Params::new()));

    let mut group = c.benchmark_group("decompression");
    group.throughput(Throughput::Bytes(data.len() as u64));

    let reader = Reader::open(zstd.as_slice()).unwrap();
    group.bench_function("zstd_sequential", |b| {
        b.iter(|| read_everything(black_box(&reader), data.len(), &mut buf));
    });

    let reader = Reader::open(lz4.as_slice()).unwrap();
    group.bench_function("lz4_sequential", |b| {
        b.iter(|| read_everything(black_box(&reader), data.len(), &mut buf));
    });
    group.finish();

    let mut group = c.benchmark_group("random_access");
    let cached = ReadOptions::new(zstd.as_slice())
        .cache_entries(16)
        .into_reader()
        .unwrap();
    group.bench_function("zstd_cached", |b| {
        b.iter(|| random_reads(black_box(&cached), data.len(), &mut buf));
    });

    let cacheless = ReadOptions::new(zstd.as_slice())
        .cache_entries(0)
        .into_reader()
        .unwrap();
    group.bench_function("zstd_cacheless", |b| {
        b.iter(|| random_reads(black_box(&cacheless), data.len(), &mut buf));
    });
    group.finish();
}

criterion_group!(benches, decompression);
criterion_main!(benches);
