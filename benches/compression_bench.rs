use criterion::{black_box, criterion_group, criterion_main, Criterion};
use hexcell::archive::EncodeOptions;
use hexcell::codec::DeflateCodec;
use hexcell::property::{decode_name, encode_name};
use hexcell::{DecodeOptions, Decoder, Encoder, NullSink};
use std::fs;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

fn bench_compression(c: &mut Criterion) {
    let data: Vec<u8> = (0..1024 * 1024u32).map(|i| (i % 251) as u8).collect();
    let fast = DeflateCodec::new(1);
    let best = DeflateCodec::default();
    let packed = best.compress(&data).unwrap();

    c.bench_function("deflate_1_compress_1mb", |b| b.iter(|| fast.compress(black_box(&data))));
    c.bench_function("deflate_9_compress_1mb", |b| b.iter(|| best.compress(black_box(&data))));
    c.bench_function("inflate_1mb", |b| b.iter(|| best.decompress(black_box(&packed))));
}

fn bench_names(c: &mut Criterion) {
    let name = b"usr/share/doc/hexcell/examples/deeply/nested/path/name.txt".to_vec();
    let stored = encode_name(&name);
    c.bench_function("encode_name", |b| b.iter(|| encode_name(black_box(&name))));
    c.bench_function("decode_name", |b| b.iter(|| decode_name(black_box(&stored))));
}

fn sample_tree(root: &Path) {
    for d in 0..8 {
        let dir = root.join(format!("dir{d}"));
        fs::create_dir(&dir).unwrap();
        for f in 0..32 {
            fs::write(dir.join(format!("file{f}")), vec![(d * f) as u8; 4096]).unwrap();
        }
    }
}

fn bench_pack_unpack(c: &mut Criterion) {
    let src = tempfile::tempdir().unwrap();
    sample_tree(src.path());
    let encoder = Encoder::with_sink(EncodeOptions::default(), Arc::new(NullSink));

    c.bench_function("encode_256_files", |b| {
        b.iter(|| {
            let mut out = Cursor::new(Vec::new());
            encoder.encode(black_box(src.path()), &mut out, 0).unwrap();
        })
    });

    let mut out = Cursor::new(Vec::new());
    encoder.encode(src.path(), &mut out, 0).unwrap();
    let cell = out.into_inner();

    for workers in [1usize, 4] {
        let options = DecodeOptions { materializers: workers, preserve_ownership: false, ..DecodeOptions::default() };
        let decoder = Decoder::with_sink(options, Arc::new(NullSink));
        c.bench_function(&format!("decode_256_files_{workers}_materializers"), |b| {
            b.iter(|| {
                let dest = tempfile::tempdir().unwrap();
                decoder.decode(Cursor::new(black_box(&cell[..])), 0, dest.path()).unwrap();
            })
        });
    }
}

criterion_group!(benches, bench_compression, bench_names, bench_pack_unpack);
criterion_main!(benches);
