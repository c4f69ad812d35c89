//! Benchmark: in-memory bitmap scans vs the scratch-backed working map.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use qfs_alloc::{BitmapGeometry, WorkingBitmap, bitmap_count_free, bitmap_find_free};
use qfs_ondisk::DeviceClass;
use qfs_types::Ordinal;

const BITS: u64 = 32_768;

/// 4096-byte map, mostly allocated, with free clusters every ~650 units.
fn make_bitmap() -> Vec<u8> {
    let mut bm = vec![0_u8; 4096];
    let mut pos = 100_usize;
    while pos + 32 < BITS as usize {
        for i in pos..pos + 32 {
            bm[i / 8] |= 1 << (i % 8);
        }
        pos += 650;
    }
    bm
}

fn geometry() -> BitmapGeometry {
    BitmapGeometry {
        ord: Ordinal(0),
        class: DeviceClass::Data,
        width: 1,
        unit_blocks: 4,
        small_blocks: 4,
        large_blocks: 16,
        capacity: BITS * 4,
        bits: BITS,
        map_ord: Ordinal(0),
        map_block: 32,
        map_blocks: 4,
    }
}

fn bench_count_free(c: &mut Criterion) {
    let bm = make_bitmap();
    let mut group = c.benchmark_group("count_free");
    group.bench_function("slice", |b| {
        b.iter(|| black_box(bitmap_count_free(black_box(&bm), BITS)));
    });
    group.finish();
}

fn bench_find_free(c: &mut Criterion) {
    let bm = make_bitmap();
    let mut group = c.benchmark_group("find_free");
    group.bench_function("slice", |b| {
        b.iter(|| black_box(bitmap_find_free(black_box(&bm), BITS, black_box(16_000))));
    });
    group.finish();
}

fn bench_claim(c: &mut Criterion) {
    let mut group = c.benchmark_group("working_bitmap");
    group.bench_function("claim_release_1k", |b| {
        let mut map = WorkingBitmap::build_free_map(geometry(), None).expect("build");
        b.iter(|| {
            for unit in 0..1024_u64 {
                let _ = black_box(map.claim(unit * 4, 4).expect("claim"));
            }
            map.release(0, 4096).expect("release");
        });
    });
    group.finish();
}

criterion_group!(benches, bench_count_free, bench_find_free, bench_claim);
criterion_main!(benches);
