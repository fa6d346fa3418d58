//! Output parser benchmarks
//!
//! Run with: cargo bench --bench output_parser_benchmark

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use meedyacore::download::{parse_line, LineBuffer};

const LINES: &[(&str, &str)] = &[
    ("progress", "[download]  45.2% of ~ 5.12MiB at 2.51MiB/s ETA 00:01"),
    ("finished", "[download] 100% of 5.12MiB in 00:02"),
    ("compact", "45% 2.3MB/s 00:30 remaining"),
    ("track", "Getting track 3 of 12: Stand by Me by Ben E. King"),
    ("error", "ERROR: Codec not available"),
    ("step", "Remuxing with ffmpeg"),
    ("saved", "Saved to: /music/Artist/Album/03 Song.m4a"),
    ("unrecognized", "[debug] Python version 3.12.1 (CPython x86_64 64bit)"),
];

fn bench_parse_line(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_line");
    for (name, line) in LINES {
        group.bench_with_input(BenchmarkId::from_parameter(name), line, |b, line| {
            b.iter(|| parse_line(black_box(line)))
        });
    }
    group.finish();
}

/// One album's worth of output with progress redraws, split into pipe-sized chunks.
fn album_output(tracks: usize) -> Vec<u8> {
    let mut out = String::new();
    for track in 1..=tracks {
        out.push_str(&format!("Getting track {} of {}: Song {} by Artist\n", track, tracks, track));
        for percent in (0..=100).step_by(5) {
            out.push_str(&format!(
                "[download] {:>5.1}% of ~ 5.00MiB at 1.20MiB/s ETA 00:03\r",
                percent as f64
            ));
        }
        out.push_str("\nTagging\n");
    }
    out.push_str("Saved to: /music/Artist/Album\n");
    out.into_bytes()
}

fn bench_stream(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream");
    for tracks in [1usize, 12, 50] {
        let bytes = album_output(tracks);
        group.throughput(Throughput::Bytes(bytes.len() as u64));
        group.bench_with_input(BenchmarkId::new("album", tracks), &bytes, |b, bytes| {
            b.iter(|| {
                let mut buffer = LineBuffer::new();
                let mut parsed = 0usize;
                for chunk in bytes.chunks(4096) {
                    for line in buffer.push(black_box(chunk)) {
                        black_box(parse_line(&line));
                        parsed += 1;
                    }
                }
                parsed
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_parse_line, bench_stream);
criterion_main!(benches);
