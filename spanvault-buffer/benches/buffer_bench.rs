// Copyright 2025 SpanVault (https://github.com/spanvault)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Buffer hot-path benchmarks: append throughput and the analyze/index
//! pipeline drain.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use spanvault_buffer::{BufferProperties, EvictingBuffer};
use spanvault_core::{RecordPayload, TelemetryRecord, TimerStats};

fn record(id: u64) -> TelemetryRecord {
    TelemetryRecord::new(
        id,
        10,
        20,
        1_000 + id,
        RecordPayload::Timer(TimerStats::single(50)),
    )
}

fn bench_put(c: &mut Criterion) {
    let properties = BufferProperties {
        initial_capacity: 1024 * 1024 * 1024,
        ..BufferProperties::default()
    };
    let buffer = EvictingBuffer::new(properties).unwrap();
    let mut id = 0u64;

    c.bench_function("buffer_put", |b| {
        b.iter(|| {
            id += 1;
            buffer.put(black_box(record(id)));
        })
    });
}

fn bench_pipeline_drain(c: &mut Criterion) {
    c.bench_function("analyze_and_index_1k", |b| {
        b.iter_with_setup(
            || {
                let properties = BufferProperties {
                    initial_capacity: 1024 * 1024 * 1024,
                    ..BufferProperties::default()
                };
                let buffer = EvictingBuffer::new(properties).unwrap();
                for id in 0..1_000 {
                    buffer.put(record(id));
                }
                buffer
            },
            |buffer| {
                buffer.analyze_pending();
                buffer.index_pending();
            },
        )
    });
}

criterion_group!(benches, bench_put, bench_pipeline_drain);
criterion_main!(benches);
