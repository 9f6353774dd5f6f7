// Weft
// Copyright (C) 2026 Weft Contributors

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Spawn/sync throughput through the public runtime surface.

use criterion::{Criterion, criterion_group, criterion_main};

use weft_core::{Config, Runtime, value};

fn bench_spawn_sync(c: &mut Criterion) {
    let rt = Runtime::new(Config {
        workers: 4,
        stack_size: 64 * 1024,
        ..Config::default()
    })
    .expect("Failed to start runtime");

    c.bench_function("spawn_sync_batch_64", |b| {
        b.iter(|| {
            let rt2 = rt.clone();
            let out = rt
                .block_on(move || {
                    let tasks: Vec<_> = (0..64u64)
                        .map(|i| {
                            let task = rt2.task_new(move || value(i)).expect("task_new");
                            rt2.task_spawn(&task, false, false).expect("task_spawn");
                            task
                        })
                        .collect();
                    let total: u64 = tasks
                        .iter()
                        .map(|t| {
                            *rt2.task_sync(t)
                                .expect("task_sync")
                                .expect("no value")
                                .downcast_ref::<u64>()
                                .expect("value type")
                        })
                        .sum();
                    value(total)
                })
                .expect("block_on");
            assert_eq!(out.downcast_ref::<u64>(), Some(&2016));
        })
    });

    c.bench_function("grain_sum_100k", |b| {
        b.iter(|| {
            let rt2 = rt.clone();
            let out = rt
                .block_on(move || {
                    let parent = rt2
                        .task_new_multi(
                            |start, end| value((start..end).map(|i| i as u64).sum::<u64>()),
                            100_000,
                            Some(std::sync::Arc::new(|a: weft_core::Value, b: weft_core::Value| {
                                value(a.downcast_ref::<u64>().unwrap() + b.downcast_ref::<u64>().unwrap())
                            })),
                        )
                        .expect("task_new_multi");
                    rt2.task_spawn_multi(&parent).expect("task_spawn_multi");
                    rt2.task_sync(&parent).expect("task_sync").expect("no value")
                })
                .expect("block_on");
            assert_eq!(out.downcast_ref::<u64>(), Some(&4_999_950_000));
        })
    });

    rt.shutdown();
}

criterion_group!(benches, bench_spawn_sync);
criterion_main!(benches);
