use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

use evio::stdx::{Queue, QueueLink, QueueNode};

const BATCH_SIZES: [usize; 3] = [64, 1_024, 16_384];

enum BenchTag {}

struct Node {
    #[allow(dead_code)]
    payload: u64,
    link: QueueLink<Node, BenchTag>,
}

impl QueueNode<BenchTag> for Node {
    fn queue_link(&mut self) -> &mut QueueLink<Self, BenchTag> {
        &mut self.link
    }

    fn queue_link_ref(&self) -> &QueueLink<Self, BenchTag> {
        &self.link
    }
}

/// Push a batch through the intrusive FIFO and drain it, the hot path of
/// every loop iteration (submission drain + dispatch).
fn bench_push_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("intrusive_queue");

    for &batch in &BATCH_SIZES {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::new("push_pop", batch), &batch, |b, &batch| {
            let mut nodes: Vec<Node> = (0..batch)
                .map(|i| Node {
                    payload: i as u64,
                    link: QueueLink::new(),
                })
                .collect();

            b.iter(|| {
                let mut q: Queue<Node, BenchTag> = Queue::init();
                for node in nodes.iter_mut() {
                    q.push(node);
                }
                while let Some(node) = q.pop() {
                    black_box(node);
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_push_pop);
criterion_main!(benches);
