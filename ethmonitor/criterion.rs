use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ethmonitor::{Block, Chain, Header, PublishQueue};
use web3::types::{H256, U256};

fn added(number: u64, byte: u8) -> Block {
    let mut block = Block::new_added(
        Header {
            number,
            hash: H256::repeat_byte(byte),
            parent_hash: H256::repeat_byte(byte.wrapping_sub(1)),
            timestamp: number,
            base_fee: None,
            gas_used: U256::zero(),
            gas_limit: U256::zero(),
        },
        vec![],
    );
    block.ok = true;
    block
}

fn chain_push_pop(c: &mut Criterion) {
    c.bench_function("chain_push_pop_at_capacity", |b| {
        let mut chain = Chain::new(256);
        for n in 1..=256u64 {
            chain.push(added(n, n as u8)).unwrap();
        }
        let mut next = 257u64;
        b.iter(|| {
            chain.pop().unwrap();
            chain.push(black_box(added(next, next as u8))).unwrap();
            next += 1;
        });
    });
}

fn queue_enqueue_dequeue(c: &mut Criterion) {
    c.bench_function("queue_enqueue_then_dequeue_ready_prefix", |b| {
        b.iter(|| {
            let mut queue = PublishQueue::new(1024);
            for n in 1..=512u64 {
                queue.enqueue(std::iter::once(added(n, n as u8))).unwrap();
            }
            black_box(queue.dequeue(0));
        });
    });
}

criterion_group!(benches, chain_push_pop, queue_enqueue_dequeue);
criterion_main!(benches);
