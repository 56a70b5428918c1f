//! End-to-end block execution scenarios.

use std::sync::Arc;
use vertex_core::execution::{
    BlockExecutor, ExecutionScheduler, ExecutorConfig, Outcome, SessionContext,
};
use vertex_core::memory::{AccessError, Chunk, ChunkIndex};
use vertex_core::types::{
    status, AccessBlockInfo, AccessMap, AccessType, AppId, ChunkId, FullId, RequestDescriptor,
    RequestId,
};

const BANK: AppId = AppId(7);
const ALICE: ChunkId = ChunkId(1);
const BOB: ChunkId = ChunkId(2);

fn bank_index(alice_balance: u64, bob_balance: u64) -> Arc<ChunkIndex> {
    let index = Arc::new(ChunkIndex::new());
    for (chunk_id, balance) in [(ALICE, alice_balance), (BOB, bob_balance)] {
        let chunk = Arc::new(Chunk::new(8));
        chunk.set_size(8);
        chunk.write(0, &balance.to_le_bytes());
        index.add_chunk(FullId::new(BANK, chunk_id), chunk).unwrap();
    }
    index
}

fn transfer_request(id: RequestId, from: ChunkId, to: ChunkId, amount: u64) -> RequestDescriptor {
    let mut map = AccessMap::new();
    let chunks = map.entry(BANK).or_default();
    chunks.insert(from, vec![AccessBlockInfo::new(0, 8, AccessType::Writable, id)]);
    chunks.insert(to, vec![AccessBlockInfo::new(0, 8, AccessType::IntAdditive, id)]);
    RequestDescriptor {
        id,
        called_app: BANK,
        payload: [&[0u8][..], &from.0.to_le_bytes(), &to.0.to_le_bytes(), &amount.to_le_bytes()]
            .concat(),
        gas: 1_000_000,
        access_map: map,
        adjacency: Default::default(),
    }
}

/// Debits the source account with a balance check, credits the destination
/// as a commutative addition.
fn transfer_handler(
    session: &mut SessionContext<'_>,
    request: &RequestDescriptor,
) -> Result<Outcome, AccessError> {
    let from = ChunkId(u64::from_le_bytes(request.payload[1..9].try_into().unwrap()));
    let to = ChunkId(u64::from_le_bytes(request.payload[9..17].try_into().unwrap()));
    let amount = u64::from_le_bytes(request.payload[17..25].try_into().unwrap());

    session.consume_gas(100)?;
    let modifier = session.modifier();
    modifier.load_context(BANK);

    modifier.load_chunk(from)?;
    let balance: u64 = modifier.load(0)?;
    if balance < amount {
        return Ok(Outcome::Revert(b"insufficient funds".to_vec()));
    }
    modifier.store(0, balance - amount)?;

    modifier.load_chunk(to)?;
    modifier.add_int::<u64>(0, amount)?;
    Ok(Outcome::Complete(Vec::new()))
}

fn bank_executor(threads: usize) -> BlockExecutor {
    let mut executor = BlockExecutor::new(ExecutorConfig {
        worker_threads: threads,
    });
    executor.register_handler(BANK, Arc::new(transfer_handler));
    executor
}

fn balances(index: &ChunkIndex) -> (u64, u64) {
    let read = |chunk_id| {
        let content = index.get_chunk(FullId::new(BANK, chunk_id)).unwrap().content();
        u64::from_le_bytes(content[..8].try_into().unwrap())
    };
    (read(ALICE), read(BOB))
}

#[test]
fn transfer_moves_exact_bytes() {
    let index = bank_index(1000, 50);
    let mut scheduler = ExecutionScheduler::new(1, Arc::clone(&index));
    scheduler
        .add_request(transfer_request(0, ALICE, BOB, 300))
        .unwrap();

    let responses = bank_executor(1).execute_block(&mut scheduler).unwrap();
    assert_eq!(responses[0].status, status::OK);

    let (alice, bob) = balances(&index);
    assert_eq!(alice, 700);
    assert_eq!(bob, 350);

    let alice_bytes = index.get_chunk(FullId::new(BANK, ALICE)).unwrap().content();
    assert_eq!(alice_bytes, 700u64.to_le_bytes());
}

#[test]
fn insufficient_funds_reverts_without_side_effects() {
    let index = bank_index(100, 50);
    let mut scheduler = ExecutionScheduler::new(2, Arc::clone(&index));
    scheduler
        .add_request(transfer_request(0, ALICE, BOB, 40))
        .unwrap();
    scheduler
        .add_request(transfer_request(1, ALICE, BOB, 500))
        .unwrap();

    let responses = bank_executor(1).execute_block(&mut scheduler).unwrap();
    assert_eq!(responses[0].status, status::OK);
    assert_eq!(responses[1].status, status::BAD_REQUEST);
    assert_eq!(responses[1].payload, b"insufficient funds");

    let (alice, bob) = balances(&index);
    assert_eq!(alice, 60);
    assert_eq!(bob, 90);
}

#[test]
fn concurrent_credits_commute() {
    // Every request credits Bob; the debit sources are all distinct, so only
    // the additive cell is shared and the whole block can run in parallel.
    use rand::Rng;
    let count = 12u32;
    let amounts: Vec<u64> = {
        let mut rng = rand::thread_rng();
        (0..count).map(|_| rng.gen_range(1..10_000)).collect()
    };
    let index = Arc::new(ChunkIndex::new());
    for id in 0..count {
        let chunk = Arc::new(Chunk::new(8));
        chunk.set_size(8);
        chunk.write(0, &10_000u64.to_le_bytes());
        index
            .add_chunk(FullId::new(BANK, ChunkId(100 + id as u64)), chunk)
            .unwrap();
    }
    let bob = Arc::new(Chunk::new(8));
    bob.set_size(8);
    index.add_chunk(FullId::new(BANK, BOB), bob).unwrap();

    let mut scheduler = ExecutionScheduler::new(count, Arc::clone(&index));
    for id in 0..count {
        scheduler
            .add_request(transfer_request(
                id,
                ChunkId(100 + id as u64),
                BOB,
                amounts[id as usize],
            ))
            .unwrap();
        scheduler.finalize_request(id).unwrap();
    }

    let responses = bank_executor(8).execute_block(&mut scheduler).unwrap();
    assert!(responses.iter().all(|r| r.status == status::OK));

    let content = index.get_chunk(FullId::new(BANK, BOB)).unwrap().content();
    let total: u64 = amounts.iter().sum();
    assert_eq!(u64::from_le_bytes(content[..8].try_into().unwrap()), total);
}

#[test]
fn final_state_is_independent_of_worker_count() {
    let run = |threads: usize| {
        let index = bank_index(10_000, 10_000);
        let mut scheduler = ExecutionScheduler::new(6, Arc::clone(&index));
        scheduler.add_request(transfer_request(0, ALICE, BOB, 100)).unwrap();
        scheduler.add_request(transfer_request(1, BOB, ALICE, 250)).unwrap();
        scheduler.add_request(transfer_request(2, ALICE, BOB, 50)).unwrap();
        scheduler.add_request(transfer_request(3, BOB, ALICE, 75)).unwrap();
        scheduler.add_request(transfer_request(4, ALICE, BOB, 1)).unwrap();
        scheduler.add_request(transfer_request(5, BOB, ALICE, 9)).unwrap();

        bank_executor(threads).execute_block(&mut scheduler).unwrap();
        index.digests()
    };

    let reference = run(1);
    for threads in [2, 4, 8] {
        assert_eq!(run(threads), reference);
    }
}

#[test]
fn cyclic_block_commits_nothing() {
    let index = bank_index(500, 500);
    let mut scheduler = ExecutionScheduler::new(2, Arc::clone(&index));
    let mut first = transfer_request(0, ALICE, BOB, 10);
    first.adjacency.insert(1);
    let mut second = transfer_request(1, BOB, ALICE, 10);
    second.adjacency.insert(0);
    scheduler.add_request(first).unwrap();
    scheduler.add_request(second).unwrap();

    let result = bank_executor(4).execute_block(&mut scheduler);
    assert!(result.is_err());
    assert_eq!(balances(&index), (500, 500));
}
