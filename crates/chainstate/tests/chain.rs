use emberd_chainstate::genesis::GENESIS_TIMESTAMP_MS;
use emberd_chainstate::store::ChainStore;
use emberd_chainstate::validation::{
    expected_difficulty, local_suffix_work, median_time_past, segment_work, utxo_at,
    validate_segment, BlockLookup, TxError, ValidationError,
};
use emberd_consensus::constants::DEFAULT_MAX_BLOCK_DATA_BYTES;
use emberd_consensus::{block_subsidy, hash_meets_difficulty};
use emberd_primitives::{Block, Keypair, Transaction, TxInput, TxOutput};
use rand::RngCore;

const NOW_MS: u64 = GENESIS_TIMESTAMP_MS + 1_000_000_000;

fn mine(mut block: Block) -> Block {
    let mut rng = rand::thread_rng();
    loop {
        rng.fill_bytes(&mut block.nonce);
        if hash_meets_difficulty(&block.hash(), block.difficulty) {
            return block;
        }
    }
}

fn mine_failing(mut block: Block) -> Block {
    let mut rng = rand::thread_rng();
    loop {
        rng.fill_bytes(&mut block.nonce);
        if !hash_meets_difficulty(&block.hash(), block.difficulty) {
            return block;
        }
    }
}

fn candidate(
    store: &ChainStore,
    parent: &Block,
    miner: &Keypair,
    txs: Vec<Transaction>,
    fees: u64,
    message: &[u8],
) -> Block {
    let lookup = BlockLookup::new(store);
    let difficulty = expected_difficulty(&lookup, parent).expect("difficulty");
    let height = parent.height + 1;
    let reward = block_subsidy(height) + fees;
    let mut block_txs = vec![Transaction::coinbase(miner.public(), reward, height, message)];
    block_txs.extend(txs);
    Block {
        height,
        timestamp: parent.timestamp + 10_000,
        prev_hash: parent.hash(),
        difficulty,
        nonce: [0u8; 32],
        txs: block_txs,
    }
}

fn extend(store: &mut ChainStore, miner: &Keypair, count: usize) -> Vec<Block> {
    let mut out = Vec::new();
    for index in 0..count {
        let parent = store.tip().clone();
        let block = mine(candidate(store, &parent, miner, Vec::new(), 0, &[index as u8]));
        let base = utxo_at(store, &parent.hash()).expect("utxo at parent");
        let utxo = validate_segment(
            store,
            &parent.hash(),
            std::slice::from_ref(&block),
            base,
            NOW_MS,
            DEFAULT_MAX_BLOCK_DATA_BYTES,
        )
        .expect("extension validates");
        store.commit_segment(parent.hash(), vec![block.clone()]);
        assert_eq!(utxo.len(), utxo_at(store, &store.tip_hash()).unwrap().len());
        out.push(block);
    }
    out
}

fn build_fork(
    store: &ChainStore,
    fork: &Block,
    miner: &Keypair,
    count: usize,
    tag: u8,
) -> Vec<Block> {
    let mut segment: Vec<Block> = Vec::new();
    for index in 0..count {
        let parent = segment.last().cloned().unwrap_or_else(|| fork.clone());
        let lookup = BlockLookup::with_segment(store, &segment);
        let difficulty = expected_difficulty(&lookup, &parent).expect("difficulty");
        let height = parent.height + 1;
        let block = mine(Block {
            height,
            timestamp: parent.timestamp + 10_000,
            prev_hash: parent.hash(),
            difficulty,
            nonce: [0u8; 32],
            txs: vec![Transaction::coinbase(
                miner.public(),
                block_subsidy(height),
                height,
                &[tag, index as u8],
            )],
        });
        segment.push(block);
    }
    segment
}

fn spend(from: &Keypair, prev: &Transaction, amount: u64, to: &Keypair) -> Transaction {
    let total = prev.output_value();
    let mut tx = Transaction {
        inputs: vec![TxInput {
            prev_txid: prev.txid(),
            prev_index: 0,
            signature: Vec::new(),
        }],
        outputs: vec![TxOutput {
            amount,
            public_key: *to.public(),
        }],
    };
    assert!(total >= amount);
    let txid = tx.txid();
    tx.inputs[0].signature = from.sign(&txid);
    tx
}

#[test]
fn extends_the_active_chain_and_tracks_utxos() {
    let mut store = ChainStore::new();
    let miner = Keypair::generate();
    let blocks = extend(&mut store, &miner, 2);

    assert_eq!(store.len(), 3);
    assert_eq!(store.tip_hash(), blocks[1].hash());

    let utxo = utxo_at(&store, &store.tip_hash()).expect("utxo");
    // genesis coinbase plus the two mined coinbases
    assert_eq!(utxo.len(), 3);
    assert_eq!(utxo.balance(miner.public()), 2 * block_subsidy(1));
}

#[test]
fn accepts_a_valid_spend_and_credits_fees() {
    let mut store = ChainStore::new();
    let miner = Keypair::generate();
    let blocks = extend(&mut store, &miner, 1);
    let mined_coinbase = blocks[0].coinbase().unwrap().clone();

    let fee = 200u64;
    let tx = spend(
        &miner,
        &mined_coinbase,
        mined_coinbase.output_value() - fee,
        &miner,
    );
    let parent = store.tip().clone();
    let block = mine(candidate(&store, &parent, &miner, vec![tx.clone()], fee, b"spend"));

    let base = utxo_at(&store, &parent.hash()).unwrap();
    let utxo = validate_segment(
        &store,
        &parent.hash(),
        std::slice::from_ref(&block),
        base,
        NOW_MS,
        DEFAULT_MAX_BLOCK_DATA_BYTES,
    )
    .expect("block validates");

    // the spent coinbase is gone, the spend output and new coinbase exist
    assert!(utxo.get(&mined_coinbase.txid(), 0).is_none());
    assert!(utxo.get(&tx.txid(), 0).is_some());
    assert_eq!(
        utxo.balance(miner.public()),
        2 * block_subsidy(1) // value conserved: fee comes back through the coinbase
    );
}

#[test]
fn rejects_fee_below_minimum() {
    let mut store = ChainStore::new();
    let miner = Keypair::generate();
    let blocks = extend(&mut store, &miner, 1);
    let mined_coinbase = blocks[0].coinbase().unwrap().clone();

    // sum_in == sum_out, zero fee
    let tx = spend(&miner, &mined_coinbase, mined_coinbase.output_value(), &miner);
    let parent = store.tip().clone();
    let block = mine(candidate(&store, &parent, &miner, vec![tx], 0, b""));
    let base = utxo_at(&store, &parent.hash()).unwrap();
    let err = validate_segment(
        &store,
        &parent.hash(),
        std::slice::from_ref(&block),
        base,
        NOW_MS,
        DEFAULT_MAX_BLOCK_DATA_BYTES,
    )
    .unwrap_err();
    assert!(matches!(
        err,
        ValidationError::Tx(TxError::FeeBelowMinimum { fees: 0, .. })
    ));
}

#[test]
fn rejects_missing_and_double_spent_inputs() {
    let mut store = ChainStore::new();
    let miner = Keypair::generate();
    let blocks = extend(&mut store, &miner, 1);
    let mined_coinbase = blocks[0].coinbase().unwrap().clone();

    let fee = 300u64;
    let good = spend(&miner, &mined_coinbase, mined_coinbase.output_value() - fee, &miner);
    let double = spend(&miner, &mined_coinbase, mined_coinbase.output_value() - fee - 1, &miner);

    let parent = store.tip().clone();
    let block = mine(candidate(
        &store,
        &parent,
        &miner,
        vec![good, double],
        fee * 2,
        b"",
    ));
    let base = utxo_at(&store, &parent.hash()).unwrap();
    let err = validate_segment(
        &store,
        &parent.hash(),
        std::slice::from_ref(&block),
        base,
        NOW_MS,
        DEFAULT_MAX_BLOCK_DATA_BYTES,
    )
    .unwrap_err();
    assert!(matches!(
        err,
        ValidationError::Tx(TxError::MissingInput { .. })
    ));
}

#[test]
fn rejects_bad_and_absent_signatures() {
    let mut store = ChainStore::new();
    let miner = Keypair::generate();
    let stranger = Keypair::generate();
    let blocks = extend(&mut store, &miner, 1);
    let mined_coinbase = blocks[0].coinbase().unwrap().clone();

    let fee = 300u64;
    let parent = store.tip().clone();
    let base = utxo_at(&store, &parent.hash()).unwrap();

    // signed by the wrong key
    let forged = spend(
        &stranger,
        &mined_coinbase,
        mined_coinbase.output_value() - fee,
        &stranger,
    );
    let block = mine(candidate(&store, &parent, &miner, vec![forged], fee, b""));
    let err = validate_segment(
        &store,
        &parent.hash(),
        std::slice::from_ref(&block),
        base.clone(),
        NOW_MS,
        DEFAULT_MAX_BLOCK_DATA_BYTES,
    )
    .unwrap_err();
    assert!(matches!(err, ValidationError::Tx(TxError::BadSignature { .. })));

    // not signed at all
    let mut unsigned = spend(
        &miner,
        &mined_coinbase,
        mined_coinbase.output_value() - fee,
        &miner,
    );
    unsigned.inputs[0].signature.clear();
    let block = mine(candidate(&store, &parent, &miner, vec![unsigned], fee, b""));
    let err = validate_segment(
        &store,
        &parent.hash(),
        std::slice::from_ref(&block),
        base,
        NOW_MS,
        DEFAULT_MAX_BLOCK_DATA_BYTES,
    )
    .unwrap_err();
    assert!(matches!(err, ValidationError::Tx(TxError::Unsigned { .. })));
}

#[test]
fn rejects_continuity_violations() {
    let mut store = ChainStore::new();
    let miner = Keypair::generate();
    extend(&mut store, &miner, 1);

    let parent = store.tip().clone();
    let base = utxo_at(&store, &parent.hash()).unwrap();

    // wrong height
    let mut block = candidate(&store, &parent, &miner, Vec::new(), 0, b"");
    block.height += 1;
    block.txs = vec![Transaction::coinbase(
        miner.public(),
        block_subsidy(block.height),
        block.height,
        b"",
    )];
    let block = mine(block);
    let err = validate_segment(
        &store,
        &parent.hash(),
        std::slice::from_ref(&block),
        base.clone(),
        NOW_MS,
        DEFAULT_MAX_BLOCK_DATA_BYTES,
    )
    .unwrap_err();
    assert!(matches!(err, ValidationError::Continuity(_)));

    // timestamp too far in the future
    let mut block = candidate(&store, &parent, &miner, Vec::new(), 0, b"");
    block.timestamp = NOW_MS + 120_001;
    let block = mine(block);
    let err = validate_segment(
        &store,
        &parent.hash(),
        std::slice::from_ref(&block),
        base.clone(),
        NOW_MS,
        DEFAULT_MAX_BLOCK_DATA_BYTES,
    )
    .unwrap_err();
    assert!(matches!(err, ValidationError::Continuity(_)));

    // declared difficulty differs from the required one
    let mut block = candidate(&store, &parent, &miner, Vec::new(), 0, b"");
    block.difficulty += 1;
    let block = mine(block);
    let err = validate_segment(
        &store,
        &parent.hash(),
        std::slice::from_ref(&block),
        base,
        NOW_MS,
        DEFAULT_MAX_BLOCK_DATA_BYTES,
    )
    .unwrap_err();
    assert!(matches!(err, ValidationError::Continuity(_)));
}

#[test]
fn rejects_failed_proof_and_capacity() {
    let mut store = ChainStore::new();
    let miner = Keypair::generate();
    extend(&mut store, &miner, 1);

    let parent = store.tip().clone();
    let base = utxo_at(&store, &parent.hash()).unwrap();

    let block = mine_failing(candidate(&store, &parent, &miner, Vec::new(), 0, b""));
    let err = validate_segment(
        &store,
        &parent.hash(),
        std::slice::from_ref(&block),
        base.clone(),
        NOW_MS,
        DEFAULT_MAX_BLOCK_DATA_BYTES,
    )
    .unwrap_err();
    assert!(matches!(err, ValidationError::Proof { .. }));

    let block = mine(candidate(&store, &parent, &miner, Vec::new(), 0, b""));
    let err = validate_segment(
        &store,
        &parent.hash(),
        std::slice::from_ref(&block),
        base,
        NOW_MS,
        100, // smaller than one coinbase
    )
    .unwrap_err();
    assert!(matches!(err, ValidationError::Capacity { .. }));
}

#[test]
fn rejects_overpaying_coinbase() {
    let store = ChainStore::new();
    let miner = Keypair::generate();
    let parent = store.tip().clone();
    let base = utxo_at(&store, &parent.hash()).unwrap();

    let mut block = candidate(&store, &parent, &miner, Vec::new(), 0, b"");
    block.txs[0].outputs[0].amount = block_subsidy(1) + 1;
    let block = mine(block);
    let err = validate_segment(
        &store,
        &parent.hash(),
        std::slice::from_ref(&block),
        base,
        NOW_MS,
        DEFAULT_MAX_BLOCK_DATA_BYTES,
    )
    .unwrap_err();
    assert!(matches!(err, ValidationError::Coinbase(_)));
}

#[test]
fn fork_with_more_work_wins() {
    let mut store = ChainStore::new();
    let miner_a = Keypair::generate();
    let miner_b = Keypair::generate();
    extend(&mut store, &miner_a, 2);

    let genesis = store.genesis_hash();
    let fork = store.get_block(&genesis).unwrap().clone();
    let segment = build_fork(&store, &fork, &miner_b, 3, 0xb0);

    assert!(segment_work(&segment) > local_suffix_work(&store, &genesis));

    let base = utxo_at(&store, &genesis).unwrap();
    let utxo = validate_segment(
        &store,
        &genesis,
        &segment,
        base,
        NOW_MS,
        DEFAULT_MAX_BLOCK_DATA_BYTES,
    )
    .expect("fork validates");
    let removed = store.commit_segment(genesis, segment.clone());

    assert_eq!(removed.len(), 2);
    assert_eq!(store.tip_hash(), segment[2].hash());
    assert_eq!(store.len(), 4);
    assert_eq!(utxo.balance(miner_b.public()), 3 * block_subsidy(1));
    assert_eq!(utxo.balance(miner_a.public()), 0);

    // the committed state replays to the same set
    let replayed = utxo_at(&store, &store.tip_hash()).unwrap();
    assert_eq!(replayed.len(), utxo.len());
    assert_eq!(replayed.balance(miner_b.public()), utxo.balance(miner_b.public()));
}

#[test]
fn fork_with_less_work_is_not_preferred() {
    let mut store = ChainStore::new();
    let miner_a = Keypair::generate();
    let miner_b = Keypair::generate();
    extend(&mut store, &miner_a, 3);

    let genesis = store.genesis_hash();
    let fork = store.get_block(&genesis).unwrap().clone();

    let shorter = build_fork(&store, &fork, &miner_b, 2, 0xc0);
    assert!(segment_work(&shorter) < local_suffix_work(&store, &genesis));

    // equal work favors the incoming branch
    let equal = build_fork(&store, &fork, &miner_b, 3, 0xd0);
    assert!(segment_work(&equal) >= local_suffix_work(&store, &genesis));
}

#[test]
fn median_time_past_is_the_fifth_ancestor() {
    let mut store = ChainStore::new();
    let miner = Keypair::generate();
    extend(&mut store, &miner, 7);

    let lookup = BlockLookup::new(&store);
    let tip = store.tip();
    let mtp = median_time_past(&lookup, tip).unwrap();
    let anchor = store.ancestor(&store.tip_hash(), 5).unwrap();
    assert_eq!(mtp, anchor.timestamp);
    assert_eq!(anchor.height, 2);
}

#[test]
fn difficulty_retargets_on_boundaries() {
    // Chains committed without proof search: commit_segment does not
    // validate, and expected_difficulty only reads heights and timestamps.
    fn synthetic_chain(spacing_ms: u64) -> ChainStore {
        let miner = Keypair::generate();
        let mut store = ChainStore::new();
        let mut parent = store.tip().clone();
        let mut segment = Vec::new();
        for _ in 0..10 {
            let height = parent.height + 1;
            let block = Block {
                height,
                timestamp: parent.timestamp + spacing_ms,
                prev_hash: parent.hash(),
                difficulty: 1,
                nonce: [0u8; 32],
                txs: vec![Transaction::coinbase(
                    miner.public(),
                    block_subsidy(height),
                    height,
                    b"",
                )],
            };
            segment.push(block.clone());
            parent = block;
        }
        store.commit_segment(store.genesis_hash(), segment);
        store
    }

    // on-schedule chain keeps its difficulty
    let store = synthetic_chain(10_000);
    let lookup = BlockLookup::new(&store);
    assert_eq!(expected_difficulty(&lookup, store.tip()), Some(1));

    // a fast window bumps difficulty by one
    let store = synthetic_chain(1_000);
    let lookup = BlockLookup::new(&store);
    assert_eq!(expected_difficulty(&lookup, store.tip()), Some(2));

    // a slow window would drop it, clamped at the minimum
    let store = synthetic_chain(50_000);
    let lookup = BlockLookup::new(&store);
    assert_eq!(expected_difficulty(&lookup, store.tip()), Some(1));

    // off-boundary parents pass their difficulty through
    let store = synthetic_chain(1_000);
    let parent = store.ancestor(&store.tip_hash(), 1).unwrap();
    let lookup = BlockLookup::new(&store);
    assert_eq!(expected_difficulty(&lookup, parent), Some(1));
}
