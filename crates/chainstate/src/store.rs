//! In-memory block store: a tree keyed by hash whose forward `next`
//! pointers mark the active chain from genesis to the tip.

use std::collections::HashMap;

use emberd_consensus::Hash256;
use emberd_primitives::Block;

use crate::genesis::genesis_block;

#[derive(Clone, Debug)]
pub struct StoredBlock {
    pub block: Block,
    /// Hash of the active successor, if this block is on the active chain
    /// and not the tip.
    pub next: Option<Hash256>,
}

pub struct ChainStore {
    blocks: HashMap<Hash256, StoredBlock>,
    genesis: Hash256,
    tip: Hash256,
}

impl ChainStore {
    pub fn new() -> Self {
        let genesis = genesis_block();
        let hash = genesis.hash();
        let mut blocks = HashMap::new();
        blocks.insert(
            hash,
            StoredBlock {
                block: genesis,
                next: None,
            },
        );
        Self {
            blocks,
            genesis: hash,
            tip: hash,
        }
    }

    pub fn genesis_hash(&self) -> Hash256 {
        self.genesis
    }

    pub fn tip_hash(&self) -> Hash256 {
        self.tip
    }

    pub fn tip(&self) -> &Block {
        &self.blocks[&self.tip].block
    }

    pub fn height(&self) -> u64 {
        self.tip().height
    }

    /// Blocks on the active chain, genesis included.
    pub fn len(&self) -> u64 {
        self.height() + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.blocks.contains_key(hash)
    }

    pub fn get(&self, hash: &Hash256) -> Option<&StoredBlock> {
        self.blocks.get(hash)
    }

    pub fn get_block(&self, hash: &Hash256) -> Option<&Block> {
        self.blocks.get(hash).map(|stored| &stored.block)
    }

    /// Walks `steps` parents back from `hash`, clamping at genesis. `None`
    /// only if `hash` itself is unknown.
    pub fn ancestor(&self, hash: &Hash256, steps: u64) -> Option<&Block> {
        let mut current = self.get_block(hash)?;
        for _ in 0..steps {
            if current.height == 0 {
                break;
            }
            current = self.get_block(&current.prev_hash)?;
        }
        Some(current)
    }

    /// Up to `count` blocks walking back from the tip, newest first.
    pub fn top(&self, count: u64) -> Vec<&Block> {
        let mut out = Vec::new();
        let mut current = self.tip();
        for _ in 0..count {
            out.push(current);
            if current.height == 0 {
                break;
            }
            match self.get_block(&current.prev_hash) {
                Some(parent) => current = parent,
                None => break,
            }
        }
        out
    }

    /// Active-chain hashes from genesis to the tip, following `next`.
    pub fn active_path(&self) -> Vec<Hash256> {
        let mut out = Vec::new();
        let mut current = Some(self.genesis);
        while let Some(hash) = current {
            out.push(hash);
            current = self.blocks.get(&hash).and_then(|stored| stored.next);
        }
        out
    }

    /// Active-chain block at `height`, if any.
    pub fn block_at_height(&self, height: u64) -> Option<&Block> {
        if height > self.height() {
            return None;
        }
        self.ancestor(&self.tip, self.height() - height)
    }

    /// Finds a transaction on the active chain by txid.
    pub fn find_transaction(&self, txid: &Hash256) -> Option<(&Block, &emberd_primitives::Transaction)> {
        let mut current = self.get(&self.genesis);
        while let Some(stored) = current {
            for tx in &stored.block.txs {
                if tx.txid() == *txid {
                    return Some((&stored.block, tx));
                }
            }
            current = stored.next.and_then(|next| self.get(&next));
        }
        None
    }

    /// Replaces the active suffix after `fork_hash` with `segment`, which
    /// must be parent-linked oldest first with `segment[0].prev_hash ==
    /// fork_hash`. Blocks orphaned from the old active suffix are removed;
    /// the new blocks are inserted with their `next` pointers chained and
    /// the tip moves to the last of them. Returns the hashes removed.
    pub fn commit_segment(&mut self, fork_hash: Hash256, segment: Vec<Block>) -> Vec<Hash256> {
        debug_assert!(!segment.is_empty());
        debug_assert_eq!(segment[0].prev_hash, fork_hash);

        let mut removed = Vec::new();
        let mut cursor = self.blocks.get(&fork_hash).and_then(|stored| stored.next);
        while let Some(hash) = cursor {
            cursor = self.blocks.remove(&hash).and_then(|stored| stored.next);
            removed.push(hash);
        }

        let hashes: Vec<Hash256> = segment.iter().map(Block::hash).collect();
        if let Some(fork) = self.blocks.get_mut(&fork_hash) {
            fork.next = Some(hashes[0]);
        }
        for (index, block) in segment.into_iter().enumerate() {
            let next = hashes.get(index + 1).copied();
            self.blocks.insert(hashes[index], StoredBlock { block, next });
        }
        self.tip = *hashes.last().expect("segment is non-empty");
        removed
    }
}

impl Default for ChainStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genesis::GENESIS_PUBLIC_KEY;
    use emberd_primitives::Transaction;

    fn child_of(parent: &Block, nonce_byte: u8) -> Block {
        let height = parent.height + 1;
        Block {
            height,
            timestamp: parent.timestamp + 10_000,
            prev_hash: parent.hash(),
            difficulty: parent.difficulty,
            nonce: [nonce_byte; 32],
            txs: vec![Transaction::coinbase(
                &GENESIS_PUBLIC_KEY,
                5_000_000_000,
                height,
                b"",
            )],
        }
    }

    #[test]
    fn starts_at_genesis() {
        let store = ChainStore::new();
        assert_eq!(store.tip_hash(), store.genesis_hash());
        assert_eq!(store.len(), 1);
        assert_eq!(store.active_path(), vec![store.genesis_hash()]);
    }

    #[test]
    fn extension_moves_tip_and_links_next() {
        let mut store = ChainStore::new();
        let b1 = child_of(store.tip(), 1);
        let b2 = child_of(&b1, 2);
        let genesis = store.genesis_hash();

        let removed = store.commit_segment(genesis, vec![b1.clone(), b2.clone()]);
        assert!(removed.is_empty());
        assert_eq!(store.tip_hash(), b2.hash());
        assert_eq!(store.len(), 3);
        assert_eq!(store.get(&genesis).unwrap().next, Some(b1.hash()));
        assert_eq!(store.get(&b1.hash()).unwrap().next, Some(b2.hash()));
        assert_eq!(store.get(&b2.hash()).unwrap().next, None);
        assert_eq!(store.active_path(), vec![genesis, b1.hash(), b2.hash()]);
    }

    #[test]
    fn reorg_drops_displaced_blocks() {
        let mut store = ChainStore::new();
        let genesis = store.genesis_hash();
        let a1 = child_of(store.tip(), 1);
        store.commit_segment(genesis, vec![a1.clone()]);

        let b1 = child_of(store.get_block(&genesis).unwrap(), 3);
        let b2 = child_of(&b1, 4);
        let removed = store.commit_segment(genesis, vec![b1.clone(), b2.clone()]);

        assert_eq!(removed, vec![a1.hash()]);
        assert!(!store.contains(&a1.hash()));
        assert_eq!(store.tip_hash(), b2.hash());
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn ancestor_walk_clamps_at_genesis() {
        let mut store = ChainStore::new();
        let genesis = store.genesis_hash();
        let b1 = child_of(store.tip(), 1);
        let b2 = child_of(&b1, 2);
        store.commit_segment(genesis, vec![b1.clone(), b2.clone()]);

        let tip_hash = store.tip_hash();
        assert_eq!(store.ancestor(&tip_hash, 0).unwrap().height, 2);
        assert_eq!(store.ancestor(&tip_hash, 1).unwrap().height, 1);
        assert_eq!(store.ancestor(&tip_hash, 100).unwrap().height, 0);
        assert_eq!(store.top(2).len(), 2);
        assert_eq!(store.top(10).len(), 3);
        assert_eq!(store.block_at_height(1).unwrap().hash(), b1.hash());
        assert!(store.block_at_height(9).is_none());
    }
}
