use itertools::Itertools;
use qp_trie::Trie;

use crate::runtime::{Snapshot, NULL_TOKEN};

#[repr(transparent)]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Tokens(pub Vec<u32>);

impl std::ops::Deref for Tokens {
    type Target = TokenSlice;

    fn deref(&self) -> &Self::Target {
        self.0.as_token_slice()
    }
}

impl std::borrow::Borrow<[u8]> for Tokens {
    fn borrow(&self) -> &[u8] {
        bytemuck::cast_slice(&self.0)
    }
}

impl std::borrow::Borrow<[u32]> for Tokens {
    fn borrow(&self) -> &[u32] {
        &self.0
    }
}

impl std::borrow::Borrow<TokenSlice> for Tokens {
    fn borrow(&self) -> &TokenSlice {
        self.0[..].as_token_slice()
    }
}

impl qp_trie::Break for Tokens {
    type Split = TokenSlice;

    fn empty<'a>() -> &'a Self::Split {
        Default::default()
    }

    fn find_break(&self, loc: usize) -> &Self::Split {
        // `loc` counts bytes; a token is four of them
        self.0[..loc >> 2].as_token_slice()
    }
}

#[repr(transparent)]
pub struct TokenSlice([u32]);

impl std::ops::Deref for TokenSlice {
    type Target = [u32];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::borrow::Borrow<[u8]> for TokenSlice {
    fn borrow(&self) -> &[u8] {
        bytemuck::cast_slice(&self.0)
    }
}

impl Default for &TokenSlice {
    fn default() -> Self {
        <&[u32]>::default().as_token_slice()
    }
}

pub trait AsTokenSlice {
    fn as_token_slice(&self) -> &TokenSlice;
}

impl AsTokenSlice for [u32] {
    fn as_token_slice(&self) -> &TokenSlice {
        let ptr = self as *const [u32] as *const TokenSlice;
        unsafe { &*ptr }
    }
}

/// Length of the common prefix of two histories. Media positions never match.
pub fn common_prefix(lhs: &[u32], rhs: &[u32]) -> usize {
    lhs.iter()
        .zip(rhs.iter())
        .take_while(|(x, y)| x == y && **x != NULL_TOKEN)
        .count()
}

/// The part of a history that may be looked up in or saved into the cache.
pub fn reusable(tokens: &[u32]) -> &[u32] {
    match tokens.iter().position(|&token| token == NULL_TOKEN) {
        Some(len) => &tokens[..len],
        None => tokens,
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CheckpointId(pub u64);

impl std::fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Saved runtime memory of a token prefix.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub tokens: Tokens,
    pub snapshot: Snapshot,
    /// Logical access stamp; larger is more recent.
    pub last_used_at: u64,
}

impl Checkpoint {
    pub fn size_bytes(&self) -> usize {
        self.snapshot.size_bytes()
    }
}

#[derive(Debug)]
pub struct CacheHit<'a> {
    /// Number of leading prompt tokens covered by the checkpoint.
    pub len: usize,
    pub checkpoint: &'a Checkpoint,
}

/// Bounded checkpoint store keyed by token prefix.
///
/// Only the scheduler thread touches it. The type is `Send`, so it can be moved
/// behind a lock if checkpointing is ever handed to another worker.
#[derive(Debug)]
pub struct PromptCache {
    entries: Trie<Tokens, Checkpoint>,
    budget_bytes: usize,
    max_items: usize,
    size_bytes: usize,
    next_id: u64,
    clock: u64,
}

impl PromptCache {
    pub fn new(budget_bytes: usize, max_items: usize) -> Self {
        Self {
            entries: Trie::new(),
            budget_bytes,
            max_items,
            size_bytes: 0,
            next_id: 0,
            clock: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn contains(&self, tokens: &[u32]) -> bool {
        self.entries.contains_key(tokens.as_token_slice())
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Find the checkpoint sharing the longest prefix with `tokens`.
    /// Among checkpoints sharing the same prefix the most recently used wins.
    pub fn lookup(&mut self, tokens: &[u32]) -> Option<CacheHit<'_>> {
        let tokens = reusable(tokens);
        let len = self
            .entries
            .longest_common_prefix(tokens.as_token_slice())
            .len();
        if len == 0 {
            return None;
        }

        let key = self
            .entries
            .iter_prefix(tokens[..len].as_token_slice())
            .max_by_key(|(_, checkpoint)| checkpoint.last_used_at)
            .map(|(key, _)| key.clone())?;

        let stamp = self.tick();
        let checkpoint = self.entries.get_mut(key.0.as_token_slice())?;
        checkpoint.last_used_at = stamp;
        log::info!(
            "[cache][hit][id: {}][len: {len}/{}]",
            checkpoint.id,
            checkpoint.tokens.len()
        );
        Some(CacheHit {
            len,
            checkpoint: &*checkpoint,
        })
    }

    /// Store a checkpoint for `tokens`, replacing any checkpoint of the exact same prefix.
    /// Snapshots larger than the whole budget are not stored.
    pub fn save(&mut self, tokens: Tokens, snapshot: Snapshot) -> Option<CheckpointId> {
        if snapshot.size_bytes() > self.budget_bytes || self.max_items == 0 {
            log::warn!(
                "[cache][skip][len: {}][size: {}] snapshot exceeds budget",
                tokens.len(),
                snapshot.size_bytes()
            );
            return None;
        }

        let id = CheckpointId(self.next_id);
        self.next_id += 1;
        let last_used_at = self.tick();
        let len = tokens.len();
        let checkpoint = Checkpoint {
            id,
            tokens: tokens.clone(),
            snapshot,
            last_used_at,
        };

        self.size_bytes += checkpoint.size_bytes();
        if let Some(replaced) = self.entries.insert(tokens, checkpoint) {
            self.size_bytes -= replaced.size_bytes();
        }
        log::info!("[cache][insert][id: {id}][len: {len}]");

        self.evict_if_needed();
        Some(id)
    }

    pub fn remove(&mut self, tokens: &[u32]) -> Option<Checkpoint> {
        let checkpoint = self.entries.remove(tokens.as_token_slice())?;
        self.size_bytes -= checkpoint.size_bytes();
        Some(checkpoint)
    }

    /// Drop least recently used checkpoints until both the size budget and item bound hold.
    /// Returns the number of checkpoints evicted.
    pub fn evict_if_needed(&mut self) -> usize {
        if self.size_bytes <= self.budget_bytes && self.entries.count() <= self.max_items {
            return 0;
        }

        let order = self
            .entries
            .iter()
            .sorted_unstable_by_key(|(_, checkpoint)| checkpoint.last_used_at)
            .map(|(tokens, checkpoint)| (tokens.clone(), checkpoint.size_bytes()))
            .collect_vec();

        let mut size = self.size_bytes;
        let mut count = self.entries.count();
        let mut remove = vec![];
        for (tokens, bytes) in order {
            if size <= self.budget_bytes && count <= self.max_items {
                break;
            }
            size -= bytes;
            count -= 1;
            remove.push(tokens);
        }

        let evicted = remove.len();
        for tokens in remove {
            if let Some(checkpoint) = self.remove(&tokens) {
                log::info!(
                    "[cache][evict][id: {}][len: {}]",
                    checkpoint.id,
                    checkpoint.tokens.len()
                );
            }
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(tokens: &[u32]) -> Snapshot {
        Snapshot {
            n_tokens: tokens.len(),
            data: bytemuck::cast_slice(tokens).to_vec(),
        }
    }

    fn save(cache: &mut PromptCache, tokens: &[u32]) -> Option<CheckpointId> {
        cache.save(Tokens(tokens.to_vec()), snapshot(tokens))
    }

    #[test]
    fn lookup_finds_longest_shared_prefix() {
        let mut cache = PromptCache::new(1 << 20, 16);
        save(&mut cache, &[1, 2, 3, 4, 5]);
        save(&mut cache, &[1, 2, 9]);

        let hit = cache.lookup(&[1, 2, 3, 4, 7, 8]).unwrap();
        assert_eq!(hit.len, 4);
        assert_eq!(hit.checkpoint.tokens.0, vec![1, 2, 3, 4, 5]);

        let hit = cache.lookup(&[1, 2, 9, 9]).unwrap();
        assert_eq!(hit.len, 3);
        assert_eq!(hit.checkpoint.tokens.0, vec![1, 2, 9]);

        assert!(cache.lookup(&[7, 7]).is_none());
    }

    #[test]
    fn lookup_handles_partial_byte_matches() {
        // 257 and 1 share their low byte
        let mut cache = PromptCache::new(1 << 20, 16);
        save(&mut cache, &[5, 257]);
        let hit = cache.lookup(&[5, 1]).unwrap();
        assert_eq!(hit.len, 1);
    }

    #[test]
    fn lookup_stops_at_media_positions() {
        let mut cache = PromptCache::new(1 << 20, 16);
        save(&mut cache, &[1, 2, 3]);
        let hit = cache.lookup(&[1, NULL_TOKEN, 3]).unwrap();
        assert_eq!(hit.len, 1);
        assert_eq!(common_prefix(&[1, NULL_TOKEN], &[1, NULL_TOKEN]), 1);
    }

    #[test]
    fn evicts_least_recently_used_over_budget() {
        // each checkpoint of three tokens takes 12 bytes
        let mut cache = PromptCache::new(30, 16);
        save(&mut cache, &[1, 1, 1]);
        save(&mut cache, &[2, 2, 2]);
        assert!(cache.lookup(&[1, 1, 1]).is_some());
        save(&mut cache, &[3, 3, 3]);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.size_bytes(), 24);
        assert!(cache.contains(&[1, 1, 1]));
        assert!(!cache.contains(&[2, 2, 2]));
        assert!(cache.contains(&[3, 3, 3]));
    }

    #[test]
    fn evicts_over_item_bound() {
        let mut cache = PromptCache::new(1 << 20, 2);
        save(&mut cache, &[1]);
        save(&mut cache, &[2]);
        save(&mut cache, &[3]);
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(&[1]));
    }

    #[test]
    fn replacing_a_prefix_keeps_size_consistent() {
        let mut cache = PromptCache::new(1 << 20, 16);
        save(&mut cache, &[1, 2]);
        save(&mut cache, &[1, 2]);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.size_bytes(), 8);

        assert!(cache.remove(&[1, 2]).is_some());
        assert_eq!(cache.size_bytes(), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn oversized_snapshot_is_not_stored() {
        let mut cache = PromptCache::new(4, 16);
        assert!(save(&mut cache, &[1, 2]).is_none());
        assert!(cache.is_empty());
    }
}
