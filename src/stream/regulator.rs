//! The token-stream regulator.
//!
//! Generated tokens enter as chunks; a chunk stays queued while any lock
//! is held on it (an unresolved stop-pattern prefix, a possible function
//! marker, or an incomplete character) and flushes to the caller only once
//! every lock is released. Chunks flush strictly in order.

use std::collections::VecDeque;

use crate::runtime::TokenId;

/// Stable identity of a queued chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkId(u64);

/// One hold on one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockId {
    chunk: u64,
    lock: u64,
}

struct Chunk {
    id: u64,
    tokens: Vec<TokenId>,
    text: String,
    locks: Vec<u64>,
}

/// A chunk released to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleasedChunk {
    pub tokens: Vec<TokenId>,
    pub text: String,
}

#[derive(Default)]
pub struct TokenStreamRegulator {
    chunks: VecDeque<Chunk>,
    next_chunk_id: u64,
    next_lock_id: u64,
}

impl TokenStreamRegulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a freshly generated chunk.
    pub fn add_chunk(&mut self, tokens: Vec<TokenId>, text: String) -> ChunkId {
        let id = self.next_chunk_id;
        self.next_chunk_id += 1;
        self.chunks.push_back(Chunk {
            id,
            tokens,
            text,
            locks: Vec::new(),
        });
        ChunkId(id)
    }

    /// Hold a chunk back from flushing. Returns `None` when the chunk has
    /// already flushed or been discarded.
    pub fn hold(&mut self, chunk: ChunkId) -> Option<LockId> {
        let lock = self.next_lock_id;
        self.next_lock_id += 1;
        let entry = self.chunk_mut(chunk)?;
        entry.locks.push(lock);
        Some(LockId {
            chunk: chunk.0,
            lock,
        })
    }

    /// Release one hold. Unknown ids (already-resolved chunks) are
    /// ignored.
    pub fn release(&mut self, lock: LockId) {
        if let Some(entry) = self.chunk_mut(ChunkId(lock.chunk)) {
            entry.locks.retain(|&l| l != lock.lock);
        }
    }

    /// Grow a held chunk with a token whose bytes merge into it (partial
    /// UTF-8 resolution), replacing its text wholesale.
    pub fn extend_chunk(&mut self, chunk: ChunkId, token: TokenId, text: String) -> bool {
        match self.chunk_mut(chunk) {
            Some(entry) => {
                entry.tokens.push(token);
                entry.text = text;
                true
            }
            None => false,
        }
    }

    /// Cut a chunk's text at `keep_chars` (a stop boundary); its tokens
    /// are dropped entirely since they overlap the match.
    pub fn truncate_chunk(&mut self, chunk: ChunkId, keep_chars: usize) {
        if let Some(entry) = self.chunk_mut(chunk) {
            entry.text = entry.text.chars().take(keep_chars).collect();
            entry.tokens.clear();
        }
    }

    /// Drop `chunk` and everything queued after it.
    pub fn discard_from(&mut self, chunk: ChunkId) {
        if let Some(idx) = self.chunks.iter().position(|c| c.id == chunk.0) {
            self.chunks.truncate(idx);
        }
    }

    /// Flush the longest fully-unlocked prefix of the queue.
    pub fn pop_free_chunks(&mut self) -> Vec<ReleasedChunk> {
        let mut out = Vec::new();
        while let Some(front) = self.chunks.front() {
            if !front.locks.is_empty() {
                break;
            }
            let chunk = self.chunks.pop_front().unwrap();
            if !chunk.tokens.is_empty() || !chunk.text.is_empty() {
                out.push(ReleasedChunk {
                    tokens: chunk.tokens,
                    text: chunk.text,
                });
            }
        }
        out
    }

    /// Release every remaining lock and flush the whole queue (end of
    /// generation).
    pub fn flush_all(&mut self) -> Vec<ReleasedChunk> {
        for chunk in &mut self.chunks {
            chunk.locks.clear();
        }
        self.pop_free_chunks()
    }

    /// Tokens still queued (locked or not yet popped).
    pub fn pending_tokens(&self) -> usize {
        self.chunks.iter().map(|c| c.tokens.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Chunks still queued.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    fn chunk_mut(&mut self, chunk: ChunkId) -> Option<&mut Chunk> {
        self.chunks.iter_mut().find(|c| c.id == chunk.0)
    }
}
