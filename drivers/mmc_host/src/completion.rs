// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Completion channel between the interrupt handler and `finalize`.

use heapless::Deque;
use log::trace;
use spin::Mutex;

/// Depth of the completion channel.
///
/// At most one request is outstanding, so anything beyond the current token
/// is a stale notification kept only until the consumer discards it.
pub const COMPLETION_DEPTH: usize = 4;

/// Notification that the request with sequence number `seq` is ready to be
/// finalized.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CompletionToken {
    pub seq: u64,
}

/// Single-consumer channel between the interrupt handler and the
/// completion context.
///
/// Pushing never allocates and holds the inner lock only for the length of
/// one deque operation.
pub struct CompletionQueue {
    tokens: Mutex<Deque<CompletionToken, COMPLETION_DEPTH>>,
}

impl CompletionQueue {
    /// Creates an empty channel.
    pub const fn new() -> Self {
        Self {
            tokens: Mutex::new(Deque::new()),
        }
    }

    /// Enqueues a token, evicting the oldest one when the channel is full.
    pub fn push(&self, token: CompletionToken) {
        let mut tokens = self.tokens.lock();
        if tokens.is_full() {
            if let Some(old) = tokens.pop_front() {
                trace!("completion channel full, evicting #{}", old.seq);
            }
        }
        // Cannot fail: a slot was freed above if needed.
        let _ = tokens.push_back(token);
    }

    /// Dequeues the oldest token.
    #[must_use]
    pub fn pop(&self) -> Option<CompletionToken> {
        self.tokens.lock().pop_front()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tokens.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }
}

impl Default for CompletionQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let q = CompletionQueue::new();
        assert!(q.pop().is_none());
        q.push(CompletionToken { seq: 1 });
        q.push(CompletionToken { seq: 2 });
        assert_eq!(q.pop(), Some(CompletionToken { seq: 1 }));
        assert_eq!(q.pop(), Some(CompletionToken { seq: 2 }));
        assert!(q.is_empty());
    }

    #[test]
    fn full_channel_drops_oldest() {
        let q = CompletionQueue::new();
        for seq in 0..(COMPLETION_DEPTH as u64 + 2) {
            q.push(CompletionToken { seq });
        }
        assert_eq!(q.len(), COMPLETION_DEPTH);
        assert_eq!(q.pop(), Some(CompletionToken { seq: 2 }));
    }
}
