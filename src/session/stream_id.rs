// src/session/stream_id.rs

//! Per-channel stream-id allocation.
//!
//! Consumer-initiated streams use small positive ids starting above the four
//! reserved admin ids (login 1, directory 2, field dictionary 3, enum
//! dictionary 4); provider-initiated streams use small negative ids. Released
//! ids are queued for reuse before new ones are minted. Near exhaustion the
//! allocator wraps back above the reserved range and skips ids still in use.

use crate::config::SessionRole;
use crate::core::errors::SessionError;
use std::collections::{HashSet, VecDeque};

/// First id minted for consumer-initiated streams; 1-4 are reserved.
const CONSUMER_STARTING_STREAM_ID: i32 = 5;
/// First id minted for provider-initiated streams.
const PROVIDER_STARTING_STREAM_ID: i32 = -1;

/// Issues and reclaims stream identifiers for one channel.
#[derive(Debug)]
pub(crate) struct StreamIdPool {
    role: SessionRole,
    next: i32,
    free: VecDeque<i32>,
    in_use: HashSet<i32>,
    wrapped: bool,
}

impl StreamIdPool {
    pub(crate) fn new(role: SessionRole) -> Self {
        Self {
            role,
            next: match role {
                SessionRole::Consumer => CONSUMER_STARTING_STREAM_ID,
                SessionRole::Provider => PROVIDER_STARTING_STREAM_ID,
            },
            free: VecDeque::new(),
            in_use: HashSet::new(),
            wrapped: false,
        }
    }

    /// Allocates one stream id, preferring released ids over fresh ones.
    pub(crate) fn alloc(&mut self) -> Result<i32, SessionError> {
        if let Some(id) = self.free.pop_front() {
            self.in_use.insert(id);
            return Ok(id);
        }
        self.mint()
    }

    /// Allocates `count` contiguous ids and returns the first. Ranges are
    /// always freshly minted: the free list cannot guarantee a contiguous
    /// run.
    pub(crate) fn alloc_range(&mut self, count: i32) -> Result<i32, SessionError> {
        if count <= 0 {
            return Err(SessionError::Internal(
                "stream id range count must be positive".to_string(),
            ));
        }
        if self.wrapped {
            // After wrap-around a contiguous unused run is no longer
            // guaranteed to exist.
            return Err(SessionError::StreamIdExhausted);
        }
        let step: i64 = match self.role {
            SessionRole::Consumer => 1,
            SessionRole::Provider => -1,
        };
        let first = self.next;
        let last = first as i64 + step * (count as i64 - 1);
        if last.unsigned_abs() >= i32::MAX as u64 {
            return Err(SessionError::StreamIdExhausted);
        }
        for i in 0..count {
            self.in_use.insert(first + (step as i32) * i);
        }
        self.next = (first as i64 + step * count as i64) as i32;
        Ok(first)
    }

    /// Returns a released id to the reuse queue.
    pub(crate) fn release(&mut self, id: i32) {
        if self.in_use.remove(&id) {
            self.free.push_back(id);
        }
    }

    pub(crate) fn in_use_count(&self) -> usize {
        self.in_use.len()
    }

    #[cfg(test)]
    pub(crate) fn set_next_for_test(&mut self, next: i32) {
        self.next = next;
    }

    fn mint(&mut self) -> Result<i32, SessionError> {
        match self.role {
            SessionRole::Consumer => {
                if self.next == i32::MAX {
                    self.wrapped = true;
                    self.next = CONSUMER_STARTING_STREAM_ID;
                    tracing::trace!("Reached max available stream id, wrapping around");
                }
            }
            SessionRole::Provider => {
                if self.next == i32::MIN {
                    self.wrapped = true;
                    self.next = PROVIDER_STARTING_STREAM_ID;
                    tracing::trace!("Reached min available stream id, wrapping around");
                }
            }
        }

        if !self.wrapped {
            let id = self.next;
            self.next = match self.role {
                SessionRole::Consumer => self.next + 1,
                SessionRole::Provider => self.next - 1,
            };
            self.in_use.insert(id);
            return Ok(id);
        }

        // Wrapped: linearly skip ids still in use. The reserved range and
        // zero are never revisited.
        let start = self.next;
        loop {
            let id = self.next;
            self.next = match self.role {
                SessionRole::Consumer => {
                    if self.next == i32::MAX {
                        CONSUMER_STARTING_STREAM_ID
                    } else {
                        self.next + 1
                    }
                }
                SessionRole::Provider => {
                    if self.next == i32::MIN {
                        PROVIDER_STARTING_STREAM_ID
                    } else {
                        self.next - 1
                    }
                }
            };
            if !self.in_use.contains(&id) {
                self.in_use.insert(id);
                return Ok(id);
            }
            if self.next == start {
                return Err(SessionError::StreamIdExhausted);
            }
        }
    }
}
