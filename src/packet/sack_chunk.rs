// Copyright 2025 The dcSCTP Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::types::Tsn;
use std::cmp::max;
use std::fmt;

/// A gap ack block, with `start` and `end` being offsets relative to the cumulative TSN ack, both
/// inclusive.
///
/// See <https://datatracker.ietf.org/doc/html/rfc9260#section-3.3.4>.
#[derive(Clone, Debug, PartialEq)]
pub struct GapAckBlock {
    pub start: u16,
    pub end: u16,
}

impl GapAckBlock {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }
}

/// Selective Acknowledgement (SACK) chunk
#[derive(Clone, Debug, PartialEq)]
pub struct SackChunk {
    pub cumulative_tsn_ack: Tsn,
    pub a_rwnd: u32,
    pub gap_ack_blocks: Vec<GapAckBlock>,
    pub duplicate_tsns: Vec<Tsn>,
}

impl SackChunk {
    /// Returns true if the gap ack blocks are sorted, non-empty, non-overlapping and
    /// non-adjacent, and don't touch the cumulative TSN ack.
    pub fn has_well_formed_gap_ack_blocks(&self) -> bool {
        let mut prev_end: u32 = 0;
        for block in &self.gap_ack_blocks {
            if block.end < block.start || block.start as u32 <= prev_end + 1 {
                return false;
            }
            prev_end = block.end as u32;
        }
        true
    }

    /// Returns a SACK where gap ack blocks that are inverted are dropped, and remaining ones are
    /// sorted and merged when they overlap or are adjacent.
    ///
    /// Blocks that start right after the cumulative TSN ack are kept as-is, as gap-acked data is
    /// renegable and can't be treated as cumulatively acked.
    pub fn sanitized(self) -> SackChunk {
        if self.has_well_formed_gap_ack_blocks() {
            return self;
        }

        let mut blocks: Vec<GapAckBlock> =
            self.gap_ack_blocks.into_iter().filter(|b| b.end >= b.start).collect();
        blocks.sort_by_key(|b| b.start);

        let mut merged: Vec<GapAckBlock> = Vec::with_capacity(blocks.len());
        for block in blocks {
            match merged.last_mut() {
                Some(last) if last.end as u32 + 1 >= block.start as u32 => {
                    last.end = max(last.end, block.end);
                }
                _ => merged.push(block),
            }
        }

        SackChunk { gap_ack_blocks: merged, ..self }
    }

    /// The size of this chunk when serialized.
    pub fn serialized_size(&self) -> usize {
        16 + self.gap_ack_blocks.len() * 4 + self.duplicate_tsns.len() * 4
    }
}

impl fmt::Display for SackChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SACK, cum_ack_tsn={}, a_rwnd={}", self.cumulative_tsn_ack, self.a_rwnd)?;
        for block in &self.gap_ack_blocks {
            write!(f, ", gap={}-{}", block.start, block.end)?;
        }
        if !self.duplicate_tsns.is_empty() {
            write!(f, ", dups={:?}", self.duplicate_tsns)?;
        }
        Ok(())
    }
}
