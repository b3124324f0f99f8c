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

use crate::api::Options;
use crate::api::SocketTime;
use crate::packet::sack_chunk::GapAckBlock;
use crate::packet::sack_chunk::SackChunk;
use crate::timer::BackoffAlgorithm;
use crate::timer::Timer;
use crate::types::Tsn;
use crate::types::TsnUnwrapper;
use crate::types::UnwrappedTsn;
use std::cmp::min;
use std::collections::BTreeMap;
use std::time::Duration;

/// Received TSNs further away than this from the cumulative ack TSN are dropped. This forces the
/// sender to fill the gaps before it can send more.
pub(crate) const MAX_ACCEPTED_OUTSTANDING_FRAGMENTS: u64 = 100_000;

/// Maximum number of duplicate TSNs reported in a single SACK.
pub(crate) const MAX_DUPLICATE_TSN_REPORTED: usize = 20;

/// Maximum number of gap ack blocks reported in a single SACK.
pub(crate) const MAX_GAP_ACK_BLOCKS_REPORTED: usize = 20;

#[derive(Clone, Copy, Debug, PartialEq)]
enum AckState {
    /// Nothing needs to be acknowledged.
    Idle,

    /// DATA has been received in a packet that hasn't been fully processed yet.
    BecomingDelayed,

    /// DATA has been received and the delayed ack timer is running.
    Delayed,

    /// A SACK should be sent as soon as the current packet has been processed.
    Immediate,
}

/// Tracks received TSNs, and decides when to send a SACK and what to put in it.
///
/// The tracker knows nothing about streams or messages. In a connection without loss, a SACK is
/// sent for every second packet; when there are gaps, for every packet. Otherwise the delayed ack
/// timer ensures that received data is acknowledged within min(RTO/2, 200 ms).
pub struct DataTracker {
    seen_packet: bool,
    ack_state: AckState,
    tsn_unwrapper: TsnUnwrapper,

    /// All TSNs up to and including this one have been received (or skipped by FORWARD-TSN).
    last_cumulative_acked_tsn: UnwrappedTsn,

    /// Received TSNs above the cumulative ack TSN, as a map from the first to the last (inclusive)
    /// TSN in each contiguous range. Ranges never overlap or touch each other, and the first range
    /// never starts right after `last_cumulative_acked_tsn`.
    additional_tsn_blocks: BTreeMap<UnwrappedTsn, UnwrappedTsn>,

    duplicates: Vec<Tsn>,
    delayed_ack_timer: Timer,
    delayed_ack_max_timeout: Duration,
}

impl DataTracker {
    pub fn new(peer_initial_tsn: Tsn, options: &Options) -> DataTracker {
        let mut tsn_unwrapper = TsnUnwrapper::new();
        let last_cumulative_acked_tsn = tsn_unwrapper.unwrap(peer_initial_tsn - 1);
        DataTracker {
            seen_packet: false,
            ack_state: AckState::Idle,
            tsn_unwrapper,
            last_cumulative_acked_tsn,
            additional_tsn_blocks: BTreeMap::new(),
            duplicates: Vec::new(),
            delayed_ack_timer: Timer::new(
                "delayed-ack",
                options.delayed_ack_max_timeout,
                BackoffAlgorithm::Fixed,
                Some(0),
                None,
            ),
            delayed_ack_max_timeout: options.delayed_ack_max_timeout,
        }
    }

    /// Adapts the delayed ack timeout to a new RTO.
    pub fn update_rto(&mut self, rto: Duration) {
        self.delayed_ack_timer.set_duration(min(rto / 2, self.delayed_ack_max_timeout));
    }

    pub fn next_timeout(&self) -> Option<SocketTime> {
        self.delayed_ack_timer.next_expiry()
    }

    #[cfg(test)]
    pub fn last_cumulative_acked_tsn(&self) -> Tsn {
        self.last_cumulative_acked_tsn.wrap()
    }

    /// Returns true if `tsn` is close enough to the cumulative ack TSN to be accepted.
    ///
    /// Old TSNs are valid, as receiving them again must be reported as duplicates.
    pub fn is_tsn_valid(&self, tsn: Tsn) -> bool {
        let tsn = self.tsn_unwrapper.peek_unwrap(tsn);
        tsn.distance_to(self.last_cumulative_acked_tsn) <= MAX_ACCEPTED_OUTSTANDING_FRAGMENTS
    }

    /// Returns true if receiving `tsn` would move the cumulative ack TSN.
    pub fn will_increase_cum_ack_tsn(&self, tsn: Tsn) -> bool {
        self.tsn_unwrapper.peek_unwrap(tsn) == self.last_cumulative_acked_tsn.next_value()
    }

    /// Returns true if `tsn` hasn't been cumulatively acknowledged yet.
    pub fn is_later_than_cumulative_acked_tsn(&self, tsn: Tsn) -> bool {
        self.tsn_unwrapper.peek_unwrap(tsn) > self.last_cumulative_acked_tsn
    }

    /// Records a received DATA chunk. Returns false if `tsn` has been received before.
    ///
    /// [`Self::is_tsn_valid`] must have returned true for `tsn`.
    pub fn observe(&mut self, now: SocketTime, tsn: Tsn, immediate_ack: bool) -> bool {
        debug_assert!(self.is_tsn_valid(tsn));
        let unwrapped = self.tsn_unwrapper.unwrap(tsn);

        let is_new = if unwrapped <= self.last_cumulative_acked_tsn {
            false
        } else if unwrapped == self.last_cumulative_acked_tsn.next_value() {
            self.last_cumulative_acked_tsn = unwrapped;
            self.absorb_first_block();
            true
        } else {
            self.insert_additional_tsn(unwrapped)
        };

        // RFC 9260 section 6.2: a packet with only duplicates MUST be acked without delay. One with
        // both duplicates and new data MAY be, which this implementation does.
        if !is_new {
            if self.duplicates.len() < MAX_DUPLICATE_TSN_REPORTED {
                self.duplicates.push(tsn);
            }
            self.update_ack_state(now, AckState::Immediate);
        }

        // RFC 9260 section 6.7: ack immediately as long as there are gaps.
        if !self.additional_tsn_blocks.is_empty() {
            self.update_ack_state(now, AckState::Immediate);
        }

        // RFC 9260 section 6.2: the sender requested an immediate ack (I-bit).
        if immediate_ack {
            self.update_ack_state(now, AckState::Immediate);
        }

        // RFC 9260 section 5.1: the first DATA chunk of an association is acked immediately.
        if !self.seen_packet {
            self.seen_packet = true;
            self.update_ack_state(now, AckState::Immediate);
        }

        // RFC 9260 section 6.2: ack at least every second packet.
        match self.ack_state {
            AckState::Idle => self.update_ack_state(now, AckState::BecomingDelayed),
            AckState::Delayed => self.update_ack_state(now, AckState::Immediate),
            AckState::BecomingDelayed | AckState::Immediate => {}
        }
        is_new
    }

    /// Handles a FORWARD-TSN or I-FORWARD-TSN, where the peer has abandoned all data up to and
    /// including `new_cumulative_tsn`. Returns true if the cumulative ack TSN was moved.
    pub fn handle_forward_tsn(&mut self, now: SocketTime, new_cumulative_tsn: Tsn) -> bool {
        let new_cumulative_tsn = self.tsn_unwrapper.unwrap(new_cumulative_tsn);

        // The peer will keep sending FORWARD-TSN until it has seen a SACK reflecting it.
        self.update_ack_state(now, AckState::Immediate);

        // RFC 3758 section 3.6: a FORWARD-TSN at or behind the cumulative ack TSN is out-of-date
        // and must not update it.
        if new_cumulative_tsn <= self.last_cumulative_acked_tsn {
            return false;
        }

        self.last_cumulative_acked_tsn = new_cumulative_tsn;
        let covered: Vec<(UnwrappedTsn, UnwrappedTsn)> = self
            .additional_tsn_blocks
            .range(..=new_cumulative_tsn)
            .map(|(start, end)| (*start, *end))
            .collect();
        for (start, end) in covered {
            self.additional_tsn_blocks.remove(&start);
            if end > new_cumulative_tsn {
                self.additional_tsn_blocks.insert(new_cumulative_tsn.next_value(), end);
            }
        }
        self.absorb_first_block();
        true
    }

    /// Creates a SACK reflecting all received TSNs. The reported duplicates are cleared, so the
    /// returned SACK must be sent.
    ///
    /// Received data is never reneged on, so all gap-acked data is guaranteed to stay acked.
    pub fn create_selective_ack(&mut self, a_rwnd: u32) -> SackChunk {
        let cumulative_tsn_ack = self.last_cumulative_acked_tsn;
        let gap_ack_blocks = self
            .additional_tsn_blocks
            .iter()
            .take(MAX_GAP_ACK_BLOCKS_REPORTED)
            .filter_map(|(start, end)| {
                let start = u16::try_from(start.offset_from(cumulative_tsn_ack)).ok()?;
                let end = u16::try_from(end.offset_from(cumulative_tsn_ack)).ok()?;
                Some(GapAckBlock::new(start, end))
            })
            .collect();

        SackChunk {
            cumulative_tsn_ack: cumulative_tsn_ack.wrap(),
            a_rwnd,
            gap_ack_blocks,
            duplicate_tsns: std::mem::take(&mut self.duplicates),
        }
    }

    /// Returns true if a SACK should be sent now, and resets the ack state to idle if so.
    ///
    /// A delayed SACK is only reported when `also_if_delayed` is set, which is typically the case
    /// when there is DATA to send that the SACK can be bundled with.
    pub fn should_send_ack(&mut self, now: SocketTime, also_if_delayed: bool) -> bool {
        let send = match self.ack_state {
            AckState::Immediate => true,
            AckState::BecomingDelayed | AckState::Delayed => also_if_delayed,
            AckState::Idle => false,
        };
        if send {
            self.update_ack_state(now, AckState::Idle);
        }
        send
    }

    pub fn force_immediate_sack(&mut self, now: SocketTime) {
        self.update_ack_state(now, AckState::Immediate);
    }

    /// Handles expiry of the delayed ack timer.
    pub fn handle_timeout(&mut self, now: SocketTime) {
        if self.delayed_ack_timer.expire(now) {
            self.update_ack_state(now, AckState::Immediate);
        }
    }

    /// To be called when all chunks in a received packet have been processed.
    pub fn observe_packet_end(&mut self, now: SocketTime) {
        if self.ack_state == AckState::BecomingDelayed {
            self.update_ack_state(now, AckState::Delayed);
        }
    }

    /// Adds `tsn`, which is beyond the next expected TSN, to the additional blocks. Returns false
    /// if it was already present.
    fn insert_additional_tsn(&mut self, tsn: UnwrappedTsn) -> bool {
        let before = self.additional_tsn_blocks.range(..=tsn).next_back().map(|(s, e)| (*s, *e));
        let mut start = tsn;
        if let Some((prev_start, prev_end)) = before {
            if tsn <= prev_end {
                return false;
            }
            if prev_end.next_value() == tsn {
                start = prev_start;
            }
        }
        let end = self.additional_tsn_blocks.remove(&tsn.next_value()).unwrap_or(tsn);
        self.additional_tsn_blocks.insert(start, end);
        true
    }

    /// Merges the first additional block into the cumulative ack TSN if they are now adjacent.
    fn absorb_first_block(&mut self) {
        let next = self.last_cumulative_acked_tsn.next_value();
        if let Some(end) = self.additional_tsn_blocks.remove(&next) {
            self.last_cumulative_acked_tsn = end;
        }
    }

    fn update_ack_state(&mut self, now: SocketTime, new_state: AckState) {
        if self.ack_state == new_state {
            return;
        }
        if self.ack_state == AckState::Delayed {
            self.delayed_ack_timer.stop();
        } else if new_state == AckState::Delayed {
            self.delayed_ack_timer.start(now);
        }
        self.ack_state = new_state;
    }
}
