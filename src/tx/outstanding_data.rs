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

use crate::api::LifecycleId;
use crate::api::SocketTime;
use crate::api::StreamId;
use crate::math::round_up_to_4;
use crate::packet::data::Data;
use crate::packet::forward_tsn_chunk::ForwardTsnChunk;
use crate::packet::sack_chunk::GapAckBlock;
use crate::packet::SkippedStream;
use crate::types::Mid;
use crate::types::OutgoingMessageId;
use crate::types::Ssn;
use crate::types::StreamKey;
#[cfg(test)]
use crate::types::Tsn;
use crate::types::UnwrappedTsn;
use std::cmp::max;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::time::Duration;

#[derive(Debug, PartialEq)]
enum Lifecycle {
    Active,
    ToBeRetransmitted,
    Abandoned,
}

#[derive(Debug, PartialEq)]
enum AckState {
    Unacked,
    Acked,
    Nacked,
}

#[derive(Debug, PartialEq)]
enum NackAction {
    Nothing,
    Retransmit,
    Abandon,
}

/// The outcome of processing a SACK.
#[derive(Debug)]
pub(crate) struct AckInfo {
    /// Bytes acked by the cumulative TSN ack and the gap ack blocks, that weren't acked before.
    pub bytes_acked: usize,

    /// Set when a fragment has been reported missing often enough to be considered lost, or was
    /// abandoned for that reason. A single missing report doesn't mean loss, as the fragment may
    /// just be reordered.
    pub has_packet_loss: bool,

    /// The highest TSN that was newly acknowledged, or the cumulative TSN ack if none was.
    pub highest_tsn_acked: UnwrappedTsn,

    /// Lifecycle IDs of messages whose last fragment was cumulatively acked.
    pub acked_lifecycle_ids: Vec<LifecycleId>,

    /// Lifecycle IDs of messages that were cumulatively acked after having been abandoned.
    pub abandoned_lifecycle_ids: Vec<LifecycleId>,
}

/// The state of a sent fragment, as seen by the sender.
#[cfg(test)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum ChunkState {
    /// Sent, but not yet referenced by a SACK.
    InFlight,

    /// Reported missing by a SACK. It will be retransmitted if reported missing enough times.
    Nacked,

    /// Will be retransmitted when the congestion window allows it.
    ToBeRetransmitted,

    /// Reported as received by a SACK.
    Acked,

    /// The message has expired or has been retransmitted too many times, and the fragment will
    /// not be retransmitted again.
    Abandoned,
}

/// The number of times a fragment must be reported missing before it's retransmitted, see
/// <https://datatracker.ietf.org/doc/html/rfc9260#section-7.2.4-5.1.1>.
const NUMBER_OF_NACKS_FOR_RETRANSMISSION: u8 = 3;

fn chunk_size(data_chunk_header_size: usize, data: &Data) -> usize {
    round_up_to_4!(data_chunk_header_size + data.payload.len())
}

#[derive(Debug)]
struct Item {
    message_id: OutgoingMessageId,
    time_sent: SocketTime,
    max_retransmissions: Option<u16>,
    lifecycle: Lifecycle,
    ack_state: AckState,
    nack_count: u8,
    num_retransmissions: u16,
    expires_at: Option<SocketTime>,
    lifecycle_id: Option<LifecycleId>,
    data: Data,
}

impl Item {
    fn is_in_flight(&self) -> bool {
        self.ack_state == AckState::Unacked
    }

    /// In flight, or reported missing and still to be delivered.
    fn is_outstanding(&self) -> bool {
        match self.ack_state {
            AckState::Unacked => true,
            AckState::Nacked => !self.is_abandoned(),
            AckState::Acked => false,
        }
    }

    fn is_acked(&self) -> bool {
        self.ack_state == AckState::Acked
    }

    fn is_nacked(&self) -> bool {
        self.ack_state == AckState::Nacked
    }

    fn is_abandoned(&self) -> bool {
        self.lifecycle == Lifecycle::Abandoned
    }

    fn should_be_retransmitted(&self) -> bool {
        self.lifecycle == Lifecycle::ToBeRetransmitted
    }

    fn has_been_retransmitted(&self) -> bool {
        self.num_retransmissions > 0
    }

    fn has_expired(&self, now: SocketTime) -> bool {
        self.expires_at.is_some_and(|e| e <= now)
    }

    fn ack(&mut self) {
        if self.lifecycle != Lifecycle::Abandoned {
            self.lifecycle = Lifecycle::Active;
        }
        self.ack_state = AckState::Acked;
    }

    fn nack(&mut self, retransmit_now: bool) -> NackAction {
        self.ack_state = AckState::Nacked;
        self.nack_count = self.nack_count.saturating_add(1);
        if self.should_be_retransmitted()
            || self.is_abandoned()
            || !(retransmit_now || self.nack_count >= NUMBER_OF_NACKS_FOR_RETRANSMISSION)
        {
            return NackAction::Nothing;
        }
        if self.max_retransmissions.is_none_or(|max| self.num_retransmissions < max) {
            self.lifecycle = Lifecycle::ToBeRetransmitted;
            NackAction::Retransmit
        } else {
            self.lifecycle = Lifecycle::Abandoned;
            NackAction::Abandon
        }
    }

    fn mark_as_retransmitted(&mut self) {
        self.lifecycle = Lifecycle::Active;
        self.ack_state = AckState::Unacked;
        self.nack_count = 0;
        self.num_retransmissions = self.num_retransmissions.saturating_add(1);
    }
}

/// Keeps track of fragments that have been sent but not yet cumulatively acknowledged, and handles
/// acking, nacking, scheduling for retransmission and abandoning them.
///
/// Fragments are inserted as they are sent, which is also when they are assigned a TSN, and
/// removed when the peer's cumulative TSN ack passes them. All TSNs between the cumulative TSN ack
/// and [`OutstandingData::next_tsn`] are present in the ledger.
#[derive(Debug)]
pub(crate) struct OutstandingData {
    data_chunk_header_size: usize,
    last_cumulative_tsn_ack: UnwrappedTsn,
    items: BTreeMap<UnwrappedTsn, Item>,

    /// Size and count of fragments that are in flight, which excludes those that have been acked
    /// or nacked.
    unacked_bytes: usize,
    unacked_items: usize,

    /// Size and count of fragments that are in flight, or nacked and not abandoned.
    outstanding_bytes: usize,
    outstanding_items: usize,

    to_be_fast_retransmitted: BTreeSet<UnwrappedTsn>,
    to_be_retransmitted: BTreeSet<UnwrappedTsn>,

    /// The first TSN sent after an outgoing stream reset request. FORWARD-TSN may not skip past
    /// them, as the peer would then apply the reset before having received all prior data.
    stream_reset_breakpoint_tsns: BTreeSet<UnwrappedTsn>,

    unsent_messages_to_discard: Vec<(StreamId, OutgoingMessageId)>,
}

impl OutstandingData {
    pub fn new(data_chunk_header_size: usize, last_cumulative_tsn_ack: UnwrappedTsn) -> Self {
        OutstandingData {
            data_chunk_header_size,
            last_cumulative_tsn_ack,
            items: BTreeMap::new(),
            unacked_bytes: 0,
            unacked_items: 0,
            outstanding_bytes: 0,
            outstanding_items: 0,
            to_be_fast_retransmitted: BTreeSet::new(),
            to_be_retransmitted: BTreeSet::new(),
            stream_reset_breakpoint_tsns: BTreeSet::new(),
            unsent_messages_to_discard: Vec::new(),
        }
    }

    /// Recomputes the tracked totals and compares them with the ones that are maintained
    /// incrementally.
    pub(crate) fn is_consistent(&self) -> bool {
        let mut actual_unacked_bytes = 0;
        let mut actual_unacked_items = 0;
        let mut actual_outstanding_bytes = 0;
        let mut actual_outstanding_items = 0;
        let mut actual_to_be_retransmitted = BTreeSet::new();
        let mut expected_tsn = self.last_cumulative_tsn_ack.next_value();

        for (tsn, item) in &self.items {
            if *tsn != expected_tsn {
                return false;
            }
            expected_tsn = tsn.next_value();

            let size = chunk_size(self.data_chunk_header_size, &item.data);
            if item.is_in_flight() {
                actual_unacked_bytes += size;
                actual_unacked_items += 1;
            }
            if item.is_outstanding() {
                actual_outstanding_bytes += size;
                actual_outstanding_items += 1;
            }
            if item.should_be_retransmitted() {
                if item.is_acked() {
                    return false;
                }
                actual_to_be_retransmitted.insert(*tsn);
            }
        }

        let combined: BTreeSet<UnwrappedTsn> =
            self.to_be_retransmitted.union(&self.to_be_fast_retransmitted).copied().collect();

        actual_unacked_bytes == self.unacked_bytes
            && actual_unacked_items == self.unacked_items
            && actual_outstanding_bytes == self.outstanding_bytes
            && actual_outstanding_items == self.outstanding_items
            && actual_to_be_retransmitted == combined
    }

    /// Processes the acknowledgement information of a SACK, which must have been validated by the
    /// caller, so that `cumulative_tsn_ack` is within the range of sent TSNs.
    ///
    /// Note: This may discard unsent messages - call `get_unsent_messages_to_discard`.
    pub fn handle_sack(
        &mut self,
        cumulative_tsn_ack: UnwrappedTsn,
        gap_ack_blocks: &[GapAckBlock],
        is_in_fast_recovery: bool,
    ) -> AckInfo {
        let mut ack_info = AckInfo {
            bytes_acked: 0,
            has_packet_loss: false,
            highest_tsn_acked: cumulative_tsn_ack,
            acked_lifecycle_ids: vec![],
            abandoned_lifecycle_ids: vec![],
        };

        self.remove_acked(cumulative_tsn_ack, &mut ack_info);
        self.ack_gap_blocks(cumulative_tsn_ack, gap_ack_blocks, &mut ack_info);
        self.nack_between_ack_blocks(
            cumulative_tsn_ack,
            gap_ack_blocks,
            is_in_fast_recovery,
            &mut ack_info,
        );

        debug_assert!(self.is_consistent());
        ack_info
    }

    fn remove_acked(&mut self, cumulative_tsn_ack: UnwrappedTsn, ack_info: &mut AckInfo) {
        let acked: Vec<UnwrappedTsn> =
            self.items.range(..=cumulative_tsn_ack).map(|(tsn, _)| *tsn).collect();
        for tsn in acked {
            self.ack_chunk(tsn, ack_info);
            let Some(item) = self.items.remove(&tsn) else {
                continue;
            };
            if let Some(lifecycle_id) = item.lifecycle_id {
                debug_assert!(item.data.is_end);
                if item.lifecycle == Lifecycle::Abandoned {
                    ack_info.abandoned_lifecycle_ids.push(lifecycle_id);
                } else {
                    ack_info.acked_lifecycle_ids.push(lifecycle_id);
                }
            }
        }
        self.last_cumulative_tsn_ack = max(self.last_cumulative_tsn_ack, cumulative_tsn_ack);
        self.stream_reset_breakpoint_tsns.retain(|b| *b > cumulative_tsn_ack.next_value());
    }

    fn ack_gap_blocks(
        &mut self,
        cumulative_tsn_ack: UnwrappedTsn,
        gap_ack_blocks: &[GapAckBlock],
        ack_info: &mut AckInfo,
    ) {
        // From <https://datatracker.ietf.org/doc/html/rfc9260#section-7.1>:
        //
        //   SCTP considers the information carried in the Gap Ack Blocks in the SACK chunk as
        //   advisory.
        //
        // Gap-acked fragments are marked as acked, but can't be removed until cumulatively acked.
        for block in gap_ack_blocks {
            let start = cumulative_tsn_ack.add_to(block.start as u64);
            let end = cumulative_tsn_ack.add_to(block.end as u64);
            let tsns: Vec<UnwrappedTsn> =
                self.items.range(start..=end).map(|(tsn, _)| *tsn).collect();
            for tsn in tsns {
                self.ack_chunk(tsn, ack_info);
            }
        }
    }

    fn nack_between_ack_blocks(
        &mut self,
        cumulative_tsn_ack: UnwrappedTsn,
        gap_ack_blocks: &[GapAckBlock],
        is_in_fast_recovery: bool,
        ack_info: &mut AckInfo,
    ) {
        // Every fragment below the highest gap-acked TSN that the SACK doesn't acknowledge gets a
        // miss indication, also when the same SACK is received repeatedly. Fragments above it may
        // still be in flight and are left alone.
        let mut tsns_to_nack: Vec<UnwrappedTsn> = Vec::new();
        let mut prev_block_end = cumulative_tsn_ack;
        for block in gap_ack_blocks {
            let block_start = cumulative_tsn_ack.add_to(block.start as u64);
            if block_start > prev_block_end.next_value() {
                tsns_to_nack.extend(
                    self.items
                        .range(prev_block_end.next_value()..block_start)
                        .filter(|(_, item)| !item.is_acked())
                        .map(|(tsn, _)| *tsn),
                );
            }
            prev_block_end = max(prev_block_end, cumulative_tsn_ack.add_to(block.end as u64));
        }

        for tsn in tsns_to_nack {
            ack_info.has_packet_loss |= self.nack_chunk(tsn, false, !is_in_fast_recovery);
        }
    }

    /// Nacks a fragment, and returns true if that made it considered lost.
    fn nack_chunk(&mut self, tsn: UnwrappedTsn, retransmit_now: bool, fast: bool) -> bool {
        let Some(item) = self.items.get_mut(&tsn) else {
            return false;
        };
        let size = chunk_size(self.data_chunk_header_size, &item.data);
        if item.is_in_flight() {
            self.unacked_bytes -= size;
            self.unacked_items -= 1;
        }
        let was_outstanding = item.is_outstanding();
        let action = item.nack(retransmit_now);
        if was_outstanding && !item.is_outstanding() {
            self.outstanding_bytes -= size;
            self.outstanding_items -= 1;
        }

        match action {
            NackAction::Nothing => false,
            NackAction::Retransmit => {
                if fast {
                    self.to_be_fast_retransmitted.insert(tsn);
                } else {
                    self.to_be_retransmitted.insert(tsn);
                }
                true
            }
            NackAction::Abandon => {
                self.abandon_all_for(tsn);
                true
            }
        }
    }

    fn ack_chunk(&mut self, tsn: UnwrappedTsn, ack_info: &mut AckInfo) {
        let Some(item) = self.items.get_mut(&tsn) else {
            return;
        };
        if item.is_acked() {
            return;
        }
        let size = chunk_size(self.data_chunk_header_size, &item.data);
        ack_info.bytes_acked += size;
        if item.is_in_flight() {
            self.unacked_bytes -= size;
            self.unacked_items -= 1;
        }
        if item.is_outstanding() {
            self.outstanding_bytes -= size;
            self.outstanding_items -= 1;
        }
        if item.should_be_retransmitted() {
            self.to_be_retransmitted.remove(&tsn);
            self.to_be_fast_retransmitted.remove(&tsn);
        }
        item.ack();
        ack_info.highest_tsn_acked = max(ack_info.highest_tsn_acked, tsn);
    }

    pub fn has_unsent_messages_to_discard(&self) -> bool {
        !self.unsent_messages_to_discard.is_empty()
    }

    /// Returns the messages that have been abandoned before all of their fragments were sent. The
    /// send queue must discard what's left of them.
    pub fn get_unsent_messages_to_discard(&mut self) -> Vec<(StreamId, OutgoingMessageId)> {
        std::mem::take(&mut self.unsent_messages_to_discard)
    }

    fn extract_chunks_that_can_fit(
        &mut self,
        mut max_size: usize,
        tsns: &mut BTreeSet<UnwrappedTsn>,
    ) -> Vec<(UnwrappedTsn, Data)> {
        let mut result: Vec<(UnwrappedTsn, Data)> = vec![];
        for tsn in tsns.iter() {
            let Some(item) = self.items.get_mut(tsn) else {
                continue;
            };
            debug_assert!(item.should_be_retransmitted());
            debug_assert!(!item.is_in_flight());

            let size = chunk_size(self.data_chunk_header_size, &item.data);
            if size <= max_size {
                item.mark_as_retransmitted();
                result.push((*tsn, item.data.clone()));
                max_size -= size;
                self.unacked_bytes += size;
                self.unacked_items += 1;
            }
            if max_size <= self.data_chunk_header_size {
                break;
            }
        }
        for (tsn, _) in &result {
            tsns.remove(tsn);
        }
        result
    }

    /// Returns, in TSN order, the fragments eligible for fast retransmission that fit in
    /// `max_size` bytes. Eligible fragments that didn't fit are moved to the regular
    /// retransmission set, and won't be fast retransmitted.
    pub fn get_chunks_to_be_fast_retransmitted(
        &mut self,
        max_size: usize,
    ) -> Vec<(UnwrappedTsn, Data)> {
        let mut tsns = std::mem::take(&mut self.to_be_fast_retransmitted);
        let chunks = self.extract_chunks_that_can_fit(max_size, &mut tsns);

        // From <https://datatracker.ietf.org/doc/html/rfc9260#section-7.2.4-5.5.1>:
        //
        //   Those TSNs marked for retransmission due to the Fast Retransmit algorithm that did not
        //   fit in the sent datagram carrying K other TSNs are also marked as ineligible for a
        //   subsequent Fast Retransmit.
        self.to_be_retransmitted.append(&mut tsns);
        debug_assert!(self.is_consistent());
        chunks
    }

    /// Returns, in TSN order, the fragments to be retransmitted that fit in `max_size` bytes.
    pub fn get_chunks_to_be_retransmitted(&mut self, max_size: usize) -> Vec<(UnwrappedTsn, Data)> {
        let mut tsns = std::mem::take(&mut self.to_be_retransmitted);
        let chunks = self.extract_chunks_that_can_fit(max_size, &mut tsns);
        self.to_be_retransmitted = tsns;
        debug_assert!(self.is_consistent());
        chunks
    }

    pub fn unacked_bytes(&self) -> usize {
        self.unacked_bytes
    }

    /// Returns the size of the fragments that are in flight, or nacked and not abandoned. Unlike
    /// [`Self::unacked_bytes`], this includes fragments waiting to be retransmitted.
    pub fn outstanding_bytes(&self) -> usize {
        self.outstanding_bytes
    }

    pub fn outstanding_items(&self) -> usize {
        self.outstanding_items
    }

    /// Returns the number of fragments that are in flight (neither acked nor nacked).
    pub fn unacked_items(&self) -> usize {
        self.unacked_items
    }

    /// Abandons nacked fragments whose message has expired, starting from the oldest one.
    ///
    /// Fragments in flight are not expired, as the peer may already have received them and the
    /// SACK saying so may be on its way.
    ///
    /// Note: This may discard unsent messages - call `get_unsent_messages_to_discard`.
    pub fn expire_outstanding_chunks(&mut self, now: SocketTime) {
        let mut tsns_to_expire: Vec<UnwrappedTsn> = Vec::new();
        for (tsn, item) in &self.items {
            if item.is_abandoned() {
                continue;
            }
            if !(item.is_nacked() && item.has_expired(now)) {
                break;
            }
            log::debug!("Marking nacked chunk {} and message {} as expired", tsn, item.data.mid);
            tsns_to_expire.push(*tsn);
        }
        for tsn in tsns_to_expire {
            self.abandon_all_for(tsn);
        }
        debug_assert!(self.is_consistent());
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn has_data_to_be_fast_retransmitted(&self) -> bool {
        !self.to_be_fast_retransmitted.is_empty()
    }

    pub fn has_data_to_be_retransmitted(&self) -> bool {
        !self.to_be_retransmitted.is_empty() || !self.to_be_fast_retransmitted.is_empty()
    }

    pub fn last_cumulative_acked_tsn(&self) -> UnwrappedTsn {
        self.last_cumulative_tsn_ack
    }

    pub fn next_tsn(&self) -> UnwrappedTsn {
        self.highest_outstanding_tsn().next_value()
    }

    /// The highest TSN that has been assigned, or the cumulative TSN ack if nothing is outstanding.
    pub fn highest_outstanding_tsn(&self) -> UnwrappedTsn {
        self.items.last_key_value().map_or(self.last_cumulative_tsn_ack, |(tsn, _)| *tsn)
    }

    /// Assigns the next TSN to `data`, which is about to be sent. Returns `None` if the message
    /// has already expired, in which case it's abandoned instead and shouldn't be sent.
    ///
    /// Note: This may discard unsent messages - call `get_unsent_messages_to_discard`.
    pub fn insert(
        &mut self,
        message_id: OutgoingMessageId,
        data: &Data,
        time_sent: SocketTime,
        max_retransmissions: Option<u16>,
        expires_at: Option<SocketTime>,
        lifecycle_id: Option<LifecycleId>,
    ) -> Option<UnwrappedTsn> {
        // Fragments of an already discarded message must not be produced.
        debug_assert!(self.unsent_messages_to_discard.is_empty());

        let tsn = self.next_tsn();
        let size = chunk_size(self.data_chunk_header_size, data);
        self.unacked_bytes += size;
        self.unacked_items += 1;
        self.outstanding_bytes += size;
        self.outstanding_items += 1;
        let item = Item {
            message_id,
            time_sent,
            max_retransmissions,
            lifecycle: Lifecycle::Active,
            ack_state: AckState::Unacked,
            nack_count: 0,
            num_retransmissions: 0,
            expires_at,
            lifecycle_id,
            data: data.clone(),
        };
        let expired = item.has_expired(time_sent);
        self.items.insert(tsn, item);

        if expired {
            log::debug!(
                "Marking freshly produced chunk {} and message {} as expired",
                tsn,
                data.mid
            );
            self.abandon_all_for(tsn);
            debug_assert!(self.is_consistent());
            return None;
        }
        debug_assert!(self.is_consistent());
        Some(tsn)
    }

    /// Abandons all fragments of the message that `tsn` belongs to. If the message's last fragment
    /// hasn't been sent, a placeholder for it is allocated a TSN and abandoned immediately.
    fn abandon_all_for(&mut self, tsn: UnwrappedTsn) {
        let Some(item) = self.items.get(&tsn) else {
            return;
        };
        let message_id = item.message_id;
        let stream_key = item.data.stream_key;
        let ssn = item.data.ssn;
        let mid = item.data.mid;

        let mut end_found = false;
        for (tsn, other) in self.items.iter_mut() {
            if other.message_id != message_id {
                continue;
            }
            end_found |= other.data.is_end;
            if !other.is_abandoned() {
                if other.should_be_retransmitted() {
                    self.to_be_fast_retransmitted.remove(tsn);
                    self.to_be_retransmitted.remove(tsn);
                }
                let was_outstanding = other.is_outstanding();
                other.lifecycle = Lifecycle::Abandoned;
                if was_outstanding && !other.is_outstanding() {
                    self.outstanding_bytes -= chunk_size(self.data_chunk_header_size, &other.data);
                    self.outstanding_items -= 1;
                }
            }
        }
        if end_found {
            return;
        }

        // The peer may have received all fragments sent so far. Skipping to the last of them with
        // a FORWARD-TSN would make it see the start of the next message on the stream before the
        // end of this one. The placeholder represents the end, and the peer never sees it.
        let placeholder = Item {
            message_id,
            time_sent: SocketTime::zero(),
            max_retransmissions: Some(0),
            lifecycle: Lifecycle::Abandoned,
            ack_state: AckState::Acked,
            nack_count: 0,
            num_retransmissions: 0,
            expires_at: None,
            lifecycle_id: None,
            data: Data { stream_key, ssn, mid, is_end: true, ..Default::default() },
        };
        let placeholder_tsn = self.next_tsn();
        self.items.insert(placeholder_tsn, placeholder);
        self.unsent_messages_to_discard.push((stream_key.id(), message_id));
    }

    /// Nacks all fragments that haven't been acked, and schedules them for retransmission (or
    /// abandons them).
    ///
    /// Note: This may discard unsent messages - call `get_unsent_messages_to_discard`.
    pub fn nack_all(&mut self) {
        let tsns_to_nack: Vec<UnwrappedTsn> =
            self.items.iter().filter(|(_, item)| !item.is_acked()).map(|(tsn, _)| *tsn).collect();
        for tsn in tsns_to_nack {
            self.nack_chunk(tsn, true, false);
        }
        debug_assert!(self.is_consistent());
    }

    /// Returns the abandoned fragments at the start of the ledger, up to the first one that isn't
    /// abandoned or a stream reset breakpoint.
    fn leading_abandoned(&self) -> impl Iterator<Item = (&UnwrappedTsn, &Item)> {
        self.items.iter().take_while(|(tsn, item)| {
            item.is_abandoned() && !self.stream_reset_breakpoint_tsns.contains(*tsn)
        })
    }

    /// Creates a FORWARD-TSN chunk, skipping past the abandoned fragments at the start of the
    /// ledger. Ordered streams report the last skipped SSN.
    pub fn create_forward_tsn(&self) -> ForwardTsnChunk {
        let mut new_cumulative_tsn = self.last_cumulative_tsn_ack;
        let mut skipped_per_ordered_stream: BTreeMap<StreamId, Ssn> = BTreeMap::new();
        for (tsn, item) in self.leading_abandoned() {
            new_cumulative_tsn = *tsn;
            if !item.data.is_unordered() {
                // SSNs increase with the TSN on a stream, so the last one seen is the highest.
                skipped_per_ordered_stream.insert(item.data.stream_id(), item.data.ssn);
            }
        }

        ForwardTsnChunk {
            new_cumulative_tsn: new_cumulative_tsn.wrap(),
            skipped_streams: skipped_per_ordered_stream
                .into_iter()
                .map(|(stream_id, ssn)| SkippedStream::ForwardTsn(stream_id, ssn))
                .collect(),
        }
    }

    /// Creates an I-FORWARD-TSN chunk, which reports the last skipped MID of both ordered and
    /// unordered streams.
    pub fn create_iforward_tsn(&self) -> ForwardTsnChunk {
        let mut new_cumulative_tsn = self.last_cumulative_tsn_ack;
        let mut skipped_per_stream: BTreeMap<StreamKey, Mid> = BTreeMap::new();
        for (tsn, item) in self.leading_abandoned() {
            new_cumulative_tsn = *tsn;
            skipped_per_stream.insert(item.data.stream_key, item.data.mid);
        }

        ForwardTsnChunk {
            new_cumulative_tsn: new_cumulative_tsn.wrap(),
            skipped_streams: skipped_per_stream
                .into_iter()
                .map(|(stream_key, mid)| SkippedStream::IForwardTsn(stream_key, mid))
                .collect(),
        }
    }

    /// Returns the time between when `tsn` was sent and `now`. Following Karn's algorithm, nothing
    /// is returned if the fragment has been retransmitted.
    pub fn measure_rtt(&self, now: SocketTime, tsn: UnwrappedTsn) -> Option<Duration> {
        self.items
            .get(&tsn)
            .filter(|item| !item.has_been_retransmitted())
            .map(|item| now - item.time_sent)
    }

    #[cfg(test)]
    pub fn get_chunk_states_for_testing(&self) -> Vec<(Tsn, ChunkState)> {
        let mut states = vec![(self.last_cumulative_tsn_ack.wrap(), ChunkState::Acked)];
        states.extend(self.items.iter().map(|(tsn, item)| {
            let state = if item.is_abandoned() {
                ChunkState::Abandoned
            } else if item.should_be_retransmitted() {
                ChunkState::ToBeRetransmitted
            } else if item.is_acked() {
                ChunkState::Acked
            } else if item.is_in_flight() {
                ChunkState::InFlight
            } else {
                ChunkState::Nacked
            };
            (tsn.wrap(), state)
        }));
        states
    }

    /// Returns true if the oldest fragment not acked by the peer has been abandoned, so that a
    /// FORWARD-TSN should be sent.
    pub fn should_send_forward_tsn(&self) -> bool {
        self.items.first_key_value().is_some_and(|(_, item)| item.is_abandoned())
    }

    /// Called when an outgoing stream reset request is sent. The next TSN becomes a breakpoint
    /// that a FORWARD-TSN won't skip past.
    pub fn begin_reset_streams(&mut self) {
        self.stream_reset_breakpoint_tsns.insert(self.next_tsn());
    }
}
