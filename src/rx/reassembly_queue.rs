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

use crate::api::Message;
use crate::api::StreamId;
use crate::packet::data::Data;
use crate::packet::SkippedStream;
use crate::rx::interleaved_reassembly_streams::InterleavedReassemblyStreams;
use crate::rx::reassembly_streams::ReassemblyStreams;
use crate::rx::traditional_reassembly_streams::TraditionalReassemblyStreams;
use crate::types::Tsn;
use crate::types::TsnUnwrapper;
use crate::types::UnwrappedTsn;
use log::debug;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::collections::VecDeque;

/// The fraction of the buffer that can be filled before the receiver starts to drop data that
/// doesn't help to make progress.
pub const HIGH_WATERMARK_LIMIT: f32 = 0.9;

enum DeferredOperation {
    Data(UnwrappedTsn, Data),
    ForwardTsn(UnwrappedTsn, Vec<SkippedStream>),
}

/// Incoming stream resets are applied only once all data sent before the reset request has been
/// received. Until then, data on the streams being reset that were sent after the request is held
/// back.
struct DeferredResetStreams {
    sender_last_assigned_tsn: UnwrappedTsn,
    streams: HashSet<StreamId>,
    deferred_operations: Vec<DeferredOperation>,
}

/// The TSNs of all fragments that have been delivered as part of a message, or skipped.
///
/// Everything up to and including `watermark` has been handled. Handled TSNs above it are kept in
/// `out_of_order` until the gap below them is closed.
struct AssembledTsns {
    watermark: UnwrappedTsn,
    out_of_order: BTreeSet<UnwrappedTsn>,
}

impl AssembledTsns {
    fn contains(&self, tsn: UnwrappedTsn) -> bool {
        tsn <= self.watermark || self.out_of_order.contains(&tsn)
    }

    fn add(&mut self, tsns: &[UnwrappedTsn]) {
        let watermark = self.watermark;
        self.out_of_order.extend(tsns.iter().filter(|&&tsn| tsn > watermark));
        self.advance();
    }

    fn skip_to(&mut self, tsn: UnwrappedTsn) {
        self.watermark = self.watermark.max(tsn);
        self.out_of_order = self.out_of_order.split_off(&self.watermark.next_value());
        self.advance();
    }

    fn advance(&mut self) {
        while self.out_of_order.first() == Some(&self.watermark.next_value()) {
            self.out_of_order.pop_first();
            self.watermark = self.watermark.next_value();
        }
    }
}

/// Contains the received DATA/I-DATA fragments that haven't yet been reassembled, and the
/// messages that have been reassembled but not yet read by the application.
///
/// Fragments are handed to a [`ReassemblyStreams`] strategy that is chosen when the queue is
/// created, depending on if message interleaving has been negotiated. The queue itself tracks which
/// TSNs have been delivered, so that duplicate fragments never produce a second message, and how
/// many payload bytes are buffered.
pub struct ReassemblyQueue {
    max_size_bytes: usize,
    watermark_bytes: usize,
    queued_bytes: usize,
    tsn_unwrapper: TsnUnwrapper,
    streams: Box<dyn ReassemblyStreams>,
    assembled_tsns: AssembledTsns,
    deferred_reset_streams: Option<DeferredResetStreams>,
    reassembled_messages: VecDeque<Message>,
    rx_messages_count: usize,
}

impl ReassemblyQueue {
    pub fn new(
        peer_initial_tsn: Tsn,
        max_size_bytes: usize,
        use_message_interleaving: bool,
    ) -> Self {
        let streams: Box<dyn ReassemblyStreams> = if use_message_interleaving {
            Box::new(InterleavedReassemblyStreams::new())
        } else {
            Box::new(TraditionalReassemblyStreams::new())
        };

        let mut tsn_unwrapper = TsnUnwrapper::new();
        let last_assembled = tsn_unwrapper.unwrap(peer_initial_tsn - 1);

        Self {
            max_size_bytes,
            watermark_bytes: (max_size_bytes as f32 * HIGH_WATERMARK_LIMIT) as usize,
            queued_bytes: 0,
            tsn_unwrapper,
            streams,
            assembled_tsns: AssembledTsns {
                watermark: last_assembled,
                out_of_order: BTreeSet::new(),
            },
            deferred_reset_streams: None,
            reassembled_messages: VecDeque::new(),
            rx_messages_count: 0,
        }
    }

    /// Adds a received fragment. Fragments that belong to an already delivered message are
    /// ignored.
    pub fn add(&mut self, tsn: Tsn, data: Data) {
        let tsn = self.tsn_unwrapper.unwrap(tsn);
        self.add_unwrapped(tsn, data);
    }

    fn add_unwrapped(&mut self, tsn: UnwrappedTsn, data: Data) {
        if self.assembled_tsns.contains(tsn) {
            return;
        }

        if let Some(deferred) = &mut self.deferred_reset_streams {
            if tsn > deferred.sender_last_assigned_tsn
                && deferred.streams.contains(&data.stream_id())
            {
                debug!("Deferring TSN {tsn} on stream {} until stream reset", data.stream_id());
                self.queued_bytes += data.payload.len();
                deferred.deferred_operations.push(DeferredOperation::Data(tsn, data));
                return;
            }
        }

        let assembled_tsns = &mut self.assembled_tsns;
        let messages = &mut self.reassembled_messages;
        let rx_messages_count = &mut self.rx_messages_count;
        let delta = self.streams.add(tsn, data, &mut |tsns, message| {
            assembled_tsns.add(tsns);
            messages.push_back(message);
            *rx_messages_count += 1;
        });
        debug_assert!(delta >= 0 || self.queued_bytes >= delta.unsigned_abs());
        self.queued_bytes = self.queued_bytes.wrapping_add_signed(delta);
    }

    /// Forgets about all data up to `new_cumulative_tsn`, and about the messages listed in
    /// `skipped_streams`.
    pub fn handle_forward_tsn(
        &mut self,
        new_cumulative_tsn: Tsn,
        skipped_streams: &[SkippedStream],
    ) {
        let tsn = self.tsn_unwrapper.unwrap(new_cumulative_tsn);
        self.handle_forward_tsn_unwrapped(tsn, skipped_streams.to_vec());
    }

    fn handle_forward_tsn_unwrapped(
        &mut self,
        new_cumulative_tsn: UnwrappedTsn,
        skipped_streams: Vec<SkippedStream>,
    ) {
        if let Some(deferred) = &mut self.deferred_reset_streams {
            if new_cumulative_tsn > deferred.sender_last_assigned_tsn {
                debug!("Deferring FORWARD-TSN {new_cumulative_tsn} until stream reset");
                deferred
                    .deferred_operations
                    .push(DeferredOperation::ForwardTsn(new_cumulative_tsn, skipped_streams));
                return;
            }
        }

        self.assembled_tsns.skip_to(new_cumulative_tsn);

        let assembled_tsns = &mut self.assembled_tsns;
        let messages = &mut self.reassembled_messages;
        let rx_messages_count = &mut self.rx_messages_count;
        let released = self.streams.handle_forward_tsn(
            new_cumulative_tsn,
            &skipped_streams,
            &mut |tsns, message| {
                assembled_tsns.add(tsns);
                messages.push_back(message);
                *rx_messages_count += 1;
            },
        );
        debug_assert!(self.queued_bytes >= released);
        self.queued_bytes -= released;
    }

    /// Holds back data on `streams` that was sent after `sender_last_assigned_tsn`, until
    /// [`Self::reset_streams_and_leave_deferred_reset`] is called.
    pub fn enter_deferred_reset(&mut self, sender_last_assigned_tsn: Tsn, streams: &[StreamId]) {
        let sender_last_assigned_tsn = self.tsn_unwrapper.peek_unwrap(sender_last_assigned_tsn);
        if self.deferred_reset_streams.is_some() {
            return;
        }
        debug!("Entering deferred reset of streams {streams:?} at TSN {sender_last_assigned_tsn}");
        self.deferred_reset_streams = Some(DeferredResetStreams {
            sender_last_assigned_tsn,
            streams: streams.iter().copied().collect(),
            deferred_operations: Vec::new(),
        });
    }

    /// Resets the sequence numbers of `streams` (or all streams, if empty) and processes any data
    /// that was held back while waiting for the reset.
    pub fn reset_streams_and_leave_deferred_reset(&mut self, streams: &[StreamId]) {
        self.streams.reset_streams(streams);
        let Some(deferred) = self.deferred_reset_streams.take() else {
            return;
        };
        debug!(
            "Leaving deferred reset, replaying {} operations",
            deferred.deferred_operations.len()
        );
        for operation in deferred.deferred_operations {
            match operation {
                DeferredOperation::Data(tsn, data) => {
                    debug_assert!(self.queued_bytes >= data.payload.len());
                    self.queued_bytes -= data.payload.len();
                    self.add_unwrapped(tsn, data);
                }
                DeferredOperation::ForwardTsn(tsn, skipped_streams) => {
                    self.handle_forward_tsn_unwrapped(tsn, skipped_streams);
                }
            }
        }
    }

    #[cfg(test)]
    pub fn is_deferring_reset(&self) -> bool {
        self.deferred_reset_streams.is_some()
    }

    /// The highest TSN up to which every fragment has been delivered or skipped.
    #[cfg(test)]
    pub fn last_assembled_tsn_watermark(&self) -> Tsn {
        self.assembled_tsns.watermark.wrap()
    }

    pub fn get_next_message(&mut self) -> Option<Message> {
        self.reassembled_messages.pop_front()
    }

    #[cfg(test)]
    pub fn has_messages(&self) -> bool {
        !self.reassembled_messages.is_empty()
    }

    pub fn rx_messages_count(&self) -> usize {
        self.rx_messages_count
    }

    /// The number of payload bytes of fragments that are not yet part of an assembled message.
    #[cfg(test)]
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    pub fn is_above_watermark(&self) -> bool {
        self.queued_bytes >= self.watermark_bytes
    }

    pub fn is_full(&self) -> bool {
        self.queued_bytes >= self.max_size_bytes
    }

    /// The remaining bytes until the queue has reached the watermark limit.
    pub fn remaining_bytes(&self) -> usize {
        self.watermark_bytes.saturating_sub(self.queued_bytes)
    }
}
