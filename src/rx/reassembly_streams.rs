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
use crate::types::UnwrappedTsn;

/// Called with the TSNs of all fragments that made up the message, in TSN order, and the message.
pub type OnAssembled<'a> = dyn FnMut(&[UnwrappedTsn], Message) + 'a;

/// A reassembly strategy, which keeps fragments per stream and assembles messages out of them.
///
/// There are two strategies: one for when messages are identified by their stream sequence number
/// and fragments are ordered by TSN, and one for when message interleaving has been negotiated and
/// messages are identified by their message identifier with fragments ordered by FSN. The strategy
/// is selected once, when the association is established.
///
/// Every operation reports how the number of buffered payload bytes changed, which is used by the
/// owning queue to bound its memory usage.
pub trait ReassemblyStreams {
    /// Adds a fragment to its stream. If it completes one (or, for ordered streams, several)
    /// messages, these are handed to `on_assembled`.
    ///
    /// Returns the change in buffered bytes, which is negative if more bytes were assembled and
    /// delivered than were added.
    fn add(&mut self, tsn: UnwrappedTsn, data: Data, on_assembled: &mut OnAssembled<'_>) -> isize;

    /// Forgets about abandoned messages, as instructed by a FORWARD-TSN or I-FORWARD-TSN chunk.
    /// Ordered streams that were waiting for a skipped message may now deliver following messages.
    ///
    /// Returns the number of bytes that were released, either dropped or assembled.
    fn handle_forward_tsn(
        &mut self,
        new_cumulative_tsn: UnwrappedTsn,
        skipped_streams: &[SkippedStream],
        on_assembled: &mut OnAssembled<'_>,
    ) -> usize;

    /// Restarts the sequence numbering of the given streams, or of all streams when `streams` is
    /// empty, so that the next expected message has sequence number zero.
    fn reset_streams(&mut self, streams: &[StreamId]);
}

/// Concatenates the payloads of a complete fragment run, which must be given in order.
pub(crate) fn assemble_message(
    fragments: impl IntoIterator<Item = (UnwrappedTsn, Data)>,
) -> Option<(Vec<UnwrappedTsn>, Message)> {
    let mut tsns = Vec::new();
    let mut header = None;
    let mut payload = Vec::new();
    for (tsn, mut data) in fragments {
        if header.is_none() {
            header = Some((data.stream_key.id(), data.ppid));
        }
        tsns.push(tsn);
        if payload.is_empty() {
            payload = std::mem::take(&mut data.payload);
        } else {
            payload.append(&mut data.payload);
        }
    }
    let (stream_id, ppid) = header?;
    Some((tsns, Message::new(stream_id, ppid, payload)))
}
