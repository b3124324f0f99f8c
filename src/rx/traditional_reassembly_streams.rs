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

use crate::api::StreamId;
use crate::packet::data::Data;
use crate::packet::SkippedStream;
use crate::rx::reassembly_streams::assemble_message;
use crate::rx::reassembly_streams::OnAssembled;
use crate::rx::reassembly_streams::ReassemblyStreams;
use crate::types::Ssn;
use crate::types::SsnUnwrapper;
use crate::types::UnwrappedSsn;
use crate::types::UnwrappedTsn;
use std::collections::BTreeMap;
use std::collections::HashMap;

type ChunkMap = BTreeMap<UnwrappedTsn, Data>;

fn payload_size(chunks: &ChunkMap) -> usize {
    chunks.values().map(|d| d.payload.len()).sum()
}

/// Walks backwards from `tsn` through consecutive TSNs, and returns the TSN of the beginning
/// fragment, if there is one without gaps.
fn find_beginning(chunks: &ChunkMap, tsn: UnwrappedTsn) -> Option<UnwrappedTsn> {
    let mut expected = tsn;
    for (&cur, data) in chunks.range(..=tsn).rev() {
        if cur != expected {
            return None;
        }
        if data.is_beginning {
            return Some(cur);
        }
        expected = cur.prev_value();
    }
    None
}

/// Walks forward from `tsn` through consecutive TSNs, and returns the TSN of the end fragment, if
/// there is one without gaps.
fn find_end(chunks: &ChunkMap, tsn: UnwrappedTsn) -> Option<UnwrappedTsn> {
    let mut expected = tsn;
    for (&cur, data) in chunks.range(tsn..) {
        if cur != expected {
            return None;
        }
        if data.is_end {
            return Some(cur);
        }
        expected = cur.next_value();
    }
    None
}

/// Removes the fragments in `first..=last` from `chunks` and returns them.
fn take_range(chunks: &mut ChunkMap, first: UnwrappedTsn, last: UnwrappedTsn) -> ChunkMap {
    let mut after = chunks.split_off(&last.next_value());
    let run = chunks.split_off(&first);
    chunks.append(&mut after);
    run
}

/// Unordered messages can be assembled as soon as all their fragments have been received. As the
/// fragments of a message have consecutive TSNs, the beginning and end are found by looking at the
/// neighbours of the newly received TSN.
#[derive(Default)]
struct UnorderedStream {
    chunks: ChunkMap,
}

impl UnorderedStream {
    fn add(&mut self, tsn: UnwrappedTsn, data: Data, on_assembled: &mut OnAssembled<'_>) -> isize {
        if data.is_beginning && data.is_end {
            if let Some((tsns, message)) = assemble_message([(tsn, data)]) {
                on_assembled(&tsns, message);
            }
            return 0;
        }
        if self.chunks.contains_key(&tsn) {
            return 0;
        }
        let queued_bytes = data.payload.len() as isize;
        self.chunks.insert(tsn, data);
        queued_bytes - self.try_to_assemble_message(tsn, on_assembled) as isize
    }

    fn try_to_assemble_message(
        &mut self,
        tsn: UnwrappedTsn,
        on_assembled: &mut OnAssembled<'_>,
    ) -> usize {
        let Some(first) = find_beginning(&self.chunks, tsn) else {
            return 0;
        };
        let Some(last) = find_end(&self.chunks, tsn) else {
            return 0;
        };
        let run = take_range(&mut self.chunks, first, last);
        let assembled_bytes = payload_size(&run);
        if let Some((tsns, message)) = assemble_message(run) {
            on_assembled(&tsns, message);
        }
        assembled_bytes
    }

    fn erase_to(&mut self, tsn: UnwrappedTsn) -> usize {
        let remaining = self.chunks.split_off(&tsn.next_value());
        let removed_bytes = payload_size(&self.chunks);
        self.chunks = remaining;
        removed_bytes
    }
}

/// Ordered messages are delivered strictly in SSN order. Fragments are grouped by SSN, and a
/// message is only assembled when it is the next expected one and all its fragments are present.
struct OrderedStream {
    ssn_unwrapper: SsnUnwrapper,
    next_ssn: UnwrappedSsn,
    chunks_by_ssn: BTreeMap<UnwrappedSsn, ChunkMap>,
}

impl OrderedStream {
    fn new() -> Self {
        let mut ssn_unwrapper = SsnUnwrapper::new();
        let next_ssn = ssn_unwrapper.unwrap(Ssn(0));
        Self { ssn_unwrapper, next_ssn, chunks_by_ssn: BTreeMap::new() }
    }

    fn add(&mut self, tsn: UnwrappedTsn, data: Data, on_assembled: &mut OnAssembled<'_>) -> isize {
        let ssn = self.ssn_unwrapper.unwrap(data.ssn);
        if ssn < self.next_ssn {
            // Already delivered or skipped.
            return 0;
        }

        if ssn == self.next_ssn && data.is_beginning && data.is_end {
            if let Some((tsns, message)) = assemble_message([(tsn, data)]) {
                on_assembled(&tsns, message);
            }
            self.next_ssn = self.next_ssn.next_value();
            return -(self.try_to_assemble_messages(on_assembled) as isize);
        }

        let chunks = self.chunks_by_ssn.entry(ssn).or_default();
        if chunks.contains_key(&tsn) {
            return 0;
        }
        let queued_bytes = data.payload.len() as isize;
        chunks.insert(tsn, data);
        queued_bytes - self.try_to_assemble_messages(on_assembled) as isize
    }

    fn try_to_assemble_messages(&mut self, on_assembled: &mut OnAssembled<'_>) -> usize {
        let mut assembled_bytes = 0;
        while let Some(entry) = self.chunks_by_ssn.first_entry() {
            if *entry.key() != self.next_ssn || !is_complete(entry.get()) {
                break;
            }
            let chunks = entry.remove();
            assembled_bytes += payload_size(&chunks);
            if let Some((tsns, message)) = assemble_message(chunks) {
                on_assembled(&tsns, message);
            }
            self.next_ssn = self.next_ssn.next_value();
        }
        assembled_bytes
    }

    fn erase_to(&mut self, ssn: Ssn, on_assembled: &mut OnAssembled<'_>) -> usize {
        let ssn = self.ssn_unwrapper.unwrap(ssn);
        let remaining = self.chunks_by_ssn.split_off(&ssn.next_value());
        let removed_bytes: usize = self.chunks_by_ssn.values().map(payload_size).sum();
        self.chunks_by_ssn = remaining;
        if ssn >= self.next_ssn {
            self.next_ssn = ssn.next_value();
        }
        removed_bytes + self.try_to_assemble_messages(on_assembled)
    }

    fn reset(&mut self) {
        self.ssn_unwrapper.reset();
        self.next_ssn = self.ssn_unwrapper.unwrap(Ssn(0));
    }
}

/// Returns true if `chunks` holds every fragment of a single message.
fn is_complete(chunks: &ChunkMap) -> bool {
    let (Some((first_tsn, first)), Some((last_tsn, last))) =
        (chunks.first_key_value(), chunks.last_key_value())
    else {
        return false;
    };
    first.is_beginning
        && last.is_end
        && first_tsn.distance_to(*last_tsn) + 1 == chunks.len() as u64
}

/// Reassembly of DATA chunks, where ordered messages are identified by their SSN and the fragments
/// of a message are identified by consecutive TSNs.
#[derive(Default)]
pub struct TraditionalReassemblyStreams {
    ordered_streams: HashMap<StreamId, OrderedStream>,
    unordered_streams: HashMap<StreamId, UnorderedStream>,
}

impl TraditionalReassemblyStreams {
    pub fn new() -> Self {
        Default::default()
    }
}

impl ReassemblyStreams for TraditionalReassemblyStreams {
    fn add(&mut self, tsn: UnwrappedTsn, data: Data, on_assembled: &mut OnAssembled<'_>) -> isize {
        let stream_id = data.stream_id();
        if data.is_unordered() {
            self.unordered_streams.entry(stream_id).or_default().add(tsn, data, on_assembled)
        } else {
            self.ordered_streams
                .entry(stream_id)
                .or_insert_with(OrderedStream::new)
                .add(tsn, data, on_assembled)
        }
    }

    fn handle_forward_tsn(
        &mut self,
        new_cumulative_tsn: UnwrappedTsn,
        skipped_streams: &[SkippedStream],
        on_assembled: &mut OnAssembled<'_>,
    ) -> usize {
        let mut released_bytes: usize =
            self.unordered_streams.values_mut().map(|s| s.erase_to(new_cumulative_tsn)).sum();

        for skipped in skipped_streams {
            if let SkippedStream::ForwardTsn(stream_id, ssn) = skipped {
                released_bytes += self
                    .ordered_streams
                    .entry(*stream_id)
                    .or_insert_with(OrderedStream::new)
                    .erase_to(*ssn, on_assembled);
            }
        }
        released_bytes
    }

    fn reset_streams(&mut self, streams: &[StreamId]) {
        self.ordered_streams
            .iter_mut()
            .filter(|(id, _)| streams.is_empty() || streams.contains(id))
            .for_each(|(_, stream)| stream.reset());
    }
}
