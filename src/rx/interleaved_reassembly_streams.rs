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
use crate::types::Fsn;
use crate::types::Mid;
use crate::types::MidUnwrapper;
use crate::types::StreamKey;
use crate::types::UnwrappedMid;
use crate::types::UnwrappedTsn;
use std::collections::BTreeMap;
use std::collections::HashMap;

/// The fragments of a single message, by FSN.
type Fragments = BTreeMap<Fsn, (UnwrappedTsn, Data)>;

fn payload_size(fragments: &Fragments) -> usize {
    fragments.values().map(|(_, d)| d.payload.len()).sum()
}

fn is_complete(fragments: &Fragments) -> bool {
    let (Some((first_fsn, (_, first))), Some((last_fsn, (_, last)))) =
        (fragments.first_key_value(), fragments.last_key_value())
    else {
        return false;
    };
    *first_fsn == Fsn(0)
        && first.is_beginning
        && last.is_end
        && (last_fsn.0 as usize) + 1 == fragments.len()
}

/// One direction (ordered or unordered) of a stream. Fragments are grouped by MID, and within a
/// message ordered by FSN. Ordered messages are delivered strictly in MID order, while unordered
/// messages are delivered as soon as they are complete.
struct Stream {
    is_unordered: bool,
    mid_unwrapper: MidUnwrapper,
    next_mid: UnwrappedMid,
    chunks_by_mid: BTreeMap<UnwrappedMid, Fragments>,
}

impl Stream {
    fn new(stream_key: StreamKey) -> Self {
        let mut mid_unwrapper = MidUnwrapper::new();
        let next_mid = mid_unwrapper.unwrap(Mid(0));
        Self {
            is_unordered: stream_key.is_unordered(),
            mid_unwrapper,
            next_mid,
            chunks_by_mid: BTreeMap::new(),
        }
    }

    fn add(&mut self, tsn: UnwrappedTsn, data: Data, on_assembled: &mut OnAssembled<'_>) -> isize {
        let mid = self.mid_unwrapper.unwrap(data.mid);
        if !self.is_unordered && mid < self.next_mid {
            return 0;
        }

        let can_deliver = self.is_unordered || mid == self.next_mid;
        if can_deliver && data.is_beginning && data.is_end && !self.chunks_by_mid.contains_key(&mid)
        {
            if let Some((tsns, message)) = assemble_message([(tsn, data)]) {
                on_assembled(&tsns, message);
            }
            if self.is_unordered {
                return 0;
            }
            self.next_mid = self.next_mid.next_value();
            return -(self.try_to_assemble_ordered(on_assembled) as isize);
        }

        let fragments = self.chunks_by_mid.entry(mid).or_default();
        if fragments.contains_key(&data.fsn) {
            return 0;
        }
        let queued_bytes = data.payload.len() as isize;
        fragments.insert(data.fsn, (tsn, data));

        let assembled_bytes = if self.is_unordered {
            self.try_to_assemble(mid, on_assembled).unwrap_or(0)
        } else {
            self.try_to_assemble_ordered(on_assembled)
        };
        queued_bytes - assembled_bytes as isize
    }

    fn try_to_assemble(
        &mut self,
        mid: UnwrappedMid,
        on_assembled: &mut OnAssembled<'_>,
    ) -> Option<usize> {
        if !self.chunks_by_mid.get(&mid).is_some_and(is_complete) {
            return None;
        }
        let fragments = self.chunks_by_mid.remove(&mid)?;
        let assembled_bytes = payload_size(&fragments);
        if let Some((mut tsns, message)) = assemble_message(fragments.into_values()) {
            tsns.sort();
            on_assembled(&tsns, message);
        }
        Some(assembled_bytes)
    }

    fn try_to_assemble_ordered(&mut self, on_assembled: &mut OnAssembled<'_>) -> usize {
        let mut assembled_bytes = 0;
        while let Some(bytes) = self.try_to_assemble(self.next_mid, on_assembled) {
            assembled_bytes += bytes;
            self.next_mid = self.next_mid.next_value();
        }
        assembled_bytes
    }

    fn erase_to(&mut self, mid: Mid, on_assembled: &mut OnAssembled<'_>) -> usize {
        let mid = self.mid_unwrapper.unwrap(mid);
        let remaining = self.chunks_by_mid.split_off(&mid.next_value());
        let removed_bytes: usize = self.chunks_by_mid.values().map(payload_size).sum();
        self.chunks_by_mid = remaining;
        if self.is_unordered {
            return removed_bytes;
        }
        if mid >= self.next_mid {
            self.next_mid = mid.next_value();
        }
        removed_bytes + self.try_to_assemble_ordered(on_assembled)
    }

    fn reset(&mut self) {
        self.mid_unwrapper.reset();
        self.next_mid = self.mid_unwrapper.unwrap(Mid(0));
    }
}

/// Reassembly of I-DATA chunks, where messages are identified by their MID, and the fragments of
/// a message by their FSN. Fragments of different messages may be interleaved, on the same stream
/// as well as across streams.
#[derive(Default)]
pub struct InterleavedReassemblyStreams {
    streams: HashMap<StreamKey, Stream>,
}

impl InterleavedReassemblyStreams {
    pub fn new() -> Self {
        Default::default()
    }

    fn get_or_create(&mut self, stream_key: StreamKey) -> &mut Stream {
        self.streams.entry(stream_key).or_insert_with(|| Stream::new(stream_key))
    }
}

impl ReassemblyStreams for InterleavedReassemblyStreams {
    fn add(&mut self, tsn: UnwrappedTsn, data: Data, on_assembled: &mut OnAssembled<'_>) -> isize {
        self.get_or_create(data.stream_key).add(tsn, data, on_assembled)
    }

    fn handle_forward_tsn(
        &mut self,
        _new_cumulative_tsn: UnwrappedTsn,
        skipped_streams: &[SkippedStream],
        on_assembled: &mut OnAssembled<'_>,
    ) -> usize {
        let mut released_bytes = 0;
        for skipped in skipped_streams {
            if let SkippedStream::IForwardTsn(stream_key, mid) = skipped {
                released_bytes += self.get_or_create(*stream_key).erase_to(*mid, on_assembled);
            }
        }
        released_bytes
    }

    fn reset_streams(&mut self, streams: &[StreamId]) {
        self.streams
            .iter_mut()
            .filter(|(key, _)| streams.is_empty() || streams.contains(&key.id()))
            .for_each(|(_, stream)| stream.reset());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Message;
    use crate::testing::data_generator::DataGenerator;
    use crate::types::Tsn;

    fn tsn(value: u32) -> UnwrappedTsn {
        UnwrappedTsn::from_wrapped(Tsn(value))
    }

    #[test]
    fn add_unordered_message_returns_correct_size() {
        let mut s = InterleavedReassemblyStreams::new();
        let mut g = DataGenerator::new(StreamId(1));

        assert_eq!(s.add(tsn(1), g.unordered("a", "B"), &mut |_, _| {}), 1);
        assert_eq!(s.add(tsn(2), g.unordered("bcd", ""), &mut |_, _| {}), 3);
        assert_eq!(s.add(tsn(3), g.unordered("ef", ""), &mut |_, _| {}), 2);
        assert_eq!(s.add(tsn(4), g.unordered("g", "E"), &mut |_, _| {}), -6);
    }

    #[test]
    fn add_unordered_message_out_of_order_returns_correct_size() {
        let mut s = InterleavedReassemblyStreams::new();
        let mut g = DataGenerator::new(StreamId(1));
        let mut messages = Vec::new();

        let c1 = g.unordered("a", "B");
        let c2 = g.unordered("bcd", "");
        let c3 = g.unordered("ef", "");
        let c4 = g.unordered("g", "E");

        assert_eq!(s.add(tsn(1), c1, &mut |_, m| messages.push(m)), 1);
        assert_eq!(s.add(tsn(2), c2, &mut |_, m| messages.push(m)), 3);
        assert_eq!(s.add(tsn(4), c4, &mut |_, m| messages.push(m)), 1);
        assert!(messages.is_empty());
        assert_eq!(s.add(tsn(3), c3, &mut |_, m| messages.push(m)), -5);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload, b"abcdefg".to_vec());
    }

    #[test]
    fn add_more_complex_ordered_message_returns_correct_size() {
        let mut s = InterleavedReassemblyStreams::new();
        let mut g = DataGenerator::new(StreamId(1));
        let mut messages = Vec::new();

        let c11 = g.ordered("a", "B");
        let c12 = g.ordered("bcd", "");
        let c13 = g.ordered("ef", "");
        let c14 = g.ordered("g", "E");
        let c21 = g.ordered("h", "BE");
        let c31 = g.ordered("ij", "B");
        let c32 = g.ordered("k", "E");

        assert_eq!(s.add(tsn(1), c11, &mut |_, m| messages.push(m)), 1);
        assert_eq!(s.add(tsn(3), c13, &mut |_, m| messages.push(m)), 2);
        assert_eq!(s.add(tsn(4), c14, &mut |_, m| messages.push(m)), 1);
        assert_eq!(s.add(tsn(5), c21, &mut |_, m| messages.push(m)), 1);
        assert_eq!(s.add(tsn(6), c31, &mut |_, m| messages.push(m)), 2);
        assert_eq!(s.add(tsn(7), c32, &mut |_, m| messages.push(m)), 1);
        assert!(messages.is_empty());
        assert_eq!(s.add(tsn(2), c12, &mut |_, m| messages.push(m)), -8);

        let payloads: Vec<_> = messages.iter().map(|m| m.payload.clone()).collect();
        assert_eq!(payloads, vec![b"abcdefg".to_vec(), b"h".to_vec(), b"ijk".to_vec()]);
    }

    #[test]
    fn unordered_message_assembles_while_earlier_message_is_incomplete() {
        let mut s = InterleavedReassemblyStreams::new();
        let mut g = DataGenerator::new(StreamId(1));
        let mut assembled = Vec::new();

        let m4_first = g.unordered_with_mid("ab", "B", Mid(4));
        let m4_last = g.unordered_with_mid("c", "E", Mid(4));
        let m5_first = g.unordered_with_mid("de", "B", Mid(5));
        let m5_last = g.unordered_with_mid("f", "E", Mid(5));

        // Fragments of both messages are interleaved by the sender.
        let mut on_assembled = |t: &[UnwrappedTsn], m: Message| assembled.push((t.to_vec(), m));
        assert_eq!(s.add(tsn(1), m4_first, &mut on_assembled), 2);
        assert_eq!(s.add(tsn(2), m5_first, &mut on_assembled), 2);
        assert_eq!(s.add(tsn(4), m5_last, &mut on_assembled), -2);
        assert_eq!(s.add(tsn(3), m4_last, &mut on_assembled), -2);

        assert_eq!(assembled.len(), 2);
        assert_eq!(assembled[0].0, vec![tsn(2), tsn(4)]);
        assert_eq!(assembled[0].1.payload, b"def".to_vec());
        assert_eq!(assembled[1].0, vec![tsn(1), tsn(3)]);
        assert_eq!(assembled[1].1.payload, b"abc".to_vec());
    }

    #[test]
    fn ordered_message_is_held_back_until_previous_mid_is_complete() {
        let mut s = InterleavedReassemblyStreams::new();
        let mut g = DataGenerator::new(StreamId(1));
        let mut messages = Vec::new();

        let m0_first = g.ordered_with_mid("ab", "B", Mid(0));
        let m1 = g.ordered_with_mid("cd", "BE", Mid(1));
        let m0_last = g.ordered_with_mid("e", "E", Mid(0));

        assert_eq!(s.add(tsn(1), m0_first, &mut |_, m| messages.push(m)), 2);
        assert_eq!(s.add(tsn(2), m1, &mut |_, m| messages.push(m)), 2);
        assert!(messages.is_empty());
        assert_eq!(s.add(tsn(3), m0_last, &mut |_, m| messages.push(m)), -4);

        let payloads: Vec<_> = messages.iter().map(|m| m.payload.clone()).collect();
        assert_eq!(payloads, vec![b"abe".to_vec(), b"cd".to_vec()]);
    }

    #[test]
    fn ordered_and_unordered_directions_are_independent() {
        let mut s = InterleavedReassemblyStreams::new();
        let mut ordered = DataGenerator::new(StreamId(1));
        let mut unordered = DataGenerator::new(StreamId(1));
        let mut messages = Vec::new();

        assert_eq!(s.add(tsn(1), ordered.ordered("a", "B"), &mut |_, m| messages.push(m)), 1);
        assert_eq!(s.add(tsn(2), unordered.unordered("b", "BE"), &mut |_, m| messages.push(m)), 0);
        assert_eq!(messages.len(), 1);
        assert_eq!(s.add(tsn(3), ordered.ordered("c", "E"), &mut |_, m| messages.push(m)), -1);
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn delete_unordered_message_returns_correct_size() {
        let mut s = InterleavedReassemblyStreams::new();
        let mut g = DataGenerator::new(StreamId(1));

        assert_eq!(s.add(tsn(1), g.unordered("a", "B"), &mut |_, _| {}), 1);
        assert_eq!(s.add(tsn(2), g.unordered("bcd", ""), &mut |_, _| {}), 3);
        assert_eq!(s.add(tsn(3), g.unordered("ef", ""), &mut |_, _| {}), 2);
        assert_eq!(
            s.handle_forward_tsn(
                tsn(3),
                &[SkippedStream::IForwardTsn(StreamKey::Unordered(StreamId(1)), Mid(0))],
                &mut |_, _| {}
            ),
            6
        );
    }

    #[test]
    fn delete_many_ordered_messages_returns_correct_size() {
        let mut s = InterleavedReassemblyStreams::new();
        let mut g = DataGenerator::new(StreamId(1));
        let mut messages = Vec::new();

        let c1 = g.ordered("a", "B");
        g.ordered("bcd", ""); // TSN=2 Not received.
        let c3 = g.ordered("ef", "");
        let c4 = g.ordered("g", "E");
        let c5 = g.ordered("h", "BE");
        let c6 = g.ordered("ij", "B");
        let c7 = g.ordered("k", "E");

        assert_eq!(s.add(tsn(1), c1, &mut |_, m| messages.push(m)), 1);
        assert_eq!(s.add(tsn(3), c3, &mut |_, m| messages.push(m)), 2);
        assert_eq!(s.add(tsn(4), c4, &mut |_, m| messages.push(m)), 1);
        assert_eq!(s.add(tsn(5), c5, &mut |_, m| messages.push(m)), 1);
        assert_eq!(s.add(tsn(6), c6, &mut |_, m| messages.push(m)), 2);
        assert_eq!(s.add(tsn(7), c7, &mut |_, m| messages.push(m)), 1);

        assert_eq!(
            s.handle_forward_tsn(
                tsn(8),
                &[SkippedStream::IForwardTsn(StreamKey::Ordered(StreamId(1)), Mid(2))],
                &mut |_, m| messages.push(m)
            ),
            8
        );
        assert!(messages.is_empty());
    }

    #[test]
    fn delete_ordered_message_delivers_two_returns_correct_size() {
        let mut s = InterleavedReassemblyStreams::new();
        let mut g = DataGenerator::new(StreamId(1));
        let mut messages = Vec::new();

        let c1 = g.ordered("a", "B");
        g.ordered("bcd", ""); // TSN=2 Not received.
        let c3 = g.ordered("ef", "");
        let c4 = g.ordered("g", "E");
        let c5 = g.ordered("h", "BE");
        let c6 = g.ordered("ij", "B");
        let c7 = g.ordered("k", "E");

        assert_eq!(s.add(tsn(1), c1, &mut |_, m| messages.push(m)), 1);
        assert_eq!(s.add(tsn(3), c3, &mut |_, m| messages.push(m)), 2);
        assert_eq!(s.add(tsn(4), c4, &mut |_, m| messages.push(m)), 1);
        assert_eq!(s.add(tsn(5), c5, &mut |_, m| messages.push(m)), 1);
        assert_eq!(s.add(tsn(6), c6, &mut |_, m| messages.push(m)), 2);
        assert_eq!(s.add(tsn(7), c7, &mut |_, m| messages.push(m)), 1);

        assert_eq!(
            s.handle_forward_tsn(
                tsn(8),
                &[SkippedStream::IForwardTsn(StreamKey::Ordered(StreamId(1)), Mid(0))],
                &mut |_, m| messages.push(m)
            ),
            8
        );
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn can_delete_first_ordered_message() {
        let mut s = InterleavedReassemblyStreams::new();
        let mut g = DataGenerator::new(StreamId(1));
        let mut messages = Vec::new();

        g.ordered("abc", "BE"); // TSN=1 Not received.
        let c2 = g.ordered("def", "BE");
        assert_eq!(
            s.handle_forward_tsn(
                tsn(1),
                &[SkippedStream::IForwardTsn(StreamKey::Ordered(StreamId(1)), Mid(0))],
                &mut |_, m| messages.push(m)
            ),
            0
        );

        assert_eq!(s.add(tsn(2), c2, &mut |_, m| messages.push(m)), 0);
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn can_reassemble_fast_path_ordered() {
        let mut s = InterleavedReassemblyStreams::new();
        let mut g = DataGenerator::new(StreamId(1));
        let mut messages = Vec::new();

        let data1 = g.ordered("a", "BE");
        let data2 = g.ordered("b", "BE");
        let data3 = g.ordered("c", "BE");

        assert_eq!(s.add(tsn(1), data1, &mut |_, m| messages.push(m)), 0);
        assert_eq!(s.add(tsn(3), data3, &mut |_, m| messages.push(m)), 1);
        assert_eq!(messages.len(), 1);
        assert_eq!(s.add(tsn(2), data2, &mut |_, m| messages.push(m)), -1);
        assert_eq!(messages.len(), 3);
    }

    #[test]
    fn reset_streams_restarts_mid_for_both_directions() {
        let mut s = InterleavedReassemblyStreams::new();
        let mut g = DataGenerator::new(StreamId(1));
        let mut messages = Vec::new();

        assert_eq!(s.add(tsn(1), g.ordered("a", "BE"), &mut |_, m| messages.push(m)), 0);
        assert_eq!(s.add(tsn(2), g.ordered("b", "BE"), &mut |_, m| messages.push(m)), 0);

        s.reset_streams(&[]);

        let mut g = DataGenerator::new(StreamId(1));
        assert_eq!(s.add(tsn(3), g.ordered("c", "BE"), &mut |_, m| messages.push(m)), 0);
        assert_eq!(messages.len(), 3);
    }
}
