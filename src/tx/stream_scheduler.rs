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
use std::cmp::min;
use std::collections::BTreeMap;

/// How a stream's virtual finish time advances when it produces a fragment.
#[derive(Clone, Copy, Debug, PartialEq)]
enum Discipline {
    /// Every fragment costs one unit of virtual time, independent of its size.
    RoundRobin,

    /// A fragment costs its size divided by the stream's priority.
    WeightedFair { inverse_weight: f64 },
}

impl Discipline {
    fn from_priority(priority: Option<u16>) -> Self {
        match priority {
            Some(p) => Discipline::WeightedFair { inverse_weight: 1.0 / f64::from(p.max(1)) },
            None => Discipline::RoundRobin,
        }
    }

    fn cost(&self, bytes: usize) -> f64 {
        match self {
            Discipline::RoundRobin => 1.0,
            Discipline::WeightedFair { inverse_weight } => bytes as f64 * inverse_weight,
        }
    }
}

#[derive(Debug)]
struct ActiveStream {
    discipline: Discipline,
    start_time: f64,
    finish_time: f64,
    ready_bytes: usize,
}

impl ActiveStream {
    fn reschedule(&mut self, start_time: f64, max_payload_bytes: usize) {
        self.start_time = start_time;
        self.finish_time =
            start_time + self.discipline.cost(min(self.ready_bytes, max_payload_bytes));
    }
}

/// Selects the stream that produces the next fragment.
///
/// Each stream with data ready to be sent has a virtual finish time, and the stream with the
/// smallest one wins, with ties going to the lowest stream id. When streams are given a priority,
/// this is weighted fair queuing and every fragment is scheduled on its own. Without a priority,
/// every message costs the same and a stream keeps producing until its current message is done,
/// which is plain round robin on message boundaries.
pub(crate) struct StreamScheduler {
    max_payload_bytes: usize,
    current_stream: Option<StreamId>,
    virtual_time: f64,
    active_streams: BTreeMap<StreamId, ActiveStream>,
}

impl StreamScheduler {
    pub fn new(max_payload_bytes: usize) -> Self {
        Self {
            max_payload_bytes,
            current_stream: None,
            virtual_time: 0.0,
            active_streams: BTreeMap::new(),
        }
    }

    /// Sets how many bytes are ready in the message at the head of `stream_id`. Zero removes the
    /// stream from scheduling. `priority` selects weighted fair queuing and must only be given
    /// when message interleaving is in use.
    pub fn set_bytes_remaining(
        &mut self,
        stream_id: StreamId,
        ready_bytes: usize,
        priority: Option<u16>,
    ) {
        if ready_bytes == 0 {
            self.active_streams.remove(&stream_id);
            if self.current_stream == Some(stream_id) {
                self.current_stream = None;
            }
            return;
        }

        let virtual_time = self.virtual_time;
        let stream = self.active_streams.entry(stream_id).or_insert(ActiveStream {
            discipline: Discipline::RoundRobin,
            start_time: virtual_time,
            finish_time: virtual_time,
            ready_bytes,
        });
        stream.discipline = Discipline::from_priority(priority);
        stream.ready_bytes = ready_bytes;
        let start_time = stream.start_time;
        stream.reschedule(start_time, self.max_payload_bytes);
    }

    /// Proposes a stream to produce from, and how many of its bytes fit in `max_size`.
    ///
    /// The proposal is taken with [`Self::accept`], or rejected by updating the stream with
    /// [`Self::set_bytes_remaining`].
    pub fn peek(&self, max_size: usize) -> Option<(StreamId, usize)> {
        let sticky = self
            .current_stream
            .and_then(|id| self.active_streams.get(&id).map(|stream| (id, stream)));
        let (stream_id, stream) = sticky.or_else(|| {
            self.active_streams
                .iter()
                .min_by(|(_, a), (_, b)| a.finish_time.total_cmp(&b.finish_time))
                .map(|(id, stream)| (*id, stream))
        })?;
        Some((stream_id, min(stream.ready_bytes, max_size)))
    }

    /// Accepts a proposal returned by [`Self::peek`].
    pub fn accept(&mut self, stream_id: StreamId, bytes: usize) {
        let Some(stream) = self.active_streams.get_mut(&stream_id) else {
            debug_assert!(false, "accepting inactive stream {}", stream_id);
            return;
        };
        debug_assert!(stream.ready_bytes >= bytes);

        self.virtual_time = stream.start_time + stream.discipline.cost(bytes);
        stream.ready_bytes -= bytes;
        if stream.ready_bytes == 0 {
            self.active_streams.remove(&stream_id);
            self.current_stream = None;
            return;
        }

        stream.reschedule(self.virtual_time, self.max_payload_bytes);
        self.current_stream = match stream.discipline {
            Discipline::RoundRobin => Some(stream_id),
            Discipline::WeightedFair { .. } => None,
        };
    }

    pub fn is_active(&self, stream_id: StreamId) -> bool {
        self.active_streams.contains_key(&stream_id)
    }
}
