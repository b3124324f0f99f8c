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
use crate::api::Message;
use crate::api::Options;
use crate::api::SendOptions;
use crate::api::SocketEvent;
use crate::api::SocketTime;
use crate::api::StreamId;
use crate::packet::data::Data;
use crate::tx::stream_scheduler::StreamScheduler;
use crate::types::Fsn;
use crate::types::Mid;
use crate::types::OutgoingMessageId;
use crate::types::Ssn;
use crate::types::StreamKey;
use crate::EventSink;
use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

/// A fragment produced by the send queue, together with the partial reliability attributes of the
/// message it belongs to.
#[derive(Debug)]
pub(crate) struct DataToSend {
    pub message_id: OutgoingMessageId,
    pub data: Data,
    pub max_retransmissions: Option<u16>,
    pub expires_at: Option<SocketTime>,

    /// Only set on the last fragment of a message.
    pub lifecycle_id: Option<LifecycleId>,
}

struct MessageAttributes {
    unordered: bool,
    max_retransmissions: Option<u16>,
    expires_at: Option<SocketTime>,
    lifecycle_id: Option<LifecycleId>,
}

/// A stream is paused before it's reset, so that the sender can tell the receiver the last TSN of
/// the stream. A message that has started to be sent is always finished first.
#[derive(Clone, Copy, Debug, PartialEq)]
enum PauseState {
    NotPaused,

    /// Pausing, but the message at the front has fragments left to send.
    Pending,

    /// Paused, and ready to be reset.
    Paused,

    /// Part of an outgoing stream reset request that hasn't been answered yet.
    Resetting,
}

struct QueuedMessage {
    message_id: OutgoingMessageId,
    message: Message,
    attributes: MessageAttributes,

    /// Payload offset of the next fragment.
    offset: usize,

    /// Assigned when the first fragment is produced.
    mid: Option<Mid>,
    ssn: Option<Ssn>,
    next_fsn: Fsn,
}

impl QueuedMessage {
    fn remaining(&self) -> usize {
        self.message.payload.len() - self.offset
    }

    fn is_expired(&self, now: SocketTime) -> bool {
        self.attributes.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    fn rewind(&mut self) {
        self.offset = 0;
        self.mid = None;
        self.ssn = None;
        self.next_fsn = Fsn(0);
    }
}

/// A byte counter that reports when it drops to or below its low threshold.
struct BufferedAmount {
    value: usize,
    low_threshold: usize,
}

impl BufferedAmount {
    fn new(low_threshold: usize) -> Self {
        Self { value: 0, low_threshold }
    }

    fn increase(&mut self, bytes: usize) {
        self.value += bytes;
    }

    /// Returns true if the value went from above the threshold to at or below it.
    fn decrease(&mut self, bytes: usize) -> bool {
        debug_assert!(self.value >= bytes);
        let was_above = self.value > self.low_threshold;
        self.value -= bytes;
        was_above && self.value <= self.low_threshold
    }

    /// Returns true if the new threshold puts the current value at or below it, where it wasn't
    /// before.
    fn set_low_threshold(&mut self, low_threshold: usize) -> bool {
        let crossed = self.low_threshold < self.value && low_threshold >= self.value;
        self.low_threshold = low_threshold;
        crossed
    }
}

struct OutgoingStream {
    priority: u16,
    pause_state: PauseState,
    next_unordered_mid: Mid,
    next_ordered_mid: Mid,
    next_ssn: Ssn,
    buffered_amount: BufferedAmount,
    messages: VecDeque<QueuedMessage>,
}

impl OutgoingStream {
    fn new(priority: u16, low_threshold: usize) -> Self {
        Self {
            priority,
            pause_state: PauseState::NotPaused,
            next_unordered_mid: Mid(0),
            next_ordered_mid: Mid(0),
            next_ssn: Ssn(0),
            buffered_amount: BufferedAmount::new(low_threshold),
            messages: VecDeque::new(),
        }
    }

    /// Bytes the scheduler may produce from this stream right now.
    fn ready_bytes(&self) -> usize {
        match self.pause_state {
            PauseState::Paused | PauseState::Resetting => 0,
            PauseState::NotPaused | PauseState::Pending => {
                self.messages.front().map_or(0, QueuedMessage::remaining)
            }
        }
    }

    fn reset_sequence_numbers(&mut self) {
        self.next_ordered_mid = Mid(0);
        self.next_unordered_mid = Mid(0);
        self.next_ssn = Ssn(0);
    }
}

fn schedule(
    scheduler: &mut StreamScheduler,
    interleaving: bool,
    stream_id: StreamId,
    stream: &OutgoingStream,
) {
    scheduler.set_bytes_remaining(
        stream_id,
        stream.ready_bytes(),
        interleaving.then_some(stream.priority),
    );
}

fn release_buffered(
    events: &Rc<RefCell<dyn EventSink>>,
    total: &mut BufferedAmount,
    stream_id: StreamId,
    stream: &mut BufferedAmount,
    bytes: usize,
) {
    if stream.decrease(bytes) {
        events.borrow_mut().add(SocketEvent::OnBufferedAmountLow(stream_id));
    }
    if total.decrease(bytes) {
        events.borrow_mut().add(SocketEvent::OnTotalBufferedAmountLow());
    }
}

fn report_expired(events: &Rc<RefCell<dyn EventSink>>, lifecycle_id: &Option<LifecycleId>) {
    if let Some(id) = lifecycle_id {
        events.borrow_mut().add(SocketEvent::OnLifecycleMessageExpired(id.clone()));
        events.borrow_mut().add(SocketEvent::OnLifecycleEnd(id.clone()));
    }
}

/// Messages that are waiting to be sent, per outgoing stream.
///
/// Messages are fragmented on demand in [`SendQueue::produce`], which asks the
/// [`StreamScheduler`] which stream to take the next fragment from.
pub(crate) struct SendQueue {
    enable_message_interleaving: bool,
    default_priority: u16,
    default_low_threshold: usize,
    buffered_amount: BufferedAmount,
    next_message_id: OutgoingMessageId,
    scheduler: StreamScheduler,
    streams: HashMap<StreamId, OutgoingStream>,
    events: Rc<RefCell<dyn EventSink>>,
}

impl SendQueue {
    pub fn new(
        max_payload_bytes: usize,
        options: &Options,
        events: Rc<RefCell<dyn EventSink>>,
    ) -> Self {
        Self {
            enable_message_interleaving: options.enable_message_interleaving,
            default_priority: options.default_stream_priority,
            default_low_threshold: options.default_stream_buffered_amount_low_threshold,
            buffered_amount: BufferedAmount::new(options.total_buffered_amount_low_threshold),
            next_message_id: OutgoingMessageId(0),
            scheduler: StreamScheduler::new(max_payload_bytes),
            streams: HashMap::new(),
            events,
        }
    }

    fn stream_mut(&mut self, stream_id: StreamId) -> &mut OutgoingStream {
        let (priority, low_threshold) = (self.default_priority, self.default_low_threshold);
        self.streams
            .entry(stream_id)
            .or_insert_with(|| OutgoingStream::new(priority, low_threshold))
    }

    pub fn enable_message_interleaving(&mut self, enable: bool) {
        if enable == self.enable_message_interleaving {
            return;
        }
        self.enable_message_interleaving = enable;
        for (stream_id, stream) in &self.streams {
            schedule(&mut self.scheduler, enable, *stream_id, stream);
        }
    }

    /// Enqueues a message. Size limits are enforced by the caller.
    pub fn add(&mut self, now: SocketTime, message: Message, send_options: &SendOptions) {
        let attributes = MessageAttributes {
            unordered: send_options.unordered,
            max_retransmissions: send_options.max_retransmissions,
            // A zero lifetime still allows the message to be sent once.
            expires_at: send_options
                .lifetime
                .map(|lifetime| now + lifetime + Duration::from_millis(1)),
            lifecycle_id: send_options.lifecycle_id.clone(),
        };
        let message_id = self.next_message_id;
        self.next_message_id += 1;
        let size = message.payload.len();
        let stream_id = message.stream_id;
        self.buffered_amount.increase(size);

        let interleaving = self.enable_message_interleaving;
        let stream = self.stream_mut(stream_id);
        stream.buffered_amount.increase(size);
        stream.messages.push_back(QueuedMessage {
            message_id,
            message,
            attributes,
            offset: 0,
            mid: None,
            ssn: None,
            next_fsn: Fsn(0),
        });
        let stream = &self.streams[&stream_id];
        schedule(&mut self.scheduler, interleaving, stream_id, stream);
    }

    /// Picks the stream to produce from, dropping messages at the front of streams whose lifetime
    /// has passed. A message that has started to be sent is produced to its end, and is abandoned
    /// by the retransmission queue, so that the receiver is told to skip it.
    fn select_stream(&mut self, now: SocketTime, max_size: usize) -> Option<(StreamId, usize)> {
        loop {
            let (stream_id, size) = self.scheduler.peek(max_size)?;
            let Some(stream) = self.streams.get_mut(&stream_id) else {
                self.scheduler.set_bytes_remaining(stream_id, 0, None);
                continue;
            };
            let expired = match stream.messages.front() {
                Some(message) if message.offset == 0 && message.is_expired(now) => message,
                Some(_) => {
                    self.scheduler.accept(stream_id, size);
                    return Some((stream_id, size));
                }
                None => {
                    self.scheduler.set_bytes_remaining(stream_id, 0, None);
                    continue;
                }
            };
            log::debug!(
                "Message {} on stream {} expired in the send queue",
                expired.message_id,
                stream_id
            );
            let remaining = expired.remaining();
            let lifecycle_id = expired.attributes.lifecycle_id.clone();
            stream.messages.pop_front();
            release_buffered(
                &self.events,
                &mut self.buffered_amount,
                stream_id,
                &mut stream.buffered_amount,
                remaining,
            );
            report_expired(&self.events, &lifecycle_id);
            schedule(&mut self.scheduler, self.enable_message_interleaving, stream_id, stream);
        }
    }

    /// Produces the next fragment, with a payload of at most `max_size` bytes.
    pub fn produce(&mut self, now: SocketTime, max_size: usize) -> Option<DataToSend> {
        let (stream_id, size) = self.select_stream(now, max_size)?;
        let stream = self.streams.get_mut(&stream_id)?;
        let message = stream.messages.front_mut()?;

        if message.mid.is_none() {
            if message.attributes.unordered {
                message.mid = Some(stream.next_unordered_mid);
                stream.next_unordered_mid += 1;
            } else {
                message.mid = Some(stream.next_ordered_mid);
                stream.next_ordered_mid += 1;
                message.ssn = Some(stream.next_ssn);
                stream.next_ssn += 1;
            }
        }

        let is_beginning = message.offset == 0;
        let is_end = size == message.remaining();
        let payload = message.message.payload[message.offset..message.offset + size].to_vec();
        let fsn = message.next_fsn;
        message.next_fsn += 1;
        message.offset += size;

        let to_send = DataToSend {
            message_id: message.message_id,
            data: Data {
                stream_key: StreamKey::from(message.attributes.unordered, stream_id),
                ssn: message.ssn.unwrap_or(Ssn(0)),
                mid: message.mid.unwrap_or(Mid(0)),
                fsn,
                ppid: message.message.ppid,
                payload,
                is_beginning,
                is_end,
            },
            max_retransmissions: message.attributes.max_retransmissions,
            expires_at: message.attributes.expires_at,
            lifecycle_id: if is_end { message.attributes.lifecycle_id.clone() } else { None },
        };

        if is_end {
            stream.messages.pop_front();
            if stream.pause_state == PauseState::Pending {
                stream.pause_state = PauseState::Paused;
            }
        }
        release_buffered(
            &self.events,
            &mut self.buffered_amount,
            stream_id,
            &mut stream.buffered_amount,
            size,
        );
        schedule(&mut self.scheduler, self.enable_message_interleaving, stream_id, stream);
        Some(to_send)
    }

    /// Discards the unsent remainder of a partially sent message, which happens when the message
    /// is abandoned. Returns true if the message was found.
    pub fn discard(&mut self, stream_id: StreamId, message_id: OutgoingMessageId) -> bool {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return false;
        };
        let Some(message) = stream.messages.front().filter(|m| m.message_id == message_id) else {
            return false;
        };
        let remaining = message.remaining();
        let lifecycle_id = message.attributes.lifecycle_id.clone();
        stream.messages.pop_front();
        release_buffered(
            &self.events,
            &mut self.buffered_amount,
            stream_id,
            &mut stream.buffered_amount,
            remaining,
        );
        report_expired(&self.events, &lifecycle_id);

        if stream.pause_state == PauseState::Pending {
            stream.pause_state = PauseState::Paused;
        }
        schedule(&mut self.scheduler, self.enable_message_interleaving, stream_id, stream);
        true
    }

    /// Pauses a stream so that it can be reset. Messages that haven't started to be sent are
    /// discarded, and a partially sent message is sent to completion before the stream is paused.
    pub fn prepare_reset_stream(&mut self, stream_id: StreamId) {
        let interleaving = self.enable_message_interleaving;
        let stream = self.stream_mut(stream_id);
        if stream.pause_state != PauseState::NotPaused {
            return;
        }

        let (started, unstarted): (VecDeque<_>, VecDeque<_>) =
            std::mem::take(&mut stream.messages).into_iter().partition(|m| m.offset > 0);
        stream.messages = started;
        stream.pause_state =
            if stream.messages.is_empty() { PauseState::Paused } else { PauseState::Pending };

        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        for message in unstarted {
            release_buffered(
                &self.events,
                &mut self.buffered_amount,
                stream_id,
                &mut stream.buffered_amount,
                message.remaining(),
            );
            report_expired(&self.events, &message.attributes.lifecycle_id);
        }
        schedule(&mut self.scheduler, interleaving, stream_id, stream);
    }

    pub fn has_streams_ready_to_be_reset(&self) -> bool {
        self.streams.values().any(|s| s.pause_state == PauseState::Paused)
    }

    /// Returns the paused streams, which are from now on part of an outgoing reset request.
    pub fn get_streams_ready_to_reset(&mut self) -> Vec<StreamId> {
        let mut ready: Vec<StreamId> = self
            .streams
            .iter_mut()
            .filter(|(_, s)| s.pause_state == PauseState::Paused)
            .map(|(stream_id, s)| {
                s.pause_state = PauseState::Resetting;
                *stream_id
            })
            .collect();
        ready.sort();
        ready
    }

    /// The peer performed the reset: sequence numbers restart from zero and queued messages resume.
    pub fn commit_reset_streams(&mut self) {
        for (stream_id, stream) in &mut self.streams {
            if stream.pause_state == PauseState::Resetting {
                stream.pause_state = PauseState::NotPaused;
                stream.reset_sequence_numbers();
                schedule(&mut self.scheduler, self.enable_message_interleaving, *stream_id, stream);
            }
        }
    }

    /// The reset request failed: streams resume with their sequence numbers untouched.
    pub fn rollback_reset_streams(&mut self) {
        for (stream_id, stream) in &mut self.streams {
            if stream.pause_state == PauseState::Resetting {
                stream.pause_state = PauseState::NotPaused;
                schedule(&mut self.scheduler, self.enable_message_interleaving, *stream_id, stream);
            }
        }
    }

    /// Resets all streams, such as when the association restarts. A partially sent message is
    /// rewound so that it's sent again in full, as a new message.
    pub fn reset(&mut self) {
        for (stream_id, stream) in &mut self.streams {
            stream.pause_state = PauseState::NotPaused;
            stream.reset_sequence_numbers();
            if let Some(message) = stream.messages.front_mut() {
                let already_sent = message.offset;
                message.rewind();
                stream.buffered_amount.increase(already_sent);
                self.buffered_amount.increase(already_sent);
            }
            schedule(&mut self.scheduler, self.enable_message_interleaving, *stream_id, stream);
        }
    }

    /// Returns true if there is no message in any stream, sent partially or not at all.
    pub fn is_empty(&self) -> bool {
        self.streams.values().all(|s| s.messages.is_empty())
    }

    /// Returns true if a fragment can be produced now, which excludes data on paused streams.
    pub fn has_data_to_send(&self) -> bool {
        self.streams.values().any(|s| s.ready_bytes() > 0)
    }

    pub fn buffered_amount(&self, stream_id: StreamId) -> usize {
        self.streams.get(&stream_id).map_or(0, |s| s.buffered_amount.value)
    }

    pub fn total_buffered_amount(&self) -> usize {
        self.buffered_amount.value
    }

    pub fn buffered_amount_low_threshold(&self, stream_id: StreamId) -> usize {
        self.streams
            .get(&stream_id)
            .map_or(self.default_low_threshold, |s| s.buffered_amount.low_threshold)
    }

    pub fn set_buffered_amount_low_threshold(&mut self, stream_id: StreamId, threshold: usize) {
        if self.stream_mut(stream_id).buffered_amount.set_low_threshold(threshold) {
            self.events.borrow_mut().add(SocketEvent::OnBufferedAmountLow(stream_id));
        }
    }

    pub fn set_priority(&mut self, stream_id: StreamId, priority: u16) {
        let interleaving = self.enable_message_interleaving;
        self.stream_mut(stream_id).priority = priority;
        let stream = &self.streams[&stream_id];
        if stream.ready_bytes() > 0 {
            schedule(&mut self.scheduler, interleaving, stream_id, stream);
        }
    }

    pub fn get_priority(&self, stream_id: StreamId) -> u16 {
        self.streams.get(&stream_id).map_or(self.default_priority, |s| s.priority)
    }
}
