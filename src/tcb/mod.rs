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

use crate::api::ErrorKind;
use crate::api::Message;
use crate::api::Metrics;
use crate::api::Options;
use crate::api::SendOptions;
use crate::api::SendStatus;
use crate::api::SocketEvent;
use crate::api::SocketTime;
use crate::api::StreamId;
use crate::logging::log_chunk;
use crate::math::round_down_to_4;
use crate::packet::chunk::Chunk;
use crate::packet::chunk::DATA_CHUNK_HEADER_SIZE;
use crate::packet::chunk::IDATA_CHUNK_HEADER_SIZE;
use crate::packet::data::Data;
use crate::packet::forward_tsn_chunk::ForwardTsnChunk;
use crate::packet::sack_chunk::SackChunk;
use crate::rx::data_tracker::DataTracker;
use crate::rx::reassembly_queue::ReassemblyQueue;
use crate::tx::retransmission_queue::HandleSackResult;
use crate::tx::retransmission_queue::RetransmissionQueue;
use crate::tx::retransmission_queue::SackError;
use crate::tx::retransmission_timeout::RetransmissionTimeout;
use crate::tx::send_queue::SendQueue;
use crate::types::Tsn;
use crate::EventSink;
use std::cell::RefCell;
use std::cmp::min;
use std::rc::Rc;
use std::time::Duration;
use thiserror::Error;

#[cfg(test)]
mod tcb_tests;

/// Size of the SCTP common header, which precedes the chunks in every packet.
const COMMON_HEADER_SIZE: usize = 12;

/// Upper bound of how long a duplicate FORWARD-TSN is held back, see
/// <https://datatracker.ietf.org/doc/html/rfc3758#section-3.5>.
const MAX_FORWARD_TSN_DELAY: Duration = Duration::from_millis(200);

/// Features that both endpoints support, as negotiated by the handshake.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Capabilities {
    /// RFC 3758 Partial Reliability Extension
    pub partial_reliability: bool,

    /// RFC 8260 Stream Schedulers and User Message Interleaving
    pub message_interleaving: bool,
}

impl Capabilities {
    /// Returns the features enabled in `options` that the peer also supports.
    pub fn negotiate(options: &Options, peer: Capabilities) -> Capabilities {
        Capabilities {
            partial_reliability: options.enable_partial_reliability && peer.partial_reliability,
            message_interleaving: options.enable_message_interleaving
                && peer.message_interleaving,
        }
    }
}

/// Reasons for a received chunk to be refused.
#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum ChunkError {
    #[error("DATA chunk with TSN {0} has no user data")]
    NoUserData(Tsn),

    #[error("TSN {0} is too far away from the cumulative TSN ack")]
    InvalidTsn(Tsn),

    #[error("reassembly buffer is full, dropping TSN {0}")]
    BufferFull(Tsn),

    #[error("{0} chunk received, but the feature it belongs to hasn't been negotiated")]
    NotNegotiated(&'static str),

    #[error(transparent)]
    Sack(#[from] SackError),
}

/// An outgoing stream reset request that is ready to be sent to the peer.
#[derive(Clone, Debug, PartialEq)]
pub struct OutgoingResetRequest {
    /// The last TSN assigned to data on any stream before the reset. The peer must have received
    /// everything up to it before it can reset its incoming streams.
    pub sender_last_assigned_tsn: Tsn,
    pub streams: Vec<StreamId>,
}

/// Outcome of a reset request from the peer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum IncomingResetResult {
    /// The streams have been reset.
    Performed,

    /// Data sent before the request hasn't been received yet. The streams are reset once it has
    /// been.
    InProgress,
}

/// Counts consecutive retransmission timeouts. The association is considered lost when the count
/// exceeds `limit`.
struct TxErrorCounter {
    error_counter: u32,
    limit: Option<u32>,
}

impl TxErrorCounter {
    fn new(limit: Option<u32>) -> Self {
        Self { error_counter: 0, limit }
    }

    fn increment(&mut self) {
        match self.limit {
            Some(limit) if self.error_counter <= limit => {
                self.error_counter += 1;
            }
            _ => {}
        }
    }

    fn reset(&mut self) {
        self.error_counter = 0;
    }

    fn is_exhausted(&self) -> bool {
        self.limit.is_some_and(|limit| self.error_counter > limit)
    }
}

/// Collects the chunks of one outgoing packet.
struct PacketBuilder {
    max_packet_size: usize,
    size: usize,
    chunks: Vec<Chunk>,
}

impl PacketBuilder {
    fn new(max_packet_size: usize) -> Self {
        Self { max_packet_size, size: COMMON_HEADER_SIZE, chunks: Vec::new() }
    }

    fn bytes_remaining(&self) -> usize {
        round_down_to_4!(self.max_packet_size.saturating_sub(self.size))
    }

    fn add(&mut self, chunk: Chunk) {
        debug_assert!(chunk.serialized_size() <= self.bytes_remaining());
        self.size += chunk.serialized_size();
        self.chunks.push(chunk);
    }

    fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

struct DeferredIncomingReset {
    sender_last_assigned_tsn: Tsn,
    streams: Vec<StreamId>,
}

/// The data path of an established association.
///
/// It owns the send and receive side components and connects them: received DATA goes through the
/// [`DataTracker`] into the [`ReassemblyQueue`], received SACKs drive the [`RetransmissionQueue`],
/// and [`Self::produce_packets`] fills packets from the retransmission queue and the
/// [`SendQueue`]. The handshake, the stream reset negotiation and the packet format are handled
/// by the owner.
pub struct TransmissionControlBlock {
    name: String,
    options: Options,
    capabilities: Capabilities,
    events: Rc<RefCell<dyn EventSink>>,
    data_tracker: DataTracker,
    reassembly_queue: ReassemblyQueue,
    retransmission_queue: RetransmissionQueue,
    send_queue: SendQueue,
    rto: RetransmissionTimeout,
    tx_error_counter: TxErrorCounter,
    limit_forward_tsn_until: SocketTime,
    current_reset_request: Option<OutgoingResetRequest>,
    deferred_incoming_reset: Option<DeferredIncomingReset>,
    is_shutting_down: bool,
    max_packet_size: usize,
    tx_messages_count: usize,
}

impl TransmissionControlBlock {
    /// Creates the data path of an association, after the handshake has exchanged initial TSNs,
    /// the peer's receiver window and `capabilities`. `name` identifies it in logs.
    pub fn new(
        name: &str,
        options: &Options,
        my_initial_tsn: Tsn,
        peer_initial_tsn: Tsn,
        a_rwnd: u32,
        capabilities: Capabilities,
        events: Rc<RefCell<dyn EventSink>>,
    ) -> Self {
        let max_packet_size = round_down_to_4!(options.mtu);
        let data_chunk_header_size = if capabilities.message_interleaving {
            IDATA_CHUNK_HEADER_SIZE
        } else {
            DATA_CHUNK_HEADER_SIZE
        };
        let mut send_queue = SendQueue::new(
            max_packet_size.saturating_sub(COMMON_HEADER_SIZE + data_chunk_header_size),
            options,
            Rc::clone(&events),
        );
        send_queue.enable_message_interleaving(capabilities.message_interleaving);

        TransmissionControlBlock {
            name: name.to_string(),
            options: options.clone(),
            capabilities,
            events: Rc::clone(&events),
            data_tracker: DataTracker::new(peer_initial_tsn, options),
            reassembly_queue: ReassemblyQueue::new(
                peer_initial_tsn,
                options.max_receiver_window_buffer_size,
                capabilities.message_interleaving,
            ),
            retransmission_queue: RetransmissionQueue::new(
                events,
                my_initial_tsn,
                a_rwnd,
                options,
                capabilities.partial_reliability,
                capabilities.message_interleaving,
            ),
            send_queue,
            rto: RetransmissionTimeout::new(options),
            tx_error_counter: TxErrorCounter::new(options.max_retransmissions),
            limit_forward_tsn_until: SocketTime::zero(),
            current_reset_request: None,
            deferred_incoming_reset: None,
            is_shutting_down: false,
            max_packet_size,
            tx_messages_count: 0,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Starts over with the initial TSNs and receiver window of a new handshake, such as when the
    /// peer has restarted. Sent and received data is forgotten. Queued messages are kept, and a
    /// partially sent message is sent again from its start. Stream sequence numbers start from
    /// zero.
    pub fn restart(&mut self, my_initial_tsn: Tsn, peer_initial_tsn: Tsn, a_rwnd: u32) {
        log::info!(
            "[{}] Restarting, my_initial_tsn={}, peer_initial_tsn={}",
            self.name,
            my_initial_tsn,
            peer_initial_tsn
        );
        self.send_queue.reset();
        self.data_tracker = DataTracker::new(peer_initial_tsn, &self.options);
        self.reassembly_queue = ReassemblyQueue::new(
            peer_initial_tsn,
            self.options.max_receiver_window_buffer_size,
            self.capabilities.message_interleaving,
        );
        self.retransmission_queue = RetransmissionQueue::new(
            Rc::clone(&self.events),
            my_initial_tsn,
            a_rwnd,
            &self.options,
            self.capabilities.partial_reliability,
            self.capabilities.message_interleaving,
        );
        self.rto = RetransmissionTimeout::new(&self.options);
        self.tx_error_counter.reset();
        self.limit_forward_tsn_until = SocketTime::zero();
        self.current_reset_request = None;
        self.deferred_incoming_reset = None;
        self.is_shutting_down = false;
    }

    fn report_send_error(&self, send_options: &SendOptions, kind: ErrorKind, message: &str) {
        if let Some(id) = &send_options.lifecycle_id {
            self.events.borrow_mut().add(SocketEvent::OnLifecycleEnd(id.clone()));
        }
        self.events.borrow_mut().add(SocketEvent::OnError(kind, message.to_string()));
    }

    /// Enqueues a message to be sent. It's sent by [`Self::produce_packets`].
    pub fn send(
        &mut self,
        now: SocketTime,
        message: Message,
        send_options: &SendOptions,
    ) -> SendStatus {
        if message.payload.is_empty() {
            self.report_send_error(
                send_options,
                ErrorKind::ProtocolViolation,
                "Unable to send empty message",
            );
            return SendStatus::ErrorMessageEmpty;
        }
        if message.payload.len() > self.options.max_message_size {
            self.report_send_error(
                send_options,
                ErrorKind::ProtocolViolation,
                "Unable to send too large message",
            );
            return SendStatus::ErrorMessageTooLarge;
        }
        if self.is_shutting_down {
            self.report_send_error(
                send_options,
                ErrorKind::WrongSequence,
                "Unable to send message as the association is shutting down",
            );
            return SendStatus::ErrorShuttingDown;
        }
        if self.send_queue.total_buffered_amount() >= self.options.max_send_buffer_size
            || self.send_queue.buffered_amount(message.stream_id)
                >= self.options.per_stream_send_queue_limit
        {
            log::warn!(
                "[{}] Send queue full, rejecting {} bytes on stream {:?}",
                self.name,
                message.payload.len(),
                message.stream_id
            );
            self.report_send_error(
                send_options,
                ErrorKind::ResourceExhaustion,
                "Unable to send message as the send queue is full",
            );
            return SendStatus::ErrorResourceExhaustion;
        }

        self.send_queue.add(now, message, send_options);
        self.tx_messages_count += 1;
        SendStatus::Success
    }

    /// Handles a chunk received from the peer. Call [`Self::observe_packet_end`] when all chunks
    /// of a packet have been handled.
    pub fn handle_chunk(&mut self, now: SocketTime, chunk: Chunk) -> Result<(), ChunkError> {
        log_chunk(&self.name, now, false, &chunk);
        match chunk {
            Chunk::Data(tsn, data) if !self.capabilities.message_interleaving => {
                self.handle_data(now, tsn, data)
            }
            Chunk::IData(tsn, data) if self.capabilities.message_interleaving => {
                self.handle_data(now, tsn, data)
            }
            Chunk::Sack(sack) => Ok(self.handle_sack(now, &sack)?),
            Chunk::ForwardTsn(c)
                if self.capabilities.partial_reliability
                    && !self.capabilities.message_interleaving =>
            {
                self.handle_forward_tsn(now, &c);
                Ok(())
            }
            Chunk::IForwardTsn(c)
                if self.capabilities.partial_reliability
                    && self.capabilities.message_interleaving =>
            {
                self.handle_forward_tsn(now, &c);
                Ok(())
            }
            other => {
                let name = match other {
                    Chunk::Data(..) => "DATA",
                    Chunk::IData(..) => "I-DATA",
                    Chunk::ForwardTsn(..) => "FORWARD-TSN",
                    Chunk::IForwardTsn(..) => "I-FORWARD-TSN",
                    Chunk::Sack(..) => "SACK",
                };
                self.events.borrow_mut().add(SocketEvent::OnError(
                    ErrorKind::ProtocolViolation,
                    format!("Received {name} chunk, which isn't negotiated"),
                ));
                Err(ChunkError::NotNegotiated(name))
            }
        }
    }

    /// Handles a received DATA or I-DATA fragment.
    pub fn handle_data(&mut self, now: SocketTime, tsn: Tsn, data: Data) -> Result<(), ChunkError> {
        if data.payload.is_empty() {
            self.events.borrow_mut().add(SocketEvent::OnError(
                ErrorKind::ProtocolViolation,
                "Received DATA chunk with no user data".into(),
            ));
            return Err(ChunkError::NoUserData(tsn));
        }
        if self.reassembly_queue.is_full() {
            log::warn!("[{}] Reassembly queue is full, dropping TSN {}", self.name, tsn);
            return Err(ChunkError::BufferFull(tsn));
        }
        if self.reassembly_queue.is_above_watermark()
            && !self.data_tracker.will_increase_cum_ack_tsn(tsn)
        {
            // From <https://datatracker.ietf.org/doc/html/rfc9260#section-6.2>:
            //
            //   When the receiver's advertised window is 0, the receiver MUST drop any new
            //   incoming DATA chunk with a TSN larger than the largest TSN received so far.
            //
            // Only the fragment that moves the cumulative TSN ack is accepted, so that assembled
            // messages can free up space.
            log::debug!("[{}] Above watermark, dropping TSN {}", self.name, tsn);
            self.data_tracker.force_immediate_sack(now);
            return Err(ChunkError::BufferFull(tsn));
        }
        if !self.data_tracker.is_tsn_valid(tsn) {
            self.events.borrow_mut().add(SocketEvent::OnError(
                ErrorKind::ProtocolViolation,
                format!("Received DATA chunk with invalid TSN {tsn}"),
            ));
            return Err(ChunkError::InvalidTsn(tsn));
        }
        if self.data_tracker.observe(now, tsn, false) {
            self.reassembly_queue.add(tsn, data);
            self.maybe_complete_deferred_reset();
        }
        Ok(())
    }

    /// To be called when all chunks of a received packet have been handled. Returns a SACK that
    /// should be sent now, if any.
    pub fn observe_packet_end(&mut self, now: SocketTime) -> Option<SackChunk> {
        self.data_tracker.observe_packet_end(now);
        if self.data_tracker.should_send_ack(now, false) {
            Some(self.create_selective_ack())
        } else {
            None
        }
    }

    fn create_selective_ack(&mut self) -> SackChunk {
        let a_rwnd = u32::try_from(self.reassembly_queue.remaining_bytes()).unwrap_or(u32::MAX);
        self.data_tracker.create_selective_ack(a_rwnd)
    }

    /// Handles a received SACK. Invalid SACKs are dropped, and those acknowledging data that
    /// hasn't been sent are reported as protocol violations.
    pub fn handle_sack(&mut self, now: SocketTime, sack: &SackChunk) -> Result<(), SackError> {
        match self.retransmission_queue.handle_sack(now, sack) {
            HandleSackResult::Invalid(e @ SackError::InvalidCumulativeAck { .. }) => {
                // Likely a reordered SACK.
                Err(e)
            }
            HandleSackResult::Invalid(e) => {
                self.events
                    .borrow_mut()
                    .add(SocketEvent::OnError(ErrorKind::ProtocolViolation, e.to_string()));
                Err(e)
            }
            HandleSackResult::Valid { rtt, reset_error_counter } => {
                if let Some(rtt) = rtt {
                    self.rto.observe_rtt(rtt);
                    self.retransmission_queue.update_rto(self.rto.rto());
                    self.data_tracker.update_rto(self.rto.rto());
                }
                if reset_error_counter {
                    self.tx_error_counter.reset();
                }
                Ok(())
            }
        }
    }

    /// Handles a received FORWARD-TSN or I-FORWARD-TSN.
    pub fn handle_forward_tsn(&mut self, now: SocketTime, chunk: &ForwardTsnChunk) {
        if self.data_tracker.handle_forward_tsn(now, chunk.new_cumulative_tsn) {
            self.reassembly_queue
                .handle_forward_tsn(chunk.new_cumulative_tsn, &chunk.skipped_streams);
            self.maybe_complete_deferred_reset();
        }
    }

    fn make_data_chunk(&self, tsn: Tsn, data: Data) -> Chunk {
        if self.capabilities.message_interleaving {
            Chunk::IData(tsn, data)
        } else {
            Chunk::Data(tsn, data)
        }
    }

    fn build(&self, now: SocketTime, builder: PacketBuilder) -> Vec<Chunk> {
        for chunk in &builder.chunks {
            log_chunk(&self.name, now, true, chunk);
        }
        builder.chunks
    }

    /// Returns the packets to send now, each being a list of chunks that fits in the MTU.
    ///
    /// Fast retransmissions come first, in a packet of their own. Then follow at most
    /// [`Options::max_burst`] packets, where the first one carries a SACK and a FORWARD-TSN if
    /// needed, and all are filled with retransmissions and new data as allowed by the congestion
    /// and receiver windows.
    pub fn produce_packets(&mut self, now: SocketTime) -> Vec<Vec<Chunk>> {
        let mut packets = Vec::new();

        // From <https://datatracker.ietf.org/doc/html/rfc9260#section-7.2.4>:
        //
        //   Call this value K. Retransmit those K DATA chunks in a single packet. When a Fast
        //   Retransmit is being performed, the sender SHOULD ignore the value of cwnd and SHOULD
        //   NOT delay retransmission for this single packet.
        if self.retransmission_queue.has_data_to_be_fast_retransmitted() {
            let mut builder = PacketBuilder::new(self.max_packet_size);
            let chunks = self
                .retransmission_queue
                .get_chunks_for_fast_retransmit(now, builder.bytes_remaining());
            for (tsn, data) in chunks {
                builder.add(self.make_data_chunk(tsn, data));
            }
            if !builder.is_empty() {
                packets.push(self.build(now, builder));
            }
        }

        for packet_idx in 0..self.options.max_burst {
            let mut builder = PacketBuilder::new(self.max_packet_size);
            if packet_idx == 0 {
                // Add SACKs if it's likely that a DATA chunk would also be added.
                let also_if_delayed = self.send_queue.has_data_to_send()
                    || self.retransmission_queue.can_send_data();
                if self.data_tracker.should_send_ack(now, also_if_delayed) {
                    let sack = self.create_selective_ack();
                    builder.add(Chunk::Sack(sack));
                }
                if now >= self.limit_forward_tsn_until
                    && self.retransmission_queue.should_send_forward_tsn(now)
                {
                    builder.add(self.retransmission_queue.create_forward_tsn());
                    // From <https://datatracker.ietf.org/doc/html/rfc3758#section-3.5>:
                    //
                    //   IMPLEMENTATION NOTE: An implementation may wish to limit the number of
                    //   duplicate FORWARD TSN chunks it sends by [...] waiting a full RTT before
                    //   sending a duplicate FORWARD TSN.
                    self.limit_forward_tsn_until =
                        now + min(MAX_FORWARD_TSN_DELAY, self.rto.srtt());
                }
            }

            let send_queue = &mut self.send_queue;
            let chunks = self.retransmission_queue.get_chunks_to_send(
                now,
                builder.bytes_remaining(),
                |max_size, discard| {
                    for (stream_id, message_id) in discard {
                        send_queue.discard(*stream_id, *message_id);
                    }
                    send_queue.produce(now, max_size)
                },
            );
            for (tsn, data) in chunks {
                builder.add(self.make_data_chunk(tsn, data));
            }

            if builder.is_empty() {
                break;
            }
            packets.push(self.build(now, builder));
        }
        packets
    }

    /// Handles expired timers. Call this at [`Self::next_timeout`].
    pub fn handle_timeout(&mut self, now: SocketTime) {
        self.data_tracker.handle_timeout(now);

        if self.retransmission_queue.handle_timeout(now) {
            let was_exhausted = self.tx_error_counter.is_exhausted();
            self.tx_error_counter.increment();
            if self.tx_error_counter.is_exhausted() && !was_exhausted {
                log::warn!("[{}] Too many retransmissions", self.name);
                self.events.borrow_mut().add(SocketEvent::OnAborted(
                    ErrorKind::TooManyRetries,
                    "Too many retransmissions".into(),
                ));
            }
        }
    }

    /// The time when [`Self::handle_timeout`] should be called next.
    pub fn next_timeout(&self) -> Option<SocketTime> {
        [self.retransmission_queue.next_timeout(), self.data_tracker.next_timeout()]
            .into_iter()
            .flatten()
            .min()
    }

    /// Returns the next received message, in the order they were assembled.
    pub fn get_next_message(&mut self) -> Option<Message> {
        self.reassembly_queue.get_next_message()
    }

    /// Pauses `streams` so that they can be reset. Queued messages that haven't started to be sent
    /// are discarded.
    pub fn prepare_reset_streams(&mut self, streams: &[StreamId]) {
        for stream_id in streams {
            self.send_queue.prepare_reset_stream(*stream_id);
        }
    }

    /// Returns a reset request to send to the peer, if there are paused streams and no other
    /// request is in progress. The request must be finished by [`Self::commit_reset_streams`] or
    /// [`Self::rollback_reset_streams`].
    pub fn get_streams_ready_to_reset(&mut self) -> Option<OutgoingResetRequest> {
        if self.current_reset_request.is_some() || !self.send_queue.has_streams_ready_to_be_reset()
        {
            return None;
        }
        let streams = self.send_queue.get_streams_ready_to_reset();
        self.retransmission_queue.begin_reset_streams();
        let request = OutgoingResetRequest {
            sender_last_assigned_tsn: self.retransmission_queue.last_assigned_tsn(),
            streams,
        };
        self.current_reset_request = Some(request.clone());
        Some(request)
    }

    /// The peer has reset the streams, so their sequence numbers start over.
    pub fn commit_reset_streams(&mut self) {
        if let Some(request) = self.current_reset_request.take() {
            log::debug!("[{}] Reset of streams {:?} performed", self.name, request.streams);
            self.send_queue.commit_reset_streams();
        }
    }

    /// The peer has denied the reset, so the streams resume without resetting.
    pub fn rollback_reset_streams(&mut self) {
        if let Some(request) = self.current_reset_request.take() {
            log::debug!("[{}] Reset of streams {:?} failed", self.name, request.streams);
            self.send_queue.rollback_reset_streams();
        }
    }

    /// Handles a request from the peer to reset its outgoing `streams` (or all, if empty), after
    /// having sent data up to `sender_last_assigned_tsn` on them.
    pub fn handle_incoming_reset(
        &mut self,
        sender_last_assigned_tsn: Tsn,
        streams: Vec<StreamId>,
    ) -> IncomingResetResult {
        if self.data_tracker.is_later_than_cumulative_acked_tsn(sender_last_assigned_tsn) {
            // From <https://datatracker.ietf.org/doc/html/rfc6525#section-5.2.2>:
            //
            //   E2: If the Sender's Last Assigned TSN is greater than the cumulative
            //   acknowledgment point, then the endpoint MUST enter "deferred reset processing".
            self.reassembly_queue.enter_deferred_reset(sender_last_assigned_tsn, &streams);
            self.deferred_incoming_reset =
                Some(DeferredIncomingReset { sender_last_assigned_tsn, streams });
            return IncomingResetResult::InProgress;
        }
        self.reset_incoming_streams(streams);
        IncomingResetResult::Performed
    }

    fn reset_incoming_streams(&mut self, streams: Vec<StreamId>) {
        self.deferred_incoming_reset = None;
        self.reassembly_queue.reset_streams_and_leave_deferred_reset(&streams);
        self.events.borrow_mut().add(SocketEvent::OnIncomingStreamReset(streams));
    }

    fn maybe_complete_deferred_reset(&mut self) {
        let Some(deferred) = &self.deferred_incoming_reset else {
            return;
        };
        if self.data_tracker.is_later_than_cumulative_acked_tsn(deferred.sender_last_assigned_tsn) {
            return;
        }
        if let Some(deferred) = self.deferred_incoming_reset.take() {
            self.reset_incoming_streams(deferred.streams);
        }
    }

    /// Stops accepting new messages. Already queued messages are still sent.
    pub fn begin_shutdown(&mut self) {
        self.is_shutting_down = true;
    }

    /// Returns true if all queued messages have been sent and acknowledged.
    pub fn is_idle(&self) -> bool {
        self.send_queue.is_empty() && self.retransmission_queue.is_empty()
    }

    pub fn set_stream_priority(&mut self, stream_id: StreamId, priority: u16) {
        self.send_queue.set_priority(stream_id, priority);
    }

    pub fn get_stream_priority(&self, stream_id: StreamId) -> u16 {
        self.send_queue.get_priority(stream_id)
    }

    /// Bytes of messages on `stream_id` that haven't been sent yet.
    pub fn buffered_amount(&self, stream_id: StreamId) -> usize {
        self.send_queue.buffered_amount(stream_id)
    }

    pub fn total_buffered_amount(&self) -> usize {
        self.send_queue.total_buffered_amount()
    }

    pub fn buffered_amount_low_threshold(&self, stream_id: StreamId) -> usize {
        self.send_queue.buffered_amount_low_threshold(stream_id)
    }

    pub fn set_buffered_amount_low_threshold(&mut self, stream_id: StreamId, bytes: usize) {
        self.send_queue.set_buffered_amount_low_threshold(stream_id, bytes);
    }

    pub fn metrics(&self) -> Metrics {
        Metrics {
            tx_messages_count: self.tx_messages_count,
            rtx_packets_count: self.retransmission_queue.rtx_packets_count(),
            rtx_bytes_count: self.retransmission_queue.rtx_bytes_count(),
            cwnd_bytes: self.retransmission_queue.cwnd(),
            srtt: self.rto.srtt(),
            unack_data_count: self.retransmission_queue.unacked_items(),
            rx_messages_count: self.reassembly_queue.rx_messages_count(),
            peer_rwnd_bytes: u32::try_from(self.retransmission_queue.rwnd()).unwrap_or(u32::MAX),
        }
    }
}
