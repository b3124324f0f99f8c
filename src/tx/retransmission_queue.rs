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
use crate::api::SocketEvent;
use crate::api::SocketTime;
use crate::api::StreamId;
use crate::math::is_divisible_by_4;
use crate::math::round_down_to_4;
use crate::math::round_up_to_4;
use crate::packet::chunk::Chunk;
use crate::packet::chunk::DATA_CHUNK_HEADER_SIZE;
use crate::packet::chunk::IDATA_CHUNK_HEADER_SIZE;
use crate::packet::data::Data;
use crate::packet::sack_chunk::SackChunk;
use crate::timer::BackoffAlgorithm;
use crate::timer::Timer;
#[cfg(test)]
use crate::tx::outstanding_data::ChunkState;
use crate::tx::outstanding_data::OutstandingData;
use crate::tx::send_queue::DataToSend;
use crate::types::OutgoingMessageId;
use crate::types::Tsn;
use crate::types::TsnUnwrapper;
use crate::types::UnwrappedTsn;
use crate::EventSink;
use std::cell::RefCell;
use std::cmp::max;
use std::cmp::min;
use std::rc::Rc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, PartialEq)]
pub(crate) enum CongestionAlgorithmPhase {
    SlowStart,
    CongestionAvoidance,
}

/// New data is held back when the congestion window is large and less than this share of an MTU
/// is left of it, so that the window isn't filled up with small fragments.
const MIN_BYTES_REQUIRED_TO_SEND_PERCENT: usize = 90;

/// Reasons for a SACK to be rejected. A rejected SACK doesn't change any state.
#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum SackError {
    #[error("cumulative TSN ack {ack} is older than the cumulative TSN ack point {point}")]
    InvalidCumulativeAck { ack: Tsn, point: Tsn },

    #[error("cumulative TSN ack {ack} is beyond the highest TSN sent, {highest}")]
    CumulativeAckBeyondOutstanding { ack: Tsn, highest: Tsn },
}

#[derive(Debug, PartialEq)]
pub(crate) enum HandleSackResult {
    Invalid(SackError),
    Valid { rtt: Option<Duration>, reset_error_counter: bool },
}

/// Decides what DATA to send and when, by combining retransmissions from the
/// [`OutstandingData`] ledger with new data from the send queue within the limits of the
/// congestion and receiver windows. It runs the T3-rtx timer and the congestion control
/// algorithms of RFC 9260 section 7.
pub(crate) struct RetransmissionQueue {
    mtu: usize,
    cwnd_mtus_min: usize,
    avoid_fragmentation_cwnd_mtus: usize,
    min_bytes_required_to_send: usize,

    /// If the peer supports RFC 3758 - SCTP Partial Reliability Extension.
    partial_reliability: bool,

    /// If RFC 8260 message interleaving is active, which determines the DATA chunk header size.
    use_message_interleaving: bool,
    data_chunk_header_size: usize,

    /// Congestion window. Bytes that may be in flight.
    cwnd: usize,

    /// Receiver window. Bytes available in the peer's receive buffer.
    rwnd: usize,

    ssthresh: usize,
    partial_bytes_acked: usize,

    rtx_packets_count: usize,
    rtx_bytes_count: u64,

    /// Fast recovery lasts until this TSN has been cumulatively acked.
    fast_recovery_exit_tsn: Option<UnwrappedTsn>,

    tsn_unwrapper: TsnUnwrapper,
    outstanding_data: OutstandingData,
    t3_rtx: Timer,
    events: Rc<RefCell<dyn EventSink>>,
}

impl RetransmissionQueue {
    pub fn new(
        events: Rc<RefCell<dyn EventSink>>,
        my_initial_tsn: Tsn,
        a_rwnd: u32,
        options: &Options,
        supports_partial_reliability: bool,
        use_message_interleaving: bool,
    ) -> Self {
        let data_chunk_header_size = if use_message_interleaving {
            IDATA_CHUNK_HEADER_SIZE
        } else {
            DATA_CHUNK_HEADER_SIZE
        };
        let mut tsn_unwrapper = TsnUnwrapper::new();
        let last_cumulative_tsn_ack = tsn_unwrapper.unwrap(my_initial_tsn - 1);
        Self {
            mtu: options.mtu,
            cwnd_mtus_min: options.cwnd_mtus_min,
            avoid_fragmentation_cwnd_mtus: options.avoid_fragmentation_cwnd_mtus,
            min_bytes_required_to_send: options.mtu * MIN_BYTES_REQUIRED_TO_SEND_PERCENT / 100,
            partial_reliability: supports_partial_reliability,
            use_message_interleaving,
            data_chunk_header_size,
            cwnd: options.cwnd_mtus_initial * options.mtu,
            rwnd: a_rwnd as usize,
            ssthresh: a_rwnd as usize,
            partial_bytes_acked: 0,
            rtx_packets_count: 0,
            rtx_bytes_count: 0,
            fast_recovery_exit_tsn: None,
            tsn_unwrapper,
            outstanding_data: OutstandingData::new(data_chunk_header_size, last_cumulative_tsn_ack),
            t3_rtx: Timer::new(
                "t3-rtx",
                options.rto_initial,
                BackoffAlgorithm::Exponential,
                None,
                options.max_timer_backoff_duration,
            ),
            events,
        }
    }

    fn chunk_size(&self, data: &Data) -> usize {
        round_up_to_4!(self.data_chunk_header_size + data.payload.len())
    }

    fn start_t3_rtx_if_outstanding_data(&mut self, now: SocketTime) {
        // `unacked_bytes` doesn't include fragments waiting to be retransmitted.
        if !self.outstanding_data.is_empty() && !self.t3_rtx.is_running() {
            self.t3_rtx.start(now);
        }
    }

    pub fn next_timeout(&self) -> Option<SocketTime> {
        self.t3_rtx.next_expiry()
    }

    pub fn update_rto(&mut self, rto: Duration) {
        self.t3_rtx.set_duration(rto);
    }

    fn validate_sack(&self, cumulative_tsn_ack: UnwrappedTsn) -> Result<(), SackError> {
        // A SACK with the same cumulative TSN ack as before is valid, as its gap ack blocks may
        // carry new information.
        let point = self.outstanding_data.last_cumulative_acked_tsn();
        if cumulative_tsn_ack < point {
            return Err(SackError::InvalidCumulativeAck {
                ack: cumulative_tsn_ack.wrap(),
                point: point.wrap(),
            });
        }
        let highest = self.outstanding_data.highest_outstanding_tsn();
        if cumulative_tsn_ack > highest {
            return Err(SackError::CumulativeAckBeyondOutstanding {
                ack: cumulative_tsn_ack.wrap(),
                highest: highest.wrap(),
            });
        }
        Ok(())
    }

    fn maybe_exit_fast_recovery(&mut self, cumulative_tsn_ack: UnwrappedTsn) {
        if self.fast_recovery_exit_tsn.is_some_and(|exit_tsn| cumulative_tsn_ack >= exit_tsn) {
            log::debug!("Exiting fast recovery at cum_tsn_ack={}", cumulative_tsn_ack);
            self.fast_recovery_exit_tsn = None;
        }
    }

    fn is_in_fast_recovery(&self) -> bool {
        self.fast_recovery_exit_tsn.is_some()
    }

    pub(crate) fn phase(&self) -> CongestionAlgorithmPhase {
        if self.cwnd <= self.ssthresh {
            CongestionAlgorithmPhase::SlowStart
        } else {
            CongestionAlgorithmPhase::CongestionAvoidance
        }
    }

    fn handle_increased_cumulative_tsn_ack(&mut self, unacked_bytes: usize, bytes_acked: usize) {
        // Packets are rarely filled up exactly, so a window within one MTU of being full counts as
        // fully utilized.
        let is_fully_utilized = unacked_bytes + self.mtu >= self.cwnd;
        let old_cwnd = self.cwnd;

        match self.phase() {
            CongestionAlgorithmPhase::SlowStart => {
                // From <https://datatracker.ietf.org/doc/html/rfc9260#section-7.2.1>:
                //
                //   [...] cwnd MUST be increased by, at most, the lesser of (1) the total size of
                //   the previously outstanding DATA chunk(s) acknowledged and (2) the destination's
                //   path MTU.
                if is_fully_utilized && !self.is_in_fast_recovery() {
                    self.cwnd += min(bytes_acked, self.mtu);
                    log::debug!("SS increase cwnd={} ({})", self.cwnd, old_cwnd);
                }
            }
            CongestionAlgorithmPhase::CongestionAvoidance => {
                // From <https://datatracker.ietf.org/doc/html/rfc9260#section-7.2.2>:
                //
                //   When partial_bytes_acked is greater than or equal to cwnd and before the
                //   arrival of the SACK chunk the sender had less than cwnd bytes of data
                //   outstanding [...], increase cwnd by MTU, and reset partial_bytes_acked to
                //   (partial_bytes_acked - cwnd).
                let old_pba = self.partial_bytes_acked;
                self.partial_bytes_acked += bytes_acked;
                if self.partial_bytes_acked >= self.cwnd && is_fully_utilized {
                    self.partial_bytes_acked -= self.cwnd;
                    self.cwnd += self.mtu;
                }
                log::debug!(
                    "CA cwnd={} ({}), ssthresh={}, pba={} ({})",
                    self.cwnd,
                    old_cwnd,
                    self.ssthresh,
                    self.partial_bytes_acked,
                    old_pba
                );
            }
        }
    }

    fn handle_packet_loss(&mut self) {
        if self.is_in_fast_recovery() {
            // From <https://datatracker.ietf.org/doc/html/rfc9260#section-7.2.4-5.6.1>:
            //
            //   While in Fast Recovery, the ssthresh and cwnd SHOULD NOT change for any
            //   destinations due to a subsequent Fast Recovery event.
            log::debug!("Packet loss detected during fast recovery");
            return;
        }

        let old_cwnd = self.cwnd;
        self.ssthresh = max(self.cwnd / 2, self.cwnd_mtus_min * self.mtu);
        self.cwnd = self.ssthresh;
        self.partial_bytes_acked = 0;

        // From <https://datatracker.ietf.org/doc/html/rfc9260#section-7.2.4-5.6.1>:
        //
        //   If not in Fast Recovery, enter Fast Recovery and mark the highest outstanding TSN as
        //   the Fast Recovery exit point.
        let exit_tsn = self.outstanding_data.highest_outstanding_tsn();
        self.fast_recovery_exit_tsn = Some(exit_tsn);
        log::info!(
            "Packet loss detected, entering fast recovery until {}. cwnd={} ({}), ssthresh={}",
            exit_tsn,
            self.cwnd,
            old_cwnd,
            self.ssthresh
        );
    }

    fn update_receiver_window(&mut self, a_rwnd: u32) {
        self.rwnd = (a_rwnd as usize).saturating_sub(self.outstanding_data.unacked_bytes());
    }

    /// Handles a received SACK. An invalid SACK is rejected without affecting any state.
    pub fn handle_sack(&mut self, now: SocketTime, sack: &SackChunk) -> HandleSackResult {
        let cumulative_tsn_ack = self.tsn_unwrapper.peek_unwrap(sack.cumulative_tsn_ack);
        if let Err(e) = self.validate_sack(cumulative_tsn_ack) {
            log::debug!("Dropping SACK: {}", e);
            return HandleSackResult::Invalid(e);
        }
        self.tsn_unwrapper.unwrap(sack.cumulative_tsn_ack);

        let sanitized;
        let gap_ack_blocks = if sack.has_well_formed_gap_ack_blocks() {
            &sack.gap_ack_blocks
        } else {
            log::debug!("Sanitizing malformed gap ack blocks in {}", sack);
            sanitized = sack.clone().sanitized();
            &sanitized.gap_ack_blocks
        };

        let old_last_cumulative_tsn_ack = self.outstanding_data.last_cumulative_acked_tsn();
        let old_unacked_bytes = self.outstanding_data.unacked_bytes();
        let old_rwnd = self.rwnd;

        let rtt = if gap_ack_blocks.is_empty() {
            self.outstanding_data.measure_rtt(now, cumulative_tsn_ack)
        } else {
            None
        };

        // Exiting first lets loss reported in this SACK start a new fast recovery.
        self.maybe_exit_fast_recovery(cumulative_tsn_ack);

        let ack_info = self.outstanding_data.handle_sack(
            cumulative_tsn_ack,
            gap_ack_blocks,
            self.is_in_fast_recovery(),
        );

        for id in ack_info.acked_lifecycle_ids {
            self.events.borrow_mut().add(SocketEvent::OnLifecycleMessageDelivered(id.clone()));
            self.events.borrow_mut().add(SocketEvent::OnLifecycleEnd(id));
        }
        for id in ack_info.abandoned_lifecycle_ids {
            self.events.borrow_mut().add(SocketEvent::OnLifecycleMessageMaybeExpired(id.clone()));
            self.events.borrow_mut().add(SocketEvent::OnLifecycleEnd(id));
        }

        self.update_receiver_window(sack.a_rwnd);

        log::debug!(
            "Received SACK, cum_tsn_ack={} ({}), unacked_bytes={} ({}), outstanding={}/{}, rwnd={} \
             ({})",
            cumulative_tsn_ack,
            old_last_cumulative_tsn_ack,
            self.outstanding_data.unacked_bytes(),
            old_unacked_bytes,
            self.outstanding_data.outstanding_bytes(),
            self.outstanding_data.outstanding_items(),
            self.rwnd,
            old_rwnd
        );

        if cumulative_tsn_ack > old_last_cumulative_tsn_ack {
            // From <https://datatracker.ietf.org/doc/html/rfc9260#section-6.3.2-2.3.1>:
            //
            //   Whenever a SACK chunk is received that acknowledges the DATA chunk with the
            //   earliest outstanding TSN for that address, restart the T3-rtx timer for that
            //   address with its current RTO (if there is still outstanding data on that address).
            self.t3_rtx.stop();
            self.handle_increased_cumulative_tsn_ack(old_unacked_bytes, ack_info.bytes_acked);
        }

        if ack_info.has_packet_loss {
            self.handle_packet_loss();
        }

        self.start_t3_rtx_if_outstanding_data(now);

        HandleSackResult::Valid { rtt, reset_error_counter: ack_info.bytes_acked > 0 }
    }

    /// Handles an expiry of the T3-rtx timer. Returns true if it had expired.
    pub fn handle_timeout(&mut self, now: SocketTime) -> bool {
        if !self.t3_rtx.expire(now) {
            return false;
        }

        let old_cwnd = self.cwnd;
        let old_unacked_bytes = self.unacked_bytes();

        // From <https://datatracker.ietf.org/doc/html/rfc9260#section-7.2.3>:
        //
        //   When the T3-rtx timer expires on an address, SCTP SHOULD perform slow start by:
        //
        //      ssthresh = max(cwnd/2, 4*MTU)
        //      cwnd = 1*MTU
        //
        //   and ensure that no more than one SCTP packet will be in flight for that address until
        //   the endpoint receives acknowledgement for successful delivery of data to that address.
        self.ssthresh = max(self.cwnd / 2, 4 * self.mtu);
        self.cwnd = self.mtu;
        self.partial_bytes_acked = 0;

        // The timer has already backed off and restarted itself.
        self.outstanding_data.nack_all();

        log::info!(
            "t3-rtx expired. cwnd={} ({}), ssthresh={}, unacked_bytes={} ({})",
            self.cwnd,
            old_cwnd,
            self.ssthresh,
            self.unacked_bytes(),
            old_unacked_bytes
        );
        true
    }

    pub fn has_data_to_be_fast_retransmitted(&self) -> bool {
        self.outstanding_data.has_data_to_be_fast_retransmitted()
    }

    /// Returns the fragments to fast retransmit that fit in `bytes_remaining_in_packet`. The
    /// congestion window doesn't apply.
    pub fn get_chunks_for_fast_retransmit(
        &mut self,
        now: SocketTime,
        bytes_remaining_in_packet: usize,
    ) -> Vec<(Tsn, Data)> {
        debug_assert!(is_divisible_by_4!(bytes_remaining_in_packet));

        let to_be_sent =
            self.outstanding_data.get_chunks_to_be_fast_retransmitted(bytes_remaining_in_packet);
        let Some((first_tsn, _)) = to_be_sent.first() else {
            return vec![];
        };

        // From <https://datatracker.ietf.org/doc/html/rfc9260#section-7.2.4-5.4.1>:
        //
        //   Restart the T3-rtx timer only if [...] the endpoint is retransmitting the first
        //   outstanding DATA chunk sent to that address.
        if *first_tsn == self.outstanding_data.last_cumulative_acked_tsn().next_value() {
            self.t3_rtx.stop();
        }
        if !self.t3_rtx.is_running() {
            self.t3_rtx.start(now);
        }

        let bytes_retransmitted: usize =
            to_be_sent.iter().map(|(_, data)| self.chunk_size(data)).sum();
        self.rtx_packets_count += 1;
        self.rtx_bytes_count += bytes_retransmitted as u64;

        log::debug!(
            "Fast-retransmitting TSN {} - {} bytes, unacked_bytes={}",
            to_be_sent.iter().map(|(tsn, _)| tsn.to_string()).collect::<Vec<_>>().join(","),
            bytes_retransmitted,
            self.unacked_bytes()
        );

        to_be_sent.into_iter().map(|(tsn, data)| (tsn.wrap(), data)).collect()
    }

    /// Returns the fragments to send in a packet with `bytes_remaining_in_packet` bytes left,
    /// which are retransmissions first, and then new data.
    ///
    /// `produce` is called to get new data. Its first argument is the maximum payload size and the
    /// second one lists messages that must be discarded from the send queue before producing, as
    /// they have been abandoned. [`Self::should_send_forward_tsn`] expires data and should be
    /// called before this method.
    pub fn get_chunks_to_send(
        &mut self,
        now: SocketTime,
        bytes_remaining_in_packet: usize,
        mut produce: impl FnMut(usize, &[(StreamId, OutgoingMessageId)]) -> Option<DataToSend>,
    ) -> Vec<(Tsn, Data)> {
        debug_assert!(is_divisible_by_4!(bytes_remaining_in_packet));

        let old_unacked_bytes = self.unacked_bytes();
        let old_rwnd = self.rwnd;

        let mut max_bytes =
            round_down_to_4!(min(self.max_bytes_to_send(), bytes_remaining_in_packet));
        let mut to_be_sent = self.outstanding_data.get_chunks_to_be_retransmitted(max_bytes);
        let bytes_retransmitted: usize =
            to_be_sent.iter().map(|(_, data)| self.chunk_size(data)).sum();
        max_bytes -= bytes_retransmitted;

        if !to_be_sent.is_empty() {
            self.rtx_packets_count += 1;
            self.rtx_bytes_count += bytes_retransmitted as u64;
        }

        while max_bytes > self.data_chunk_header_size && self.can_send_data() {
            debug_assert!(is_divisible_by_4!(max_bytes));
            let discard = self.outstanding_data.get_unsent_messages_to_discard();
            let Some(chunk) = produce(max_bytes - self.data_chunk_header_size, &discard) else {
                break;
            };
            let size = self.chunk_size(&chunk.data);
            max_bytes = max_bytes.saturating_sub(size);
            self.rwnd = self.rwnd.saturating_sub(size);

            let (max_retransmissions, expires_at) = if self.partial_reliability {
                (chunk.max_retransmissions, chunk.expires_at)
            } else {
                (None, None)
            };
            let lifecycle_id = chunk.lifecycle_id.clone();
            if let Some(tsn) = self.outstanding_data.insert(
                chunk.message_id,
                &chunk.data,
                now,
                max_retransmissions,
                expires_at,
                chunk.lifecycle_id,
            ) {
                if let Some(id) = lifecycle_id {
                    self.events.borrow_mut().add(SocketEvent::OnLifecycleMessageFullySent(id));
                }
                to_be_sent.push((tsn, chunk.data));
            }
        }

        if !to_be_sent.is_empty() {
            if !self.t3_rtx.is_running() {
                self.t3_rtx.start(now);
            }
            log::debug!(
                "Sending TSN {} - unacked_bytes={} ({}), cwnd={}, rwnd={} ({})",
                to_be_sent.iter().map(|(tsn, _)| tsn.to_string()).collect::<Vec<_>>().join(","),
                self.unacked_bytes(),
                old_unacked_bytes,
                self.cwnd,
                self.rwnd,
                old_rwnd
            );
        }

        to_be_sent.into_iter().map(|(tsn, data)| (tsn.wrap(), data)).collect()
    }

    /// Returns the number of bytes that may be sent now, according to the congestion and receiver
    /// windows.
    fn max_bytes_to_send(&self) -> usize {
        let left = self.cwnd.saturating_sub(self.unacked_bytes());
        if self.unacked_bytes() == 0 {
            // From <https://datatracker.ietf.org/doc/html/rfc9260#section-6.1-2.2.1>:
            //
            //   [...] regardless of the value of rwnd (including if it is 0), the data sender can
            //   always have one DATA chunk in flight to the receiver if allowed by cwnd.
            return left;
        }
        min(self.rwnd, left)
    }

    /// Returns true if new data may be sent. With a large congestion window, this requires that
    /// most of an MTU is available.
    pub fn can_send_data(&self) -> bool {
        self.cwnd < self.avoid_fragmentation_cwnd_mtus * self.mtu
            || self.max_bytes_to_send() >= self.min_bytes_required_to_send
    }

    /// Returns true if a FORWARD-TSN should be sent. This first abandons expired messages.
    pub fn should_send_forward_tsn(&mut self, now: SocketTime) -> bool {
        if !self.partial_reliability {
            return false;
        }
        self.outstanding_data.expire_outstanding_chunks(now);
        self.outstanding_data.should_send_forward_tsn()
    }

    pub fn create_forward_tsn(&self) -> Chunk {
        debug_assert!(self.partial_reliability);
        if self.use_message_interleaving {
            Chunk::IForwardTsn(self.outstanding_data.create_iforward_tsn())
        } else {
            Chunk::ForwardTsn(self.outstanding_data.create_forward_tsn())
        }
    }

    pub fn begin_reset_streams(&mut self) {
        self.outstanding_data.begin_reset_streams();
    }

    #[cfg(test)]
    pub fn get_chunk_states_for_testing(&self) -> Vec<(Tsn, ChunkState)> {
        self.outstanding_data.get_chunk_states_for_testing()
    }

    /// The TSN that the next sent fragment will get.
    #[cfg(test)]
    pub fn next_tsn(&self) -> Tsn {
        self.outstanding_data.next_tsn().wrap()
    }

    pub fn last_assigned_tsn(&self) -> Tsn {
        self.outstanding_data.highest_outstanding_tsn().wrap()
    }

    pub fn is_empty(&self) -> bool {
        self.outstanding_data.is_empty()
    }

    pub fn cwnd(&self) -> usize {
        self.cwnd
    }

    #[cfg(test)]
    pub fn set_cwnd(&mut self, cwnd: usize) {
        self.cwnd = cwnd;
    }

    #[cfg(test)]
    pub fn ssthresh(&self) -> usize {
        self.ssthresh
    }

    pub fn rwnd(&self) -> usize {
        self.rwnd
    }

    pub fn rtx_packets_count(&self) -> usize {
        self.rtx_packets_count
    }

    pub fn rtx_bytes_count(&self) -> u64 {
        self.rtx_bytes_count
    }

    /// Bytes in flight, not counting fragments that are acked, nacked or abandoned.
    pub fn unacked_bytes(&self) -> usize {
        self.outstanding_data.unacked_bytes()
    }

    pub fn unacked_items(&self) -> usize {
        self.outstanding_data.unacked_items()
    }
}
