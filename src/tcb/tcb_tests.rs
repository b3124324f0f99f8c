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

#[cfg(test)]
mod tests {
    use crate::api::ErrorKind;
    use crate::api::LifecycleId;
    use crate::api::Message;
    use crate::api::Options;
    use crate::api::PpId;
    use crate::api::SendOptions;
    use crate::api::SendStatus;
    use crate::api::SocketEvent;
    use crate::api::SocketTime;
    use crate::api::StreamId;
    use crate::events::Events;
    use crate::packet::chunk::Chunk;
    use crate::packet::sack_chunk::SackChunk;
    use crate::tcb::Capabilities;
    use crate::tcb::ChunkError;
    use crate::tcb::IncomingResetResult;
    use crate::tcb::TransmissionControlBlock;
    use crate::testing::data_generator::DataGenerator;
    use crate::testing::event_helpers::drain_events;
    use crate::testing::event_helpers::expect_no_event;
    use crate::testing::event_helpers::expect_on_aborted;
    use crate::testing::event_helpers::expect_on_error;
    use crate::testing::event_helpers::expect_on_incoming_stream_reset;
    use crate::testing::event_helpers::expect_on_lifecycle_end;
    use crate::tx::retransmission_queue::SackError;
    use crate::types::Mid;
    use crate::types::Ssn;
    use crate::types::Tsn;
    use crate::EventSink;
    use itertools::Itertools;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;
    use std::time::Duration;

    const START_TIME: SocketTime = SocketTime::zero();
    const A_INITIAL_TSN: Tsn = Tsn(1000);
    const Z_INITIAL_TSN: Tsn = Tsn(5000);

    struct Peer {
        tcb: TransmissionControlBlock,
        events: Rc<RefCell<Events>>,
        pending: VecDeque<Vec<Chunk>>,
    }

    impl Peer {
        fn new(name: &str, options: &Options, my_initial_tsn: Tsn, peer_initial_tsn: Tsn) -> Self {
            let events = Rc::new(RefCell::new(Events::new()));
            let peer_capabilities = Capabilities {
                partial_reliability: options.enable_partial_reliability,
                message_interleaving: options.enable_message_interleaving,
            };
            let tcb = TransmissionControlBlock::new(
                name,
                options,
                my_initial_tsn,
                peer_initial_tsn,
                options.max_receiver_window_buffer_size as u32,
                Capabilities::negotiate(options, peer_capabilities),
                Rc::clone(&events) as Rc<RefCell<dyn EventSink>>,
            );
            Peer { tcb, events, pending: VecDeque::new() }
        }

        fn next_event(&self) -> Option<SocketEvent> {
            self.events.borrow_mut().next_event()
        }

        fn drain_events(&self) -> Vec<SocketEvent> {
            drain_events(&mut *self.events.borrow_mut())
        }

        /// Handles all chunks of a packet, queueing a SACK if one should be sent in return.
        fn receive(&mut self, now: SocketTime, packet: Vec<Chunk>) {
            for chunk in packet {
                let _ = self.tcb.handle_chunk(now, chunk);
            }
            if let Some(sack) = self.tcb.observe_packet_end(now) {
                self.pending.push_back(vec![Chunk::Sack(sack)]);
            }
        }

        fn poll_packets(&mut self, now: SocketTime) -> Vec<Vec<Chunk>> {
            let mut packets: Vec<_> = self.pending.drain(..).collect();
            packets.extend(self.tcb.produce_packets(now));
            packets
        }

        fn messages(&mut self) -> Vec<Message> {
            std::iter::from_fn(|| self.tcb.get_next_message()).collect()
        }
    }

    fn default_options() -> Options {
        Options {
            rto_initial: Duration::from_millis(100),
            rto_min: Duration::from_millis(100),
            delayed_ack_max_timeout: Duration::from_millis(10),
            ..Default::default()
        }
    }

    fn connect(options: &Options) -> (Peer, Peer) {
        (
            Peer::new("A", options, A_INITIAL_TSN, Z_INITIAL_TSN),
            Peer::new("Z", options, Z_INITIAL_TSN, A_INITIAL_TSN),
        )
    }

    fn message(stream_id: u16, payload: Vec<u8>) -> Message {
        Message::new(StreamId(stream_id), PpId(53), payload)
    }

    fn carries_data(packet: &[Chunk], tsn: Tsn) -> bool {
        packet.iter().any(|c| matches!(c, Chunk::Data(t, _) | Chunk::IData(t, _) if *t == tsn))
    }

    /// Exchanges packets until both peers are quiet, moving time forward to the next timeout
    /// whenever nothing is sent. Packets for which `lose` returns true are dropped.
    fn exchange_packets_with(
        mut now: SocketTime,
        a: &mut Peer,
        z: &mut Peer,
        mut lose: impl FnMut(&[Chunk]) -> bool,
    ) -> SocketTime {
        for _ in 0..10_000 {
            let mut delivered_packets = false;
            for packet in a.poll_packets(now) {
                delivered_packets = true;
                if !lose(&packet) {
                    z.receive(now, packet);
                }
            }
            for packet in z.poll_packets(now) {
                delivered_packets = true;
                if !lose(&packet) {
                    a.receive(now, packet);
                }
            }
            if delivered_packets {
                continue;
            }
            match [a.tcb.next_timeout(), z.tcb.next_timeout()].into_iter().flatten().min() {
                Some(timeout) => {
                    now = now.max(timeout);
                    a.tcb.handle_timeout(now);
                    z.tcb.handle_timeout(now);
                }
                None => return now,
            }
        }
        panic!("Packet exchange didn't settle");
    }

    fn exchange_packets(now: SocketTime, a: &mut Peer, z: &mut Peer) -> SocketTime {
        exchange_packets_with(now, a, z, |_| false)
    }

    #[test]
    fn sends_message_to_peer() {
        let (mut a, mut z) = connect(&default_options());

        let status = a.tcb.send(START_TIME, message(1, b"hello".to_vec()), &SendOptions::default());
        assert_eq!(status, SendStatus::Success);
        assert!(!a.tcb.is_idle());

        exchange_packets(START_TIME, &mut a, &mut z);

        assert_eq!(z.messages(), vec![message(1, b"hello".to_vec())]);
        assert!(a.tcb.is_idle());
        assert_eq!(a.tcb.metrics().tx_messages_count, 1);
        assert_eq!(a.tcb.metrics().unack_data_count, 0);
        assert_eq!(z.tcb.metrics().rx_messages_count, 1);
    }

    #[test]
    fn fragments_and_reassembles_large_message() {
        let (mut a, mut z) = connect(&default_options());
        let payload: Vec<u8> = (0..20_000).map(|i| i as u8).collect();

        a.tcb.send(START_TIME, message(1, payload.clone()), &SendOptions::default());
        let packets = a.tcb.produce_packets(START_TIME);
        assert!(packets.len() > 1);
        assert!(packets.iter().all(|p| p.iter().map(Chunk::serialized_size).sum::<usize>()
            <= default_options().mtu));
        for packet in packets {
            z.receive(START_TIME, packet);
        }

        exchange_packets(START_TIME, &mut a, &mut z);

        assert_eq!(z.messages(), vec![message(1, payload)]);
        assert!(a.tcb.is_idle());
    }

    #[test]
    fn sends_many_messages() {
        let (mut a, mut z) = connect(&default_options());
        for i in 0..100u32 {
            a.tcb.send(
                START_TIME,
                message(1 + (i % 3) as u16, i.to_be_bytes().to_vec()),
                &SendOptions::default(),
            );
        }

        exchange_packets(START_TIME, &mut a, &mut z);

        let messages = z.messages();
        assert_eq!(messages.len(), 100);
        for stream_id in 1..=3 {
            let received: Vec<_> = messages
                .iter()
                .filter(|m| m.stream_id == StreamId(stream_id))
                .map(|m| u32::from_be_bytes(<[u8; 4]>::try_from(m.payload.as_slice()).unwrap()))
                .collect();
            let expected: Vec<u32> =
                (0..100).filter(|i| 1 + (i % 3) as u16 == stream_id).collect();
            assert_eq!(received, expected);
        }
    }

    #[test]
    fn delivers_ordered_messages_in_order_when_packets_are_reordered() {
        for order in (0..4).permutations(4) {
            let (mut a, mut z) = connect(&default_options());
            for i in 0..4u8 {
                a.tcb.send(START_TIME, message(1, vec![i; 1000]), &SendOptions::default());
            }
            let packets = a.tcb.produce_packets(START_TIME);
            assert_eq!(packets.len(), 4);

            for idx in order {
                z.receive(START_TIME, packets[idx].clone());
            }

            let payloads: Vec<_> = z.messages().into_iter().map(|m| m.payload[0]).collect();
            assert_eq!(payloads, vec![0, 1, 2, 3]);
        }
    }

    #[test]
    fn first_data_is_acked_immediately_then_acks_are_delayed() {
        let (mut a, mut z) = connect(&default_options());

        a.tcb.send(START_TIME, message(1, b"one".to_vec()), &SendOptions::default());
        for packet in a.tcb.produce_packets(START_TIME) {
            z.receive(START_TIME, packet);
        }
        assert_eq!(z.pending.len(), 1);
        z.pending.clear();

        a.tcb.send(START_TIME, message(1, b"two".to_vec()), &SendOptions::default());
        for packet in a.tcb.produce_packets(START_TIME) {
            z.receive(START_TIME, packet);
        }
        assert!(z.pending.is_empty());
        let timeout = z.tcb.next_timeout().unwrap();
        assert!(timeout > START_TIME);

        z.tcb.handle_timeout(timeout);
        let packets = z.tcb.produce_packets(timeout);
        assert_eq!(packets.len(), 1);
        match &packets[0][..] {
            [Chunk::Sack(sack)] => assert_eq!(sack.cumulative_tsn_ack, A_INITIAL_TSN + 1),
            other => panic!("Expected a SACK, got {:?}", other),
        }
    }

    #[test]
    fn retransmits_lost_packet_on_timeout() {
        let (mut a, mut z) = connect(&default_options());
        a.tcb.send(START_TIME, message(1, b"hello".to_vec()), &SendOptions::default());

        let mut lost = false;
        let now = exchange_packets_with(START_TIME, &mut a, &mut z, |packet| {
            if !lost && carries_data(packet, A_INITIAL_TSN) {
                lost = true;
                return true;
            }
            false
        });

        assert!(now >= START_TIME + default_options().rto_initial);
        assert_eq!(z.messages(), vec![message(1, b"hello".to_vec())]);
        assert_eq!(a.tcb.metrics().rtx_packets_count, 1);
        assert!(a.tcb.is_idle());
    }

    #[test]
    fn fast_retransmits_lost_packet() {
        let (mut a, mut z) = connect(&default_options());
        for i in 0..5u8 {
            a.tcb.send(START_TIME, message(1, vec![i; 1000]), &SendOptions::default());
        }

        let mut lost = false;
        let now = exchange_packets_with(START_TIME, &mut a, &mut z, |packet| {
            if !lost && carries_data(packet, A_INITIAL_TSN) {
                lost = true;
                return true;
            }
            false
        });

        assert_eq!(now, START_TIME);
        let payloads: Vec<_> = z.messages().into_iter().map(|m| m.payload[0]).collect();
        assert_eq!(payloads, vec![0, 1, 2, 3, 4]);
        assert_eq!(a.tcb.metrics().rtx_packets_count, 1);
        assert!(a.tcb.is_idle());
    }

    #[test]
    fn aborts_once_after_too_many_retransmissions() {
        let options = Options { max_retransmissions: Some(2), ..default_options() };
        let (mut a, _z) = connect(&options);
        a.tcb.send(START_TIME, message(1, b"hello".to_vec()), &SendOptions::default());
        a.poll_packets(START_TIME);

        for _ in 0..2 {
            let now = a.tcb.next_timeout().unwrap();
            a.tcb.handle_timeout(now);
            assert!(!a.poll_packets(now).is_empty());
            expect_no_event!(a.next_event());
        }

        let now = a.tcb.next_timeout().unwrap();
        a.tcb.handle_timeout(now);
        assert_eq!(expect_on_aborted!(a.next_event()), ErrorKind::TooManyRetries);

        let now = a.tcb.next_timeout().unwrap();
        a.tcb.handle_timeout(now);
        expect_no_event!(a.next_event());
    }

    #[test]
    fn skips_abandoned_message_with_forward_tsn() {
        let (mut a, mut z) = connect(&default_options());
        let abandoned = LifecycleId::from(1);
        a.tcb.send(
            START_TIME,
            message(1, vec![1; 1000]),
            &SendOptions {
                max_retransmissions: Some(0),
                lifecycle_id: Some(abandoned.clone()),
                ..Default::default()
            },
        );
        a.tcb.send(START_TIME, message(1, vec![2; 1000]), &SendOptions::default());

        exchange_packets_with(START_TIME, &mut a, &mut z, |packet| {
            carries_data(packet, A_INITIAL_TSN)
        });

        assert_eq!(z.messages(), vec![message(1, vec![2; 1000])]);
        assert!(a.tcb.is_idle());
        let lifecycle: Vec<_> = a
            .drain_events()
            .into_iter()
            .filter(|e| match e {
                SocketEvent::OnLifecycleMessageFullySent(id)
                | SocketEvent::OnLifecycleMessageMaybeExpired(id)
                | SocketEvent::OnLifecycleMessageDelivered(id)
                | SocketEvent::OnLifecycleEnd(id) => *id == abandoned,
                _ => false,
            })
            .collect();
        assert_eq!(
            lifecycle,
            vec![
                SocketEvent::OnLifecycleMessageFullySent(abandoned.clone()),
                SocketEvent::OnLifecycleMessageMaybeExpired(abandoned.clone()),
                SocketEvent::OnLifecycleEnd(abandoned),
            ]
        );
    }

    #[test]
    fn uses_idata_when_interleaving_is_negotiated() {
        let options = Options { enable_message_interleaving: true, ..default_options() };
        let (mut a, mut z) = connect(&options);
        assert!(a.tcb.capabilities().message_interleaving);

        a.tcb.send(START_TIME, message(1, vec![1; 3000]), &SendOptions::default());
        a.tcb.send(START_TIME, message(2, vec![2; 10]), &SendOptions::default());
        let packets = a.tcb.produce_packets(START_TIME);
        assert!(packets.iter().flatten().all(|c| matches!(c, Chunk::IData(..))));
        for packet in packets {
            z.receive(START_TIME, packet);
        }

        exchange_packets(START_TIME, &mut a, &mut z);

        let mut messages = z.messages();
        messages.sort_by_key(|m| m.stream_id);
        assert_eq!(messages, vec![message(1, vec![1; 3000]), message(2, vec![2; 10])]);
    }

    #[test]
    fn rejects_chunks_that_arent_negotiated() {
        let (_a, mut z) = connect(&default_options());
        let mut gen = DataGenerator::new(StreamId(1));

        assert_eq!(
            z.tcb.handle_chunk(START_TIME, Chunk::IData(A_INITIAL_TSN, gen.ordered("a", "BE"))),
            Err(ChunkError::NotNegotiated("I-DATA"))
        );
        assert_eq!(expect_on_error!(z.next_event()), ErrorKind::ProtocolViolation);
    }

    #[test]
    fn rejects_data_without_payload() {
        let (_a, mut z) = connect(&default_options());
        let mut gen = DataGenerator::new(StreamId(1));

        assert_eq!(
            z.tcb.handle_data(START_TIME, A_INITIAL_TSN, gen.ordered("", "BE")),
            Err(ChunkError::NoUserData(A_INITIAL_TSN))
        );
        assert_eq!(expect_on_error!(z.next_event()), ErrorKind::ProtocolViolation);
        assert_eq!(z.tcb.get_next_message(), None);
    }

    #[test]
    fn only_accepts_data_advancing_cumulative_ack_above_watermark() {
        let options = Options { max_receiver_window_buffer_size: 1000, ..default_options() };
        let (_a, mut z) = connect(&options);
        let mut gen = DataGenerator::new(StreamId(1));
        let large = "x".repeat(950);

        let first_fragment = gen.ordered_with_mid(&large, "B", Mid(1));
        assert_eq!(z.tcb.handle_data(START_TIME, A_INITIAL_TSN + 1, first_fragment), Ok(()));
        let last_fragment = gen.ordered_with_mid("y", "E", Mid(1));
        assert_eq!(
            z.tcb.handle_data(START_TIME, A_INITIAL_TSN + 2, last_fragment),
            Err(ChunkError::BufferFull(A_INITIAL_TSN + 2))
        );
        assert!(z.tcb.observe_packet_end(START_TIME).is_some());

        let data = gen.ordered_with_mid("first", "BE", Mid(0));
        assert_eq!(z.tcb.handle_data(START_TIME, A_INITIAL_TSN, data), Ok(()));
        assert_eq!(z.messages(), vec![message(1, b"first".to_vec())]);
    }

    #[test]
    fn reports_sack_beyond_sent_data_but_drops_stale_sack() {
        let (mut a, _z) = connect(&default_options());

        let stale = SackChunk {
            cumulative_tsn_ack: A_INITIAL_TSN - 2,
            a_rwnd: 10000,
            gap_ack_blocks: vec![],
            duplicate_tsns: vec![],
        };
        assert!(matches!(
            a.tcb.handle_sack(START_TIME, &stale),
            Err(SackError::InvalidCumulativeAck { .. })
        ));
        expect_no_event!(a.next_event());

        let beyond = SackChunk { cumulative_tsn_ack: A_INITIAL_TSN + 5, ..stale };
        assert!(matches!(
            a.tcb.handle_chunk(START_TIME, Chunk::Sack(beyond)),
            Err(ChunkError::Sack(SackError::CumulativeAckBeyondOutstanding { .. }))
        ));
        assert_eq!(expect_on_error!(a.next_event()), ErrorKind::ProtocolViolation);
    }

    #[test]
    fn rejects_empty_and_too_large_messages() {
        let options = Options { max_message_size: 100, ..default_options() };
        let (mut a, _z) = connect(&options);

        assert_eq!(
            a.tcb.send(START_TIME, message(1, vec![]), &SendOptions::default()),
            SendStatus::ErrorMessageEmpty
        );
        assert_eq!(expect_on_error!(a.next_event()), ErrorKind::ProtocolViolation);

        assert_eq!(
            a.tcb.send(START_TIME, message(1, vec![0; 101]), &SendOptions::default()),
            SendStatus::ErrorMessageTooLarge
        );
        assert_eq!(expect_on_error!(a.next_event()), ErrorKind::ProtocolViolation);

        assert_eq!(
            a.tcb.send(START_TIME, message(1, vec![0; 100]), &SendOptions::default()),
            SendStatus::Success
        );
        assert_eq!(a.tcb.metrics().tx_messages_count, 1);
    }

    #[test]
    fn respects_send_buffer_limits() {
        let options = Options {
            max_send_buffer_size: 1000,
            per_stream_send_queue_limit: 500,
            ..default_options()
        };
        let (mut a, _z) = connect(&options);
        let lifecycle_id = LifecycleId::from(7);
        let tracked =
            SendOptions { lifecycle_id: Some(lifecycle_id.clone()), ..Default::default() };

        assert_eq!(a.tcb.send(START_TIME, message(1, vec![0; 600]), &tracked), SendStatus::Success);
        assert_eq!(
            a.tcb.send(START_TIME, message(1, vec![0; 10]), &tracked),
            SendStatus::ErrorResourceExhaustion
        );
        assert_eq!(expect_on_lifecycle_end!(a.next_event()), lifecycle_id);
        assert_eq!(expect_on_error!(a.next_event()), ErrorKind::ResourceExhaustion);

        assert_eq!(
            a.tcb.send(START_TIME, message(2, vec![0; 500]), &SendOptions::default()),
            SendStatus::Success
        );
        assert_eq!(
            a.tcb.send(START_TIME, message(3, vec![0; 1]), &SendOptions::default()),
            SendStatus::ErrorResourceExhaustion
        );
        assert_eq!(expect_on_error!(a.next_event()), ErrorKind::ResourceExhaustion);
        assert_eq!(a.tcb.buffered_amount(StreamId(1)), 600);
        assert_eq!(a.tcb.total_buffered_amount(), 1100);
    }

    #[test]
    fn rejects_messages_after_shutdown_has_begun() {
        let (mut a, mut z) = connect(&default_options());
        a.tcb.send(START_TIME, message(1, b"before".to_vec()), &SendOptions::default());

        a.tcb.begin_shutdown();
        assert_eq!(
            a.tcb.send(START_TIME, message(1, b"after".to_vec()), &SendOptions::default()),
            SendStatus::ErrorShuttingDown
        );
        assert_eq!(expect_on_error!(a.next_event()), ErrorKind::WrongSequence);
        assert!(!a.tcb.is_idle());

        exchange_packets(START_TIME, &mut a, &mut z);

        assert!(a.tcb.is_idle());
        assert_eq!(z.messages(), vec![message(1, b"before".to_vec())]);
    }

    #[test]
    fn performs_incoming_reset_when_all_data_is_received() {
        let (_a, mut z) = connect(&default_options());

        assert_eq!(
            z.tcb.handle_incoming_reset(A_INITIAL_TSN - 1, vec![StreamId(1)]),
            IncomingResetResult::Performed
        );
        assert_eq!(expect_on_incoming_stream_reset!(z.next_event()), vec![StreamId(1)]);
    }

    #[test]
    fn reset_stream_makes_ssn_start_at_zero_after_deferred_reset() {
        let (mut a, mut z) = connect(&default_options());
        a.tcb.send(START_TIME, message(1, b"one".to_vec()), &SendOptions::default());
        a.tcb.send(START_TIME, message(1, b"two".to_vec()), &SendOptions::default());
        let before_reset = a.tcb.produce_packets(START_TIME);
        assert_eq!(before_reset.len(), 1);

        a.tcb.prepare_reset_streams(&[StreamId(1)]);
        let request = a.tcb.get_streams_ready_to_reset().unwrap();
        assert_eq!(request.sender_last_assigned_tsn, A_INITIAL_TSN + 1);
        assert_eq!(request.streams, vec![StreamId(1)]);

        assert_eq!(
            z.tcb.handle_incoming_reset(request.sender_last_assigned_tsn, request.streams),
            IncomingResetResult::InProgress
        );
        a.tcb.commit_reset_streams();

        a.tcb.send(START_TIME, message(1, b"three".to_vec()), &SendOptions::default());
        let after_reset = a.tcb.produce_packets(START_TIME);
        match &after_reset[..] {
            [packet] => match &packet[..] {
                [Chunk::Data(tsn, data)] => {
                    assert_eq!(*tsn, A_INITIAL_TSN + 2);
                    assert_eq!(data.ssn.0, 0);
                }
                other => panic!("Unexpected chunks {:?}", other),
            },
            other => panic!("Unexpected packets {:?}", other),
        }

        // Data sent after the reset arrives before the data sent before it.
        for packet in after_reset.into_iter().chain(before_reset) {
            z.receive(START_TIME, packet);
        }

        assert_eq!(expect_on_incoming_stream_reset!(z.next_event()), vec![StreamId(1)]);
        let payloads: Vec<_> = z.messages().into_iter().map(|m| m.payload).collect();
        assert_eq!(payloads, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
    }

    #[test]
    fn restart_sends_partially_sent_message_again_from_its_start() {
        let options = default_options();
        let (mut a, mut z) = connect(&options);
        a.tcb.send(START_TIME, message(1, b"hello".to_vec()), &SendOptions::default());
        let now = exchange_packets(START_TIME, &mut a, &mut z);
        assert_eq!(z.messages(), vec![message(1, b"hello".to_vec())]);

        let payload: Vec<u8> = (0..20_000).map(|i| i as u8).collect();
        a.tcb.send(now, message(1, payload.clone()), &SendOptions::default());
        let packets = a.tcb.produce_packets(now);
        assert!(packets.len() > 1);
        z.receive(now, packets[0].clone());
        assert!(z.messages().is_empty());

        let a_rwnd = options.max_receiver_window_buffer_size as u32;
        a.tcb.restart(Tsn(2000), Tsn(6000), a_rwnd);
        z.tcb.restart(Tsn(6000), Tsn(2000), a_rwnd);
        a.pending.clear();
        z.pending.clear();
        assert_eq!(a.tcb.total_buffered_amount(), payload.len());

        let packets = a.tcb.produce_packets(now);
        let Some(Chunk::Data(tsn, data)) = packets[0].first() else {
            panic!("expected DATA");
        };
        assert_eq!(*tsn, Tsn(2000));
        assert_eq!(data.ssn, Ssn(0));
        assert!(data.is_beginning);
        for packet in packets {
            z.receive(now, packet);
        }
        exchange_packets(now, &mut a, &mut z);

        assert_eq!(z.messages(), vec![message(1, payload)]);
        assert!(a.tcb.is_idle());
    }

    #[test]
    fn only_one_outgoing_reset_request_at_a_time() {
        let (mut a, _z) = connect(&default_options());

        a.tcb.prepare_reset_streams(&[StreamId(1)]);
        let request = a.tcb.get_streams_ready_to_reset().unwrap();
        assert_eq!(request.streams, vec![StreamId(1)]);

        a.tcb.prepare_reset_streams(&[StreamId(2)]);
        assert_eq!(a.tcb.get_streams_ready_to_reset(), None);

        a.tcb.rollback_reset_streams();
        let request = a.tcb.get_streams_ready_to_reset().unwrap();
        assert_eq!(request.streams, vec![StreamId(2)]);
    }

    #[test]
    fn sets_stream_priority_and_buffered_amount_threshold() {
        let (mut a, _z) = connect(&default_options());

        assert_eq!(
            a.tcb.get_stream_priority(StreamId(1)),
            default_options().default_stream_priority
        );
        a.tcb.set_stream_priority(StreamId(1), 42);
        assert_eq!(a.tcb.get_stream_priority(StreamId(1)), 42);

        a.tcb.set_buffered_amount_low_threshold(StreamId(1), 100);
        assert_eq!(a.tcb.buffered_amount_low_threshold(StreamId(1)), 100);
    }

    #[test]
    fn metrics_track_round_trip_and_windows() {
        let (mut a, mut z) = connect(&default_options());
        assert_eq!(a.tcb.metrics().srtt, default_options().rto_initial);

        a.tcb.send(START_TIME, message(1, vec![0; 100]), &SendOptions::default());
        let packets = a.tcb.produce_packets(START_TIME);
        assert_eq!(a.tcb.metrics().unack_data_count, 1);

        let later = START_TIME + Duration::from_millis(30);
        for packet in packets {
            z.receive(later, packet);
        }
        for packet in z.poll_packets(later) {
            a.receive(later, packet);
        }

        let metrics = a.tcb.metrics();
        assert_eq!(metrics.unack_data_count, 0);
        assert!(metrics.srtt > Duration::from_millis(29));
        assert!(metrics.srtt < Duration::from_millis(31));
        assert_eq!(metrics.cwnd_bytes, default_options().cwnd_mtus_initial * default_options().mtu);
        assert!(metrics.peer_rwnd_bytes > 0);
    }
}
