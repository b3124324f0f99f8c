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

//! Types shared between the delivery core and the code that drives it.

use std::fmt;
use std::num::NonZeroU64;
use std::ops::Add;
use std::ops::Sub;
use std::time::Duration;

/// A point in time, relative to when the association was created.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SocketTime(Duration);

impl SocketTime {
    pub const fn zero() -> SocketTime {
        SocketTime(Duration::ZERO)
    }

    pub const fn infinite_future() -> SocketTime {
        SocketTime(Duration::MAX)
    }
}

impl Add<Duration> for SocketTime {
    type Output = SocketTime;
    fn add(self, rhs: Duration) -> SocketTime {
        SocketTime(self.0.saturating_add(rhs))
    }
}

impl Sub<Duration> for SocketTime {
    type Output = SocketTime;
    fn sub(self, rhs: Duration) -> SocketTime {
        SocketTime(self.0.saturating_sub(rhs))
    }
}

impl Sub<SocketTime> for SocketTime {
    type Output = Duration;
    fn sub(self, rhs: SocketTime) -> Duration {
        self.0.saturating_sub(rhs.0)
    }
}

impl From<Duration> for SocketTime {
    fn from(value: Duration) -> Self {
        SocketTime(value)
    }
}

impl From<SocketTime> for Duration {
    fn from(value: SocketTime) -> Self {
        value.0
    }
}

/// An identifier picked by the sender of a message, which makes the library generate lifecycle
/// events for it. See [`SocketEvent::OnLifecycleMessageFullySent`]. Zero is not a valid lifecycle
/// identifier.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct LifecycleId(NonZeroU64);

impl fmt::Debug for LifecycleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for LifecycleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl LifecycleId {
    /// Returns `None` if `n` is zero.
    pub fn new(n: u64) -> Option<LifecycleId> {
        NonZeroU64::new(n).map(LifecycleId)
    }

    /// Creates a `LifecycleId` from a value known to be non-zero. Zero is mapped to one, which is
    /// flagged in debug builds.
    pub fn from(n: u64) -> LifecycleId {
        debug_assert!(n != 0);
        LifecycleId(NonZeroU64::new(n).unwrap_or(NonZeroU64::MIN))
    }

    pub fn value(&self) -> u64 {
        self.0.get()
    }
}

/// Stream Identifier
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct StreamId(pub u16);

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Payload Protocol Identifier (PPID)
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct PpId(pub u32);

impl fmt::Debug for PpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for PpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-message send options.
#[derive(Clone, Debug, Default)]
pub struct SendOptions {
    /// Deliver the message as soon as it's reassembled, regardless of the order it was sent in.
    pub unordered: bool,

    /// Abandon the message if it hasn't been fully delivered within this duration. Requires
    /// partial reliability (RFC 3758) to be negotiated.
    pub lifetime: Option<Duration>,

    /// Abandon the message when any of its fragments has been retransmitted this many times.
    /// Requires partial reliability (RFC 3758) to be negotiated.
    pub max_retransmissions: Option<u16>,

    /// If set, lifecycle events will be generated for this message.
    pub lifecycle_id: Option<LifecycleId>,
}

/// A message sent or received on a stream, with a payload protocol identifier.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub stream_id: StreamId,
    pub ppid: PpId,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(stream_id: StreamId, ppid: PpId, payload: Vec<u8>) -> Self {
        Message { stream_id, ppid, payload }
    }
}

/// The category of an error reported with [`SocketEvent::OnError`] or [`SocketEvent::OnAborted`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ErrorKind {
    /// Too many retransmissions or timeouts. Typically a loss of connectivity to the peer.
    TooManyRetries,

    /// The peer sent something that violates the protocol, such as a SACK acknowledging data that
    /// was never sent.
    ProtocolViolation,

    /// Send or receive buffers are exhausted.
    ResourceExhaustion,

    /// The operation isn't possible in the current state.
    WrongSequence,
}

/// Configuration of the delivery core. It's fixed when the core is created.
#[derive(Clone, Debug)]
pub struct Options {
    /// Maximum SCTP packet size, excluding any lower layer (DTLS, UDP, IP) overhead.
    pub mtu: usize,

    /// The largest message payload that can be sent.
    pub max_message_size: usize,

    /// The priority of streams for which no priority has been set. Compatible with
    /// <https://www.w3.org/TR/webrtc-priority/>, sections 4.2--4.3.
    pub default_stream_priority: u16,

    /// Maximum number of bytes buffered for reassembly. This is also the initially advertised
    /// receiver window, and should be a bit larger than the largest message to be received.
    pub max_receiver_window_buffer_size: usize,

    /// New messages are rejected when this many bytes are buffered in the send queue.
    pub max_send_buffer_size: usize,

    /// Like [`Options::max_send_buffer_size`], but for a single stream.
    pub per_stream_send_queue_limit: usize,

    /// [`SocketEvent::OnTotalBufferedAmountLow`] is generated when the send queue drops to or below
    /// this size.
    pub total_buffered_amount_low_threshold: usize,

    /// The initial per-stream buffered amount low threshold.
    pub default_stream_buffered_amount_low_threshold: usize,

    /// Measured RTTs above this value are discarded.
    pub rtt_max: Duration,

    pub rto_initial: Duration,
    pub rto_max: Duration,

    /// Minimum RTO. Must be larger than the delayed ack timeout of the peer.
    pub rto_min: Duration,

    /// The lower bound of the RTT variance, used in the RTO calculation.
    pub min_rtt_variance: Duration,

    /// Upper bound of the exponentially backed off retransmission timeout.
    pub max_timer_backoff_duration: Option<Duration>,

    /// The longest a SACK can be delayed. Whichever is smallest of this and RTO/2 is used.
    pub delayed_ack_max_timeout: Duration,

    /// Initial congestion window, in MTUs.
    pub cwnd_mtus_initial: usize,

    /// Minimum congestion window after loss has been detected by a SACK, in MTUs. A
    /// retransmission timeout still brings it down to a single MTU.
    pub cwnd_mtus_min: usize,

    /// When the congestion window is at least this many MTUs, small fragments are avoided when
    /// filling up the last bit of it.
    pub avoid_fragmentation_cwnd_mtus: usize,

    /// The number of packets that may be produced in a single burst.
    pub max_burst: usize,

    /// Maximum consecutive retransmission timeouts before the association is reported as lost.
    /// `None` means no limit.
    pub max_retransmissions: Option<u32>,

    /// RFC 3758 Partial Reliability Extension
    pub enable_partial_reliability: bool,

    /// RFC 8260 Stream Schedulers and User Message Interleaving
    pub enable_message_interleaving: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            // 1280 (IPv6 MTU) - 40 (IPv6) - 8 (UDP) - 24 (GCM) - 13 (DTLS) - 4 (TURN ChannelData)
            mtu: 1191,
            max_message_size: 256 * 1024,
            default_stream_priority: 256,
            max_receiver_window_buffer_size: 5 * 1024 * 1024,
            max_send_buffer_size: 2_000_000,
            per_stream_send_queue_limit: 2_000_000,
            total_buffered_amount_low_threshold: 1_800_000,
            default_stream_buffered_amount_low_threshold: 0,
            rtt_max: Duration::from_secs(60),
            rto_initial: Duration::from_millis(500),
            rto_max: Duration::from_secs(60),
            rto_min: Duration::from_millis(400),
            min_rtt_variance: Duration::from_millis(220),
            max_timer_backoff_duration: None,
            delayed_ack_max_timeout: Duration::from_millis(200),
            cwnd_mtus_initial: 10,
            cwnd_mtus_min: 4,
            avoid_fragmentation_cwnd_mtus: 6,
            max_burst: 4,
            max_retransmissions: Some(10),
            enable_partial_reliability: true,
            enable_message_interleaving: false,
        }
    }
}

/// Events generated by the delivery core, to be consumed by the application.
#[derive(Debug, PartialEq)]
pub enum SocketEvent {
    /// The association should be considered lost. The core only reports this, and it's up to the
    /// owner to tear the association down.
    OnAborted(ErrorKind, String),

    /// A non-fatal error. The association is still usable.
    OnError(ErrorKind, String),

    /// The amount of data buffered for a stream has dropped to or below its threshold.
    OnBufferedAmountLow(StreamId),

    /// The total amount of buffered data has dropped to or below
    /// [`Options::total_buffered_amount_low_threshold`].
    OnTotalBufferedAmountLow(),

    /// The peer has reset some of its outgoing streams, which are our incoming streams.
    OnIncomingStreamReset(Vec<StreamId>),

    /// The last fragment of the message has been sent. Generated at most once per message.
    ///
    /// # Lifecycle events
    ///
    /// Messages sent with a [`SendOptions::lifecycle_id`] generate these events:
    ///
    /// ```txt
    ///          send ───────────────────────────────────────────────────────────────┐
    ///           │                                                                   │
    ///           v                                                                   v
    /// OnLifecycleMessageFullySent ──> OnLifecycleMessageMaybeExpired    OnLifecycleMessageExpired
    ///           │                                │                                  │
    ///           v                                v                                  │
    /// OnLifecycleMessageDelivered ─────────> OnLifecycleEnd <───────────────────────┘
    /// ```
    OnLifecycleMessageFullySent(LifecycleId),

    /// The message was abandoned after (parts of it) had been sent, so the peer may or may not
    /// have received it.
    OnLifecycleMessageMaybeExpired(LifecycleId),

    /// The message was abandoned before it had been fully sent.
    OnLifecycleMessageExpired(LifecycleId),

    /// The peer has cumulatively acknowledged all fragments of the message.
    OnLifecycleMessageDelivered(LifecycleId),

    /// No more lifecycle events will be generated for this message.
    OnLifecycleEnd(LifecycleId),
}

/// The result of sending a message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SendStatus {
    /// The message was enqueued. That is no guarantee that it will be delivered.
    Success,

    /// The payload was empty, which isn't allowed in SCTP.
    ErrorMessageEmpty,

    /// The payload was larger than [`Options::max_message_size`].
    ErrorMessageTooLarge,

    /// The send queue is full.
    ErrorResourceExhaustion,

    /// The association is shutting down.
    ErrorShuttingDown,
}

/// Counters and current values, as returned by
/// [`crate::TransmissionControlBlock::metrics`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Metrics {
    /// Number of messages enqueued to be sent.
    pub tx_messages_count: usize,

    /// Number of produced packets containing at least one retransmitted fragment.
    pub rtx_packets_count: usize,

    /// Number of retransmitted bytes, including DATA/I-DATA chunk headers.
    pub rtx_bytes_count: u64,

    /// The congestion window, in bytes.
    pub cwnd_bytes: usize,

    /// The smoothed round trip time.
    pub srtt: Duration,

    /// Number of fragments in flight that haven't been acked or nacked.
    pub unack_data_count: usize,

    /// Number of messages received.
    pub rx_messages_count: usize,

    /// The receiver window most recently advertised by the peer.
    pub peer_rwnd_bytes: u32,
}
