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

//! The reliable-delivery core of dcSCTP.
//!
//! This crate contains the parts of an SCTP association that decide what to send, what to
//! acknowledge and what to deliver: sequence number bookkeeping, selective acknowledgements,
//! congestion controlled retransmission, partial reliability, stream scheduling and message
//! reassembly. Connection management and the wire format are handled by the owner, which feeds
//! received chunks into a [`TransmissionControlBlock`] and sends the chunks it produces.

pub mod api;
pub mod packet;
pub mod types;

pub mod events;
pub(crate) mod rx;
pub(crate) mod tcb;
pub(crate) mod timer;
pub(crate) mod tx;

pub use tcb::Capabilities;
pub use tcb::ChunkError;
pub use tcb::IncomingResetResult;
pub use tcb::OutgoingResetRequest;
pub use tcb::TransmissionControlBlock;
pub use tx::retransmission_queue::SackError;

/// Receives the events generated by the delivery core.
pub trait EventSink {
    fn add(&mut self, event: api::SocketEvent);
    fn next_event(&mut self) -> Option<api::SocketEvent>;
}

#[cfg(test)]
pub(crate) mod testing;

pub(crate) mod logging {
    use crate::api::SocketTime;
    use crate::packet::chunk::Chunk;
    #[cfg(not(test))]
    use log::debug;
    #[cfg(test)]
    use std::println as debug;
    use std::time::Duration;

    /// Logs a chunk that is sent (`O`) or received (`I`) by the association called `name`, with
    /// the time formatted as `HH:MM:SS.mmm`.
    pub fn log_chunk(name: &str, now: SocketTime, sent: bool, chunk: &Chunk) {
        let ms = Duration::from(now).as_millis() % (24 * 3600 * 1000);
        let prefix = if sent { "O" } else { "I" };
        debug!(
            "{} {:02}:{:02}:{:02}.{:03} [{}] {}",
            prefix,
            ms / 3_600_000,
            (ms / 60_000) % 60,
            (ms / 1000) % 60,
            ms % 1000,
            name,
            chunk
        );
    }
}

pub(crate) mod math {
    macro_rules! round_up_to_4 {
        ($a: expr) => {
            ($a + 3) & !3
        };
    }

    macro_rules! round_down_to_4 {
        ($a: expr) => {
            $a & !3
        };
    }

    macro_rules! is_divisible_by_4 {
        ($a: expr) => {
            ($a % 4) == 0
        };
    }

    pub(crate) use is_divisible_by_4;
    pub(crate) use round_down_to_4;
    pub(crate) use round_up_to_4;
}
