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

//! In-memory representations of the chunks that the delivery core consumes and produces.
//!
//! Serializing these to, and parsing them from, the wire format is done by the packet layer,
//! which is outside this crate.

use crate::api::StreamId;
use crate::types::Mid;
use crate::types::Ssn;
use crate::types::StreamKey;

pub mod chunk;
pub mod data;
pub mod forward_tsn_chunk;
pub mod sack_chunk;

/// A stream that a FORWARD-TSN or I-FORWARD-TSN instructs the receiver to skip ahead on.
#[derive(Clone, Debug, PartialEq)]
pub enum SkippedStream {
    /// FORWARD-TSN: the ordered stream has skipped up to and including the SSN.
    ForwardTsn(StreamId, Ssn),

    /// I-FORWARD-TSN: the ordered or unordered stream has skipped up to and including the MID.
    IForwardTsn(StreamKey, Mid),
}

impl SkippedStream {
    pub fn stream_id(&self) -> StreamId {
        match self {
            SkippedStream::ForwardTsn(stream_id, _) => *stream_id,
            SkippedStream::IForwardTsn(key, _) => key.id(),
        }
    }
}
