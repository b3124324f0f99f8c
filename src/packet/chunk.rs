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

use crate::math::round_up_to_4;
use crate::packet::data::Data;
use crate::packet::forward_tsn_chunk::ForwardTsnChunk;
use crate::packet::sack_chunk::SackChunk;
use crate::types::Tsn;
use std::fmt;

/// Size of a DATA chunk header, including the TSN, stream identifier, SSN and PPID.
pub(crate) const DATA_CHUNK_HEADER_SIZE: usize = 16;

/// Size of an I-DATA chunk header, including the TSN, stream identifier, MID, PPID/FSN.
pub(crate) const IDATA_CHUNK_HEADER_SIZE: usize = 20;

/// The chunks exchanged between the delivery core and the packet layer.
#[derive(Clone, Debug, PartialEq)]
pub enum Chunk {
    Data(Tsn, Data),
    IData(Tsn, Data),
    Sack(SackChunk),
    ForwardTsn(ForwardTsnChunk),
    IForwardTsn(ForwardTsnChunk),
}

impl Chunk {
    /// Returns the number of bytes this chunk occupies in a packet, including padding.
    pub fn serialized_size(&self) -> usize {
        match self {
            Chunk::Data(_, data) => round_up_to_4!(DATA_CHUNK_HEADER_SIZE + data.payload.len()),
            Chunk::IData(_, data) => round_up_to_4!(IDATA_CHUNK_HEADER_SIZE + data.payload.len()),
            Chunk::Sack(sack) => sack.serialized_size(),
            Chunk::ForwardTsn(c) | Chunk::IForwardTsn(c) => c.serialized_size(),
        }
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Chunk::Data(tsn, data) | Chunk::IData(tsn, data) => {
                let kind = if matches!(self, Chunk::Data(..)) { "DATA" } else { "I-DATA" };
                write!(
                    f,
                    "{}, tsn={}, stream_key={:?}, ssn={}, mid={}, fsn={}, ppid={}, length={}{}{}",
                    kind,
                    tsn,
                    data.stream_key,
                    data.ssn,
                    data.mid,
                    data.fsn,
                    data.ppid,
                    data.payload.len(),
                    if data.is_beginning { ", B" } else { "" },
                    if data.is_end { ", E" } else { "" },
                )
            }
            Chunk::Sack(c) => c.fmt(f),
            Chunk::ForwardTsn(c) => c.fmt(f),
            Chunk::IForwardTsn(c) => write!(f, "I-{}", c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::StreamId;
    use crate::testing::data_generator::DataGenerator;

    #[test]
    fn data_chunks_are_padded() {
        let mut g = DataGenerator::new(StreamId(1));
        assert_eq!(Chunk::Data(Tsn(1), g.ordered("abcde", "BE")).serialized_size(), 24);
        assert_eq!(Chunk::IData(Tsn(2), g.ordered("abcd", "BE")).serialized_size(), 24);
    }

    #[test]
    fn displays_data_chunk() {
        let mut g = DataGenerator::new(StreamId(1));
        let chunk = Chunk::Data(Tsn(1), g.ordered("abc", "BE"));
        assert_eq!(
            format!("{}", chunk),
            "DATA, tsn=1, stream_key=Ordered(1), ssn=0, mid=0, fsn=0, ppid=53, length=3, B, E"
        );
    }
}
