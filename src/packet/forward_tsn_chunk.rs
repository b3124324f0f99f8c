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

use crate::packet::SkippedStream;
use crate::types::Tsn;
use std::fmt;

/// The content of a FORWARD-TSN chunk (RFC 3758) or an I-FORWARD-TSN chunk (RFC 8260).
///
/// Which one it is follows from the variant of [`SkippedStream`] being used, and from whether it's
/// carried as [`crate::packet::chunk::Chunk::ForwardTsn`] or
/// [`crate::packet::chunk::Chunk::IForwardTsn`].
#[derive(Clone, Debug, PartialEq)]
pub struct ForwardTsnChunk {
    pub new_cumulative_tsn: Tsn,
    pub skipped_streams: Vec<SkippedStream>,
}

impl ForwardTsnChunk {
    /// The size of this chunk when serialized. Each skipped stream takes four bytes in a
    /// FORWARD-TSN and eight bytes in an I-FORWARD-TSN.
    pub fn serialized_size(&self) -> usize {
        let per_stream: usize = self
            .skipped_streams
            .iter()
            .map(|s| match s {
                SkippedStream::ForwardTsn(..) => 4,
                SkippedStream::IForwardTsn(..) => 8,
            })
            .sum();
        8 + per_stream
    }
}

impl fmt::Display for ForwardTsnChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FORWARD-TSN, new_cumulative_tsn={}", self.new_cumulative_tsn)?;
        for skipped in &self.skipped_streams {
            match skipped {
                SkippedStream::ForwardTsn(stream_id, ssn) => {
                    write!(f, ", skip={}:{}", stream_id, ssn)?
                }
                SkippedStream::IForwardTsn(key, mid) => {
                    let u = if key.is_unordered() { "U" } else { "" };
                    write!(f, ", skip={}{}:{}", key.id(), u, mid)?
                }
            }
        }
        Ok(())
    }
}
