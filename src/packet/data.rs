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

use crate::api::PpId;
use crate::api::StreamId;
use crate::types::Fsn;
use crate::types::Mid;
use crate::types::Ssn;
use crate::types::StreamKey;

/// A message fragment, as carried by either a DATA or an I-DATA chunk.
///
/// It's the union of what both chunk types can carry. Traditional streams use `ssn`, while
/// interleaved streams use `mid` and `fsn`. The TSN is not part of the fragment, as it's only
/// assigned when the fragment is sent, and is passed alongside it instead.
#[derive(Clone, Debug, PartialEq)]
pub struct Data {
    pub stream_key: StreamKey,
    pub ssn: Ssn,
    pub mid: Mid,
    pub fsn: Fsn,
    pub ppid: PpId,
    pub payload: Vec<u8>,
    pub is_beginning: bool,
    pub is_end: bool,
}

impl Data {
    pub fn stream_id(&self) -> StreamId {
        self.stream_key.id()
    }

    pub fn is_unordered(&self) -> bool {
        self.stream_key.is_unordered()
    }
}

impl Default for Data {
    fn default() -> Self {
        Self {
            stream_key: StreamKey::Ordered(StreamId(0)),
            ssn: Ssn(0),
            mid: Mid(0),
            fsn: Fsn(0),
            ppid: PpId(0),
            payload: Vec::new(),
            is_beginning: false,
            is_end: false,
        }
    }
}
