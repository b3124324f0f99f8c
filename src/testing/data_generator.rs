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
use crate::packet::data::Data;
use crate::types::Fsn;
use crate::types::Mid;
use crate::types::Ssn;
use crate::types::StreamKey;

/// Creates fragments for a single stream, with flags given as a string where "B" marks the
/// beginning and "E" the end of a message. Messages are numbered (SSN and MID) in the order their
/// first fragment is created.
pub struct DataGenerator {
    stream_id: StreamId,
    next_mid: Mid,
    current_mid: Mid,
    fsn: Fsn,
}

impl DataGenerator {
    pub fn new(stream_id: StreamId) -> Self {
        DataGenerator { stream_id, next_mid: Mid(0), current_mid: Mid(0), fsn: Fsn(0) }
    }

    pub fn ordered(&mut self, payload: &str, flags: &str) -> Data {
        self.make(false, payload, flags, None)
    }

    pub fn unordered(&mut self, payload: &str, flags: &str) -> Data {
        self.make(true, payload, flags, None)
    }

    /// Like [`Self::ordered`], but with an explicit MID (and SSN), for creating messages out of
    /// order. The FSN continues from the previous fragment unless "B" is given.
    pub fn ordered_with_mid(&mut self, payload: &str, flags: &str, mid: Mid) -> Data {
        self.make(false, payload, flags, Some(mid))
    }

    pub fn unordered_with_mid(&mut self, payload: &str, flags: &str, mid: Mid) -> Data {
        self.make(true, payload, flags, Some(mid))
    }

    fn make(&mut self, unordered: bool, payload: &str, flags: &str, mid: Option<Mid>) -> Data {
        let is_beginning = flags.contains('B');
        let is_end = flags.contains('E');
        if is_beginning {
            self.fsn = Fsn(0);
            self.current_mid = mid.unwrap_or(self.next_mid);
            self.next_mid = self.current_mid + 1;
        } else {
            self.fsn += 1;
            if let Some(mid) = mid {
                self.current_mid = mid;
            }
        }
        Data {
            stream_key: StreamKey::from(unordered, self.stream_id),
            ssn: if unordered { Ssn(0) } else { Ssn(self.current_mid.0 as u16) },
            mid: self.current_mid,
            fsn: self.fsn,
            ppid: PpId(53),
            payload: payload.as_bytes().to_vec(),
            is_beginning,
            is_end,
        }
    }
}
