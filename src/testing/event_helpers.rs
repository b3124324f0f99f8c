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

use crate::api::SocketEvent;
use crate::EventSink;

macro_rules! expect_event_0 {
    ($event:expr, $variant:ident) => {
        match $event {
            Some($crate::api::SocketEvent::$variant()) => {}
            other => panic!("Expected {}, got {:?}", stringify!($variant), other),
        }
    };
}

macro_rules! expect_event_1 {
    ($event:expr, $variant:ident) => {
        match $event {
            Some($crate::api::SocketEvent::$variant(value)) => value,
            other => panic!("Expected {}, got {:?}", stringify!($variant), other),
        }
    };
}

/// Matches events carrying an [`crate::api::ErrorKind`] and a message, returning the kind.
macro_rules! expect_event_kind {
    ($event:expr, $variant:ident) => {
        match $event {
            Some($crate::api::SocketEvent::$variant(kind, _)) => kind,
            other => panic!("Expected {}, got {:?}", stringify!($variant), other),
        }
    };
}

macro_rules! expect_buffered_amount_low {
    ($event:expr) => {
        $crate::testing::event_helpers::expect_event_1!($event, OnBufferedAmountLow)
    };
}

macro_rules! expect_total_buffered_amount_low {
    ($event:expr) => {
        $crate::testing::event_helpers::expect_event_0!($event, OnTotalBufferedAmountLow)
    };
}

macro_rules! expect_on_lifecycle_message_fully_sent {
    ($event:expr) => {
        $crate::testing::event_helpers::expect_event_1!($event, OnLifecycleMessageFullySent)
    };
}

macro_rules! expect_on_lifecycle_message_expired {
    ($event:expr) => {
        $crate::testing::event_helpers::expect_event_1!($event, OnLifecycleMessageExpired)
    };
}

macro_rules! expect_on_lifecycle_message_maybe_expired {
    ($event:expr) => {
        $crate::testing::event_helpers::expect_event_1!($event, OnLifecycleMessageMaybeExpired)
    };
}

macro_rules! expect_on_lifecycle_message_delivered {
    ($event:expr) => {
        $crate::testing::event_helpers::expect_event_1!($event, OnLifecycleMessageDelivered)
    };
}

macro_rules! expect_on_lifecycle_end {
    ($event:expr) => {
        $crate::testing::event_helpers::expect_event_1!($event, OnLifecycleEnd)
    };
}

macro_rules! expect_on_incoming_stream_reset {
    ($event:expr) => {
        $crate::testing::event_helpers::expect_event_1!($event, OnIncomingStreamReset)
    };
}

macro_rules! expect_on_error {
    ($event:expr) => {
        $crate::testing::event_helpers::expect_event_kind!($event, OnError)
    };
}

macro_rules! expect_on_aborted {
    ($event:expr) => {
        $crate::testing::event_helpers::expect_event_kind!($event, OnAborted)
    };
}

macro_rules! expect_no_event {
    ($event:expr) => {
        if let Some(e) = $event {
            panic!("Expected no event, got {:?}", e);
        }
    };
}

/// Drains all queued events.
pub fn drain_events(sink: &mut dyn EventSink) -> Vec<SocketEvent> {
    std::iter::from_fn(|| sink.next_event()).collect()
}

#[allow(unused_imports)]
pub(crate) use expect_buffered_amount_low;
pub(crate) use expect_event_0;
pub(crate) use expect_event_1;
pub(crate) use expect_event_kind;
pub(crate) use expect_no_event;
#[allow(unused_imports)]
pub(crate) use expect_on_aborted;
#[allow(unused_imports)]
pub(crate) use expect_on_error;
#[allow(unused_imports)]
pub(crate) use expect_on_incoming_stream_reset;
#[allow(unused_imports)]
pub(crate) use expect_on_lifecycle_end;
#[allow(unused_imports)]
pub(crate) use expect_on_lifecycle_message_delivered;
#[allow(unused_imports)]
pub(crate) use expect_on_lifecycle_message_expired;
#[allow(unused_imports)]
pub(crate) use expect_on_lifecycle_message_fully_sent;
#[allow(unused_imports)]
pub(crate) use expect_on_lifecycle_message_maybe_expired;
#[allow(unused_imports)]
pub(crate) use expect_total_buffered_amount_low;
