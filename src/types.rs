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

use crate::api::StreamId;
use std::cmp::Ordering;
use std::fmt;
use std::hash::Hash;
use std::hash::Hasher;
use std::marker::PhantomData;

/// Ordered/Unordered stream identifiers.
///
/// Ordered and unordered messages on the same stream use separate sequence spaces in most parts of
/// SCTP, even though the application only sees a single stream. `StreamKey` is used where the two
/// must be kept apart.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum StreamKey {
    Ordered(StreamId),
    Unordered(StreamId),
}

impl StreamKey {
    pub fn from(is_unordered: bool, id: StreamId) -> Self {
        match is_unordered {
            true => Self::Unordered(id),
            false => Self::Ordered(id),
        }
    }

    pub fn id(&self) -> StreamId {
        match *self {
            StreamKey::Ordered(id) | StreamKey::Unordered(id) => id,
        }
    }

    pub fn is_unordered(&self) -> bool {
        matches!(self, Self::Unordered(_))
    }
}

/// A sequence number as it appears on the wire, which wraps around at `MODULUS`.
///
/// Wrapped sequence numbers have no ordering. To compare them, they must first be converted into
/// their [`Unwrapped`] form using an [`Unwrapper`].
pub trait WrappingSequenceNumber: Copy + Eq {
    /// The number of distinct values, i.e. `2^bits`.
    const MODULUS: i64;

    fn to_raw(self) -> i64;
    fn from_raw(raw: i64) -> Self;
}

macro_rules! wrapping_sequence_number {
    ($(#[$meta:meta])* $name:ident, $inner:ty) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Eq, Hash, PartialEq)]
        pub struct $name(pub $inner);

        impl WrappingSequenceNumber for $name {
            const MODULUS: i64 = 1 << <$inner>::BITS;

            fn to_raw(self) -> i64 {
                self.0 as i64
            }

            fn from_raw(raw: i64) -> Self {
                $name(raw.rem_euclid(Self::MODULUS) as $inner)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(self, f)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::ops::Add<$inner> for $name {
            type Output = $name;

            #[inline]
            fn add(self, rhs: $inner) -> $name {
                $name(self.0.wrapping_add(rhs))
            }
        }

        impl std::ops::Sub<$inner> for $name {
            type Output = $name;

            #[inline]
            fn sub(self, rhs: $inner) -> $name {
                $name(self.0.wrapping_sub(rhs))
            }
        }

        impl std::ops::AddAssign<$inner> for $name {
            fn add_assign(&mut self, rhs: $inner) {
                self.0 = self.0.wrapping_add(rhs);
            }
        }
    };
}

wrapping_sequence_number!(
    /// Transmission Sequence Number (TSN), see
    /// <https://datatracker.ietf.org/doc/html/rfc9260#section-1.6>.
    Tsn,
    u32
);

wrapping_sequence_number!(
    /// Stream Sequence Number (SSN)
    Ssn,
    u16
);

wrapping_sequence_number!(
    /// Message Identifier (MID), see <https://datatracker.ietf.org/doc/html/rfc8260#section-2.1>.
    Mid,
    u32
);

/// Fragment Sequence Number (FSN)
///
/// The FSN restarts at zero for every message, and a single message can't carry enough fragments
/// to wrap around, so unlike the other sequence numbers it's ordered by its plain value.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Fsn(pub u32);

impl fmt::Debug for Fsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Fsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::ops::AddAssign<u32> for Fsn {
    fn add_assign(&mut self, rhs: u32) {
        self.0 = self.0.wrapping_add(rhs);
    }
}

/// A sequence number that has been extended to 64 bits, so that it never wraps in practice and can
/// be compared and ordered with the normal operators.
///
/// Created by [`Unwrapper::unwrap`], and converted back to the on-wire representation using
/// [`Unwrapped::wrap`].
pub struct Unwrapped<T> {
    value: i64,
    marker: PhantomData<T>,
}

pub type UnwrappedTsn = Unwrapped<Tsn>;
pub type UnwrappedSsn = Unwrapped<Ssn>;
pub type UnwrappedMid = Unwrapped<Mid>;

impl<T: WrappingSequenceNumber> Unwrapped<T> {
    pub(crate) const fn from_value(value: i64) -> Self {
        Self { value, marker: PhantomData }
    }

    /// Returns the unwrapped value that corresponds to `wrapped` in the first lap. Mainly useful
    /// as the starting point of a sequence.
    pub fn from_wrapped(wrapped: T) -> Self {
        Self::from_value(wrapped.to_raw())
    }

    pub fn wrap(&self) -> T {
        T::from_raw(self.value)
    }

    pub fn next_value(&self) -> Self {
        self.add_to(1)
    }

    pub fn prev_value(&self) -> Self {
        Self::from_value(self.value - 1)
    }

    pub fn add_to(&self, delta: u64) -> Self {
        Self::from_value(self.value + delta as i64)
    }

    pub fn distance_to(&self, other: Self) -> u64 {
        self.value.abs_diff(other.value)
    }

    /// Returns the value of `self` relative to `base`. Used when encoding offsets such as
    /// gap-ack-block boundaries.
    pub fn offset_from(&self, base: Self) -> i64 {
        self.value - base.value
    }
}

impl<T> Clone for Unwrapped<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Unwrapped<T> {}

impl<T> PartialEq for Unwrapped<T> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl<T> Eq for Unwrapped<T> {}

impl<T> PartialOrd for Unwrapped<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Unwrapped<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value.cmp(&other.value)
    }
}

impl<T> Hash for Unwrapped<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

impl<T: WrappingSequenceNumber + fmt::Display> fmt::Debug for Unwrapped<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl<T: WrappingSequenceNumber + fmt::Display> fmt::Display for Unwrapped<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.wrap(), f)
    }
}

/// Converts wrapped sequence numbers into [`Unwrapped`] ones.
///
/// A newly observed value is resolved to the unwrapped value that is closest to the previously
/// unwrapped one. A forward distance of less than half the sequence number space is interpreted as
/// moving forward, anything else as moving backwards (possibly across a wrap-around).
///
/// Values must be unwrapped in roughly the order they were generated for this to be correct.
pub struct Unwrapper<T> {
    last: Option<Unwrapped<T>>,
}

pub type TsnUnwrapper = Unwrapper<Tsn>;
pub type SsnUnwrapper = Unwrapper<Ssn>;
pub type MidUnwrapper = Unwrapper<Mid>;

impl<T: WrappingSequenceNumber> Default for Unwrapper<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: WrappingSequenceNumber> Unwrapper<T> {
    pub fn new() -> Self {
        Self { last: None }
    }

    /// Unwraps `wrapped` and uses the result as reference for future calls.
    pub fn unwrap(&mut self, wrapped: T) -> Unwrapped<T> {
        let unwrapped = self.peek_unwrap(wrapped);
        self.last = Some(unwrapped);
        unwrapped
    }

    /// Unwraps `wrapped` without modifying the reference.
    pub fn peek_unwrap(&self, wrapped: T) -> Unwrapped<T> {
        let Some(last) = self.last else {
            return Unwrapped::from_wrapped(wrapped);
        };
        let delta = (wrapped.to_raw() - last.wrap().to_raw()).rem_euclid(T::MODULUS);
        if delta < T::MODULUS / 2 {
            Unwrapped::from_value(last.value + delta)
        } else {
            Unwrapped::from_value(last.value + delta - T::MODULUS)
        }
    }

    /// Forgets the reference, so that the next value will be unwrapped as if it were the first.
    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// An ID for every outgoing message, to correlate outgoing data chunks with the message it was
/// carved from. It can only be compared by equality - there is no defined ordering.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct OutgoingMessageId(pub u32);

impl fmt::Debug for OutgoingMessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for OutgoingMessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::ops::AddAssign<u32> for OutgoingMessageId {
    fn add_assign(&mut self, rhs: u32) {
        self.0 = self.0.wrapping_add(rhs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX_U32: u32 = u32::MAX;
    const MAX_U16: u16 = u16::MAX;

    #[test]
    fn wrapped_arithmetic_wraps_around() {
        assert_eq!(Tsn(MAX_U32) + 1, Tsn(0));
        assert_eq!(Tsn(0) - 1, Tsn(MAX_U32));
        assert_eq!(Ssn(MAX_U16) + 2, Ssn(1));

        let mut mid = Mid(MAX_U32 - 1);
        mid += 1;
        assert_eq!(mid, Mid(MAX_U32));
        mid += 1;
        assert_eq!(mid, Mid(0));
    }

    #[test]
    fn first_value_is_taken_as_is() {
        let mut unwrapper = TsnUnwrapper::new();
        let tsn = unwrapper.unwrap(Tsn(42));
        assert_eq!(tsn, UnwrappedTsn::from_wrapped(Tsn(42)));
        assert_eq!(tsn.wrap(), Tsn(42));
    }

    #[test]
    fn unwraps_forward_across_wrap_around() {
        let mut unwrapper = TsnUnwrapper::new();
        let a = unwrapper.unwrap(Tsn(MAX_U32 - 1));
        let b = unwrapper.unwrap(Tsn(MAX_U32));
        let c = unwrapper.unwrap(Tsn(0));
        let d = unwrapper.unwrap(Tsn(1));

        assert!(a < b);
        assert!(b < c);
        assert!(c < d);
        assert_eq!(a.distance_to(d), 3);
        assert_eq!(c.wrap(), Tsn(0));
        assert_eq!(d.wrap(), Tsn(1));
    }

    #[test]
    fn unwraps_backwards_across_wrap_around() {
        let mut unwrapper = SsnUnwrapper::new();
        let a = unwrapper.unwrap(Ssn(2));
        let b = unwrapper.unwrap(Ssn(MAX_U16));

        assert!(b < a);
        assert_eq!(b.distance_to(a), 3);
        assert_eq!(b.wrap(), Ssn(MAX_U16));
    }

    #[test]
    fn large_forward_jump_is_interpreted_as_negative() {
        let mut unwrapper = SsnUnwrapper::new();
        let a = unwrapper.unwrap(Ssn(10));
        let b = unwrapper.unwrap(Ssn(10 + 0x7fff));
        let c = unwrapper.unwrap(Ssn(10));
        let d = unwrapper.unwrap(Ssn(10 + 0x8000));

        assert!(b > a);
        assert_eq!(c, a);
        assert!(d < c);
        assert_eq!(d.distance_to(c), 0x8000);
    }

    #[test]
    fn peek_unwrap_does_not_update_reference() {
        let mut unwrapper = MidUnwrapper::new();
        unwrapper.unwrap(Mid(MAX_U32));
        let peeked = unwrapper.peek_unwrap(Mid(1));
        assert_eq!(peeked.wrap(), Mid(1));

        // Still relative to MAX_U32, which means that a value just below it is backwards.
        let back = unwrapper.peek_unwrap(Mid(MAX_U32 - 10));
        assert!(back < peeked);
        assert_eq!(unwrapper.unwrap(Mid(1)), peeked);
    }

    #[test]
    fn reset_forgets_the_reference() {
        let mut unwrapper = TsnUnwrapper::new();
        unwrapper.unwrap(Tsn(MAX_U32));
        let wrapped_once = unwrapper.unwrap(Tsn(5));
        unwrapper.reset();
        let fresh = unwrapper.unwrap(Tsn(5));

        assert_eq!(fresh.wrap(), wrapped_once.wrap());
        assert!(fresh < wrapped_once);
    }

    #[test]
    fn keeps_ordering_over_several_laps() {
        let mut unwrapper = SsnUnwrapper::new();
        let mut previous = unwrapper.unwrap(Ssn(0));
        let mut ssn = Ssn(0);
        for _ in 0..(3 * 65536 / 1000) {
            ssn = ssn + 1000;
            let next = unwrapper.unwrap(ssn);
            assert!(next > previous);
            assert_eq!(previous.distance_to(next), 1000);
            previous = next;
        }
    }

    #[test]
    fn unwrapped_helpers() {
        let tsn = UnwrappedTsn::from_wrapped(Tsn(MAX_U32));
        assert_eq!(tsn.next_value().wrap(), Tsn(0));
        assert_eq!(tsn.add_to(3).wrap(), Tsn(2));
        assert_eq!(tsn.add_to(3).prev_value(), tsn.add_to(2));
        assert_eq!(tsn.add_to(3).offset_from(tsn), 3);
        assert_eq!(format!("{}", tsn.next_value()), "0");
    }

    #[test]
    fn stream_key_accessors() {
        let key = StreamKey::from(true, StreamId(3));
        assert_eq!(key, StreamKey::Unordered(StreamId(3)));
        assert!(key.is_unordered());
        assert_eq!(key.id(), StreamId(3));
        assert!(!StreamKey::from(false, StreamId(3)).is_unordered());
    }
}
