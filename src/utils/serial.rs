//! Configure serials
//!
//! Serials are 32-bit and wrap around. Two serials are ordered by the shortest distance between
//! them on the wrapping circle, so a serial handed out right after the wrap still compares as
//! newer than the ones before it. Serials exactly half the circle apart fall back to their
//! numeric order.

use std::cmp::Ordering;

/// A wrap-aware serial
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Serial(pub(crate) u32);

impl PartialOrd for Serial {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        // forward distance from `other` to `self`
        let ahead = self.0.wrapping_sub(other.0);
        Some(match ahead {
            0 => Ordering::Equal,
            1..=0x7fff_ffff => Ordering::Greater,
            0x8000_0000 => self.0.cmp(&other.0),
            _ => Ordering::Less,
        })
    }
}

impl From<u32> for Serial {
    fn from(n: u32) -> Self {
        Serial(n)
    }
}

impl From<Serial> for u32 {
    fn from(serial: Serial) -> u32 {
        serial.0
    }
}

impl Serial {
    /// Whether this serial was handed out at the same time as or after `other`
    pub fn is_no_older_than(&self, other: &Serial) -> bool {
        self >= other
    }
}

/// Source of serials for one configure sequence
///
/// Starts at 1 and never hands out 0, which clients may use as "no serial".
#[derive(Debug, Clone)]
pub struct SerialCounter {
    next: u32,
}

impl Default for SerialCounter {
    fn default() -> Self {
        SerialCounter::new()
    }
}

impl SerialCounter {
    /// A counter whose first serial is 1
    pub const fn new() -> SerialCounter {
        SerialCounter { next: 1 }
    }

    /// Hand out the next serial
    pub fn next_serial(&mut self) -> Serial {
        if self.next == 0 {
            self.next = 1;
        }
        let serial = Serial(self.next);
        self.next = self.next.wrapping_add(1);
        serial
    }
}
