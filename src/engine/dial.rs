use std::time::{Duration, Instant};
use log::trace;

use crate::numbers::MAX_NUMBER_LENGTH;

/// Collects keypad digits into a candidate number, rejecting switch bounce.
pub struct DialAccumulator {
    digits: Vec<u8>,
    debounce: Duration,
    last_accept: Option<Instant>,
}

impl DialAccumulator {
    pub fn new(debounce: Duration) -> Self {
        Self {
            digits: Vec::with_capacity(MAX_NUMBER_LENGTH),
            debounce,
            last_accept: None,
        }
    }

    /// Offers a digit to the accumulator. Returns `true` if it was accepted.
    ///
    /// A digit arriving sooner than the debounce interval after the previous
    /// accepted one is bounce from a single physical press and is dropped, as
    /// is any digit past the maximum number length.
    pub fn accept(&mut self, digit: u8, now: Instant) -> bool {
        if let Some(last) = self.last_accept {
            if now.saturating_duration_since(last) < self.debounce {
                trace!("Discarded bounced digit {}", digit);
                return false;
            }
        }
        if self.digits.len() >= MAX_NUMBER_LENGTH {
            trace!("Discarded digit {}; number is already full", digit);
            return false;
        }
        self.digits.push(digit);
        self.last_accept = Some(now);
        true
    }

    pub fn digits(&self) -> &[u8] {
        &self.digits
    }

    pub fn len(&self) -> usize {
        self.digits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digits.is_empty()
    }

    /// Time of the most recent accepted digit.
    pub fn last_accept(&self) -> Option<Instant> {
        self.last_accept
    }

    /// Clears the dialed digits. Bounce tracking survives the reset so a
    /// bouncing contact can't sneak a digit in right after.
    pub fn reset(&mut self) {
        self.digits.clear();
    }
}
