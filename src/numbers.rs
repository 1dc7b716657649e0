use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::config::{NumberConfig, NumberKind};
use crate::mp3::SoundIndex;

/// Longest number the phone will collect.
pub const MAX_NUMBER_LENGTH: usize = 10;

/// One slot of a configured number pattern.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Slot {
    /// Matches exactly one digit value.
    Digit(u8),
    /// Matches any single digit.
    Any,
}

impl Slot {
    #[inline]
    fn matches(self, digit: u8) -> bool {
        match self {
            Slot::Digit(d) => d == digit,
            Slot::Any => true,
        }
    }
}

/// A recognized phone number and its answer behavior.
#[derive(Clone, Debug)]
pub struct NumberEntry {
    pub digits: Vec<Slot>,
    pub sound: SoundIndex,
    pub playback_duration: Duration,
    pub pre_ring_delay: Duration,
    pub ring_jitter: Duration,
    pub kind: NumberKind,
    pub hold_after_playback: bool,
}

impl NumberEntry {
    /// Whether the fully dialed sequence matches this entry. Lengths must be
    /// equal; wildcard slots accept any digit.
    fn matches(&self, dialed: &[u8]) -> bool {
        self.digits.len() == dialed.len()
            && self.digits.iter().zip(dialed).all(|(slot, &d)| slot.matches(d))
    }

    /// Whether some longer dial starting with `dialed` could still match this entry.
    fn prefix_compatible(&self, dialed: &[u8]) -> bool {
        self.digits.len() > dialed.len()
            && self.digits.iter().zip(dialed).all(|(slot, &d)| slot.matches(d))
    }
}

impl fmt::Display for NumberEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for slot in &self.digits {
            match slot {
                Slot::Digit(d) => write!(f, "{}", d)?,
                Slot::Any => f.write_str("?")?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum TableError {
    #[error("number {row} is empty")]
    Empty { row: usize },
    #[error("number {row} has {len} digits; the maximum is {}", MAX_NUMBER_LENGTH)]
    TooLong { row: usize, len: usize },
    #[error("number {row} contains invalid character '{ch}'")]
    BadDigit { row: usize, ch: char },
    #[error("numbers {first} and {second} are both marked volume-admin")]
    DuplicateAdmin { first: usize, second: usize },
}

/// Result of matching the dialed digits against the table.
#[derive(Debug)]
pub enum MatchResult<'a> {
    /// The dialed sequence matches this entry.
    Matched(usize, &'a NumberEntry),
    /// No entry matches yet, but a longer dial still could.
    Partial,
    /// No entry can match any extension of the dialed sequence.
    NoMatch,
}

/// The table of recognized numbers. Row order encodes precedence and is
/// never reordered here; whoever writes the table keeps specific rows ahead
/// of the wildcard rows that shadow them.
#[derive(Debug)]
pub struct NumberTable {
    entries: Vec<NumberEntry>,
}

impl NumberTable {
    /// Builds and validates the table from its config rows.
    pub fn from_config(rows: &[NumberConfig]) -> Result<Self, TableError> {
        let mut entries = Vec::with_capacity(rows.len());
        let mut admin: Option<usize> = None;
        for (row, cfg) in rows.iter().enumerate() {
            if cfg.digits.is_empty() {
                return Err(TableError::Empty { row });
            }
            let len = cfg.digits.chars().count();
            if len > MAX_NUMBER_LENGTH {
                return Err(TableError::TooLong { row, len });
            }
            let mut digits = Vec::with_capacity(len);
            for ch in cfg.digits.chars() {
                let slot = match ch {
                    '0'..='9' => Slot::Digit(ch as u8 - b'0'),
                    '?' => Slot::Any,
                    _ => return Err(TableError::BadDigit { row, ch }),
                };
                digits.push(slot);
            }
            if cfg.kind == NumberKind::VolumeAdmin {
                if let Some(first) = admin {
                    return Err(TableError::DuplicateAdmin { first, second: row });
                }
                admin = Some(row);
            }
            entries.push(NumberEntry {
                digits,
                sound: cfg.sound,
                playback_duration: Duration::from_millis(cfg.playback_duration_ms),
                pre_ring_delay: Duration::from_millis(cfg.pre_ring_delay_ms),
                ring_jitter: Duration::from_millis(cfg.ring_jitter_ms),
                kind: cfg.kind,
                hold_after_playback: cfg.hold_after_playback,
            });
        }
        Ok(Self { entries })
    }

    pub fn get(&self, index: usize) -> &NumberEntry {
        &self.entries[index]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First-match-wins lookup over the dialed digits; row order is the
    /// tie-break when several rows cover the same number.
    pub fn lookup(&self, dialed: &[u8]) -> MatchResult<'_> {
        let mut extendable = false;
        for (index, entry) in self.entries.iter().enumerate() {
            if entry.matches(dialed) {
                return MatchResult::Matched(index, entry);
            }
            extendable |= entry.prefix_compatible(dialed);
        }
        if extendable {
            MatchResult::Partial
        } else {
            MatchResult::NoMatch
        }
    }
}
