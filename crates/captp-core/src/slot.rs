use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// What a slot names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SlotKind {
    /// A remotable object (`o`).
    Object,
    /// A pending result exported or imported as such (`p`).
    Promise,
    /// The result of a call (`q`).
    Question,
    /// An object eligible for synchronous trap calls (`t`).
    Trap,
}

impl SlotKind {
    pub fn sigil(self) -> char {
        match self {
            SlotKind::Object => 'o',
            SlotKind::Promise => 'p',
            SlotKind::Question => 'q',
            SlotKind::Trap => 't',
        }
    }

    fn from_sigil(c: char) -> Option<Self> {
        match c {
            'o' => Some(SlotKind::Object),
            'p' => Some(SlotKind::Promise),
            'q' => Some(SlotKind::Question),
            't' => Some(SlotKind::Trap),
            _ => None,
        }
    }
}

/// Which side allocated (and hosts) the thing a slot names, from the point
/// of view of whoever holds the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    /// `+`: hosted here.
    Local,
    /// `-`: hosted by the peer.
    Remote,
}

impl Direction {
    pub fn sign(self) -> char {
        match self {
            Direction::Local => '+',
            Direction::Remote => '-',
        }
    }

    pub fn flip(self) -> Self {
        match self {
            Direction::Local => Direction::Remote,
            Direction::Remote => Direction::Local,
        }
    }
}

/// A slot identifier, rendered on the wire as `<kind><direction><number>`,
/// e.g. `o+3` or `q-12`.
///
/// Both peers number from 1 in every space. Every slot received from the
/// peer is [flipped](Slot::flip) before it is looked up, so our `o+3` and
/// the peer's `o+3` never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Slot {
    kind: SlotKind,
    direction: Direction,
    number: u64,
}

impl Slot {
    pub const fn new(kind: SlotKind, direction: Direction, number: u64) -> Self {
        Self {
            kind,
            direction,
            number,
        }
    }

    pub const fn local(kind: SlotKind, number: u64) -> Self {
        Self::new(kind, Direction::Local, number)
    }

    pub const fn remote(kind: SlotKind, number: u64) -> Self {
        Self::new(kind, Direction::Remote, number)
    }

    pub fn kind(&self) -> SlotKind {
        self.kind
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn is_local(&self) -> bool {
        self.direction == Direction::Local
    }

    pub fn is_remote(&self) -> bool {
        self.direction == Direction::Remote
    }

    /// The same slot as seen from the other side of the connection.
    #[must_use]
    pub fn flip(self) -> Self {
        Self {
            direction: self.direction.flip(),
            ..self
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            self.kind.sigil(),
            self.direction.sign(),
            self.number
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SlotParseError {
    #[error("slot is too short: {0:?}")]
    TooShort(String),
    #[error("unknown slot kind {kind:?} in {slot:?}")]
    UnknownKind { slot: String, kind: char },
    #[error("unknown slot direction {direction:?} in {slot:?}")]
    UnknownDirection { slot: String, direction: char },
    #[error("invalid slot number in {0:?}")]
    InvalidNumber(String),
}

impl FromStr for Slot {
    type Err = SlotParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        let (Some(k), Some(d)) = (chars.next(), chars.next()) else {
            return Err(SlotParseError::TooShort(s.to_owned()));
        };
        let kind = SlotKind::from_sigil(k).ok_or_else(|| SlotParseError::UnknownKind {
            slot: s.to_owned(),
            kind: k,
        })?;
        let direction = match d {
            '+' => Direction::Local,
            '-' => Direction::Remote,
            other => {
                return Err(SlotParseError::UnknownDirection {
                    slot: s.to_owned(),
                    direction: other,
                });
            }
        };
        let digits = chars.as_str();
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(SlotParseError::InvalidNumber(s.to_owned()));
        }
        let number = digits
            .parse()
            .map_err(|_| SlotParseError::InvalidNumber(s.to_owned()))?;
        Ok(Slot::new(kind, direction, number))
    }
}

impl Serialize for Slot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Slot {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
