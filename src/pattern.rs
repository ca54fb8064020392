//! Pattern content: charts, rounds and the stitches inside them.
//!
//! A chart owns a dense, 1-based sequence of rounds plus the progress cursor
//! used while knitting it. Round numbers are kept contiguous by every
//! operation here; nothing outside this module renumbers rounds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// A single stitch instruction, e.g. `k` x 4.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StitchInfo {
    pub id: String,
    /// Stitch abbreviation ("k", "p", "yo", "k2tog", ...)
    pub kind: String,
    pub count: u32,
}

impl StitchInfo {
    pub fn new(kind: impl Into<String>, count: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: kind.into(),
            count,
        }
    }
}

/// A bracketed run of stitches worked `repeat` times.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StitchGroup {
    pub id: String,
    pub stitches: Vec<StitchInfo>,
    /// Always at least 1.
    #[serde(deserialize_with = "at_least_once")]
    pub repeat: u32,
}

fn at_least_once<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    Ok(u32::deserialize(deserializer)?.max(1))
}

impl StitchGroup {
    pub fn new(stitches: Vec<StitchInfo>, repeat: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            stitches,
            repeat: repeat.max(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PatternItem {
    Stitch(StitchInfo),
    Group(StitchGroup),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Round {
    pub id: String,
    /// 1-based position within the owning chart.
    pub number: u32,
    #[serde(default)]
    pub stitches: Vec<PatternItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Round {
    pub fn new(number: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            number,
            stitches: Vec::new(),
            notes: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chart {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub rounds: Vec<Round>,
    /// Progress cursor, 1-based. Stays at 1 for an empty chart.
    #[serde(default = "first_round")]
    pub current_round: u32,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

fn first_round() -> u32 {
    1
}

impl Chart {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            rounds: Vec::new(),
            current_round: 1,
            created_at: now,
            last_modified: now,
        }
    }

    /// Wrap an existing round list, normalising its numbering.
    pub fn from_rounds(name: impl Into<String>, rounds: Vec<Round>, current_round: u32) -> Self {
        let mut chart = Self::new(name);
        chart.rounds = rounds;
        chart.renumber();
        chart.current_round = current_round;
        chart.clamp_cursor();
        chart
    }

    /// Append an empty round and return its number.
    pub fn add_round(&mut self) -> u32 {
        let number = self.rounds.len() as u32 + 1;
        self.rounds.push(Round::new(number));
        self.last_modified = Utc::now();
        number
    }

    pub fn round(&self, number: u32) -> Option<&Round> {
        self.rounds.iter().find(|r| r.number == number)
    }

    /// Delete round `number`, shift every later round down by one and keep
    /// the progress cursor on a valid round. Returns the removed round.
    pub fn delete_round(&mut self, number: u32) -> Option<Round> {
        let index = self.rounds.iter().position(|r| r.number == number)?;
        let removed = self.rounds.remove(index);

        for round in self.rounds.iter_mut().filter(|r| r.number > number) {
            round.number -= 1;
        }
        if self.current_round > number {
            self.current_round -= 1;
        }
        self.clamp_cursor();
        self.last_modified = Utc::now();
        Some(removed)
    }

    /// Move the cursor forward; stops at the last round.
    pub fn advance(&mut self) -> u32 {
        if (self.current_round as usize) < self.rounds.len() {
            self.current_round += 1;
            self.last_modified = Utc::now();
        }
        self.current_round
    }

    /// Move the cursor back; stops at round 1.
    pub fn retreat(&mut self) -> u32 {
        if self.current_round > 1 {
            self.current_round -= 1;
            self.last_modified = Utc::now();
        }
        self.current_round
    }

    fn renumber(&mut self) {
        self.rounds.sort_by_key(|r| r.number);
        for (i, round) in self.rounds.iter_mut().enumerate() {
            round.number = i as u32 + 1;
        }
    }

    fn clamp_cursor(&mut self) {
        let last = (self.rounds.len() as u32).max(1);
        self.current_round = self.current_round.clamp(1, last);
    }
}
