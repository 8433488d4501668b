use std::fmt;

use crate::{Result, ShmError};

const INPUT_PREFIX: &str = "input";
const OUTPUT_PREFIX: &str = "output";

/// Index of a slot in the arena, in `[0, slots)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub u32);

impl SlotId {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn input_name(self) -> String {
        format!("{INPUT_PREFIX}{}", self.0)
    }

    pub fn output_name(self) -> String {
        format!("{OUTPUT_PREFIX}{}", self.0)
    }

    /// Parses an `input<i>` / `output<i>` pair and checks both name the same slot.
    pub fn from_names(input: &str, output: &str) -> Result<Self> {
        let a = parse_index(input, INPUT_PREFIX)?;
        let b = parse_index(output, OUTPUT_PREFIX)?;
        if a != b {
            return Err(ShmError::InvalidName(format!(
                "{input} and {output} belong to different slots"
            )));
        }
        Ok(SlotId(a))
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn parse_index(name: &str, prefix: &str) -> Result<u32> {
    name.strip_prefix(prefix)
        .filter(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|rest| rest.parse().ok())
        .ok_or_else(|| ShmError::InvalidName(name.to_string()))
}

/// Who may touch a slot's buffers right now.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotOwner {
    Free = 0,
    Handler = 1,
    Worker = 2,
}

impl SlotOwner {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(SlotOwner::Free),
            1 => Some(SlotOwner::Handler),
            2 => Some(SlotOwner::Worker),
            _ => None,
        }
    }

    /// Protocol-level state implied by the owner tag.
    pub fn state(self) -> SlotState {
        match self {
            SlotOwner::Free => SlotState::Free,
            SlotOwner::Handler => SlotState::Acquired,
            SlotOwner::Worker => SlotState::InFlight,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Acquired,
    InFlight,
}

/// Owner and generation packed into one word so both move in a single CAS.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotTag {
    pub generation: u32,
    pub owner: SlotOwner,
}

impl SlotTag {
    pub fn pack(self) -> u64 {
        (u64::from(self.generation) << 32) | self.owner as u64
    }

    pub fn unpack(raw: u64) -> Self {
        let generation = (raw >> 32) as u32;
        // Unknown owner bits can only come from a foreign writer; treat as Free.
        let owner = SlotOwner::from_u32(raw as u32).unwrap_or(SlotOwner::Free);
        Self { generation, owner }
    }
}
