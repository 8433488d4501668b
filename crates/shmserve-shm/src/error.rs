use thiserror::Error;

use crate::{SlotId, SlotOwner};

pub type Result<T> = std::result::Result<T, ShmError>;

#[derive(Error, Debug)]
pub enum ShmError {
    /// No region with this name exists in the shm directory.
    #[error("shared region not found: {0}")]
    NotFound(String),

    #[error("invalid slot name: {0}")]
    InvalidName(String),

    /// Region exists but does not match the expected layout.
    #[error("layout mismatch: {0}")]
    Layout(String),

    /// A compare-and-swap on a slot tag saw a different owner or generation.
    #[error(
        "slot {slot} ownership conflict: expected {expected:?}@{generation}, found {found:?}@{found_generation}"
    )]
    Ownership {
        slot: SlotId,
        expected: SlotOwner,
        generation: u32,
        found: SlotOwner,
        found_generation: u32,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
