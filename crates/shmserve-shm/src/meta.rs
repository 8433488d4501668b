//! Shared slot ownership table.
//!
//! ```text
//! slots.meta
//! ├── header (64 bytes)
//! │   ├── magic: u64
//! │   ├── version: u32
//! │   ├── slots: u32
//! │   ├── input_bytes: u64
//! │   └── output_bytes: u64
//! └── tags[slots]: AtomicU64   generation << 32 | owner
//! ```
//!
//! The manager, every handler and every worker map the same file, so an owner
//! change made by one process is visible to all of them. Transitions are CAS
//! on the whole tag; a stale generation always fails.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::{
    ArenaLayout, Result, ShmError, SharedRegion, SlotId, SlotOwner, SlotState, SlotTag,
};

pub const META_NAME: &str = "slots.meta";

const META_MAGIC: u64 = 0x5348_4D53_4C4F_5453; // "SHMSLOTS"
const META_VERSION: u32 = 1;
const HEADER_LEN: usize = 64;

#[repr(C)]
struct MetaHeader {
    magic: u64,
    version: u32,
    slots: u32,
    input_bytes: u64,
    output_bytes: u64,
}

const _: () = assert!(std::mem::size_of::<MetaHeader>() <= HEADER_LEN);

pub struct SlotMetaTable {
    region: SharedRegion,
    layout: ArenaLayout,
}

impl SlotMetaTable {
    pub(crate) fn create(dir: &Path, layout: ArenaLayout) -> Result<Self> {
        let len = HEADER_LEN + layout.slots as usize * std::mem::size_of::<u64>();
        let mut region = SharedRegion::create(dir, META_NAME, len)?;

        let header = MetaHeader {
            magic: META_MAGIC,
            version: META_VERSION,
            slots: layout.slots,
            input_bytes: layout.input_bytes as u64,
            output_bytes: layout.output_bytes as u64,
        };
        let bytes = region.as_bytes_mut();
        bytes[0..8].copy_from_slice(&header.magic.to_le_bytes());
        bytes[8..12].copy_from_slice(&header.version.to_le_bytes());
        bytes[12..16].copy_from_slice(&header.slots.to_le_bytes());
        bytes[16..24].copy_from_slice(&header.input_bytes.to_le_bytes());
        bytes[24..32].copy_from_slice(&header.output_bytes.to_le_bytes());
        // Tags start zeroed: generation 0, owner Free.

        Ok(Self { region, layout })
    }

    pub fn attach(dir: &Path) -> Result<Self> {
        let region = SharedRegion::attach(dir, META_NAME)?;
        if region.len() < HEADER_LEN {
            return Err(ShmError::Layout("slot table shorter than header".into()));
        }
        let bytes = region.as_bytes();
        let magic = u64::from_le_bytes(le_array(&bytes[0..8]));
        let version = u32::from_le_bytes(le_array(&bytes[8..12]));
        if magic != META_MAGIC || version != META_VERSION {
            return Err(ShmError::Layout(format!(
                "bad slot table header (magic {magic:#x}, version {version})"
            )));
        }
        let layout = ArenaLayout {
            slots: u32::from_le_bytes(le_array(&bytes[12..16])),
            input_bytes: u64::from_le_bytes(le_array(&bytes[16..24])) as usize,
            output_bytes: u64::from_le_bytes(le_array(&bytes[24..32])) as usize,
        };
        let needed = HEADER_LEN + layout.slots as usize * std::mem::size_of::<u64>();
        if region.len() < needed {
            return Err(ShmError::Layout(format!(
                "slot table holds {} bytes, {} slots need {needed}",
                region.len(),
                layout.slots
            )));
        }
        Ok(Self { region, layout })
    }

    pub fn layout(&self) -> ArenaLayout {
        self.layout
    }

    fn tag_cell(&self, slot: SlotId) -> Result<&AtomicU64> {
        if slot.0 >= self.layout.slots {
            return Err(ShmError::InvalidName(format!(
                "slot {slot} outside arena of {} slots",
                self.layout.slots
            )));
        }
        let offset = HEADER_LEN + slot.index() * std::mem::size_of::<u64>();
        // SAFETY: offset is in bounds (checked above and at attach), the map is
        // page aligned so `HEADER_LEN + 8k` is 8-byte aligned, and the cell is
        // only ever accessed atomically.
        Ok(unsafe { &*(self.region.as_ptr().add(offset) as *const AtomicU64) })
    }

    pub fn tag(&self, slot: SlotId) -> Result<SlotTag> {
        Ok(SlotTag::unpack(self.tag_cell(slot)?.load(Ordering::Acquire)))
    }

    pub fn owner(&self, slot: SlotId) -> Result<SlotOwner> {
        Ok(self.tag(slot)?.owner)
    }

    pub fn state(&self, slot: SlotId) -> Result<SlotState> {
        Ok(self.owner(slot)?.state())
    }

    /// Free → Handler with a fresh generation. Only the manager calls this.
    pub fn claim(&self, slot: SlotId) -> Result<u32> {
        let cell = self.tag_cell(slot)?;
        let current = SlotTag::unpack(cell.load(Ordering::Acquire));
        let next = SlotTag {
            generation: current.generation.wrapping_add(1),
            owner: SlotOwner::Handler,
        };
        self.swap(slot, cell, SlotTag { owner: SlotOwner::Free, ..current }, next)?;
        Ok(next.generation)
    }

    /// Moves ownership between handler and worker within one generation.
    pub fn hand_over(
        &self,
        slot: SlotId,
        generation: u32,
        from: SlotOwner,
        to: SlotOwner,
    ) -> Result<()> {
        let cell = self.tag_cell(slot)?;
        self.swap(
            slot,
            cell,
            SlotTag { generation, owner: from },
            SlotTag { generation, owner: to },
        )
    }

    /// Handler → Free, the normal end of a request.
    pub fn release(&self, slot: SlotId, generation: u32) -> Result<()> {
        self.hand_over(slot, generation, SlotOwner::Handler, SlotOwner::Free)
    }

    /// Forces a slot of the given generation back to Free and bumps the
    /// generation, so a late worker or handler fails its next transition.
    pub fn reclaim(&self, slot: SlotId, generation: u32) -> Result<SlotOwner> {
        let cell = self.tag_cell(slot)?;
        let mut raw = cell.load(Ordering::Acquire);
        loop {
            let current = SlotTag::unpack(raw);
            if current.generation != generation {
                return Err(ShmError::Ownership {
                    slot,
                    expected: current.owner,
                    generation,
                    found: current.owner,
                    found_generation: current.generation,
                });
            }
            let next = SlotTag {
                generation: generation.wrapping_add(1),
                owner: SlotOwner::Free,
            };
            match cell.compare_exchange(raw, next.pack(), Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Ok(current.owner),
                Err(actual) => raw = actual,
            }
        }
    }

    fn swap(&self, slot: SlotId, cell: &AtomicU64, expected: SlotTag, next: SlotTag) -> Result<()> {
        cell.compare_exchange(
            expected.pack(),
            next.pack(),
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .map(|_| ())
        .map_err(|actual| {
            let found = SlotTag::unpack(actual);
            ShmError::Ownership {
                slot,
                expected: expected.owner,
                generation: expected.generation,
                found: found.owner,
                found_generation: found.generation,
            }
        })
    }
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> ArenaLayout {
        ArenaLayout {
            slots: 2,
            input_bytes: 16,
            output_bytes: 16,
        }
    }

    #[test]
    fn full_cycle_through_owners() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let table = SlotMetaTable::create(dir.path(), layout())?;
        let slot = SlotId(1);

        let generation = table.claim(slot)?;
        assert_eq!(generation, 1);
        assert_eq!(table.state(slot)?, SlotState::Acquired);

        table.hand_over(slot, generation, SlotOwner::Handler, SlotOwner::Worker)?;
        assert_eq!(table.state(slot)?, SlotState::InFlight);

        table.hand_over(slot, generation, SlotOwner::Worker, SlotOwner::Handler)?;
        table.release(slot, generation)?;
        assert_eq!(table.state(slot)?, SlotState::Free);
        Ok(())
    }

    #[test]
    fn attach_shares_tags_with_creator() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let created = SlotMetaTable::create(dir.path(), layout())?;
        let attached = SlotMetaTable::attach(dir.path())?;
        assert_eq!(attached.layout(), layout());

        let generation = created.claim(SlotId(0))?;
        assert_eq!(attached.owner(SlotId(0))?, SlotOwner::Handler);
        attached.hand_over(SlotId(0), generation, SlotOwner::Handler, SlotOwner::Worker)?;
        assert_eq!(created.owner(SlotId(0))?, SlotOwner::Worker);
        Ok(())
    }

    #[test]
    fn claim_of_held_slot_fails() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let table = SlotMetaTable::create(dir.path(), layout())?;
        table.claim(SlotId(0))?;
        assert!(matches!(
            table.claim(SlotId(0)),
            Err(ShmError::Ownership { found: SlotOwner::Handler, .. })
        ));
        Ok(())
    }

    #[test]
    fn reclaim_invalidates_late_transitions() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let table = SlotMetaTable::create(dir.path(), layout())?;
        let slot = SlotId(0);
        let generation = table.claim(slot)?;
        table.hand_over(slot, generation, SlotOwner::Handler, SlotOwner::Worker)?;

        assert_eq!(table.reclaim(slot, generation)?, SlotOwner::Worker);
        assert_eq!(table.tag(slot)?.generation, generation + 1);

        // The worker finishing late must not get the slot back.
        assert!(table
            .hand_over(slot, generation, SlotOwner::Worker, SlotOwner::Handler)
            .is_err());
        // Nor can the stale generation be released or reclaimed twice.
        assert!(table.release(slot, generation).is_err());
        assert!(table.reclaim(slot, generation).is_err());
        Ok(())
    }

    #[test]
    fn out_of_range_slot_is_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let table = SlotMetaTable::create(dir.path(), layout())?;
        assert!(matches!(table.tag(SlotId(2)), Err(ShmError::InvalidName(_))));
        Ok(())
    }
}
