use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::{Result, ShmError, SharedRegion, SlotId, SlotMetaTable, META_NAME};

/// Fixed geometry of an arena, decided once at startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArenaLayout {
    pub slots: u32,
    pub input_bytes: usize,
    pub output_bytes: usize,
}

impl ArenaLayout {
    pub fn slot_ids(&self) -> impl Iterator<Item = SlotId> {
        (0..self.slots).map(SlotId)
    }
}

/// The creating side of the arena: owns every region file.
///
/// Created by the slot pool manager at process start; the files are removed
/// when it drops at shutdown.
pub struct Arena {
    dir: PathBuf,
    meta: SlotMetaTable,
    regions: Vec<SharedRegion>,
}

impl Arena {
    pub fn create(dir: &Path, layout: ArenaLayout) -> Result<Self> {
        if layout.slots == 0 {
            return Err(ShmError::Layout("arena needs at least one slot".into()));
        }
        std::fs::create_dir_all(dir)?;

        let mut regions = Vec::with_capacity(layout.slots as usize * 2);
        for slot in layout.slot_ids() {
            regions.push(SharedRegion::create(dir, &slot.input_name(), layout.input_bytes)?);
            regions.push(SharedRegion::create(dir, &slot.output_name(), layout.output_bytes)?);
        }
        // Written last so attachers never see a table whose regions are missing.
        let meta = SlotMetaTable::create(dir, layout)?;

        info!(
            dir = %dir.display(),
            slots = layout.slots,
            input_bytes = layout.input_bytes,
            output_bytes = layout.output_bytes,
            "shared buffer arena created"
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            meta,
            regions,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn layout(&self) -> ArenaLayout {
        self.meta.layout()
    }

    pub fn meta(&self) -> &SlotMetaTable {
        &self.meta
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let mut paths: Vec<PathBuf> = self.regions.iter().map(|r| r.path().to_path_buf()).collect();
        paths.push(self.dir.join(META_NAME));
        for path in paths {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to remove shared region");
            }
        }
        debug!(dir = %self.dir.display(), "shared buffer arena destroyed");
    }
}

/// Input and output buffers of one slot, mapped into this process.
#[derive(Debug)]
pub struct SlotBuffers {
    pub input: SharedRegion,
    pub output: SharedRegion,
}

/// A process-local view of an arena created elsewhere.
///
/// Slot buffers are attached by name on first use and kept mapped for the
/// life of the view, so a serving thread pays the `open` + `mmap` once per
/// slot rather than once per request.
pub struct ArenaView {
    dir: PathBuf,
    meta: SlotMetaTable,
    slots: Vec<Option<SlotBuffers>>,
}

impl ArenaView {
    pub fn attach(dir: &Path) -> Result<Self> {
        let meta = SlotMetaTable::attach(dir)?;
        let slots = (0..meta.layout().slots).map(|_| None).collect();
        Ok(Self {
            dir: dir.to_path_buf(),
            meta,
            slots,
        })
    }

    pub fn layout(&self) -> ArenaLayout {
        self.meta.layout()
    }

    pub fn meta(&self) -> &SlotMetaTable {
        &self.meta
    }

    pub fn slot(&mut self, slot: SlotId) -> Result<&mut SlotBuffers> {
        let layout = self.meta.layout();
        let entry = self.slots.get_mut(slot.index()).ok_or_else(|| {
            ShmError::InvalidName(format!("slot {slot} outside arena of {} slots", layout.slots))
        })?;
        if entry.is_none() {
            let input = SharedRegion::attach(&self.dir, &slot.input_name())?;
            let output = SharedRegion::attach(&self.dir, &slot.output_name())?;
            if input.len() < layout.input_bytes || output.len() < layout.output_bytes {
                return Err(ShmError::Layout(format!(
                    "slot {slot} buffers are smaller than the arena layout"
                )));
            }
            *entry = Some(SlotBuffers { input, output });
        }
        entry
            .as_mut()
            .ok_or_else(|| ShmError::NotFound(slot.input_name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SlotOwner, SlotState};

    fn layout() -> ArenaLayout {
        ArenaLayout {
            slots: 3,
            input_bytes: 16,
            output_bytes: 8,
        }
    }

    #[test]
    fn write_then_read_is_bit_identical() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let _arena = Arena::create(dir.path(), layout())?;
        let mut writer = ArenaView::attach(dir.path())?;
        let mut reader = ArenaView::attach(dir.path())?;

        let values = [1.0f32, -2.5, f32::MIN_POSITIVE, f32::NAN];
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        writer.slot(SlotId(2))?.input.write(&bytes)?;

        let read = &reader.slot(SlotId(2))?.input.as_bytes()[..16];
        assert_eq!(read, &bytes[..]);
        Ok(())
    }

    #[test]
    fn slots_do_not_alias() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let _arena = Arena::create(dir.path(), layout())?;
        let mut view = ArenaView::attach(dir.path())?;
        view.slot(SlotId(0))?.input.write(&[1; 16])?;
        view.slot(SlotId(1))?.input.write(&[2; 16])?;
        assert_eq!(view.slot(SlotId(0))?.input.as_bytes(), &[1; 16]);
        assert_eq!(view.slot(SlotId(0))?.output.as_bytes(), &[0; 8]);
        Ok(())
    }

    #[test]
    fn view_without_arena_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ArenaView::attach(dir.path()),
            Err(ShmError::NotFound(name)) if name == META_NAME
        ));
    }

    #[test]
    fn drop_removes_region_files() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let arena = Arena::create(dir.path(), layout())?;
            assert_eq!(arena.meta().state(SlotId(0))?, SlotState::Free);
            assert!(dir.path().join("output2").exists());
        }
        assert!(!dir.path().join("output2").exists());
        assert!(!dir.path().join(META_NAME).exists());
        Ok(())
    }

    #[test]
    fn view_and_arena_share_ownership_tags() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let arena = Arena::create(dir.path(), layout())?;
        let view = ArenaView::attach(dir.path())?;
        let generation = arena.meta().claim(SlotId(1))?;
        view.meta()
            .hand_over(SlotId(1), generation, SlotOwner::Handler, SlotOwner::Worker)?;
        assert_eq!(arena.meta().state(SlotId(1))?, SlotState::InFlight);
        Ok(())
    }

    #[test]
    fn zero_slot_arena_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ArenaLayout {
            slots: 0,
            ..layout()
        };
        assert!(matches!(Arena::create(dir.path(), layout), Err(ShmError::Layout(_))));
    }
}
