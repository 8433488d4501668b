//! Ownership bookkeeping of the slot pool.
//!
//! Pure state, no I/O: the manager loop drives it and mirrors every change
//! into the shared tag table.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use shmserve_ipc::SlotGrant;
use shmserve_shm::SlotId;
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lease {
    pub grant: SlotGrant,
    pub client_id: String,
    pub acquired_at: Instant,
    pub expires_at: Instant,
}

#[derive(Clone, Debug)]
enum SlotRecord {
    Free,
    Leased(Lease),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReleaseError {
    #[error("slot {0} is not part of this pool")]
    OutOfRange(SlotId),
    #[error("slot {0} is not leased")]
    NotLeased(SlotId),
    #[error("slot {slot} is leased at generation {held}, release names generation {presented}")]
    StaleGeneration {
        slot: SlotId,
        held: u32,
        presented: u32,
    },
}

pub struct SlotTable {
    free: VecDeque<SlotId>,
    records: Vec<SlotRecord>,
    lease_ttl: Duration,
}

impl SlotTable {
    pub fn new(slots: u32, lease_ttl: Duration) -> Self {
        Self {
            free: (0..slots).map(SlotId).collect(),
            records: vec![SlotRecord::Free; slots as usize],
            lease_ttl,
        }
    }

    pub fn capacity(&self) -> usize {
        self.records.len()
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    /// Takes the slot that has been free the longest.
    pub fn pop_free(&mut self) -> Option<SlotId> {
        self.free.pop_front()
    }

    /// Puts a popped slot back at the head, as if it was never taken.
    pub fn unpop(&mut self, slot: SlotId) {
        debug_assert!(!self.free.contains(&slot));
        self.free.push_front(slot);
    }

    /// Records the lease of a slot previously returned by `pop_free`.
    pub fn lease(&mut self, grant: SlotGrant, client_id: &str, now: Instant) -> Lease {
        let lease = Lease {
            grant,
            client_id: client_id.to_string(),
            acquired_at: now,
            expires_at: now + self.lease_ttl,
        };
        let record = &mut self.records[grant.slot.index()];
        debug_assert!(matches!(record, SlotRecord::Free));
        *record = SlotRecord::Leased(lease.clone());
        lease
    }

    pub fn lease_of(&self, grant: SlotGrant) -> Result<&Lease, ReleaseError> {
        match self.records.get(grant.slot.index()) {
            None => Err(ReleaseError::OutOfRange(grant.slot)),
            Some(SlotRecord::Free) => Err(ReleaseError::NotLeased(grant.slot)),
            Some(SlotRecord::Leased(lease)) if lease.grant.generation != grant.generation => {
                Err(ReleaseError::StaleGeneration {
                    slot: grant.slot,
                    held: lease.grant.generation,
                    presented: grant.generation,
                })
            }
            Some(SlotRecord::Leased(lease)) => Ok(lease),
        }
    }

    /// Ends a lease and appends the slot to the free list.
    pub fn release(&mut self, grant: SlotGrant) -> Result<Lease, ReleaseError> {
        self.lease_of(grant)?;
        let record = std::mem::replace(&mut self.records[grant.slot.index()], SlotRecord::Free);
        self.free.push_back(grant.slot);
        match record {
            SlotRecord::Leased(lease) => Ok(lease),
            SlotRecord::Free => Err(ReleaseError::NotLeased(grant.slot)),
        }
    }

    /// Ends every lease past its expiry and returns them, oldest slot first.
    pub fn expire(&mut self, now: Instant) -> Vec<Lease> {
        let expired: Vec<SlotGrant> = self
            .records
            .iter()
            .filter_map(|r| match r {
                SlotRecord::Leased(lease) if lease.expires_at <= now => Some(lease.grant),
                _ => None,
            })
            .collect();
        expired
            .into_iter()
            .filter_map(|grant| self.release(grant).ok())
            .collect()
    }

    pub fn leases(&self) -> impl Iterator<Item = &Lease> {
        self.records.iter().filter_map(|r| match r {
            SlotRecord::Leased(lease) => Some(lease),
            SlotRecord::Free => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grant(slot: u32, generation: u32) -> SlotGrant {
        SlotGrant {
            slot: SlotId(slot),
            generation,
        }
    }

    #[test]
    fn free_list_is_fifo_by_release_order() -> anyhow::Result<()> {
        let mut table = SlotTable::new(3, Duration::from_secs(10));
        let now = Instant::now();
        for generation in 1..=3 {
            let slot = table.pop_free().unwrap();
            table.lease(grant(slot.0, generation), "c", now);
        }
        assert!(table.pop_free().is_none());

        table.release(grant(2, 3))?;
        table.release(grant(0, 1))?;
        assert_eq!(table.pop_free(), Some(SlotId(2)));
        assert_eq!(table.pop_free(), Some(SlotId(0)));
        Ok(())
    }

    #[test]
    fn double_release_is_rejected() -> anyhow::Result<()> {
        let mut table = SlotTable::new(2, Duration::from_secs(10));
        let slot = table.pop_free().unwrap();
        table.lease(grant(slot.0, 1), "c", Instant::now());
        table.release(grant(slot.0, 1))?;
        assert_eq!(
            table.release(grant(slot.0, 1)),
            Err(ReleaseError::NotLeased(slot))
        );
        assert_eq!(table.free_len(), 2);
        Ok(())
    }

    #[test]
    fn stale_generation_is_rejected() {
        let mut table = SlotTable::new(1, Duration::from_secs(10));
        table.pop_free();
        table.lease(grant(0, 4), "c", Instant::now());
        assert!(matches!(
            table.release(grant(0, 3)),
            Err(ReleaseError::StaleGeneration { held: 4, presented: 3, .. })
        ));
        assert_eq!(table.free_len(), 0);
    }

    #[test]
    fn out_of_range_is_rejected() {
        let mut table = SlotTable::new(1, Duration::from_secs(10));
        assert_eq!(
            table.release(grant(5, 1)),
            Err(ReleaseError::OutOfRange(SlotId(5)))
        );
    }

    #[test]
    fn expire_reclaims_only_overdue_leases() {
        let mut table = SlotTable::new(2, Duration::from_millis(100));
        let t0 = Instant::now();
        table.pop_free();
        table.lease(grant(0, 1), "old", t0);
        table.pop_free();
        table.lease(grant(1, 1), "new", t0 + Duration::from_millis(80));

        let expired = table.expire(t0 + Duration::from_millis(120));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].client_id, "old");
        assert_eq!(table.free_len(), 1);
        assert_eq!(table.leases().count(), 1);
    }

    #[test]
    fn unpop_restores_head() {
        let mut table = SlotTable::new(2, Duration::from_secs(1));
        let slot = table.pop_free().unwrap();
        table.unpop(slot);
        assert_eq!(table.pop_free(), Some(slot));
    }
}
