//! Priority-based torrent queueing: which torrents get an active
//! download/seed slot right now, and which wait.
//!
//! Grounded in `original_source/ccbt/queue/manager.py`'s
//! `TorrentQueueManager`, reimplemented as synchronous state transitions
//! driven by the session manager's periodic tick (see [`crate::engine`])
//! rather than the Python original's `asyncio` background
//! `_monitor_loop`/`_bandwidth_allocation_loop` tasks.

pub(crate) mod bandwidth;

use std::collections::HashMap;

use crate::{error::ResourceError, TorrentId};

/// Relative scheduling weight, mirroring `TorrentPriority` in
/// `original_source/ccbt/models.py`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low,
    Normal,
    High,
    Maximum,
}

impl Priority {
    pub fn weight(&self) -> f64 {
        match self {
            Priority::Low => 0.5,
            Priority::Normal => 1.0,
            Priority::High => 2.0,
            Priority::Maximum => 4.0,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotStatus {
    Queued,
    ActiveDownloading,
    ActiveSeeding,
    Paused,
}

#[derive(Debug, Clone)]
pub(crate) struct QueueEntry {
    pub id: TorrentId,
    pub priority: Priority,
    pub status: SlotStatus,
    pub position: usize,
    pub allocated_down: u64,
    pub allocated_up: u64,
}

/// Tracks which torrents hold an active slot and which are queued,
/// enforcing `max_active_torrents`/`max_active_downloading`/
/// `max_active_seeding` and reordering by
/// priority, the way `_reorder_queue`/`_enforce_queue_limits` do in the
/// Python original.
pub(crate) struct Queue {
    entries: HashMap<TorrentId, QueueEntry>,
    order: Vec<TorrentId>,
    max_active_torrents: Option<usize>,
    max_active_downloading: Option<usize>,
    max_active_seeding: Option<usize>,
}

impl Queue {
    pub fn new(
        max_active_torrents: Option<usize>,
        max_active_downloading: Option<usize>,
        max_active_seeding: Option<usize>,
    ) -> Self {
        Self {
            entries: HashMap::new(),
            order: Vec::new(),
            max_active_torrents,
            max_active_downloading,
            max_active_seeding,
        }
    }

    pub fn add(&mut self, id: TorrentId, priority: Priority) -> &QueueEntry {
        let position = self.order.len();
        self.entries.entry(id).or_insert_with(|| {
            self.order.push(id);
            QueueEntry {
                id,
                priority,
                status: SlotStatus::Queued,
                position,
                allocated_down: 0,
                allocated_up: 0,
            }
        });
        self.reorder();
        &self.entries[&id]
    }

    pub fn remove(&mut self, id: TorrentId) {
        self.entries.remove(&id);
        self.order.retain(|existing| *existing != id);
        self.reorder();
    }

    pub fn set_priority(&mut self, id: TorrentId, priority: Priority) -> Result<(), ResourceError> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or(ResourceError::QueueFull)?;
        entry.priority = priority;
        self.reorder();
        self.fill_free_slots();
        Ok(())
    }

    pub fn pause(&mut self, id: TorrentId) -> Result<(), ResourceError> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or(ResourceError::QueueFull)?;
        if entry.status == SlotStatus::Paused {
            return Err(ResourceError::AlreadyPaused(id));
        }
        entry.status = SlotStatus::Paused;
        self.fill_free_slots();
        Ok(())
    }

    pub fn resume(&mut self, id: TorrentId) -> Result<(), ResourceError> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or(ResourceError::QueueFull)?;
        if entry.status != SlotStatus::Paused {
            return Err(ResourceError::AlreadyActive(id));
        }
        entry.status = SlotStatus::Queued;
        self.fill_free_slots();
        Ok(())
    }

    pub fn mark_seeding(&mut self, id: TorrentId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.status = SlotStatus::ActiveSeeding;
        }
    }

    pub fn entry(&self, id: TorrentId) -> Option<&QueueEntry> {
        self.entries.get(&id)
    }

    pub fn active_entries(&self) -> Vec<&QueueEntry> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id))
            .filter(|e| matches!(e.status, SlotStatus::ActiveDownloading | SlotStatus::ActiveSeeding))
            .collect()
    }

    pub fn active_entries_mut(&mut self) -> Vec<&mut QueueEntry> {
        let active_ids: Vec<TorrentId> = self
            .order
            .iter()
            .filter(|id| {
                matches!(
                    self.entries[id].status,
                    SlotStatus::ActiveDownloading | SlotStatus::ActiveSeeding
                )
            })
            .copied()
            .collect();
        self.entries
            .iter_mut()
            .filter(|(id, _)| active_ids.contains(id))
            .map(|(_, entry)| entry)
            .collect()
    }

    /// Recomputes each active entry's allocated bandwidth per `mode` and
    /// the engine-wide caps, via [`bandwidth::allocate`].
    pub fn apply_bandwidth_allocation(
        &mut self,
        mode: crate::conf::BandwidthAllocation,
        global_down: Option<u64>,
        global_up: Option<u64>,
    ) {
        let mut entries = self.active_entries_mut();
        bandwidth::allocate(mode, &mut entries, global_down, global_up);
    }

    fn active_downloading_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.status == SlotStatus::ActiveDownloading)
            .count()
    }

    fn active_seeding_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.status == SlotStatus::ActiveSeeding)
            .count()
    }

    /// Sorts the scheduling order by descending priority (ties keep
    /// insertion order), then refreshes each entry's recorded position.
    fn reorder(&mut self) {
        let mut entries: Vec<TorrentId> = self.order.clone();
        entries.sort_by(|a, b| {
            let pa = self.entries[a].priority;
            let pb = self.entries[b].priority;
            pb.cmp(&pa)
        });
        self.order = entries;
        for (position, id) in self.order.clone().into_iter().enumerate() {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.position = position;
            }
        }
    }

    /// How many downloading slots are available right now, the tighter
    /// of `max_active_downloading` and what `max_active_torrents` leaves
    /// over once active seeders are accounted for.
    fn downloading_capacity(&self) -> usize {
        let from_downloading_cap = self.max_active_downloading.unwrap_or(usize::MAX);
        let from_combined_cap = self
            .max_active_torrents
            .map(|max| max.saturating_sub(self.active_seeding_count()))
            .unwrap_or(usize::MAX);
        from_downloading_cap.min(from_combined_cap)
    }

    /// Recomputes which non-paused, non-seeding entries hold a
    /// downloading slot from scratch: the top `downloading_capacity()`
    /// of them in priority/position order (`self.order`) are active,
    /// every other one is queued. Recomputing from scratch rather than
    /// only ever promoting into newly-freed slots keeps property 11
    /// ("the active set always equals the top-K by priority/time
    /// ordering") true even when a priority change should itself
    /// preempt an already-active lower-priority torrent — see
    /// `spec.md` §8 S6, where raising a queued torrent to `Maximum`
    /// demotes a `Normal`-priority one even though no cap changed.
    pub fn fill_free_slots(&mut self) {
        let capacity = self.downloading_capacity();
        let candidates: Vec<TorrentId> = self
            .order
            .iter()
            .filter(|id| {
                matches!(
                    self.entries[id].status,
                    SlotStatus::Queued | SlotStatus::ActiveDownloading
                )
            })
            .copied()
            .collect();
        for (rank, id) in candidates.into_iter().enumerate() {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.status = if rank < capacity {
                    SlotStatus::ActiveDownloading
                } else {
                    SlotStatus::Queued
                };
            }
        }
    }

    fn lowest_priority_id_with_status(&self, status: SlotStatus) -> Option<TorrentId> {
        self.order
            .iter()
            .rev()
            .find(|id| self.entries[id].status == status)
            .copied()
    }

    /// Demotes active seeders back to paused if `max_active_seeding`
    /// shrank below the number currently seeding (lowest priority
    /// first), then re-derives the downloading slot assignment via
    /// [`Self::fill_free_slots`], which on its own already demotes any
    /// downloading torrent in excess of `max_active_downloading` or
    /// `max_active_torrents`.
    pub fn enforce_limits(&mut self) {
        if let Some(max) = self.max_active_seeding {
            while self.active_seeding_count() > max {
                match self.lowest_priority_id_with_status(SlotStatus::ActiveSeeding) {
                    Some(id) => {
                        self.entries.get_mut(&id).unwrap().status = SlotStatus::Paused;
                    }
                    None => break,
                }
            }
        }
        self.fill_free_slots();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_free_slots_up_to_the_configured_cap() {
        let mut queue = Queue::new(Some(2), None, None);
        queue.add(1, Priority::Normal);
        queue.add(2, Priority::Normal);
        queue.add(3, Priority::Normal);
        queue.fill_free_slots();
        assert_eq!(queue.active_entries().len(), 2);
        assert_eq!(queue.entry(3).unwrap().status, SlotStatus::Queued);
    }

    #[test]
    fn higher_priority_is_scheduled_first() {
        let mut queue = Queue::new(Some(1), None, None);
        queue.add(1, Priority::Low);
        queue.add(2, Priority::High);
        queue.fill_free_slots();
        assert_eq!(queue.entry(2).unwrap().status, SlotStatus::ActiveDownloading);
        assert_eq!(queue.entry(1).unwrap().status, SlotStatus::Queued);
    }

    #[test]
    fn pause_and_resume_round_trip() {
        let mut queue = Queue::new(Some(2), None, None);
        queue.add(1, Priority::Normal);
        queue.fill_free_slots();
        queue.pause(1).unwrap();
        assert_eq!(queue.entry(1).unwrap().status, SlotStatus::Paused);
        assert!(matches!(queue.pause(1), Err(ResourceError::AlreadyPaused(1))));
        queue.resume(1).unwrap();
        queue.fill_free_slots();
        assert_eq!(queue.entry(1).unwrap().status, SlotStatus::ActiveDownloading);
    }

    #[test]
    fn enforce_limits_demotes_excess_active_torrents() {
        let mut queue = Queue::new(Some(3), None, None);
        queue.add(1, Priority::Normal);
        queue.add(2, Priority::Normal);
        queue.fill_free_slots();
        queue.max_active_torrents = Some(1);
        queue.enforce_limits();
        assert_eq!(queue.active_entries().len(), 1);
    }

    /// `spec.md` §8 S6: with `max_active_downloading=2,
    /// max_active_torrents=3`, adding T1(High), T2(Normal), T3(Low)
    /// activates T1 and T2 and leaves T3 queued; raising T3 to Maximum
    /// then promotes it and demotes T2, leaving the active set {T1, T3}.
    #[test]
    fn maximum_priority_preempts_a_lower_priority_active_torrent() {
        let mut queue = Queue::new(Some(3), Some(2), None);
        queue.add(1, Priority::High);
        queue.add(2, Priority::Normal);
        queue.add(3, Priority::Low);
        queue.fill_free_slots();
        assert_eq!(queue.entry(1).unwrap().status, SlotStatus::ActiveDownloading);
        assert_eq!(queue.entry(2).unwrap().status, SlotStatus::ActiveDownloading);
        assert_eq!(queue.entry(3).unwrap().status, SlotStatus::Queued);

        queue.set_priority(3, Priority::Maximum).unwrap();
        queue.enforce_limits();
        queue.fill_free_slots();

        assert_eq!(queue.entry(1).unwrap().status, SlotStatus::ActiveDownloading);
        assert_eq!(queue.entry(2).unwrap().status, SlotStatus::Queued);
        assert_eq!(queue.entry(3).unwrap().status, SlotStatus::ActiveDownloading);
    }
}
