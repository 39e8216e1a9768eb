//! Bandwidth allocation strategies for active torrents.
//!
//! Ported line-for-line in semantics from
//! `original_source/ccbt/queue/bandwidth.py`'s `BandwidthAllocator`: the
//! four modes (`Proportional`, `Equal`, `Fixed`, `Manual`) compute the
//! same per-torrent split, just without the Python original's
//! `session_manager.set_rate_limits` round trip — here the allocation is
//! written directly into each [`super::QueueEntry`] for the caller
//! (the session manager's tick) to push down to peer sessions.

use crate::conf::BandwidthAllocation;

use super::{Priority, QueueEntry};

/// Recomputes `allocated_down`/`allocated_up` on every entry in `active`
/// according to `mode`. `global_down`/`global_up` of `None` means
/// unlimited, in which case allocation is skipped (every torrent already
/// defers to its own per-torrent cap, if any).
pub(crate) fn allocate(
    mode: BandwidthAllocation,
    active: &mut [&mut QueueEntry],
    global_down: Option<u64>,
    global_up: Option<u64>,
) {
    match mode {
        BandwidthAllocation::Proportional => allocate_proportional(active, global_down, global_up),
        BandwidthAllocation::Equal => allocate_equal(active, global_down, global_up),
        BandwidthAllocation::Fixed => allocate_fixed(active, global_down, global_up),
        BandwidthAllocation::Manual => {
            // entries already carry their administrator-assigned limits;
            // nothing to recompute.
        }
    }
}

fn allocate_proportional(
    active: &mut [&mut QueueEntry],
    global_down: Option<u64>,
    global_up: Option<u64>,
) {
    let total_weight: f64 = active.iter().map(|e| e.priority.weight()).sum();
    if total_weight <= 0.0 {
        return;
    }
    for entry in active.iter_mut() {
        let share = entry.priority.weight() / total_weight;
        if let Some(down) = global_down {
            entry.allocated_down = (share * down as f64) as u64;
        }
        if let Some(up) = global_up {
            entry.allocated_up = (share * up as f64) as u64;
        }
    }
}

fn allocate_equal(active: &mut [&mut QueueEntry], global_down: Option<u64>, global_up: Option<u64>) {
    let count = active.len() as u64;
    if count == 0 {
        return;
    }
    for entry in active.iter_mut() {
        if let Some(down) = global_down {
            entry.allocated_down = down / count;
        }
        if let Some(up) = global_up {
            entry.allocated_up = up / count;
        }
    }
}

/// Each torrent's weight becomes a fixed share of the global cap
/// (proportional to weight, but never renormalized as torrents join or
/// leave, unlike [`allocate_proportional`]): a priority-2 torrent always
/// gets twice a priority-1 torrent's fixed slice, not twice whatever
/// share remains.
fn allocate_fixed(active: &mut [&mut QueueEntry], global_down: Option<u64>, global_up: Option<u64>) {
    let unit_weight = Priority::Normal.weight();
    for entry in active.iter_mut() {
        let share = entry.priority.weight() / unit_weight;
        if let Some(down) = global_down {
            entry.allocated_down = (share * down as f64 / active_len(active)) as u64;
        }
        if let Some(up) = global_up {
            entry.allocated_up = (share * up as f64 / active_len(active)) as u64;
        }
    }
}

fn active_len(active: &[&mut QueueEntry]) -> f64 {
    active.len().max(1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::SlotStatus;

    fn entry(id: u32, priority: Priority) -> QueueEntry {
        QueueEntry {
            id,
            priority,
            status: SlotStatus::ActiveDownloading,
            position: 0,
            allocated_down: 0,
            allocated_up: 0,
        }
    }

    #[test]
    fn proportional_splits_by_priority_weight() {
        let mut a = entry(1, Priority::Normal);
        let mut b = entry(2, Priority::High);
        let mut active: Vec<&mut QueueEntry> = vec![&mut a, &mut b];
        allocate(BandwidthAllocation::Proportional, &mut active, Some(300), None);
        // weights 1.0 and 2.0 => 100 and 200
        assert_eq!(a.allocated_down, 100);
        assert_eq!(b.allocated_down, 200);
    }

    #[test]
    fn equal_splits_evenly_regardless_of_priority() {
        let mut a = entry(1, Priority::Low);
        let mut b = entry(2, Priority::High);
        let mut active: Vec<&mut QueueEntry> = vec![&mut a, &mut b];
        allocate(BandwidthAllocation::Equal, &mut active, Some(200), None);
        assert_eq!(a.allocated_down, 100);
        assert_eq!(b.allocated_down, 100);
    }

    #[test]
    fn manual_leaves_existing_allocation_untouched() {
        let mut a = entry(1, Priority::Normal);
        a.allocated_down = 42;
        let mut active: Vec<&mut QueueEntry> = vec![&mut a];
        allocate(BandwidthAllocation::Manual, &mut active, Some(1000), None);
        assert_eq!(a.allocated_down, 42);
    }

    #[test]
    fn unlimited_global_cap_skips_allocation() {
        let mut a = entry(1, Priority::Normal);
        let mut active: Vec<&mut QueueEntry> = vec![&mut a];
        allocate(BandwidthAllocation::Proportional, &mut active, None, None);
        assert_eq!(a.allocated_down, 0);
    }
}
