//! Work-stealing victim selection.

use std::sync::Arc;

use crate::sched::local_queue::Stealer;
use crate::task::ParkableTask;
use crate::util::DetRng;

/// Probes up to `max_attempts` peer queues (capped at the peer count),
/// starting at a random victim so idle workers spread their attempts
/// instead of converging on one queue.
pub fn steal_task(
    stealers: &[Stealer],
    rng: &mut DetRng,
    max_attempts: usize,
) -> Option<Arc<ParkableTask>> {
    let probes = stealers.len().min(max_attempts);
    if probes == 0 {
        return None;
    }
    let start = rng.next_usize(stealers.len());
    for offset in 0..probes {
        if let Some(task) = stealers[(start + offset) % stealers.len()].steal() {
            return Some(task);
        }
    }
    None
}
