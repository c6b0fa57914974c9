//! In-memory counter aggregate for one camera.

use laneflow_types::{Category, CountersSnapshot, Direction};
use tracing::warn;

use crate::CountHit;

/// Accumulates [`CountHit`]s into a [`CountersSnapshot`].
///
/// Hits with an undefined category or direction are warned about and not
/// counted; the snapshot's directional totals therefore always equal the
/// sum over the four concrete categories.
#[derive(Debug, Default, Clone)]
pub struct CounterTally {
    snapshot: CountersSnapshot,
}

impl CounterTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume from a previously persisted snapshot.
    pub fn from_snapshot(snapshot: CountersSnapshot) -> Self {
        Self { snapshot }
    }

    /// Apply one hit. Returns whether it was actually counted.
    pub fn apply(&mut self, hit: &CountHit) -> bool {
        if hit.category == Category::Undefined {
            warn!(
                "unknown vehicle class '{}' on track {}, not counted",
                hit.class_name, hit.track_id
            );
            return false;
        }
        if hit.direction == Direction::Undefined {
            warn!("undefined direction on track {}, not counted", hit.track_id);
            return false;
        }
        self.snapshot.add(hit.category, hit.direction);
        true
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        self.snapshot
    }

    pub fn grand_total(&self) -> u64 {
        self.snapshot.grand_total()
    }

    /// Reset the in-memory counters only; stored data is untouched.
    pub fn reset(&mut self) {
        self.snapshot = CountersSnapshot::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(class_name: &str, direction: Direction) -> CountHit {
        CountHit {
            track_id: 1,
            class_name: class_name.to_string(),
            category: Category::from_class_name(class_name),
            direction,
        }
    }

    #[test]
    fn applies_known_categories() {
        let mut tally = CounterTally::new();
        assert!(tally.apply(&hit("car", Direction::Forward)));
        assert!(tally.apply(&hit("bus", Direction::Return)));
        assert_eq!(tally.snapshot().get(Category::Cars, Direction::Forward), 1);
        assert_eq!(tally.snapshot().get(Category::Buses, Direction::Return), 1);
        assert_eq!(tally.grand_total(), 2);
    }

    #[test]
    fn rejects_unknown_class() {
        let mut tally = CounterTally::new();
        assert!(!tally.apply(&hit("skateboard", Direction::Forward)));
        assert_eq!(tally.grand_total(), 0);
    }

    #[test]
    fn resumes_from_snapshot() {
        let mut snap = CountersSnapshot::default();
        snap.set(Category::Trucks, Direction::Forward, 41);
        let mut tally = CounterTally::from_snapshot(snap);
        tally.apply(&hit("truck", Direction::Forward));
        assert_eq!(
            tally.snapshot().get(Category::Trucks, Direction::Forward),
            42
        );
    }
}
