//! FIFO waypoint queue with an optional patrol loop.

use log::info;

use super::types::Waypoint;

/// Ordered waypoint sequence with a cursor.  In loop mode, advancing past
/// the last waypoint wraps to the first and bumps the loop counter; otherwise
/// the cursor pins at the end.
pub struct WaypointQueue {
    waypoints:     Vec<Waypoint>,
    current_index: usize,
    loop_mode:     bool,
    loop_count:    u64,
}

impl WaypointQueue {
    pub fn new(loop_mode: bool) -> Self {
        WaypointQueue {
            waypoints: Vec::new(),
            current_index: 0,
            loop_mode,
            loop_count: 0,
        }
    }

    pub fn add(&mut self, waypoint: Waypoint) {
        info!(
            "waypoint queued: {} at ({:.6}, {:.6})",
            waypoint.label(),
            waypoint.lat,
            waypoint.lon
        );
        self.waypoints.push(waypoint);
    }

    /// Current target, without consuming it.
    pub fn current(&self) -> Option<&Waypoint> {
        self.waypoints.get(self.current_index)
    }

    /// Move the cursor to the next waypoint.
    ///
    /// Returns `false` only at the end of a non-looping queue; the cursor
    /// stays pinned there.
    pub fn advance_to_next(&mut self) -> bool {
        if self.waypoints.is_empty() {
            return false;
        }
        if self.current_index + 1 < self.waypoints.len() {
            self.current_index += 1;
            info!(
                "advanced to waypoint {}/{}",
                self.current_index + 1,
                self.waypoints.len()
            );
            true
        } else if self.loop_mode {
            self.current_index = 0;
            self.loop_count += 1;
            info!("patrol loop {} complete, wrapping to first waypoint", self.loop_count);
            true
        } else {
            false
        }
    }

    pub fn clear(&mut self) {
        self.waypoints.clear();
        self.current_index = 0;
        self.loop_count = 0;
    }

    pub fn all(&self) -> Vec<Waypoint> {
        self.waypoints.clone()
    }

    /// Waypoints still ahead, including the current one.  In loop mode the
    /// route never shrinks.
    pub fn remaining(&self) -> usize {
        if self.loop_mode {
            self.waypoints.len()
        } else {
            self.waypoints.len().saturating_sub(self.current_index)
        }
    }

    pub fn len(&self) -> usize {
        self.waypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waypoints.is_empty()
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn loop_count(&self) -> u64 {
        self.loop_count
    }

    pub fn is_loop_mode(&self) -> bool {
        self.loop_mode
    }

    pub fn set_loop_mode(&mut self, loop_mode: bool) {
        self.loop_mode = loop_mode;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wp(n: u32) -> Waypoint {
        Waypoint::new(52.0 + n as f64 * 0.001, 21.0, Some(format!("WP{n}")), 2.0)
    }

    #[test]
    fn linear_queue_pins_at_end() {
        let mut q = WaypointQueue::new(false);
        for n in 0..3 {
            q.add(wp(n));
        }
        assert_eq!(q.remaining(), 3);
        assert!(q.advance_to_next());
        assert!(q.advance_to_next());
        assert_eq!(q.remaining(), 1);
        assert!(!q.advance_to_next());
        assert_eq!(q.current_index(), 2);
        assert_eq!(q.current().unwrap().label(), "WP2");
    }

    #[test]
    fn loop_mode_wraps_and_counts() {
        let n = 3usize;
        let mut q = WaypointQueue::new(true);
        for i in 0..n {
            q.add(wp(i as u32));
        }
        // After n·k advances the cursor is back at (n·k) mod n with k loops.
        for k in 1..=4u64 {
            for _ in 0..n {
                assert!(q.advance_to_next());
            }
            assert_eq!(q.current_index(), 0);
            assert_eq!(q.loop_count(), k);
            assert_eq!(q.remaining(), n);
        }
    }

    #[test]
    fn clear_resets_everything() {
        let mut q = WaypointQueue::new(true);
        q.add(wp(0));
        q.add(wp(1));
        q.advance_to_next();
        q.clear();
        assert!(q.is_empty());
        assert_eq!(q.current_index(), 0);
        assert_eq!(q.loop_count(), 0);
        assert!(q.current().is_none());
    }
}
