//! Lamport logical clock

use parking_lot::Mutex;

/// Lamport logical clock shared by all protocol messages.
///
/// Every outbound message carrying a timestamp takes one from [`tick`];
/// every inbound message carrying one goes through [`update`] before it is
/// handled. All three operations are serialised behind one lock, so values
/// returned by `tick`/`update` are strictly increasing per node.
///
/// [`tick`]: LamportClock::tick
/// [`update`]: LamportClock::update
#[derive(Debug, Default)]
pub struct LamportClock {
    time: Mutex<u64>,
}

impl LamportClock {
    /// Create a clock starting at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance for a local event and return the new time
    pub fn tick(&self) -> u64 {
        let mut time = self.time.lock();
        *time += 1;
        *time
    }

    /// Merge a remote timestamp and return the new time
    pub fn update(&self, received: u64) -> u64 {
        let mut time = self.time.lock();
        if received > *time {
            *time = received;
        }
        *time += 1;
        *time
    }

    /// Read the current time without advancing it
    pub fn read(&self) -> u64 {
        *self.time.lock()
    }

    /// Force the clock forward to at least `floor`
    ///
    /// Used when restoring from a checkpoint so that post-restart events
    /// never reuse pre-crash timestamps.
    pub fn advance_to(&self, floor: u64) {
        let mut time = self.time.lock();
        if floor > *time {
            *time = floor;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_is_strictly_increasing() {
        let clock = LamportClock::new();
        let a = clock.tick();
        let b = clock.tick();
        let c = clock.tick();
        assert!(a < b && b < c);
    }

    #[test]
    fn update_jumps_past_remote_time() {
        let clock = LamportClock::new();
        clock.tick();
        let t = clock.update(100);
        assert_eq!(t, 101);
        // A remote time in the past still advances the clock by one.
        let t = clock.update(5);
        assert_eq!(t, 102);
    }

    #[test]
    fn read_does_not_advance() {
        let clock = LamportClock::new();
        clock.tick();
        assert_eq!(clock.read(), 1);
        assert_eq!(clock.read(), 1);
    }

    #[test]
    fn advance_to_is_monotone() {
        let clock = LamportClock::new();
        clock.advance_to(50);
        assert_eq!(clock.read(), 50);
        clock.advance_to(10);
        assert_eq!(clock.read(), 50);
    }
}
