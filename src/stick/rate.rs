//! Sliding-window event rates.

use std::time::Duration;

use tokio::time::Instant;

/// Counts events per period over a sliding window.
///
/// Two buckets: the current period's count and the previous one's. A
/// read interpolates between them by how far into the current period
/// the clock is, which smooths the boundary without per-event
/// timestamps.
#[derive(Debug)]
pub(crate) struct FreqCounter {
    period: Duration,
    window_start: Instant,
    curr: u64,
    prev: u64,
}

impl FreqCounter {
    pub(crate) fn new(period: Duration) -> FreqCounter {
        debug_assert!(!period.is_zero());
        FreqCounter {
            period,
            window_start: Instant::now(),
            curr: 0,
            prev: 0,
        }
    }

    fn rotate(&mut self, now: Instant) {
        let mut elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < self.period {
            return;
        }
        if elapsed >= self.period * 2 {
            // The window went completely stale.
            self.prev = 0;
            self.curr = 0;
            // Re-anchor on a whole number of periods.
            while elapsed >= self.period {
                self.window_start += self.period;
                elapsed -= self.period;
            }
        } else {
            self.prev = self.curr;
            self.curr = 0;
            self.window_start += self.period;
        }
    }

    pub(crate) fn add(&mut self, events: u64, now: Instant) {
        self.rotate(now);
        self.curr = self.curr.saturating_add(events);
    }

    /// Events per period, interpolated over the sliding window.
    pub(crate) fn read(&mut self, now: Instant) -> u64 {
        self.rotate(now);
        let elapsed = now.saturating_duration_since(self.window_start);
        let remaining = self.period.saturating_sub(elapsed);
        let prev_part = (self.prev as u128 * remaining.as_millis())
            / std::cmp::max(self.period.as_millis(), 1);
        prev_part as u64 + self.curr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn counts_within_one_period() {
        let mut ctr = FreqCounter::new(Duration::from_secs(10));
        let now = Instant::now();
        ctr.add(3, now);
        ctr.add(2, now);
        assert_eq!(ctr.read(now), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn interpolates_across_boundary() {
        let mut ctr = FreqCounter::new(Duration::from_secs(10));
        let start = Instant::now();
        ctr.add(10, start);

        // Half-way into the next period: half of the previous bucket
        // still counts.
        let now = start + Duration::from_secs(15);
        assert_eq!(ctr.read(now), 5);

        ctr.add(4, now);
        assert_eq!(ctr.read(now), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_window_reads_zero() {
        let mut ctr = FreqCounter::new(Duration::from_secs(10));
        let start = Instant::now();
        ctr.add(100, start);
        let now = start + Duration::from_secs(35);
        assert_eq!(ctr.read(now), 0);
    }
}
