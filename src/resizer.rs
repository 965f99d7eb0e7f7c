// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Dynamic worker-pool resizing based on usage patterns.
//!
//! The resizer knows nothing about threads; it reads a handful of gauges
//! from the pool and issues at most one `grow` or `shrink` per tick.

use std::time::{Duration, Instant};

/// The gauges and operations a resizable pool exposes.
pub trait PoolMetrics {
    /// Workers in the pool, idle and busy.
    fn size(&self) -> usize;
    /// Workers currently waiting for work.
    fn idle(&self) -> usize;
    /// Jobs queued and not yet picked up.
    fn qsize(&self) -> usize;
    /// Lower bound on pool size.
    fn min(&self) -> usize;
    /// Upper bound on pool size; negative means unbounded.
    fn max(&self) -> isize;
    /// Add `n` workers.
    fn grow(&self, n: usize);
    /// Retire `n` workers.
    fn shrink(&self, n: usize);
}

/// Grow or shrink a pool depending on usage patterns.
///
/// `minspare`/`maxspare` bound the idle-worker count; `shrink_freq` rate
/// limits shrinking so the pool does not flutter around load changes.
#[derive(Debug)]
pub struct DynamicResizer {
    minspare: usize,
    maxspare: usize,
    shrink_freq: Duration,
    last_shrink: Option<Instant>,
}

impl DynamicResizer {
    /// Create a resizer. `shrink_freq` of zero disables shrink checks.
    pub fn new(minspare: usize, maxspare: usize, shrink_freq: Duration) -> Self {
        Self {
            minspare,
            maxspare,
            shrink_freq,
            last_shrink: None,
        }
    }

    /// Perform one maintenance pass: a single grow, a single shrink, or
    /// nothing. Callers invoke this periodically under their own cadence.
    pub fn run(&mut self, pool: &dyn PoolMetrics) {
        let grow_by = self.grow_value(pool);
        if grow_by > 0 {
            tracing::debug!(
                current = pool.size(),
                idle = pool.idle(),
                queue = pool.qsize(),
                grow_by,
                "growing worker pool"
            );
            pool.grow(grow_by);
        } else if self.can_shrink() {
            let shrink_by = self.shrink_value(pool);
            if shrink_by > 0 {
                tracing::debug!(
                    current = pool.size(),
                    idle = pool.idle(),
                    queue = pool.qsize(),
                    shrink_by,
                    "shrinking worker pool"
                );
                pool.shrink(shrink_by);
                self.last_shrink = Some(Instant::now());
            }
        }
    }

    fn grow_value(&self, pool: &dyn PoolMetrics) -> usize {
        let size = pool.size();
        let min = pool.min();
        let max = pool.max();
        let idle = pool.idle();
        let qsize = pool.qsize();

        if (max >= 0 && size >= max as usize && max > 0) || idle > self.maxspare {
            0
        } else if idle == 0 && qsize > 0 {
            // No spare hands and requests are piling up: spawn enough to
            // cover the queue and restore minspare, within the cap.
            if max > 0 {
                (qsize + self.minspare).min((max as usize).saturating_sub(size))
            } else {
                qsize + self.minspare
            }
        } else {
            min.saturating_sub(size)
                .max(self.minspare.saturating_sub(idle))
        }
    }

    fn can_shrink(&self) -> bool {
        !self.shrink_freq.is_zero()
            && self
                .last_shrink
                .map_or(true, |last| last.elapsed() > self.shrink_freq)
    }

    fn shrink_value(&self, pool: &dyn PoolMetrics) -> usize {
        let size = pool.size();
        let min = pool.min();
        let idle = pool.idle();
        let qsize = pool.qsize();

        if size <= min {
            // never below the floor
            0
        } else if size == idle && qsize == 0 {
            (size - min).min(idle.saturating_sub(self.minspare))
        } else if idle > self.maxspare {
            idle - self.maxspare
        } else if idle > self.minspare + 1 && qsize == 0 {
            // halve the surplus each pass, but keep one worker beyond
            // minspare so the next request does not force a respawn
            (idle - self.minspare).div_ceil(2)
        } else {
            0
        }
    }
}

#[cfg(test)]
mod test {
    use std::cell::Cell;
    use std::time::Duration;

    use super::{DynamicResizer, PoolMetrics};

    #[derive(Default)]
    struct FakePool {
        size: Cell<usize>,
        idle: Cell<usize>,
        qsize: Cell<usize>,
        min: usize,
        max: isize,
        grew: Cell<usize>,
        shrank: Cell<usize>,
    }

    impl PoolMetrics for FakePool {
        fn size(&self) -> usize {
            self.size.get()
        }
        fn idle(&self) -> usize {
            self.idle.get()
        }
        fn qsize(&self) -> usize {
            self.qsize.get()
        }
        fn min(&self) -> usize {
            self.min
        }
        fn max(&self) -> isize {
            self.max
        }
        fn grow(&self, n: usize) {
            self.grew.set(self.grew.get() + n);
        }
        fn shrink(&self, n: usize) {
            self.shrank.set(self.shrank.get() + n);
        }
    }

    fn pool(size: usize, idle: usize, qsize: usize, min: usize, max: isize) -> FakePool {
        let p = FakePool {
            min,
            max,
            ..FakePool::default()
        };
        p.size.set(size);
        p.idle.set(idle);
        p.qsize.set(qsize);
        p
    }

    fn resizer() -> DynamicResizer {
        DynamicResizer::new(2, 6, Duration::from_secs(5))
    }

    #[test]
    fn empty_pool_grows_to_min() {
        let p = pool(0, 0, 0, 4, -1);
        resizer().run(&p);
        assert_eq!(4, p.grew.get());
        assert_eq!(0, p.shrank.get());
    }

    #[test]
    fn backlog_with_no_idle_grows_by_queue_plus_minspare() {
        let p = pool(4, 0, 7, 2, -1);
        resizer().run(&p);
        assert_eq!(9, p.grew.get());
    }

    #[test]
    fn backlog_growth_is_clamped_by_max() {
        let p = pool(4, 0, 7, 2, 6);
        resizer().run(&p);
        assert_eq!(2, p.grew.get());
    }

    #[test]
    fn low_spare_count_grows_to_minspare() {
        let p = pool(8, 1, 0, 2, -1);
        resizer().run(&p);
        assert_eq!(1, p.grew.get());
    }

    #[test]
    fn pool_at_max_never_grows() {
        let p = pool(6, 0, 10, 2, 6);
        resizer().run(&p);
        assert_eq!(0, p.grew.get());
    }

    #[test]
    fn fully_idle_pool_shrinks_to_min() {
        let p = pool(10, 10, 0, 3, -1);
        resizer().run(&p);
        assert_eq!(0, p.grew.get());
        assert_eq!(7, p.shrank.get());
    }

    #[test]
    fn idle_beyond_maxspare_is_trimmed() {
        let p = pool(12, 9, 1, 2, -1);
        resizer().run(&p);
        assert_eq!(3, p.shrank.get());
    }

    #[test]
    fn quiet_surplus_halves_per_pass() {
        let p = pool(10, 6, 0, 2, -1);
        resizer().run(&p);
        assert_eq!(2, p.shrank.get());
    }

    #[test]
    fn one_spare_beyond_minspare_is_kept() {
        // hysteresis: idle == minspare + 1 never triggers a shrink
        let p = pool(10, 3, 0, 2, -1);
        resizer().run(&p);
        assert_eq!(0, p.shrank.get());
    }

    #[test]
    fn shrink_respects_frequency() {
        let mut r = DynamicResizer::new(2, 6, Duration::from_secs(3600));
        let p = pool(10, 10, 0, 3, -1);
        r.run(&p);
        assert_eq!(7, p.shrank.get());
        // well within shrink_freq: nothing further happens
        let p2 = pool(10, 10, 0, 3, -1);
        r.run(&p2);
        assert_eq!(0, p2.shrank.get());
    }

    #[test]
    fn zero_shrink_freq_disables_shrinking() {
        let mut r = DynamicResizer::new(2, 6, Duration::ZERO);
        let p = pool(10, 10, 0, 3, -1);
        r.run(&p);
        assert_eq!(0, p.shrank.get());
    }

    #[test]
    fn never_shrinks_below_min() {
        let p = pool(3, 3, 0, 3, -1);
        resizer().run(&p);
        assert_eq!(0, p.shrank.get());
    }
}
