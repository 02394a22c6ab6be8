//! Self-tuning of the two loop parameters: how many probes run at once
//! (concurrency governor) and how long to sleep between cycles (interval
//! governor). Both are fed once per cycle by the supervisor.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::config::{ConcurrencyConf, IntervalConf};

pub struct ConcurrencyGovernor {
    conf: ConcurrencyConf,
    current_limit: usize,
    history: VecDeque<Duration>,
    semaphore: Arc<Semaphore>,
}

impl ConcurrencyGovernor {
    pub fn new(conf: ConcurrencyConf) -> Self {
        let current_limit = conf.initial.clamp(conf.min, conf.max);
        Self {
            history: VecDeque::with_capacity(conf.history_size),
            semaphore: Arc::new(Semaphore::new(current_limit)),
            current_limit,
            conf,
        }
    }

    pub fn current_limit(&self) -> usize {
        self.current_limit
    }

    /// Semaphore bounding in-flight probes. Probes hold one permit each.
    pub fn semaphore(&self) -> Arc<Semaphore> {
        Arc::clone(&self.semaphore)
    }

    pub fn average(&self) -> Option<Duration> {
        if self.history.is_empty() {
            return None;
        }
        let total: Duration = self.history.iter().sum();
        Some(total / self.history.len() as u32)
    }

    /// Feeds one cycle duration and applies the adjustment rule once.
    /// Must be called between cycles, when no permit is held.
    pub fn record_cycle(&mut self, duration: Duration) -> usize {
        if self.history.len() == self.conf.history_size {
            self.history.pop_front();
        }
        self.history.push_back(duration);

        let Some(mean) = self.average() else { return self.current_limit };
        let previous = self.current_limit;
        let next = if mean > self.conf.slow_threshold() && previous > self.conf.min {
            previous.saturating_sub(self.conf.step).max(self.conf.min)
        } else if mean < self.conf.fast_threshold() && previous < self.conf.max {
            (previous + self.conf.step).min(self.conf.max)
        } else {
            previous
        };

        if next != previous {
            self.resize(previous, next);
            tracing::info!(
                from = previous,
                to = next,
                mean_ms = mean.as_millis() as u64,
                "concurrency limit adjusted"
            );
        }
        self.current_limit = next;
        next
    }

    fn resize(&self, previous: usize, next: usize) {
        if next > previous {
            self.semaphore.add_permits(next - previous);
        } else {
            let forgotten = self.semaphore.forget_permits(previous - next);
            if forgotten != previous - next {
                tracing::warn!(
                    wanted = previous - next,
                    forgotten,
                    "semaphore shrunk while permits were held"
                );
            }
        }
    }
}

/// Stability counters and the interval they select.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StabilityTracker {
    pub stable_cycles: u32,
    pub unstable_cycles: u32,
    pub offline_count: usize,
    pub current_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalRule {
    Critical,
    Unstable,
    Stable,
    /// Stable cycle, but not enough of them yet: interval unchanged.
    Settling,
}

pub struct IntervalGovernor {
    conf: IntervalConf,
    state: StabilityTracker,
}

impl IntervalGovernor {
    pub fn new(conf: IntervalConf) -> Self {
        Self {
            state: StabilityTracker {
                stable_cycles: 0,
                unstable_cycles: 0,
                offline_count: 0,
                current_interval: Duration::from_secs(conf.unstable_secs),
            },
            conf,
        }
    }

    pub fn state(&self) -> StabilityTracker {
        self.state
    }

    pub fn current_interval(&self) -> Duration {
        self.state.current_interval
    }

    /// Applies the interval rules in order and returns the rule that fired.
    pub fn evaluate(&mut self, offline_count: usize, transitions: usize) -> IntervalRule {
        let s = &mut self.state;
        s.offline_count = offline_count;

        let rule = if offline_count >= self.conf.offline_critical_threshold {
            s.current_interval = Duration::from_secs(self.conf.critical_secs);
            s.stable_cycles = 0;
            s.unstable_cycles += 1;
            IntervalRule::Critical
        } else if transitions > 0 {
            s.current_interval = Duration::from_secs(self.conf.unstable_secs);
            s.stable_cycles = 0;
            s.unstable_cycles += 1;
            IntervalRule::Unstable
        } else {
            s.stable_cycles += 1;
            if s.stable_cycles >= self.conf.stable_cycles_required {
                s.current_interval = Duration::from_secs(self.conf.stable_secs);
                s.unstable_cycles = 0;
                IntervalRule::Stable
            } else {
                IntervalRule::Settling
            }
        };

        // stable and unstable streaks are mutually exclusive
        if s.stable_cycles > 0 && s.unstable_cycles > 0 {
            s.unstable_cycles = 0;
        }
        rule
    }

    /// Delay before the next cycle: the full interval from cycle end, or
    /// nothing when the cycle itself took longer than the interval.
    pub fn sleep_for(&self, cycle_duration: Duration) -> Duration {
        if cycle_duration >= self.state.current_interval {
            Duration::ZERO
        } else {
            self.state.current_interval
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conc() -> ConcurrencyConf {
        ConcurrencyConf {
            min: 10,
            max: 30,
            step: 5,
            initial: 20,
            history_size: 5,
            slow_threshold_secs: 30.0,
            fast_threshold_secs: 10.0,
        }
    }

    #[test]
    fn slow_cycles_step_down_to_min() {
        let mut gov = ConcurrencyGovernor::new(conc());
        assert_eq!(gov.record_cycle(Duration::from_secs(45)), 15);
        assert_eq!(gov.record_cycle(Duration::from_secs(45)), 10);
        for _ in 0..5 {
            assert_eq!(gov.record_cycle(Duration::from_secs(45)), 10);
        }
        assert_eq!(gov.semaphore().available_permits(), 10);
    }

    #[test]
    fn fast_cycles_step_up_to_max() {
        let mut gov = ConcurrencyGovernor::new(conc());
        let mut last = gov.current_limit();
        for _ in 0..10 {
            let next = gov.record_cycle(Duration::from_secs(2));
            assert!(next == last || next == last + 5);
            last = next;
        }
        assert_eq!(last, 30);
        assert_eq!(gov.semaphore().available_permits(), 30);
    }

    #[test]
    fn middle_band_leaves_limit_alone() {
        let mut gov = ConcurrencyGovernor::new(conc());
        for _ in 0..8 {
            assert_eq!(gov.record_cycle(Duration::from_secs(20)), 20);
        }
    }

    #[test]
    fn ring_keeps_only_recent_history() {
        let mut gov = ConcurrencyGovernor::new(conc());
        for _ in 0..5 {
            gov.record_cycle(Duration::from_secs(100));
        }
        for _ in 0..5 {
            gov.record_cycle(Duration::from_secs(20));
        }
        assert_eq!(gov.average(), Some(Duration::from_secs(20)));
    }

    #[test]
    fn initial_limit_is_clamped() {
        let mut conf = conc();
        conf.initial = 500;
        assert_eq!(ConcurrencyGovernor::new(conf).current_limit(), 30);
    }

    fn interval() -> IntervalConf {
        IntervalConf {
            stable_secs: 60,
            unstable_secs: 30,
            critical_secs: 15,
            offline_critical_threshold: 5,
            stable_cycles_required: 3,
        }
    }

    #[test]
    fn three_quiet_cycles_reach_stable() {
        let mut gov = IntervalGovernor::new(interval());
        assert_eq!(gov.evaluate(0, 0), IntervalRule::Settling);
        assert_eq!(gov.evaluate(0, 0), IntervalRule::Settling);
        assert_eq!(gov.current_interval(), Duration::from_secs(30));
        assert_eq!(gov.evaluate(0, 0), IntervalRule::Stable);
        assert_eq!(gov.current_interval(), Duration::from_secs(60));
    }

    #[test]
    fn offline_threshold_goes_critical_first() {
        let mut gov = IntervalGovernor::new(interval());
        gov.evaluate(0, 0);
        assert_eq!(gov.evaluate(6, 6), IntervalRule::Critical);
        let s = gov.state();
        assert_eq!(s.current_interval, Duration::from_secs(15));
        assert_eq!(s.stable_cycles, 0);
        assert_eq!(s.unstable_cycles, 1);
    }

    #[test]
    fn transitions_zero_the_stable_streak() {
        let mut gov = IntervalGovernor::new(interval());
        gov.evaluate(0, 0);
        gov.evaluate(0, 0);
        assert_eq!(gov.evaluate(1, 1), IntervalRule::Unstable);
        assert_eq!(gov.state().stable_cycles, 0);
        assert_eq!(gov.current_interval(), Duration::from_secs(30));
    }

    #[test]
    fn counters_are_never_both_positive() {
        let mut gov = IntervalGovernor::new(interval());
        let script = [(0, 1), (0, 0), (6, 0), (0, 0), (0, 0), (0, 1), (0, 0)];
        for (offline, transitions) in script {
            gov.evaluate(offline, transitions);
            let s = gov.state();
            assert!(!(s.stable_cycles > 0 && s.unstable_cycles > 0), "{s:?}");
        }
    }

    #[test]
    fn critical_interval_persists_through_settling() {
        let mut gov = IntervalGovernor::new(interval());
        gov.evaluate(7, 7);
        gov.evaluate(0, 0);
        assert_eq!(gov.current_interval(), Duration::from_secs(15));
    }

    #[test]
    fn overrun_wakes_immediately() {
        let gov = IntervalGovernor::new(interval());
        assert_eq!(gov.sleep_for(Duration::from_secs(5)), Duration::from_secs(30));
        assert_eq!(gov.sleep_for(Duration::from_secs(31)), Duration::ZERO);
    }
}
