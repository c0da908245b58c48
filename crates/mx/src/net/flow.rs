use std::time::Duration;

use crate::config::TransportConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowMode {
    /// 20 Hz by default.
    Good,
    /// 10 Hz by default.
    Bad,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlowControlChange {
    pub mode: FlowMode,
    pub penalty_secs: f64,
}

/// Adaptive send-rate state machine driven by the mean round-trip time.
///
/// A connection starts in bad mode and earns good mode after staying under
/// the RTT threshold for `penalty_secs`. Falling back doubles the penalty,
/// while long stretches of good mode halve it again.
#[derive(Debug, Clone)]
pub struct FlowControl {
    mode: FlowMode,
    penalty_secs: f64,
    good_conditions_secs: f64,
    penalty_reduction_secs: f64,
    rtt_threshold_ms: f64,
    max_penalty_secs: f64,
    min_penalty_secs: f64,
    reduction_period_secs: f64,
    good_interval: Duration,
    bad_interval: Duration,
}

impl FlowControl {
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            mode: FlowMode::Bad,
            penalty_secs: config.initial_penalty_secs,
            good_conditions_secs: 0.0,
            penalty_reduction_secs: 0.0,
            rtt_threshold_ms: config.rtt_threshold_ms,
            max_penalty_secs: config.max_penalty_secs,
            min_penalty_secs: config.min_penalty_secs,
            reduction_period_secs: config.penalty_reduction_secs,
            good_interval: config.send_interval(true),
            bad_interval: config.send_interval(false),
        }
    }

    pub fn mode(&self) -> FlowMode {
        self.mode
    }

    pub fn penalty_secs(&self) -> f64 {
        self.penalty_secs
    }

    pub fn send_interval(&self) -> Duration {
        match self.mode {
            FlowMode::Good => self.good_interval,
            FlowMode::Bad => self.bad_interval,
        }
    }

    /// Advances the state machine by `delta`, returning the new state on change.
    pub fn update(&mut self, mean_rtt_ms: f64, delta: Duration) -> Option<FlowControlChange> {
        let delta = delta.as_secs_f64();

        match self.mode {
            FlowMode::Good => {
                if mean_rtt_ms > self.rtt_threshold_ms {
                    self.mode = FlowMode::Bad;
                    self.penalty_secs = (self.penalty_secs * 2.0).min(self.max_penalty_secs);
                    self.good_conditions_secs = 0.0;
                    self.penalty_reduction_secs = 0.0;
                    return Some(self.change());
                }

                self.good_conditions_secs += delta;
                self.penalty_reduction_secs += delta;
                if self.penalty_reduction_secs > self.reduction_period_secs {
                    self.penalty_reduction_secs = 0.0;
                    if self.penalty_secs > self.min_penalty_secs {
                        self.penalty_secs = (self.penalty_secs / 2.0).max(self.min_penalty_secs);
                        return Some(self.change());
                    }
                }
                None
            }
            FlowMode::Bad => {
                if mean_rtt_ms < self.rtt_threshold_ms {
                    self.good_conditions_secs += delta;
                } else {
                    self.good_conditions_secs = 0.0;
                }

                if self.good_conditions_secs > self.penalty_secs {
                    self.mode = FlowMode::Good;
                    self.good_conditions_secs = 0.0;
                    self.penalty_reduction_secs = 0.0;
                    return Some(self.change());
                }
                None
            }
        }
    }

    fn change(&self) -> FlowControlChange {
        FlowControlChange {
            mode: self.mode,
            penalty_secs: self.penalty_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: Duration = Duration::from_millis(125);

    fn run(flow: &mut FlowControl, rtt: f64, ticks: usize) -> Vec<FlowControlChange> {
        (0..ticks).filter_map(|_| flow.update(rtt, TICK)).collect()
    }

    fn ticks_to_recover(flow: &FlowControl) -> usize {
        (flow.penalty_secs() / TICK.as_secs_f64()) as usize + 1
    }

    fn good_flow() -> FlowControl {
        let mut flow = FlowControl::new(&TransportConfig::default());
        let changes = run(&mut flow, 20.0, 33);
        assert_eq!(changes.len(), 1);
        assert_eq!(flow.mode(), FlowMode::Good);
        flow
    }

    #[test]
    fn test_starts_bad_and_earns_good() {
        let mut flow = FlowControl::new(&TransportConfig::default());
        assert_eq!(flow.mode(), FlowMode::Bad);
        assert_eq!(flow.send_interval(), Duration::from_millis(100));

        assert!(run(&mut flow, 20.0, 32).is_empty());
        let change = flow.update(20.0, TICK).unwrap();

        assert_eq!(change.mode, FlowMode::Good);
        assert_eq!(change.penalty_secs, 4.0);
        assert_eq!(flow.send_interval(), Duration::from_millis(50));
    }

    #[test]
    fn test_high_rtt_doubles_penalty() {
        let mut flow = good_flow();

        let changes = run(&mut flow, 400.0, 5);

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].mode, FlowMode::Bad);
        assert_eq!(changes[0].penalty_secs, 8.0);
        assert_eq!(flow.mode(), FlowMode::Bad);
    }

    #[test]
    fn test_penalty_is_capped() {
        let mut flow = good_flow();
        for _ in 0..10 {
            run(&mut flow, 400.0, 1);
            let ticks = ticks_to_recover(&flow);
            run(&mut flow, 20.0, ticks);
            assert_eq!(flow.mode(), FlowMode::Good);
        }
        assert_eq!(flow.penalty_secs(), 60.0);
    }

    #[test]
    fn test_sustained_good_halves_penalty() {
        let mut flow = good_flow();
        run(&mut flow, 400.0, 1);
        let ticks = ticks_to_recover(&flow);
        run(&mut flow, 20.0, ticks);
        assert_eq!(flow.mode(), FlowMode::Good);
        assert_eq!(flow.penalty_secs(), 8.0);

        let changes = run(&mut flow, 20.0, 100);

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].mode, FlowMode::Good);
        assert_eq!(changes[0].penalty_secs, 4.0);
    }

    #[test]
    fn test_penalty_has_floor() {
        let mut flow = good_flow();
        run(&mut flow, 20.0, 10_000);
        assert_eq!(flow.penalty_secs(), 1.0);
        assert_eq!(flow.mode(), FlowMode::Good);
    }

    #[test]
    fn test_bad_rtt_resets_recovery() {
        let mut flow = FlowControl::new(&TransportConfig::default());
        run(&mut flow, 20.0, 30);
        run(&mut flow, 300.0, 1);
        assert!(run(&mut flow, 20.0, 32).is_empty());
        assert_eq!(flow.mode(), FlowMode::Bad);
    }
}
