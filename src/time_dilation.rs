//! Client clock regulation.
//!
//! The server reports, in every local delta packet, how many frames of this
//! client's input it still has buffered. [`TimeDilation`] turns that signal
//! into a scalar applied to the client's fixed-step accumulator: above 1.0
//! the client produces input faster than the server consumes it and the
//! buffer grows; below 1.0 it shrinks.
//!
//! The controller is a hysteresis loop over five states:
//!
//! ```text
//! Default -> Dilate -> PredictMax -> RealMax -> Shrink -> Default
//! ```
//!
//! No other edge exists except that any zero-depth or fault report forces
//! the controller back into `Dilate`.

use crate::config::{CommandFrameConfig, TimeDilationConfig};

/// Average reported while no sample qualifies.
const INVALID_AVERAGE: f32 = -0.00001;

/// States of the [`TimeDilation`] controller.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TimeDilationState {
    /// Neutral rate; waiting for the buffer to leave the target band.
    #[default]
    Default,
    /// Running fast to rebuild the server buffer.
    Dilate,
    /// The buffer is predicted to reach max within one round trip.
    PredictMax,
    /// The buffer reached max; waiting for ping to stabilise.
    RealMax,
    /// Running slow to drain the excess buffer.
    Shrink,
}

/// Rolling ping average that ignores spikes.
///
/// Samples are kept in a small ring. The reference value is the sample at
/// the middle of the filled region; only positive samples no larger than
/// `reference * outlier_ratio` contribute to the average.
#[derive(Debug, Clone)]
pub struct PingAverager {
    samples: Vec<f32>,
    cursor: usize,
    filled: usize,
    outlier_ratio: f32,
    average: f32,
}

impl PingAverager {
    /// Creates an averager holding `sample_count` samples.
    #[must_use]
    pub fn new(sample_count: usize, outlier_ratio: f32) -> Self {
        Self {
            samples: vec![-1.0; sample_count.max(1)],
            cursor: 0,
            filled: 0,
            outlier_ratio,
            average: INVALID_AVERAGE,
        }
    }

    /// Drops every sample.
    pub fn reset(&mut self) {
        self.samples.fill(-1.0);
        self.cursor = 0;
        self.filled = 0;
        self.average = INVALID_AVERAGE;
    }

    /// Adds a sample and recomputes the average.
    pub fn push(&mut self, value: f32) {
        let len = self.samples.len();
        self.samples[self.cursor] = value;
        self.cursor = (self.cursor + 1) % len;
        if self.filled < len {
            self.filled += 1;
        }

        let reference = self.samples[(self.filled / 2).min(len - 1)];
        let ceiling = reference * self.outlier_ratio;
        let (sum, valid) = self
            .samples
            .iter()
            .filter(|&&sample| sample > 0.0 && sample <= ceiling)
            .fold((0.0_f32, 0u32), |(sum, valid), &sample| (sum + sample, valid + 1));

        self.average = if valid > 0 {
            sum / valid as f32
        } else {
            INVALID_AVERAGE
        };
    }

    /// The current average; negative when no sample qualified.
    #[must_use]
    pub fn average(&self) -> f32 {
        self.average
    }

    /// Returns `true` once a sample has been pushed and the average is usable.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.filled > 0 && self.average >= 0.0
    }
}

/// Adaptive time dilation controller. See the [module docs](self).
#[derive(Debug, Clone)]
pub struct TimeDilation {
    config: TimeDilationConfig,
    min_buffered: f32,
    max_buffered: f32,
    fixed_frame_rate: f32,
    state: TimeDilationState,
    current: f32,
    stable_seconds: f32,
    // Server buffer depth, extrapolated between reports.
    last_server_buffer: f32,
    averager: PingAverager,
}

impl TimeDilation {
    /// Creates a controller at neutral dilation.
    #[must_use]
    pub fn new(config: &CommandFrameConfig) -> Self {
        let dilation = config.time_dilation;
        Self {
            config: dilation,
            min_buffered: config.min_buffered_frames as f32,
            max_buffered: config.max_buffered_frames as f32,
            fixed_frame_rate: config.fixed_frame_rate as f32,
            state: TimeDilationState::Default,
            current: dilation.target_dilation,
            stable_seconds: 0.0,
            last_server_buffer: 0.0,
            averager: PingAverager::new(dilation.ping_sample_count, dilation.outlier_ratio),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> TimeDilationState {
        self.state
    }

    /// Current dilation factor applied to real elapsed time.
    #[must_use]
    pub fn current_dilation(&self) -> f32 {
        self.current
    }

    /// Server buffer depth as last reported, extrapolated while dilating or shrinking.
    #[must_use]
    pub fn estimated_server_buffer(&self) -> f32 {
        self.last_server_buffer
    }

    /// Applies a server report of `buffer_num` buffered frames.
    ///
    /// A zero depth or a fault restarts the catch-up cycle.
    pub fn update(&mut self, buffer_num: u32, fault: bool) {
        self.last_server_buffer = buffer_num as f32;
        if buffer_num == 0 || fault {
            tracing::debug!(buffer_num, fault, "time dilation entering catch-up");
            self.enter_dilate();
        }
    }

    /// Applies a fault signal without a depth report, e.g. at the start of a replay.
    pub fn update_fault(&mut self, fault: bool) {
        if fault {
            self.enter_dilate();
        }
    }

    /// Returns to the neutral state, forgetting all history.
    pub fn reset(&mut self) {
        self.state = TimeDilationState::Default;
        self.current = self.config.target_dilation;
        self.stable_seconds = 0.0;
        self.last_server_buffer = 0.0;
        self.averager.reset();
    }

    fn enter_dilate(&mut self) {
        self.transition(
            TimeDilationState::Dilate,
            self.config.target_dilation + self.config.dilation_magnitude,
        );
        self.stable_seconds = 0.0;
        self.averager.reset();
    }

    fn transition(&mut self, state: TimeDilationState, dilation: f32) {
        if self.state != state {
            tracing::trace!(from = ?self.state, to = ?state, dilation, "time dilation transition");
        }
        self.state = state;
        self.current = dilation;
    }

    /// Frames the server buffer is expected to change by over one round trip
    /// at the current dilation, rounded to nearest.
    fn predicted_buffer_delta(&self, ping_seconds: f32) -> f32 {
        let delta = ping_seconds
            * self.fixed_frame_rate
            * (self.current - self.config.target_dilation).abs();
        (delta + 0.5).trunc()
    }

    /// Advances the controller by one fixed step. `ping_ms` is the current
    /// round-trip time; nothing happens until a positive ping is known.
    pub fn fixed_tick(&mut self, delta_seconds: f32, ping_ms: f32) {
        if ping_ms <= f32::MIN_POSITIVE {
            return;
        }
        let ping_seconds = ping_ms * 0.001;
        let target = self.config.target_dilation;
        let magnitude = self.config.dilation_magnitude;

        match self.state {
            TimeDilationState::Default => {
                if self.last_server_buffer <= f32::MIN_POSITIVE {
                    self.transition(TimeDilationState::Dilate, target + magnitude);
                }
            },
            TimeDilationState::Dilate => {
                self.last_server_buffer += self.fixed_frame_rate * delta_seconds;
                if self.last_server_buffer + self.predicted_buffer_delta(ping_seconds)
                    >= self.max_buffered
                {
                    self.transition(
                        TimeDilationState::PredictMax,
                        target + self.config.tiny_dilation,
                    );
                }
            },
            TimeDilationState::PredictMax => {
                if self.last_server_buffer >= self.max_buffered {
                    self.transition(TimeDilationState::RealMax, target);
                }
            },
            TimeDilationState::RealMax => {
                self.stable_seconds += delta_seconds;
                self.averager.push(ping_seconds);
                if self.stable_seconds >= self.config.stable_accumulation_seconds {
                    self.stable_seconds = 0.0;
                    if self.averager.average() * self.config.outlier_ratio >= ping_seconds {
                        self.transition(TimeDilationState::Shrink, target - magnitude);
                    }
                }
            },
            TimeDilationState::Shrink => {
                self.last_server_buffer -= self.fixed_frame_rate * delta_seconds;
                if self.last_server_buffer - self.predicted_buffer_delta(ping_seconds)
                    <= self.min_buffered
                {
                    self.transition(TimeDilationState::Default, target);
                }
            },
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::float_cmp
)]
mod tests {
    use super::*;

    const DT: f32 = 1.0 / 30.0;
    const PING_MS: f32 = 100.0;

    fn controller() -> TimeDilation {
        TimeDilation::new(&CommandFrameConfig::default())
    }

    #[test]
    fn starts_neutral() {
        let dilation = controller();
        assert_eq!(dilation.state(), TimeDilationState::Default);
        assert_eq!(dilation.current_dilation(), 1.0);
    }

    #[test]
    fn zero_buffer_report_forces_dilate() {
        let mut dilation = controller();
        dilation.update(12, false);
        assert_eq!(dilation.state(), TimeDilationState::Default);
        dilation.update(0, false);
        assert_eq!(dilation.state(), TimeDilationState::Dilate);
        assert!((dilation.current_dilation() - 1.05).abs() < 1e-6);
    }

    #[test]
    fn fault_report_forces_dilate_from_any_state() {
        let mut dilation = controller();
        dilation.update(0, false);
        while dilation.state() != TimeDilationState::PredictMax {
            dilation.fixed_tick(DT, PING_MS);
        }
        dilation.update(32, true);
        assert_eq!(dilation.state(), TimeDilationState::Dilate);
        assert!((dilation.current_dilation() - 1.05).abs() < 1e-6);
    }

    #[test]
    fn default_holds_while_buffer_is_reported() {
        let mut dilation = controller();
        for depth in [2, 4, 10, 32] {
            dilation.update(depth, false);
            for _ in 0..30 {
                dilation.fixed_tick(DT, PING_MS);
            }
            assert_eq!(dilation.state(), TimeDilationState::Default, "depth {depth}");
            assert_eq!(dilation.current_dilation(), 1.0);
        }
    }

    #[test]
    fn unknown_ping_freezes_controller() {
        let mut dilation = controller();
        dilation.update(10, false);
        dilation.fixed_tick(DT, 0.0);
        assert_eq!(dilation.state(), TimeDilationState::Default);
    }

    #[test]
    fn full_dilation_cycle() {
        let mut dilation = controller();
        let mut visited = vec![dilation.state()];
        let record = |dilation: &TimeDilation, visited: &mut Vec<TimeDilationState>| {
            if visited.last() != Some(&dilation.state()) {
                visited.push(dilation.state());
            }
        };

        dilation.update(0, false);
        record(&dilation, &mut visited);

        // extrapolates one frame per fixed step until the prediction hits max
        for _ in 0..64 {
            dilation.fixed_tick(DT, PING_MS);
            record(&dilation, &mut visited);
            if dilation.state() == TimeDilationState::PredictMax {
                break;
            }
        }
        assert_eq!(dilation.state(), TimeDilationState::PredictMax);

        // the server reports the real depth lagging behind the prediction
        dilation.update(20, false);
        dilation.fixed_tick(DT, PING_MS);
        assert_eq!(dilation.state(), TimeDilationState::PredictMax);

        dilation.update(32, false);
        dilation.fixed_tick(DT, PING_MS);
        record(&dilation, &mut visited);
        assert_eq!(dilation.state(), TimeDilationState::RealMax);
        assert_eq!(dilation.current_dilation(), 1.0);

        for _ in 0..32 {
            dilation.fixed_tick(DT, PING_MS);
            record(&dilation, &mut visited);
            if dilation.state() == TimeDilationState::Shrink {
                break;
            }
        }
        assert_eq!(dilation.state(), TimeDilationState::Shrink);
        assert!(dilation.current_dilation() < 1.0);

        for _ in 0..64 {
            dilation.fixed_tick(DT, PING_MS);
            record(&dilation, &mut visited);
            if dilation.state() == TimeDilationState::Default {
                break;
            }
        }

        assert_eq!(
            visited,
            vec![
                TimeDilationState::Default,
                TimeDilationState::Dilate,
                TimeDilationState::PredictMax,
                TimeDilationState::RealMax,
                TimeDilationState::Shrink,
                TimeDilationState::Default,
            ]
        );
        assert_eq!(dilation.current_dilation(), 1.0);
    }

    #[test]
    fn rising_ping_delays_shrink() {
        let mut dilation = controller();
        dilation.update(0, false);
        while dilation.state() != TimeDilationState::PredictMax {
            dilation.fixed_tick(DT, PING_MS);
        }
        dilation.update(32, false);
        dilation.fixed_tick(DT, PING_MS);
        assert_eq!(dilation.state(), TimeDilationState::RealMax);

        // every sample is a spike relative to the previous ones
        let mut ping = PING_MS;
        for _ in 0..30 {
            ping *= 2.0;
            dilation.fixed_tick(DT, ping);
        }
        assert_eq!(dilation.state(), TimeDilationState::RealMax);
    }

    #[test]
    fn averager_rejects_outliers() {
        let mut averager = PingAverager::new(4, 1.5);
        assert!(!averager.is_valid());
        averager.push(0.1);
        averager.push(0.1);
        averager.push(0.1);
        averager.push(1.0);
        assert!(averager.is_valid());
        assert!((averager.average() - 0.1).abs() < 1e-6);
    }

    #[test]
    fn averager_reset_invalidates() {
        let mut averager = PingAverager::new(3, 1.5);
        averager.push(0.05);
        assert!(averager.is_valid());
        averager.reset();
        assert!(!averager.is_valid());
        assert!(averager.average() < 0.0);
    }
}
