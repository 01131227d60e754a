//! Configuration types for the command frame manager.
//!
//! # Overview
//!
//! | Config Type | Purpose | Key Presets |
//! |-------------|---------|-------------|
//! | `CommandFrameConfig` | Scheduler rate, buffer and redundancy sizing | `lan()`, `high_latency()` |
//! | `TimeDilationConfig` | Clock-drift controller tuning | `responsive()` |
//!
//! # Example
//!
//! ```
//! use command_frame_net::{CommandFrameConfig, TimeDilationConfig};
//!
//! let config = CommandFrameConfig {
//!     max_redundant_frames: 8,
//!     time_dilation: TimeDilationConfig::responsive(),
//!     ..CommandFrameConfig::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use web_time::Duration;

use crate::{
    CommandFrameError, FIXED_FRAME_RATE, MAX_COMMAND_FRAMES, MAX_FIXED_FRAMES_PER_TICK,
    MAX_REDUNDANT_COMMAND_FRAMES, MAX_SNAPSHOT_BUFFER_FRAMES, MIN_COMMAND_FRAMES,
};

/// Largest frame budget accepted for any ring buffer.
const MAX_RING_FRAMES: u32 = 1024;

/// Tuning for the [`TimeDilation`](crate::TimeDilation) controller.
///
/// # Forward Compatibility
///
/// New fields may be added; construct with `..TimeDilationConfig::default()`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[must_use = "TimeDilationConfig has no effect unless passed to a CommandFrameConfig"]
pub struct TimeDilationConfig {
    /// Neutral dilation factor.
    ///
    /// Default: 1.0
    pub target_dilation: f32,
    /// Offset from the target used while growing or shrinking the server buffer.
    ///
    /// Default: 0.05
    pub dilation_magnitude: f32,
    /// Offset from the target used while waiting for the real depth to reach max.
    ///
    /// Default: 0.0
    pub tiny_dilation: f32,
    /// Seconds of stable ping required before shrinking the buffer.
    ///
    /// Default: 0.5
    pub stable_accumulation_seconds: f32,
    /// Ping samples kept by the median-filtered averager.
    ///
    /// Default: 10
    pub ping_sample_count: usize,
    /// Samples above `median * outlier_ratio` are ignored, and the averaged
    /// ping must stay within this ratio of the current ping to count as stable.
    ///
    /// Default: 1.5
    pub outlier_ratio: f32,
}

impl Default for TimeDilationConfig {
    fn default() -> Self {
        Self {
            target_dilation: 1.0,
            dilation_magnitude: 0.05,
            tiny_dilation: 0.0,
            stable_accumulation_seconds: 0.5,
            ping_sample_count: 10,
            outlier_ratio: 1.5,
        }
    }
}

impl TimeDilationConfig {
    /// Creates the default tuning.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stronger dilation and a shorter stability window, for clients that
    /// should recover buffer depth quickly at the cost of visible speed changes.
    pub fn responsive() -> Self {
        Self {
            dilation_magnitude: 0.1,
            stable_accumulation_seconds: 0.25,
            ..Self::default()
        }
    }

    /// Validates the tuning values.
    ///
    /// # Errors
    ///
    /// Returns [`CommandFrameError::InvalidConfig`] for non-finite values, a
    /// magnitude outside `(0, 0.5]`, a tiny dilation not below the magnitude,
    /// an empty ping window or an outlier ratio below 1.
    pub fn validate(&self) -> Result<(), CommandFrameError> {
        let finite = [
            ("target_dilation", self.target_dilation),
            ("dilation_magnitude", self.dilation_magnitude),
            ("tiny_dilation", self.tiny_dilation),
            ("stable_accumulation_seconds", self.stable_accumulation_seconds),
            ("outlier_ratio", self.outlier_ratio),
        ];
        for (field, value) in finite {
            if !value.is_finite() {
                return Err(CommandFrameError::InvalidConfig {
                    info: format!("{field} must be finite, got {value}"),
                });
            }
        }

        if self.target_dilation <= 0.0 {
            return Err(CommandFrameError::InvalidConfig {
                info: format!(
                    "target_dilation must be positive, got {}",
                    self.target_dilation
                ),
            });
        }

        if self.dilation_magnitude <= 0.0 || self.dilation_magnitude > 0.5 {
            return Err(CommandFrameError::InvalidConfig {
                info: format!(
                    "dilation_magnitude must be in (0, 0.5], got {}",
                    self.dilation_magnitude
                ),
            });
        }

        if self.tiny_dilation < 0.0 || self.tiny_dilation >= self.dilation_magnitude {
            return Err(CommandFrameError::InvalidConfig {
                info: format!(
                    "tiny_dilation must be in [0, dilation_magnitude), got {}",
                    self.tiny_dilation
                ),
            });
        }

        if self.stable_accumulation_seconds <= 0.0 {
            return Err(CommandFrameError::InvalidConfig {
                info: "stable_accumulation_seconds must be positive".to_owned(),
            });
        }

        if self.ping_sample_count == 0 || self.ping_sample_count > 256 {
            return Err(CommandFrameError::InvalidConfig {
                info: format!(
                    "ping_sample_count must be in 1..=256, got {}",
                    self.ping_sample_count
                ),
            });
        }

        if self.outlier_ratio < 1.0 {
            return Err(CommandFrameError::InvalidConfig {
                info: format!("outlier_ratio must be >= 1, got {}", self.outlier_ratio),
            });
        }

        Ok(())
    }
}

/// Configuration for a [`CommandFrameManager`](crate::CommandFrameManager).
///
/// # Forward Compatibility
///
/// New fields may be added; construct with `..CommandFrameConfig::default()`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[must_use = "CommandFrameConfig has no effect unless passed to CommandFrameManager::new()"]
pub struct CommandFrameConfig {
    /// Server-side buffer depth the controller shrinks back towards.
    ///
    /// Default: 4
    pub min_buffered_frames: u32,
    /// Server-side buffer depth the controller grows towards, and the input
    /// ring's frame budget.
    ///
    /// Default: 32
    pub max_buffered_frames: u32,
    /// Frames re-sent in every input packet.
    ///
    /// Default: 16
    pub max_redundant_frames: u32,
    /// Frames kept in the attribute snapshot buffer.
    ///
    /// Default: 32
    pub max_snapshot_frames: u32,
    /// Fixed simulation rate in Hz.
    ///
    /// Default: 30
    pub fixed_frame_rate: u32,
    /// Fixed frames run per real tick before accumulated time is dropped.
    ///
    /// Default: 4
    pub max_fixed_frames_per_tick: u32,
    /// When `false`, [`flush_command_frame`](crate::CommandFrameManager::flush_command_frame) does nothing.
    ///
    /// Default: true
    pub enabled: bool,
    /// Time dilation tuning.
    pub time_dilation: TimeDilationConfig,
}

impl Default for CommandFrameConfig {
    fn default() -> Self {
        Self {
            min_buffered_frames: MIN_COMMAND_FRAMES,
            max_buffered_frames: MAX_COMMAND_FRAMES,
            max_redundant_frames: MAX_REDUNDANT_COMMAND_FRAMES,
            max_snapshot_frames: MAX_SNAPSHOT_BUFFER_FRAMES,
            fixed_frame_rate: FIXED_FRAME_RATE,
            max_fixed_frames_per_tick: MAX_FIXED_FRAMES_PER_TICK,
            enabled: true,
            time_dilation: TimeDilationConfig::default(),
        }
    }
}

impl CommandFrameConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Low-latency networks: a shallow buffer and a short redundant window.
    pub fn lan() -> Self {
        Self {
            min_buffered_frames: 2,
            max_buffered_frames: 8,
            max_redundant_frames: 4,
            ..Self::default()
        }
    }

    /// Lossy or distant links: a deeper buffer, more redundancy and a
    /// larger snapshot history for longer replays.
    pub fn high_latency() -> Self {
        Self {
            min_buffered_frames: 8,
            max_buffered_frames: 64,
            max_redundant_frames: 32,
            max_snapshot_frames: 64,
            ..Self::default()
        }
    }

    /// Length of one fixed step in seconds.
    #[must_use]
    pub fn fixed_delta_seconds(&self) -> f32 {
        1.0 / self.fixed_frame_rate.max(1) as f32
    }

    /// Length of one fixed step.
    #[must_use]
    pub fn fixed_step(&self) -> Duration {
        Duration::from_secs_f32(self.fixed_delta_seconds())
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`CommandFrameError::InvalidConfig`] if a rate or count is
    /// zero, `min_buffered_frames > max_buffered_frames`, the redundant
    /// window exceeds the buffer, a ring budget exceeds 1024 frames, or the
    /// nested [`TimeDilationConfig`] is invalid.
    pub fn validate(&self) -> Result<(), CommandFrameError> {
        if self.fixed_frame_rate == 0 || self.fixed_frame_rate > 1000 {
            return Err(CommandFrameError::InvalidConfig {
                info: format!(
                    "fixed_frame_rate must be in 1..=1000, got {}",
                    self.fixed_frame_rate
                ),
            });
        }

        if self.max_fixed_frames_per_tick == 0 {
            return Err(CommandFrameError::InvalidConfig {
                info: "max_fixed_frames_per_tick must be at least 1".to_owned(),
            });
        }

        if self.min_buffered_frames == 0 || self.min_buffered_frames > self.max_buffered_frames {
            return Err(CommandFrameError::InvalidConfig {
                info: format!(
                    "buffered frame range {}..={} is invalid",
                    self.min_buffered_frames, self.max_buffered_frames
                ),
            });
        }

        if self.max_buffered_frames > MAX_RING_FRAMES || self.max_snapshot_frames > MAX_RING_FRAMES
        {
            return Err(CommandFrameError::InvalidConfig {
                info: format!(
                    "ring budgets must not exceed {MAX_RING_FRAMES} frames (buffer {}, snapshots {})",
                    self.max_buffered_frames, self.max_snapshot_frames
                ),
            });
        }

        if self.max_snapshot_frames == 0 {
            return Err(CommandFrameError::InvalidConfig {
                info: "max_snapshot_frames must be at least 1".to_owned(),
            });
        }

        if self.max_redundant_frames == 0 || self.max_redundant_frames > self.max_buffered_frames {
            return Err(CommandFrameError::InvalidConfig {
                info: format!(
                    "max_redundant_frames must be in 1..={}, got {}",
                    self.max_buffered_frames, self.max_redundant_frames
                ),
            });
        }

        self.time_dilation.validate()
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_constants() {
        let config = CommandFrameConfig::default();
        assert_eq!(config.min_buffered_frames, 4);
        assert_eq!(config.max_buffered_frames, 32);
        assert_eq!(config.max_redundant_frames, 16);
        assert_eq!(config.max_snapshot_frames, 32);
        assert_eq!(config.fixed_frame_rate, 30);
        assert_eq!(config.max_fixed_frames_per_tick, 4);
        assert!(config.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn presets_are_valid() {
        assert!(CommandFrameConfig::lan().validate().is_ok());
        assert!(CommandFrameConfig::high_latency().validate().is_ok());
        assert!(TimeDilationConfig::responsive().validate().is_ok());
    }

    #[test]
    fn fixed_step_matches_rate() {
        let config = CommandFrameConfig::default();
        assert!((config.fixed_delta_seconds() - 1.0 / 30.0).abs() < f32::EPSILON);
        assert_eq!(config.fixed_step().as_millis(), 33);
    }

    #[test]
    fn rejects_inverted_buffer_range() {
        let config = CommandFrameConfig {
            min_buffered_frames: 40,
            ..CommandFrameConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, CommandFrameError::InvalidConfig { .. }));
    }

    #[test]
    fn rejects_redundancy_beyond_buffer() {
        let config = CommandFrameConfig {
            max_redundant_frames: 33,
            ..CommandFrameConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_rate() {
        let config = CommandFrameConfig {
            fixed_frame_rate: 0,
            ..CommandFrameConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_dilation() {
        let mut config = CommandFrameConfig::default();
        config.time_dilation.dilation_magnitude = f32::NAN;
        assert!(config.validate().is_err());

        config.time_dilation = TimeDilationConfig {
            tiny_dilation: 0.2,
            ..TimeDilationConfig::default()
        };
        assert!(config.validate().is_err());

        config.time_dilation = TimeDilationConfig {
            outlier_ratio: 0.5,
            ..TimeDilationConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
