//! Structured telemetry for protocol anomalies.
//!
//! The command-frame loop never fails outright: lost packets are backfilled,
//! starved buffers drive time dilation and severe desyncs end in a hard
//! frame reset. Those recoveries are still worth knowing about, so they are
//! reported as [`ProtocolViolation`]s. A violation can be:
//!
//! - Logged via tracing (the default, through [`TracingObserver`])
//! - Collected programmatically for testing ([`CollectingObserver`])
//! - Fanned out to several observers ([`CompositeObserver`])
//!
//! # Example
//!
//! ```
//! use command_frame_net::telemetry::{CollectingObserver, ViolationKind, ViolationObserver};
//! use std::sync::Arc;
//!
//! let observer = Arc::new(CollectingObserver::new());
//! assert!(!observer.has_violation(ViolationKind::Scheduler));
//! ```

use crate::CommandFrame;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Severity of a protocol violation, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    /// Unexpected but recoverable; the core continued with a fallback.
    ///
    /// Example: the scheduler dropped accumulated time after an overload.
    Warning,
    /// Serious issue; behavior may be degraded.
    ///
    /// Example: an input packet could not be decoded and was discarded.
    Error,
    /// Critical invariant broken; state may be corrupted.
    Critical,
}

impl ViolationSeverity {
    /// Returns a string representation suitable for logging/metrics labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subsystem that reported a violation.
///
/// Marked `#[non_exhaustive]`; include a wildcard arm when matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ViolationKind {
    /// Local and server frame counters disagreed badly enough to force a reset.
    FrameSync,
    /// The ownership buffer rejected or lost data.
    InputBuffer,
    /// The time dilation controller saw an unexpected signal.
    TimeDilation,
    /// Channel state machine or delta ordering issue.
    ///
    /// Examples:
    /// - Server waiting for a client to catch up
    /// - Delta bit with no registered procedure
    NetChannel,
    /// The fixed-tick scheduler could not keep up with real time.
    Scheduler,
    /// A packet could not be encoded or decoded.
    Serialization,
    /// Configuration constraint violated.
    Configuration,
    /// Internal logic error (should never happen).
    InternalError,
    /// Runtime invariant check failed.
    ///
    /// Only checked in debug builds or when the `paranoid` feature is enabled.
    Invariant,
}

impl ViolationKind {
    /// Returns a string representation suitable for logging/metrics labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::FrameSync => "frame_sync",
            Self::InputBuffer => "input_buffer",
            Self::TimeDilation => "time_dilation",
            Self::NetChannel => "net_channel",
            Self::Scheduler => "scheduler",
            Self::Serialization => "serialization",
            Self::Configuration => "configuration",
            Self::InternalError => "internal_error",
            Self::Invariant => "invariant",
        }
    }
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded protocol violation.
///
/// # Example
///
/// ```
/// use command_frame_net::telemetry::{ProtocolViolation, ViolationSeverity, ViolationKind};
/// use command_frame_net::CommandFrame;
///
/// let violation = ProtocolViolation::new(
///     ViolationSeverity::Warning,
///     ViolationKind::FrameSync,
///     "hard frame reset",
///     "channel.rs:42",
/// )
/// .with_frame(CommandFrame::new(100))
/// .with_context("server_frame", "120");
///
/// let json = violation.to_json().expect("violation serializes");
/// assert!(json.contains(r#""kind":"frame_sync""#));
/// assert!(json.contains(r#""frame":100"#));
/// ```
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProtocolViolation {
    /// The severity level of this violation.
    pub severity: ViolationSeverity,
    /// The subsystem where the violation occurred.
    pub kind: ViolationKind,
    /// Human-readable description of what went wrong.
    pub message: String,
    /// Source location where the violation was detected (file:line).
    pub location: &'static str,
    /// The command frame at which the violation occurred, if applicable.
    pub frame: Option<CommandFrame>,
    /// Additional structured context as key-value pairs.
    pub context: BTreeMap<String, String>,
}

impl ProtocolViolation {
    /// Creates a new violation.
    #[must_use]
    pub fn new(
        severity: ViolationSeverity,
        kind: ViolationKind,
        message: impl Into<String>,
        location: &'static str,
    ) -> Self {
        Self {
            severity,
            kind,
            message: message.into(),
            location,
            frame: None,
            context: BTreeMap::new(),
        }
    }

    /// Sets the frame at which this violation occurred.
    #[must_use]
    pub fn with_frame(mut self, frame: CommandFrame) -> Self {
        self.frame = Some(frame);
        self
    }

    /// Adds a context key-value pair.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Serializes this violation to a JSON string.
    #[must_use]
    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

impl std::fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}/{}] {} (at {}",
            self.severity, self.kind, self.message, self.location
        )?;
        if let Some(frame) = self.frame {
            write!(f, ", frame={frame}")?;
        }
        if !self.context.is_empty() {
            write!(f, ", context={:?}", self.context)?;
        }
        write!(f, ")")
    }
}

/// Receives protocol violations as they are detected.
///
/// Called from inside the frame loop, so implementations should be quick.
pub trait ViolationObserver {
    /// Called when a violation is detected.
    fn on_violation(&self, violation: &ProtocolViolation);
}

/// Built-in observer that logs violations via the `tracing` crate.
///
/// `Warning` maps to `tracing::warn!`; `Error` and `Critical` map to
/// `tracing::error!`. Every event carries `severity`, `kind`, `location`,
/// `frame` and `context` fields.
#[derive(Debug, Default, Clone)]
pub struct TracingObserver;

impl TracingObserver {
    /// Creates a new tracing observer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn format_frame(frame: Option<CommandFrame>) -> String {
        match frame {
            None => "null".to_owned(),
            Some(f) => f.as_u32().to_string(),
        }
    }
}

impl ViolationObserver for TracingObserver {
    fn on_violation(&self, violation: &ProtocolViolation) {
        let severity = violation.severity.as_str();
        let kind = violation.kind.as_str();
        let location = violation.location;
        let frame_str = Self::format_frame(violation.frame);

        let context_str = if violation.context.is_empty() {
            "{}".to_owned()
        } else {
            let pairs: Vec<String> = violation
                .context
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            format!("{{{}}}", pairs.join(", "))
        };

        match violation.severity {
            ViolationSeverity::Warning => {
                tracing::warn!(
                    severity,
                    kind,
                    location,
                    frame = %frame_str,
                    context = %context_str,
                    "{}",
                    violation.message
                );
            },
            ViolationSeverity::Error | ViolationSeverity::Critical => {
                tracing::error!(
                    severity,
                    kind,
                    location,
                    frame = %frame_str,
                    context = %context_str,
                    "{}",
                    violation.message
                );
            },
        }
    }
}

/// Built-in observer that collects violations for testing.
#[derive(Debug, Default)]
pub struct CollectingObserver {
    violations: Mutex<Vec<ProtocolViolation>>,
}

impl CollectingObserver {
    /// Creates a new collecting observer with an empty violation list.
    #[must_use]
    pub fn new() -> Self {
        Self {
            violations: Mutex::new(Vec::new()),
        }
    }

    /// Returns a copy of all collected violations.
    #[must_use]
    pub fn violations(&self) -> Vec<ProtocolViolation> {
        self.violations.lock().clone()
    }

    /// Returns the number of collected violations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.violations.lock().len()
    }

    /// Returns true if no violations have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.violations.lock().is_empty()
    }

    /// Checks if any violation of the specified kind has been collected.
    #[must_use]
    pub fn has_violation(&self, kind: ViolationKind) -> bool {
        self.violations.lock().iter().any(|v| v.kind == kind)
    }

    /// Checks if any violation with the specified severity has been collected.
    #[must_use]
    pub fn has_severity(&self, severity: ViolationSeverity) -> bool {
        self.violations
            .lock()
            .iter()
            .any(|v| v.severity == severity)
    }

    /// Returns all violations matching the specified kind.
    #[must_use]
    pub fn violations_of_kind(&self, kind: ViolationKind) -> Vec<ProtocolViolation> {
        self.violations
            .lock()
            .iter()
            .filter(|v| v.kind == kind)
            .cloned()
            .collect()
    }

    /// Clears all collected violations.
    pub fn clear(&self) {
        self.violations.lock().clear();
    }
}

impl ViolationObserver for CollectingObserver {
    fn on_violation(&self, violation: &ProtocolViolation) {
        self.violations.lock().push(violation.clone());
    }
}

/// Forwards violations to several observers in order.
#[derive(Default)]
pub struct CompositeObserver {
    observers: Vec<Arc<dyn ViolationObserver>>,
}

impl CompositeObserver {
    /// Creates a new composite observer with no child observers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            observers: Vec::new(),
        }
    }

    /// Adds an observer to the composite.
    pub fn add(&mut self, observer: Arc<dyn ViolationObserver>) {
        self.observers.push(observer);
    }
}

impl ViolationObserver for CompositeObserver {
    fn on_violation(&self, violation: &ProtocolViolation) {
        for observer in &self.observers {
            observer.on_violation(violation);
        }
    }
}

impl std::fmt::Debug for CompositeObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeObserver")
            .field("num_observers", &self.observers.len())
            .finish()
    }
}

/// Reports a violation with the current file and line through [`TracingObserver`].
///
/// ```
/// use command_frame_net::{report_violation, telemetry::{ViolationSeverity, ViolationKind}};
///
/// report_violation!(ViolationSeverity::Warning, ViolationKind::Scheduler,
///     "dropped {} fixed frames", 3);
/// ```
#[macro_export]
macro_rules! report_violation {
    ($severity:expr, $kind:expr, $msg:literal) => {{
        use $crate::telemetry::ViolationObserver as _;
        let violation = $crate::telemetry::ProtocolViolation::new(
            $severity,
            $kind,
            $msg,
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::TracingObserver.on_violation(&violation);
    }};

    ($severity:expr, $kind:expr, $fmt:literal, $($arg:tt)+) => {{
        use $crate::telemetry::ViolationObserver as _;
        let violation = $crate::telemetry::ProtocolViolation::new(
            $severity,
            $kind,
            format!($fmt, $($arg)+),
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::TracingObserver.on_violation(&violation);
    }};
}

/// Asserts that no violations have been collected.
#[macro_export]
macro_rules! assert_no_violations {
    ($observer:expr) => {{
        let violations = $observer.violations();
        assert!(
            violations.is_empty(),
            "Expected no violations, but found {}:\n{:#?}",
            violations.len(),
            violations
        );
    }};
}

/// Asserts that a violation of the specified kind was collected.
#[macro_export]
macro_rules! assert_violation {
    ($observer:expr, $kind:expr) => {{
        assert!(
            $observer.has_violation($kind),
            "Expected violation of kind {:?}, but found: {:#?}",
            $kind,
            $observer.violations()
        );
    }};
}

/// Reports a violation to an optional observer, falling back to [`TracingObserver`] if `None`.
pub fn report_to_observer<O: ViolationObserver + ?Sized>(
    observer: Option<&Arc<O>>,
    violation: &ProtocolViolation,
) {
    match observer {
        Some(obs) => obs.on_violation(violation),
        None => TracingObserver.on_violation(violation),
    }
}

/// Reports a violation, with an optional frame, through an `Option<Arc<dyn ViolationObserver>>`.
///
/// ```text
/// report_violation_to!(observer, frame, severity, kind, "message");
/// report_violation_to!(observer, frame, severity, kind, "message with {}", args);
/// ```
#[macro_export]
macro_rules! report_violation_to {
    ($observer:expr, $frame:expr, $severity:expr, $kind:expr, $msg:literal) => {{
        let violation = $crate::telemetry::ProtocolViolation::new(
            $severity,
            $kind,
            $msg,
            concat!(file!(), ":", line!()),
        )
        .with_frame($frame);
        $crate::telemetry::report_to_observer($observer.as_ref(), &violation);
    }};

    ($observer:expr, $frame:expr, $severity:expr, $kind:expr, $fmt:literal, $($arg:tt)+) => {{
        let violation = $crate::telemetry::ProtocolViolation::new(
            $severity,
            $kind,
            format!($fmt, $($arg)+),
            concat!(file!(), ":", line!()),
        )
        .with_frame($frame);
        $crate::telemetry::report_to_observer($observer.as_ref(), &violation);
    }};
}

// ==========================================
// Runtime Invariant Checking
// ==========================================

/// Describes a broken structural invariant.
#[derive(Debug, Clone, serde::Serialize)]
pub struct InvariantViolation {
    /// Name of the type whose invariant was violated.
    pub type_name: &'static str,
    /// Description of the violated invariant.
    pub invariant: String,
    /// Additional diagnostic context.
    pub details: Option<String>,
}

impl InvariantViolation {
    /// Creates a new invariant violation.
    #[must_use]
    pub fn new(type_name: &'static str, invariant: impl Into<String>) -> Self {
        Self {
            type_name,
            invariant: invariant.into(),
            details: None,
        }
    }

    /// Adds additional details to the violation.
    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl std::fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.type_name, self.invariant)?;
        if let Some(details) = &self.details {
            write!(f, " ({})", details)?;
        }
        Ok(())
    }
}

/// Trait for types that maintain internal invariants.
pub trait InvariantChecker {
    /// Returns `Ok(())` if all invariants hold, or the first broken one.
    fn check_invariants(&self) -> Result<(), InvariantViolation>;
}

/// Checks invariants in debug builds (or with `paranoid`) and reports failures as critical.
#[macro_export]
#[cfg(any(debug_assertions, feature = "paranoid"))]
macro_rules! debug_check_invariants {
    ($expr:expr) => {{
        use $crate::telemetry::InvariantChecker as _;
        if let Err(violation) = $expr.check_invariants() {
            $crate::report_violation!(
                $crate::telemetry::ViolationSeverity::Critical,
                $crate::telemetry::ViolationKind::Invariant,
                "{}",
                violation
            );
        }
    }};

    ($expr:expr, $context:expr) => {{
        use $crate::telemetry::InvariantChecker as _;
        if let Err(violation) = $expr.check_invariants() {
            $crate::report_violation!(
                $crate::telemetry::ViolationSeverity::Critical,
                $crate::telemetry::ViolationKind::Invariant,
                "{} [context: {}]",
                violation,
                $context
            );
        }
    }};
}

/// No-op version for release builds without `paranoid` feature.
#[macro_export]
#[cfg(not(any(debug_assertions, feature = "paranoid")))]
macro_rules! debug_check_invariants {
    ($expr:expr) => {{}};
    ($expr:expr, $context:expr) => {{}};
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
    fn test_violation_severity_ordering() {
        assert!(ViolationSeverity::Warning < ViolationSeverity::Error);
        assert!(ViolationSeverity::Error < ViolationSeverity::Critical);
    }

    #[test]
    fn test_violation_kind_as_str() {
        assert_eq!(ViolationKind::FrameSync.as_str(), "frame_sync");
        assert_eq!(ViolationKind::InputBuffer.as_str(), "input_buffer");
        assert_eq!(ViolationKind::NetChannel.as_str(), "net_channel");
        assert_eq!(ViolationKind::Scheduler.as_str(), "scheduler");
        assert_eq!(ViolationKind::Serialization.as_str(), "serialization");
    }

    #[test]
    fn test_violation_builder_and_display() {
        let violation = ProtocolViolation::new(
            ViolationSeverity::Error,
            ViolationKind::Serialization,
            "bad input packet",
            "test.rs:10",
        )
        .with_frame(CommandFrame::new(50))
        .with_context("owner", "3");

        assert_eq!(violation.context.get("owner"), Some(&"3".to_owned()));
        let display = violation.to_string();
        assert!(display.contains("error"));
        assert!(display.contains("serialization"));
        assert!(display.contains("frame=50"));
    }

    #[test]
    fn test_violation_json_without_frame_is_null() {
        let violation = ProtocolViolation::new(
            ViolationSeverity::Warning,
            ViolationKind::Scheduler,
            "overload",
            "test.rs:1",
        );
        let json = violation.to_json().unwrap();
        assert!(json.contains(r#""frame":null"#));
        assert!(json.contains(r#""severity":"warning""#));
    }

    #[test]
    fn test_collecting_observer() {
        let observer = CollectingObserver::new();
        assert!(observer.is_empty());

        observer.on_violation(&ProtocolViolation::new(
            ViolationSeverity::Warning,
            ViolationKind::NetChannel,
            "first",
            "test.rs:1",
        ));
        observer.on_violation(&ProtocolViolation::new(
            ViolationSeverity::Error,
            ViolationKind::Serialization,
            "second",
            "test.rs:2",
        ));

        assert_eq!(observer.len(), 2);
        assert!(observer.has_violation(ViolationKind::NetChannel));
        assert!(!observer.has_violation(ViolationKind::FrameSync));
        assert!(observer.has_severity(ViolationSeverity::Error));
        assert_eq!(observer.violations_of_kind(ViolationKind::NetChannel).len(), 1);

        observer.clear();
        assert_no_violations!(observer);
    }

    #[test]
    fn test_composite_observer_fans_out() {
        let first = Arc::new(CollectingObserver::new());
        let second = Arc::new(CollectingObserver::new());
        let mut composite = CompositeObserver::new();
        composite.add(first.clone());
        composite.add(second.clone());

        composite.on_violation(&ProtocolViolation::new(
            ViolationSeverity::Warning,
            ViolationKind::FrameSync,
            "reset",
            "test.rs:1",
        ));
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert!(format!("{composite:?}").contains("num_observers: 2"));
    }

    #[test]
    fn test_report_violation_to_prefers_observer() {
        let collecting = Arc::new(CollectingObserver::new());
        let observer: Option<Arc<dyn ViolationObserver>> = Some(collecting.clone());
        report_violation_to!(
            observer,
            CommandFrame::new(4),
            ViolationSeverity::Warning,
            ViolationKind::Scheduler,
            "dropped {} frames",
            2
        );
        let violations = collecting.violations();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].frame, Some(CommandFrame::new(4)));
        assert_eq!(violations[0].message, "dropped 2 frames");
        assert_violation!(collecting, ViolationKind::Scheduler);
    }

    #[test]
    fn test_invariant_violation_display() {
        let violation = InvariantViolation::new("OwnershipCircularQueue", "head beyond end")
            .with_details("head=5, end=4");
        assert_eq!(
            violation.to_string(),
            "OwnershipCircularQueue: head beyond end (head=5, end=4)"
        );
    }
}
