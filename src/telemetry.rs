//! Structured telemetry pipeline for protocol violations.
//!
//! Anything unexpected that the protocol recovers from (a malformed packet, a seed
//! correction, dropped input) is reported as a [`ProtocolViolation`] instead of a bare log
//! line. Violations are:
//!
//! - Logged via tracing (default behavior)
//! - Collected programmatically for testing
//! - Sent to custom observers (metrics, alerting, etc.)
//!
//! # Example
//!
//! ```
//! use fortress_lockstep::telemetry::{ViolationSeverity, ViolationKind, CollectingObserver};
//! use std::sync::Arc;
//!
//! // Create a collecting observer for tests
//! let observer = Arc::new(CollectingObserver::new());
//!
//! // Check violations after some operations
//! assert!(observer.violations().is_empty(), "unexpected violations");
//! ```

use crate::Frame;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Severity of a violation.
///
/// Severities are ordered from least to most severe, allowing filtering
/// and comparison operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    /// Unexpected but recoverable - operation continued with fallback.
    ///
    /// Example: a peer's seed was corrected to the host's value.
    Warning,
    /// Serious issue - operation may have degraded behavior.
    ///
    /// Example: a socket read failed while draining the lobby.
    Error,
    /// Critical invariant broken - state may be corrupted.
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

/// Categories of violations, one per protocol concern.
///
/// # Forward Compatibility
///
/// This enum is marked `#[non_exhaustive]` because new violation categories
/// may be added in future versions. Always include a wildcard arm when matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ViolationKind {
    /// Lockstep frame exchange issue.
    ///
    /// Examples:
    /// - Payload for a frame neither current, previous nor next
    /// - Retransmission after a timeout slice
    FrameSync,
    /// Packet could not be decoded or came from an unexpected source.
    NetworkProtocol,
    /// A peer's seed disagreed with the host's for the same frame.
    SeedMismatch,
    /// Start handshake anomaly (unexpected ack, duplicate ack).
    Handshake,
    /// Lobby message arrived in a state that cannot use it.
    Lobby,
    /// Local input exceeded the per-frame byte budget and was dropped.
    InputOverflow,
    /// Configuration constraint violated.
    Configuration,
    /// Internal logic error (should never happen).
    InternalError,
}

impl ViolationKind {
    /// Returns a string representation suitable for logging/metrics labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::FrameSync => "frame_sync",
            Self::NetworkProtocol => "network_protocol",
            Self::SeedMismatch => "seed_mismatch",
            Self::Handshake => "handshake",
            Self::Lobby => "lobby",
            Self::InputOverflow => "input_overflow",
            Self::Configuration => "configuration",
            Self::InternalError => "internal_error",
        }
    }
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded violation.
///
/// # Example
///
/// ```
/// use fortress_lockstep::telemetry::{ProtocolViolation, ViolationSeverity, ViolationKind};
/// use fortress_lockstep::Frame;
///
/// let violation = ProtocolViolation::new(
///     ViolationSeverity::Warning,
///     ViolationKind::SeedMismatch,
///     "re-seeded to host value",
///     "lockstep.rs:42",
/// ).with_frame(Frame::new(100))
///  .with_context("local", "17")
///  .with_context("host", "99");
///
/// assert_eq!(violation.frame, Some(Frame::new(100)));
/// assert!(violation.to_string().contains("seed_mismatch"));
/// ```
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProtocolViolation {
    /// The severity level of this violation.
    pub severity: ViolationSeverity,
    /// The protocol concern where the violation occurred.
    pub kind: ViolationKind,
    /// Human-readable description of what went wrong.
    pub message: String,
    /// Source location where the violation was detected (file:line).
    pub location: &'static str,
    /// The lockstep frame at which the violation occurred, if applicable.
    pub frame: Option<Frame>,
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
    pub fn with_frame(mut self, frame: Frame) -> Self {
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
    ///
    /// Returns `None` if serialization fails.
    #[cfg(feature = "json")]
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

/// Trait for observing violations.
///
/// Implement this trait to create custom observers that can react to
/// violations in various ways (logging, metrics, alerting, etc.).
///
/// # Example
///
/// ```
/// use fortress_lockstep::telemetry::{ViolationObserver, ProtocolViolation};
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// struct CountingObserver {
///     seen: AtomicUsize,
/// }
///
/// impl ViolationObserver for CountingObserver {
///     fn on_violation(&self, _violation: &ProtocolViolation) {
///         self.seen.fetch_add(1, Ordering::Relaxed);
///     }
/// }
/// ```
pub trait ViolationObserver: Send + Sync {
    /// Called when a violation is detected.
    fn on_violation(&self, violation: &ProtocolViolation);
}

/// Built-in observer that logs violations via the `tracing` crate.
///
/// # Log Levels
///
/// - `Warning` severity → `tracing::warn!`
/// - `Error` and `Critical` severity → `tracing::error!`
///
/// All fields are emitted as structured tracing fields (`severity`, `kind`,
/// `location`, `frame`, `context`).
#[derive(Debug, Default, Clone)]
pub struct TracingObserver;

impl TracingObserver {
    /// Creates a new tracing observer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn format_frame(frame: Option<Frame>) -> String {
        frame.map_or_else(|| "null".to_owned(), |f| f.to_string())
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
///
/// # Example
///
/// ```
/// use fortress_lockstep::telemetry::{CollectingObserver, ViolationKind, ViolationObserver, ProtocolViolation, ViolationSeverity};
///
/// let observer = CollectingObserver::new();
///
/// observer.on_violation(&ProtocolViolation::new(
///     ViolationSeverity::Warning,
///     ViolationKind::FrameSync,
///     "test violation",
///     "test.rs:1",
/// ));
///
/// assert_eq!(observer.violations().len(), 1);
/// assert!(observer.has_violation(ViolationKind::FrameSync));
/// ```
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

/// Reports a violation to an optional observer, falling back to [`TracingObserver`] if `None`.
///
/// # Example
///
/// ```
/// use fortress_lockstep::telemetry::{
///     report_to_observer, CollectingObserver, ProtocolViolation, ViolationKind, ViolationSeverity
/// };
/// use std::sync::Arc;
///
/// let observer = Arc::new(CollectingObserver::new());
/// let violation = ProtocolViolation::new(
///     ViolationSeverity::Warning,
///     ViolationKind::Lobby,
///     "test message",
///     "test.rs:1",
/// );
///
/// report_to_observer(Some(&observer), &violation);
/// assert_eq!(observer.len(), 1);
/// ```
pub fn report_to_observer<O: ViolationObserver + ?Sized>(
    observer: Option<&Arc<O>>,
    violation: &ProtocolViolation,
) {
    match observer {
        Some(obs) => obs.on_violation(violation),
        None => TracingObserver.on_violation(violation),
    }
}

/// Reports a violation to the default [`TracingObserver`], tagging it with the call site.
///
/// # Syntax
///
/// ```text
/// report_violation!(severity, kind, "message");
/// report_violation!(severity, kind, "message with {}", format_args);
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

/// Reports a violation through an `Option<Arc<dyn ViolationObserver>>`, falling back to
/// [`TracingObserver`] when it is `None`.
///
/// # Syntax
///
/// ```text
/// report_violation_to!(observer, severity, kind, "message");
/// report_violation_to!(observer, severity, kind, "message with {}", format_args);
/// report_violation_to!(observer, frame = frame, severity, kind, "message with {}", format_args);
/// ```
///
/// # Example
///
/// ```
/// use fortress_lockstep::{report_violation_to, telemetry::{ViolationSeverity, ViolationKind, CollectingObserver, ViolationObserver}, Frame};
/// use std::sync::Arc;
///
/// let observer: Option<Arc<dyn ViolationObserver>> = Some(Arc::new(CollectingObserver::new()));
///
/// report_violation_to!(&observer, ViolationSeverity::Warning, ViolationKind::FrameSync,
///     "stale payload: expected={}, actual={}", 10, 8);
/// report_violation_to!(&observer, frame = Frame::new(10), ViolationSeverity::Warning,
///     ViolationKind::InputOverflow, "input dropped");
/// ```
#[macro_export]
macro_rules! report_violation_to {
    ($observer:expr, frame = $frame:expr, $severity:expr, $kind:expr, $msg:literal) => {{
        let violation = $crate::telemetry::ProtocolViolation::new(
            $severity,
            $kind,
            $msg,
            concat!(file!(), ":", line!()),
        )
        .with_frame($frame);
        $crate::telemetry::report_to_observer($observer.as_ref(), &violation);
    }};

    ($observer:expr, frame = $frame:expr, $severity:expr, $kind:expr, $fmt:literal, $($arg:tt)+) => {{
        let violation = $crate::telemetry::ProtocolViolation::new(
            $severity,
            $kind,
            format!($fmt, $($arg)+),
            concat!(file!(), ":", line!()),
        )
        .with_frame($frame);
        $crate::telemetry::report_to_observer($observer.as_ref(), &violation);
    }};

    ($observer:expr, $severity:expr, $kind:expr, $msg:literal) => {{
        let violation = $crate::telemetry::ProtocolViolation::new(
            $severity,
            $kind,
            $msg,
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::report_to_observer($observer.as_ref(), &violation);
    }};

    ($observer:expr, $severity:expr, $kind:expr, $fmt:literal, $($arg:tt)+) => {{
        let violation = $crate::telemetry::ProtocolViolation::new(
            $severity,
            $kind,
            format!($fmt, $($arg)+),
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::report_to_observer($observer.as_ref(), &violation);
    }};
}

/// Asserts that no violations have been collected.
///
/// # Panics
///
/// Panics if the observer contains any violations, printing them for debugging.
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
///
/// # Panics
///
/// Panics if no violation of the specified kind was found.
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
        assert_eq!(ViolationKind::SeedMismatch.as_str(), "seed_mismatch");
        assert_eq!(ViolationKind::InputOverflow.as_str(), "input_overflow");
        assert_eq!(ViolationKind::Lobby.as_str(), "lobby");
    }

    #[test]
    fn test_protocol_violation_display() {
        let violation = ProtocolViolation::new(
            ViolationSeverity::Error,
            ViolationKind::NetworkProtocol,
            "short packet",
            "test.rs:10",
        )
        .with_frame(Frame::new(50))
        .with_context("len", "3");

        let display = violation.to_string();
        assert!(display.contains("error"));
        assert!(display.contains("network_protocol"));
        assert!(display.contains("short packet"));
        assert!(display.contains("frame=50"));
        assert!(display.contains("len"));
    }

    #[test]
    fn test_collecting_observer_through_macro() {
        let observer: Option<Arc<dyn ViolationObserver>> = None;
        // Falls back to tracing without panicking
        report_violation_to!(
            observer,
            ViolationSeverity::Warning,
            ViolationKind::Lobby,
            "dropped {}",
            "GAME_INFO"
        );

        let collecting = Arc::new(CollectingObserver::new());
        let observer: Option<Arc<dyn ViolationObserver>> = Some(collecting.clone());
        report_violation_to!(
            observer,
            ViolationSeverity::Warning,
            ViolationKind::SeedMismatch,
            "re-seeded"
        );
        assert_eq!(collecting.len(), 1);
        assert_violation!(collecting, ViolationKind::SeedMismatch);
        assert_eq!(
            collecting.violations_of_kind(ViolationKind::SeedMismatch)[0].message,
            "re-seeded"
        );

        collecting.clear();
        assert_no_violations!(collecting);
    }

    #[test]
    fn test_report_with_frame_sets_structured_frame() {
        let collecting = Arc::new(CollectingObserver::new());
        let observer: Option<Arc<dyn ViolationObserver>> = Some(collecting.clone());
        report_violation_to!(
            observer,
            frame = Frame::new(7),
            ViolationSeverity::Warning,
            ViolationKind::InputOverflow,
            "budget of {} bytes full",
            512
        );

        let violations = collecting.violations();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].frame, Some(Frame::new(7)));
        assert_eq!(violations[0].message, "budget of 512 bytes full");
        assert!(violations[0].to_string().contains("frame=7"));
    }

    #[test]
    fn test_violation_serializes_frame_as_number() {
        let violation = ProtocolViolation::new(
            ViolationSeverity::Warning,
            ViolationKind::FrameSync,
            "test",
            "test.rs:1",
        )
        .with_frame(Frame::new(42));
        let json = serde_json::to_string(&violation).unwrap();
        assert!(json.contains(r#""frame":42"#));
        assert!(json.contains(r#""kind":"frame_sync""#));
    }
}
