//! Point-in-time signal readings published by tuner sessions.

use std::time::{Duration, Instant};

use satip_protocol::TunerStatus;

/// An immutable signal-quality reading.
///
/// Written exclusively by the owning session's status listener and
/// published through a `tokio::sync::watch` channel, so readers always
/// observe either the previous or the next complete value, never a mix.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Display label of the originating tune request.
    pub label: String,
    /// Signal level, 0–100.
    pub signal: u8,
    /// Signal quality, 0–100.
    pub quality: u8,
    /// Whether the server reports lock on the transponder.
    pub lock: bool,
    /// Number of status records folded into snapshots so far; 0 means no
    /// record has arrived yet and the other fields are placeholders.
    pub sequence: u64,
    /// When this reading was taken (session start for the placeholder).
    pub taken_at: Instant,
}

impl MetricsSnapshot {
    /// The "searching" placeholder published before the first status
    /// record arrives. Never reports a synthetic non-zero quality.
    pub fn placeholder(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            signal: 0,
            quality: 0,
            lock: false,
            sequence: 0,
            taken_at: Instant::now(),
        }
    }

    /// Fold a decoded status record into the next snapshot.
    pub fn from_status(label: impl Into<String>, sequence: u64, status: &TunerStatus) -> Self {
        Self {
            label: label.into(),
            signal: status.level_percent(),
            quality: status.quality_percent(),
            lock: status.lock,
            sequence,
            taken_at: Instant::now(),
        }
    }

    /// Age of this reading.
    pub fn age(&self) -> Duration {
        self.taken_at.elapsed()
    }

    /// Whether any status record has ever been folded in.
    pub fn has_data(&self) -> bool {
        self.sequence > 0
    }

    /// A snapshot is stale once it carries real data that has not been
    /// replaced within the staleness threshold. The placeholder never
    /// goes stale; a session without any record is searching, not stalled.
    pub fn is_stale(&self, threshold: Duration) -> bool {
        self.has_data() && self.age() > threshold
    }
}
