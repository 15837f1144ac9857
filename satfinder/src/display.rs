//! Terminal signal display.
//!
//! Two bars per tuner (signal level and quality), refreshed in place.
//! Logging goes to files while the display runs, so the bars own the
//! terminal.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::tuner::pool::TunerReport;
use crate::tuner::session::SessionState;

const SIGNAL_TEMPLATE: &str =
    "{prefix:>28.bold} Signal  [{bar:40.cyan/blue}] {pos:>3}% {msg}";
const QUALITY_TEMPLATE: &str =
    "{prefix:>28} SNR     [{bar:40.green/blue}] {pos:>3}%";

struct TunerRow {
    signal: ProgressBar,
    quality: ProgressBar,
}

/// One pair of in-place bars per tuner session.
pub struct SignalDisplay {
    _multi: MultiProgress,
    rows: Vec<TunerRow>,
}

impl SignalDisplay {
    pub fn new(labels: &[String]) -> Self {
        let multi = MultiProgress::new();
        let signal_style = ProgressStyle::default_bar()
            .template(SIGNAL_TEMPLATE)
            .unwrap()
            .progress_chars("=>-");
        let quality_style = ProgressStyle::default_bar()
            .template(QUALITY_TEMPLATE)
            .unwrap()
            .progress_chars("=>-");

        let rows = labels
            .iter()
            .map(|label| {
                let signal = multi.add(ProgressBar::new(100));
                signal.set_style(signal_style.clone());
                signal.set_prefix(label.clone());
                signal.set_message(status_tag_for(SessionState::Idle, false, false));

                let quality = multi.add(ProgressBar::new(100));
                quality.set_style(quality_style.clone());
                quality.set_prefix(String::new());

                TunerRow { signal, quality }
            })
            .collect();

        Self {
            _multi: multi,
            rows,
        }
    }

    /// Push the latest reports into the bars. Rows are matched by session
    /// order, which never changes after startup.
    pub fn render(&self, reports: &[TunerReport]) {
        for (row, report) in self.rows.iter().zip(reports) {
            row.signal.set_position(u64::from(report.snapshot.signal));
            row.quality.set_position(u64::from(report.snapshot.quality));
            row.signal.set_message(status_tag(report));
        }
    }

    /// Leave the final readings on screen.
    pub fn finish(&self) {
        for row in &self.rows {
            row.signal.abandon();
            row.quality.abandon();
        }
    }
}

/// The status tag shown next to a tuner's signal bar.
pub fn status_tag(report: &TunerReport) -> &'static str {
    status_tag_for(report.state, report.stale, report.snapshot.lock)
}

fn status_tag_for(state: SessionState, stale: bool, lock: bool) -> &'static str {
    if state == SessionState::Errored {
        "FAILED"
    } else if stale {
        "STALE"
    } else if lock {
        "LOCK"
    } else {
        "SEARCH"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuner::metrics::MetricsSnapshot;

    fn report(state: SessionState, stale: bool, lock: bool) -> TunerReport {
        let mut snapshot = MetricsSnapshot::placeholder("t");
        snapshot.lock = lock;
        if lock {
            snapshot.sequence = 1;
        }
        TunerReport {
            index: 0,
            label: "t".to_string(),
            state,
            snapshot,
            stale,
            dropped_records: 0,
        }
    }

    #[test]
    fn failed_takes_precedence_over_everything() {
        assert_eq!(status_tag(&report(SessionState::Errored, true, true)), "FAILED");
        assert_eq!(status_tag(&report(SessionState::Errored, false, false)), "FAILED");
    }

    #[test]
    fn stale_takes_precedence_over_lock() {
        assert_eq!(status_tag(&report(SessionState::Playing, true, true)), "STALE");
    }

    #[test]
    fn lock_and_search() {
        assert_eq!(status_tag(&report(SessionState::Playing, false, true)), "LOCK");
        assert_eq!(status_tag(&report(SessionState::Playing, false, false)), "SEARCH");
        assert_eq!(status_tag(&report(SessionState::SettingUp, false, false)), "SEARCH");
    }
}
