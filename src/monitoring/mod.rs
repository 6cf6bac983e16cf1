pub mod logging;
pub mod metrics;

use crate::reconciler::Phase;

/// Libellé Prometheus d'une phase de cycle.
pub fn phase_label(phase: Phase) -> &'static str {
    match phase {
        Phase::Idle => "idle",
        Phase::Fetching => "fetching",
        Phase::Applying => "applying",
    }
}
