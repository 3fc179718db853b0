use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder};
use std::sync::OnceLock;
use tracing::warn;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}

struct Metrics {
    resident_sessions: IntGauge,
    session_transitions: IntCounterVec,
    memory_saves: IntCounterVec,
    work_claimed: IntCounter,
}

static METRICS: OnceLock<Option<Metrics>> = OnceLock::new();

impl Metrics {
    fn register() -> prometheus::Result<Self> {
        let resident_sessions = IntGauge::new(
            "parallel_sessions_resident",
            "Sessions currently resident in memory",
        )?;
        let session_transitions = IntCounterVec::new(
            prometheus::opts!(
                "parallel_sessions_transitions_total",
                "Session lifecycle transitions"
            ),
            &["transition"],
        )?;
        let memory_saves = IntCounterVec::new(
            prometheus::opts!("parallel_sessions_memory_saves_total", "Channel memories saved"),
            &["promoted"],
        )?;
        let work_claimed = IntCounter::new(
            "parallel_sessions_work_claimed_total",
            "Work items handed to executors",
        )?;

        REGISTRY.register(Box::new(resident_sessions.clone()))?;
        REGISTRY.register(Box::new(session_transitions.clone()))?;
        REGISTRY.register(Box::new(memory_saves.clone()))?;
        REGISTRY.register(Box::new(work_claimed.clone()))?;

        Ok(Self {
            resident_sessions,
            session_transitions,
            memory_saves,
            work_claimed,
        })
    }
}

fn metrics() -> Option<&'static Metrics> {
    METRICS
        .get_or_init(|| match Metrics::register() {
            Ok(metrics) => Some(metrics),
            Err(e) => {
                warn!("Failed to register metrics: {}", e);
                None
            }
        })
        .as_ref()
}

/// Register the collectors. Recording a metric does this lazily as well.
pub fn init_metrics() {
    metrics();
}

pub fn set_resident_sessions(count: usize) {
    if let Some(m) = metrics() {
        m.resident_sessions.set(count as i64);
    }
}

/// `transition` is one of `created`, `hibernated` or `reactivated`.
pub fn inc_session_transition(transition: &str) {
    if let Some(m) = metrics() {
        m.session_transitions.with_label_values(&[transition]).inc();
    }
}

pub fn inc_memory_saved(promoted: bool) {
    if let Some(m) = metrics() {
        let label = if promoted { "true" } else { "false" };
        m.memory_saves.with_label_values(&[label]).inc();
    }
}

pub fn inc_work_claimed(count: usize) {
    if let Some(m) = metrics() {
        m.work_claimed.inc_by(count as u64);
    }
}

/// Current values in the Prometheus text exposition format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorded_metrics_show_up_in_exposition() {
        init_metrics();
        init_metrics();
        inc_session_transition("created");
        inc_memory_saved(true);
        inc_work_claimed(2);
        set_resident_sessions(3);

        let text = gather();
        assert!(text.contains("parallel_sessions_transitions_total{transition=\"created\"}"));
        assert!(text.contains("parallel_sessions_memory_saves_total{promoted=\"true\"}"));
        assert!(text.contains("parallel_sessions_work_claimed_total"));
        assert!(text.contains("parallel_sessions_resident"));
    }
}
