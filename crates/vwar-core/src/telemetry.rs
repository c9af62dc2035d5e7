//! In-memory monotonic counters, surfaced on shutdown or on request.
//! One explicit value owned by the engine; no global state.

use parking_lot::Mutex;
use std::collections::BTreeMap;

#[derive(Default)]
pub struct Telemetry {
    counters: Mutex<BTreeMap<String, u64>>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, name: &str) {
        *self.counters.lock().entry(name.to_string()).or_insert(0) += 1;
    }

    pub fn get(&self, name: &str) -> u64 {
        self.counters.lock().get(name).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counters.lock().clone()
    }

    /// One `name=value` line per counter, sorted by name.
    pub fn render(&self) -> String {
        self.snapshot()
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_monotonic() {
        let t = Telemetry::new();
        t.incr("scan_clean");
        t.incr("scan_clean");
        t.incr("duplicate_suppressed");
        assert_eq!(t.get("scan_clean"), 2);
        assert_eq!(t.get("duplicate_suppressed"), 1);
        assert_eq!(t.get("never_touched"), 0);
    }

    #[test]
    fn render_is_sorted() {
        let t = Telemetry::new();
        t.incr("zebra");
        t.incr("alpha");
        let rendered = t.render();
        let lines: Vec<_> = rendered.lines().collect();
        assert_eq!(lines, vec!["alpha=1", "zebra=1"]);
    }
}
