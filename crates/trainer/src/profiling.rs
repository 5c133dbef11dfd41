//! Step profiling
//!
//! A [`StepTrace`] collects timed spans and counters while a model executes
//! one instrumented step. The result is exported as Chrome trace JSON, which
//! `chrome://tracing` and Perfetto can open directly.

use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Instant;

/// Collector handed to the model for one step
#[derive(Debug)]
pub struct StepTrace {
    origin: Option<Instant>,
    events: Vec<TraceEvent>,
}

impl StepTrace {
    /// A trace that records spans
    pub fn enabled() -> Self {
        Self {
            origin: Some(Instant::now()),
            events: Vec::new(),
        }
    }

    /// A trace that only runs the wrapped work
    pub fn disabled() -> Self {
        Self {
            origin: None,
            events: Vec::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.origin.is_some()
    }

    /// Run `f`, recording it as a span named `name` when enabled
    pub fn scope<T>(&mut self, name: &str, f: impl FnOnce() -> T) -> T {
        let Some(origin) = self.origin else {
            return f();
        };

        let start = Instant::now();
        let out = f();
        let end = Instant::now();

        self.events.push(TraceEvent {
            name: name.to_string(),
            cat: "step".to_string(),
            ph: "X",
            ts: micros_since(origin, start),
            dur: Some(micros_since(start, end)),
            pid: 0,
            tid: 0,
            args: BTreeMap::new(),
        });
        out
    }

    /// Record a counter sample, e.g. bytes of live state
    pub fn counter(&mut self, name: &str, value: u64) {
        let Some(origin) = self.origin else {
            return;
        };

        let mut args = BTreeMap::new();
        args.insert(name.to_string(), value);
        self.events.push(TraceEvent {
            name: "memory".to_string(),
            cat: "memory".to_string(),
            ph: "C",
            ts: micros_since(origin, Instant::now()),
            dur: None,
            pid: 0,
            tid: 0,
            args,
        });
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    /// Chrome trace document of everything recorded so far
    pub fn to_chrome_trace(&self) -> ChromeTrace {
        ChromeTrace {
            trace_events: self.events.clone(),
            display_time_unit: "ms",
        }
    }
}

/// One Chrome trace event (`X` complete span or `C` counter)
#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    pub name: String,
    pub cat: String,
    pub ph: &'static str,
    pub ts: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dur: Option<u64>,
    pub pid: u32,
    pub tid: u32,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<String, u64>,
}

/// Top-level Chrome trace document
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChromeTrace {
    pub trace_events: Vec<TraceEvent>,
    pub display_time_unit: &'static str,
}

fn micros_since(earlier: Instant, later: Instant) -> u64 {
    later.saturating_duration_since(earlier).as_micros() as u64
}
