use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// One node in a tree of named wall-clock intervals. Stopping a parent
/// stops every still-running child first; stopping twice is a no-op.
#[derive(Debug, Default)]
pub struct TimedInterval {
    name: Option<String>,
    started: Option<Instant>,
    duration: Option<Duration>,
    subintervals: Vec<TimedInterval>,
    data: BTreeMap<String, Value>,
}

impl TimedInterval {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    pub fn subintervals(&self) -> &[TimedInterval] {
        &self.subintervals
    }

    pub fn data(&self) -> &BTreeMap<String, Value> {
        &self.data
    }

    pub fn subinterval(&mut self, name: impl Into<String>) -> &mut TimedInterval {
        let idx = self.subintervals.len();
        self.subintervals.push(TimedInterval::named(name));
        &mut self.subintervals[idx]
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.data.insert(key.into(), value.into());
    }

    pub fn start(&mut self) {
        self.started = Some(Instant::now());
    }

    pub fn stop(&mut self) {
        if self.duration.is_some() {
            return;
        }
        for sub in &mut self.subintervals {
            sub.stop();
        }
        if let Some(started) = self.started {
            self.duration = Some(started.elapsed());
        }
    }

    /// Runs `f` inside a freshly started subinterval and stops it on the
    /// way out.
    pub fn timed<T>(&mut self, name: impl Into<String>, f: impl FnOnce(&mut TimedInterval) -> T) -> T {
        let sub = self.subinterval(name);
        sub.start();
        let out = f(sub);
        sub.stop();
        out
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out, 0);
        out
    }

    fn render_into(&self, out: &mut String, indent: usize) {
        let name = self.name.as_deref().unwrap_or("anonymous");
        let duration = match self.duration {
            Some(duration) => format_duration(duration),
            None => "running".to_string(),
        };
        out.push_str(&" ".repeat(indent));
        out.push_str(&format!("{name} - {duration}\n"));
        for sub in &self.subintervals {
            sub.render_into(out, indent + 2);
        }
    }

    pub fn show(&self) {
        print!("{}", self.render());
    }
}

fn format_duration(duration: Duration) -> String {
    if duration >= Duration::from_secs(1) {
        format!("{:.3}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

/// Tracks progress over a known number of items and estimates the time
/// remaining from the mean per-item duration observed so far.
#[derive(Debug)]
pub struct ProgressCounter {
    n_items: usize,
    n_done: usize,
    started: Instant,
    last_step: Instant,
}

impl ProgressCounter {
    pub fn new(n_items: usize) -> Self {
        let now = Instant::now();
        Self {
            n_items,
            n_done: 0,
            started: now,
            last_step: now,
        }
    }

    pub fn n_items(&self) -> usize {
        self.n_items
    }

    pub fn n_done(&self) -> usize {
        self.n_done
    }

    pub fn step(&mut self) {
        self.n_done += 1;
        self.last_step = Instant::now();
    }

    /// Mean-per-item extrapolation; `None` until the first step.
    pub fn remaining(&self) -> Option<Duration> {
        if self.n_done == 0 {
            return None;
        }
        let elapsed = self.last_step.duration_since(self.started);
        let left = self.n_items.saturating_sub(self.n_done);
        Some(Duration::from_secs_f64(
            elapsed.as_secs_f64() / self.n_done as f64 * left as f64,
        ))
    }

    pub fn log(&self) -> String {
        if self.n_done == 0 {
            return format!("[0/{}]", self.n_items);
        }
        let remaining = self.remaining().unwrap_or_default();
        format!(
            "[{}/{}] - eta {}",
            self.n_done,
            self.n_items,
            format_compact(remaining)
        )
    }
}

/// Compact `DdHhMmSs` rendering, omitting zero-valued components; whole
/// seconds only.
fn format_compact(duration: Duration) -> String {
    let mut seconds = duration.as_secs();
    let days = seconds / (24 * 3600);
    seconds -= days * 24 * 3600;
    let hours = seconds / 3600;
    seconds -= hours * 3600;
    let minutes = seconds / 60;
    seconds -= minutes * 60;

    let mut out = String::new();
    if days > 0 {
        out.push_str(&format!("{days}d"));
    }
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
    }
    if minutes > 0 {
        out.push_str(&format!("{minutes}m"));
    }
    if seconds > 0 {
        out.push_str(&format!("{seconds}s"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::thread;

    #[test]
    fn stopping_a_parent_stops_running_children_first() {
        let mut root = TimedInterval::named("root");
        root.start();
        root.subinterval("first").start();
        root.subinterval("second").start();
        thread::sleep(Duration::from_millis(5));
        root.stop();

        assert!(root.duration().is_some());
        for sub in root.subintervals() {
            assert!(sub.duration().is_some(), "child {:?} not stopped", sub.name());
        }
    }

    #[test]
    fn stop_is_idempotent() {
        let mut interval = TimedInterval::named("once");
        interval.start();
        thread::sleep(Duration::from_millis(5));
        interval.stop();
        let first = interval.duration().expect("stopped");
        thread::sleep(Duration::from_millis(5));
        interval.stop();
        assert_eq!(interval.duration().expect("still stopped"), first);
    }

    #[test]
    fn stopping_without_starting_leaves_no_duration() {
        let mut interval = TimedInterval::named("never");
        interval.stop();
        assert!(interval.duration().is_none());
    }

    #[test]
    fn timed_scope_records_the_subinterval() {
        let mut root = TimedInterval::named("root");
        root.start();
        let answer = root.timed("work", |sub| {
            sub.put("attempt", 1);
            42
        });
        root.stop();

        assert_eq!(answer, 42);
        let sub = &root.subintervals()[0];
        assert_eq!(sub.name(), Some("work"));
        assert!(sub.duration().is_some());
        assert_eq!(sub.data().get("attempt"), Some(&json!(1)));
    }

    #[test]
    fn render_indents_children_and_formats_durations() {
        let mut root = TimedInterval::named("root");
        root.duration = Some(Duration::from_millis(1500));
        let child = root.subinterval("child");
        child.duration = Some(Duration::from_millis(250));
        root.subintervals.push(TimedInterval::default());

        let rendered = root.render();
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[0], "root - 1.500s");
        assert_eq!(lines[1], "  child - 250ms");
        assert_eq!(lines[2], "  anonymous - running");
    }

    #[test]
    fn counter_reports_trivial_status_before_any_step() {
        let counter = ProgressCounter::new(5);
        assert_eq!(counter.log(), "[0/5]");
        assert!(counter.remaining().is_none());
    }

    #[test]
    fn counter_estimates_remaining_from_the_mean_step_time() {
        let mut counter = ProgressCounter::new(4);
        counter.started = Instant::now()
            .checked_sub(Duration::from_secs(10))
            .expect("clock headroom");
        counter.step();

        let remaining = counter.remaining().expect("remaining after a step");
        assert!(
            (remaining.as_secs_f64() - 30.0).abs() < 1.0,
            "expected ~30s, got {:?}",
            remaining
        );
        assert!(counter.log().starts_with("[1/4] - eta "));
    }

    #[test]
    fn stepping_past_the_item_count_never_underflows() {
        let mut counter = ProgressCounter::new(1);
        counter.step();
        counter.step();
        assert_eq!(counter.remaining().expect("remaining"), Duration::ZERO);
    }

    #[test]
    fn compact_format_omits_zero_components() {
        assert_eq!(format_compact(Duration::from_secs(30)), "30s");
        assert_eq!(format_compact(Duration::from_secs(90)), "1m30s");
        assert_eq!(format_compact(Duration::from_secs(3600 + 120 + 5)), "1h2m5s");
        assert_eq!(format_compact(Duration::from_secs(2 * 24 * 3600 + 3)), "2d3s");
        assert_eq!(format_compact(Duration::ZERO), "");
    }
}
