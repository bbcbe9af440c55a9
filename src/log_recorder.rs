// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;

use anyhow::Result;
use log::info;
use metrics::Counter;
use metrics::Gauge;
use metrics::Histogram;
use metrics::Key;
use metrics::KeyName;
use metrics::Metadata;
use metrics::Recorder;
use metrics::SharedString;
use metrics::Unit;
use metrics_util::registry::AtomicStorage;
use metrics_util::registry::Registry;
use metrics_util::AtomicBucket;

type AtomicRegistry = Registry<Key, AtomicStorage>;

/// A builder for creating a new instance of `LogRecorder` and installing it as
/// the global recorder.
///
/// Example:
///
/// ```no_run
/// let report = scx_eas::LogRecorderBuilder::new().install()?;
/// // ... replay ...
/// report.log();
/// # Ok::<(), anyhow::Error>(())
/// ```
#[derive(Default)]
pub struct LogRecorderBuilder {}

impl LogRecorderBuilder {
    pub fn new() -> LogRecorderBuilder {
        Self {}
    }

    /// Builds the recorder without installing it, e.g. for
    /// `metrics::with_local_recorder`.
    pub fn build(self) -> (LogRecorder, MetricsReport) {
        let registry = Arc::new(Registry::<Key, AtomicStorage>::atomic());
        let report = MetricsReport {
            registry: registry.clone(),
        };
        (LogRecorder { registry }, report)
    }

    /// Installs the log recorder as the global recorder.
    pub fn install(self) -> Result<MetricsReport> {
        let (recorder, report) = self.build();
        metrics::set_global_recorder(recorder)?;
        Ok(report)
    }
}

/// A metrics recorder keeping everything in an in-memory registry, dumped to
/// the log on demand through its [`MetricsReport`].
pub struct LogRecorder {
    registry: Arc<AtomicRegistry>,
}

impl Recorder for LogRecorder {
    fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
        self.registry.get_or_create_counter(key, |c| c.clone().into())
    }

    fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
        self.registry.get_or_create_gauge(key, |g| g.clone().into())
    }

    fn register_histogram(&self, key: &Key, _: &Metadata<'_>) -> Histogram {
        self.registry
            .get_or_create_histogram(key, |h: &Arc<AtomicBucket<f64>>| h.clone().into())
    }
}

/// Read side of an installed [`LogRecorder`].
#[derive(Clone)]
pub struct MetricsReport {
    registry: Arc<AtomicRegistry>,
}

impl MetricsReport {
    /// Current value of counter `name`, summed over its labels.
    pub fn counter_total(&self, name: &str) -> u64 {
        self.registry
            .get_counter_handles()
            .iter()
            .filter(|(key, _)| key.name() == name)
            .map(|(_, c)| c.load(Relaxed))
            .sum()
    }

    /// Render every metric, counters first.
    pub fn lines(&self) -> Vec<String> {
        let mut lines = counter_lines(&self.registry);
        lines.extend(gauge_lines(&self.registry));
        lines.extend(histogram_lines(&self.registry));
        lines
    }

    pub fn log(&self) {
        for line in self.lines() {
            info!("{}", line);
        }
    }
}

fn label_of(key: &Key) -> String {
    key.labels()
        .map(|l| l.value().to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn counter_lines(registry: &AtomicRegistry) -> Vec<String> {
    let mut grouped: BTreeMap<String, Vec<(Key, u64)>> = BTreeMap::new();
    for (key, counter) in registry.get_counter_handles() {
        grouped
            .entry(key.name().to_string())
            .or_default()
            .push((key, counter.load(Relaxed)));
    }

    // Largest totals first, then by name.
    let mut totals: Vec<(String, u64, Vec<(Key, u64)>)> = grouped
        .into_iter()
        .map(|(name, key_values)| {
            let total = key_values.iter().map(|(_, v)| *v).sum();
            (name, total, key_values)
        })
        .collect();
    totals.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let mut lines = vec![];
    if !totals.is_empty() {
        lines.push("Counters:".to_string());
    }
    for (name, total, mut key_values) in totals {
        lines.push(format!("  {}: {}", name, total));
        let labeled = key_values.iter().any(|(k, _)| k.labels().next().is_some());
        if !labeled {
            continue;
        }
        key_values.sort_by(|a, b| {
            b.1.cmp(&a.1)
                .then_with(|| label_of(&a.0).cmp(&label_of(&b.0)))
        });
        for (key, value) in key_values {
            let percentage = if total == 0 {
                0.0
            } else {
                (value as f64 / total as f64) * 100.0
            };
            lines.push(format!(
                "    {}: {} ({:.1}%)",
                label_of(&key),
                value,
                percentage
            ));
        }
    }
    lines
}

fn gauge_lines(registry: &AtomicRegistry) -> Vec<String> {
    let handles = registry.get_gauge_handles();
    let mut keys: Vec<Key> = handles.keys().cloned().collect();
    keys.sort();

    let mut lines = vec![];
    if !keys.is_empty() {
        lines.push("Gauges:".to_string());
    }
    for key in keys {
        if let Some(gauge) = registry.get_gauge(&key) {
            // Stored as bits.
            let value = f64::from_bits(gauge.load(Relaxed));
            lines.push(format!("  {}: {:.2}", key.name(), value));
        }
    }
    lines
}

fn histogram_lines(registry: &AtomicRegistry) -> Vec<String> {
    let handles = registry.get_histogram_handles();
    let mut keys: Vec<Key> = handles.keys().cloned().collect();
    keys.sort();

    let mut lines = vec![];
    if !keys.is_empty() {
        lines.push("Histograms:".to_string());
    }
    for key in keys {
        let histogram = match registry.get_histogram(&key) {
            Some(histogram) => histogram,
            None => continue,
        };

        let mut sum = 0.0;
        let mut count = 0;
        let mut min = f64::MAX;
        let mut max = 0.0;
        for element in histogram.data() {
            sum += element;
            count += 1;
            min = f64::min(min, element);
            max = f64::max(max, element);
        }
        if count == 0 {
            min = 0.0;
        }
        let avg = if count > 0 { sum / count as f64 } else { 0.0 };

        let mut name = key.name().to_string();
        for label in key.labels() {
            name.push_str(&format!(" {}={}", label.key(), label.value()));
        }
        lines.push(format!(
            "  {}: count={} avg={:.2} min={:.2} max={:.2}",
            name, count, avg, min, max
        ));
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_report() {
        let (recorder, report) = LogRecorderBuilder::new().build();
        metrics::with_local_recorder(&recorder, || {
            metrics::counter!("placed_tasks_total", "reason" => "prev_idle").increment(3);
            metrics::counter!("placed_tasks_total", "reason" => "energy_efficient").increment(1);
            metrics::counter!("forks_total").increment(2);
            metrics::histogram!("feec_energy_calcs").record(4.0);
            metrics::histogram!("feec_energy_calcs").record(8.0);
        });

        assert_eq!(report.counter_total("placed_tasks_total"), 4);
        assert_eq!(report.counter_total("forks_total"), 2);
        assert_eq!(report.counter_total("missing"), 0);

        let lines = report.lines();
        assert_eq!(lines[0], "Counters:");
        assert_eq!(lines[1], "  placed_tasks_total: 4");
        assert_eq!(lines[2], "    prev_idle: 3 (75.0%)");
        assert_eq!(lines[3], "    energy_efficient: 1 (25.0%)");
        assert_eq!(lines[4], "  forks_total: 2");
        assert!(lines
            .iter()
            .any(|l| l == "  feec_energy_calcs: count=2 avg=6.00 min=4.00 max=8.00"));
    }
}
