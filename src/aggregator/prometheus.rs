//! Prometheus text exposition of aggregated metrics

use std::collections::BTreeMap;
use std::fmt::Write;

use super::{AggregatedMetric, MetricsSnapshot};
use crate::entry::{Labels, MetricKind};

/// Renders a snapshot into some external format
pub trait MetricsExporter: Send + Sync {
    fn export(&self, snapshot: &MetricsSnapshot) -> String;
}

/// Prometheus text format (version 0.0.4)
#[derive(Debug, Clone, Default)]
pub struct PrometheusTextExporter {
    /// Optional prefix applied to every metric name, joined with `_`
    pub namespace: Option<String>,
}

impl PrometheusTextExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
        }
    }

    fn metric_name(&self, name: &str) -> String {
        let name = sanitize_name(name);
        match &self.namespace {
            Some(ns) if !ns.is_empty() => format!("{}_{}", sanitize_name(ns), name),
            _ => name,
        }
    }
}

impl MetricsExporter for PrometheusTextExporter {
    fn export(&self, snapshot: &MetricsSnapshot) -> String {
        // Group series by metric name so each family gets a single TYPE line
        let mut families: BTreeMap<String, Vec<&AggregatedMetric>> = BTreeMap::new();
        for metric in snapshot.values() {
            families
                .entry(self.metric_name(&metric.name))
                .or_default()
                .push(metric);
        }

        let mut out = String::new();
        for (name, series) in families {
            let kind = series[0].kind;
            let _ = writeln!(out, "# TYPE {} {}", name, kind.as_str());

            // Names that only collide after sanitizing can still disagree
            for metric in series.into_iter().filter(|m| m.kind == kind) {
                match metric.kind {
                    MetricKind::Counter | MetricKind::Gauge => {
                        let _ = writeln!(
                            out,
                            "{}{} {}",
                            name,
                            render_labels(&metric.labels, None),
                            format_value(metric.value)
                        );
                    }
                    MetricKind::Histogram => {
                        for (bound, count) in &metric.buckets {
                            let _ = writeln!(
                                out,
                                "{}_bucket{} {}",
                                name,
                                render_labels(&metric.labels, Some(*bound)),
                                count
                            );
                        }
                        let labels = render_labels(&metric.labels, None);
                        let _ = writeln!(out, "{}_sum{} {}", name, labels, format_value(metric.sum));
                        let _ = writeln!(out, "{}_count{} {}", name, labels, metric.count);
                    }
                }
            }
        }
        out
    }
}

fn render_labels(labels: &Labels, le: Option<f64>) -> String {
    if labels.is_empty() && le.is_none() {
        return String::new();
    }

    let mut parts: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", sanitize_name(k), escape_label_value(v)))
        .collect();
    if let Some(bound) = le {
        parts.push(format!("le=\"{}\"", format_value(bound)));
    }
    format!("{{{}}}", parts.join(","))
}

/// Metric and label names may only contain `[a-zA-Z0-9_:]`
fn sanitize_name(name: &str) -> String {
    let mut sanitized: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == ':' { c } else { '_' })
        .collect();
    if sanitized.starts_with(|c: char| c.is_ascii_digit()) {
        sanitized.insert(0, '_');
    }
    sanitized
}

fn escape_label_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn format_value(value: f64) -> String {
    if value.is_infinite() {
        if value > 0.0 { "+Inf".to_string() } else { "-Inf".to_string() }
    } else if value.is_nan() {
        "NaN".to_string()
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::MetricsAggregator;
    use crate::entry::labels;

    #[test]
    fn test_counter_and_gauge_lines() {
        let agg = MetricsAggregator::default();
        agg.increment_counter("requests_total", 3.0, &labels([("method", "GET")]));
        agg.set_gauge("queue_depth", 7.0, &Labels::new());

        let text = PrometheusTextExporter::new().export(&agg.snapshot());
        assert!(text.contains("# TYPE requests_total counter\n"));
        assert!(text.contains("requests_total{method=\"GET\"} 3\n"));
        assert!(text.contains("# TYPE queue_depth gauge\n"));
        assert!(text.contains("queue_depth 7\n"));
    }

    #[test]
    fn test_histogram_buckets_sum_count() {
        let agg = MetricsAggregator::new(100, vec![1.0, 5.0], 1_000.0);
        for v in [0.5, 2.0, 3.0, 9.0] {
            agg.record_histogram("latency_ms", v, &Labels::new());
        }

        let text = PrometheusTextExporter::new().export(&agg.snapshot());
        assert!(text.contains("# TYPE latency_ms histogram\n"));
        assert!(text.contains("latency_ms_bucket{le=\"1\"} 1\n"));
        assert!(text.contains("latency_ms_bucket{le=\"5\"} 3\n"));
        assert!(text.contains("latency_ms_bucket{le=\"+Inf\"} 4\n"));
        assert!(text.contains("latency_ms_sum 14.5\n"));
        assert!(text.contains("latency_ms_count 4\n"));
    }

    #[test]
    fn test_one_type_line_per_family() {
        let agg = MetricsAggregator::default();
        agg.increment_counter("hits", 1.0, &labels([("cache", "logger")]));
        agg.increment_counter("hits", 1.0, &labels([("cache", "message")]));

        let text = PrometheusTextExporter::new().export(&agg.snapshot());
        assert_eq!(text.matches("# TYPE hits counter").count(), 1);
    }

    #[test]
    fn test_family_never_mixes_kinds() {
        let agg = MetricsAggregator::new(100, vec![10.0], 1_000.0);
        agg.increment_counter("x", 1.0, &labels([("a", "1")]));
        agg.set_gauge("x", 5.0, &labels([("a", "2")]));
        agg.record_histogram("x", 3.0, &labels([("a", "3")]));
        agg.set_gauge("api.depth", 2.0, &Labels::new());
        agg.increment_counter("api_depth", 4.0, &Labels::new());

        let text = PrometheusTextExporter::new().export(&agg.snapshot());
        assert!(text.contains("# TYPE x counter\nx{a=\"1\"} 1\n"));
        assert!(!text.contains("x{a=\"2\"}"));
        assert!(!text.contains("x_bucket"));

        // `api.depth` sorts first and claims the sanitized family
        assert_eq!(text.matches("# TYPE api_depth").count(), 1);
        assert!(text.contains("# TYPE api_depth gauge\napi_depth 2\n"));
        assert!(!text.contains("api_depth 4"));
    }

    #[test]
    fn test_escaping_and_namespace() {
        let agg = MetricsAggregator::default();
        agg.increment_counter("api.calls", 1.0, &labels([("path", "a\"b\\c")]));

        let text = PrometheusTextExporter::with_namespace("svc").export(&agg.snapshot());
        assert!(text.contains("svc_api_calls{path=\"a\\\"b\\\\c\"} 1\n"));
    }
}
