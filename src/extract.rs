//! # Metrics Extraction
//!
//! Turns the free-form stdout of the load client into a [`MetricsRecord`].
//! Extraction is a pure function of the captured text: it never fails and it
//! never touches a process. Every field is looked up twice, first as an
//! explicit labeled line (`Throughput: 812.5 messages/second`), then as a
//! looser phrase (`812.5 msg/s`). Fields that match neither stay `None`.
//!
//! When the client prints no throughput but does print the total time and the
//! number of messages, throughput is derived as
//! `messages * 1000 / total_time_ms`.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Structured view of one client invocation's output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    /// Messages per second
    pub throughput: Option<f64>,
    pub avg_latency_ms: Option<f64>,
    pub min_latency_ms: Option<f64>,
    pub max_latency_ms: Option<f64>,
    pub p50_latency_ms: Option<f64>,
    pub p95_latency_ms: Option<f64>,
    pub p99_latency_ms: Option<f64>,
    pub total_time_ms: Option<f64>,
    /// Message count as reported by the client itself
    pub reported_messages: Option<u64>,
    pub success_rate_percent: Option<f64>,
}

impl MetricsRecord {
    /// True when not a single field could be recovered.
    pub fn is_empty(&self) -> bool {
        *self == MetricsRecord::default()
    }
}

// Java prints large doubles in scientific notation (1.2E7).
const NUM: &str = r"([0-9]+(?:\.[0-9]+)?(?:[eE][-+]?[0-9]+)?)";

struct FieldPattern {
    labeled: Regex,
    loose: Regex,
}

impl FieldPattern {
    fn new(labeled: &str, loose: &str) -> Self {
        let labeled = labeled.replace("{NUM}", NUM);
        let loose = loose.replace("{NUM}", NUM);
        Self {
            labeled: Regex::new(&labeled).expect("labeled metric pattern"),
            loose: Regex::new(&loose).expect("loose metric pattern"),
        }
    }

    fn find(&self, text: &str) -> Option<f64> {
        capture_f64(&self.labeled, text).or_else(|| capture_f64(&self.loose, text))
    }
}

struct Patterns {
    throughput: FieldPattern,
    avg_latency: FieldPattern,
    min_latency: FieldPattern,
    max_latency: FieldPattern,
    p50_latency: FieldPattern,
    p95_latency: FieldPattern,
    p99_latency: FieldPattern,
    total_time: FieldPattern,
    total_messages: FieldPattern,
    success_rate: FieldPattern,
    acknowledgments: Regex,
    total_clients: Regex,
    total_errors: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        throughput: FieldPattern::new(
            r"(?im)^\s*throughput:\s*{NUM}",
            r"(?i){NUM}\s*(?:messages|msgs?)\s*/\s*s(?:ec(?:ond)?)?\b",
        ),
        avg_latency: FieldPattern::new(
            r"(?im)^\s*average latency:\s*{NUM}\s*ms",
            r"(?i)\b(?:avg|mean)\b[^\n\d]*{NUM}\s*ms",
        ),
        min_latency: FieldPattern::new(
            r"(?im)^\s*min(?:imum)? latency:\s*{NUM}\s*ms",
            r"(?i)\bmin\b[^\n\d]*{NUM}\s*ms",
        ),
        max_latency: FieldPattern::new(
            r"(?im)^\s*max(?:imum)? latency:\s*{NUM}\s*ms",
            r"(?i)\bmax\b[^\n\d]*{NUM}\s*ms",
        ),
        p50_latency: FieldPattern::new(
            r"(?im)^\s*(?:p50|median) latency:\s*{NUM}\s*ms",
            r"(?i)\b(?:p50|median)\b[^\n\d]*{NUM}\s*ms",
        ),
        p95_latency: FieldPattern::new(
            r"(?im)^\s*p95 latency:\s*{NUM}\s*ms",
            r"(?i)\bp95\b[^\n\d]*{NUM}\s*ms",
        ),
        p99_latency: FieldPattern::new(
            r"(?im)^\s*p99 latency:\s*{NUM}\s*ms",
            r"(?i)\bp99\b[^\n\d]*{NUM}\s*ms",
        ),
        total_time: FieldPattern::new(
            r"(?im)^\s*total time:\s*{NUM}\s*ms",
            r"(?i)(?:{NUM}\s*ms\s+total|\btook\s+{NUM}\s*ms)",
        ),
        total_messages: FieldPattern::new(
            r"(?im)^\s*total messages (?:sent|processed):\s*([0-9]+)",
            r"(?i)\b([0-9]+)\s+messages(?:[\s.,;:)]|$)",
        ),
        success_rate: FieldPattern::new(
            r"(?im)^\s*success rate:\s*{NUM}\s*%",
            r"(?i){NUM}\s*%\s*success",
        ),
        acknowledgments: Regex::new(r"(?im)^\s*successful acknowledgments:\s*([0-9]+)")
            .expect("acknowledgment pattern"),
        total_clients: Regex::new(r"(?im)^\s*total clients:\s*([0-9]+)")
            .expect("client count pattern"),
        total_errors: Regex::new(r"(?im)^\s*total errors:\s*([0-9]+)")
            .expect("error count pattern"),
    })
}

/// First participating capture group parsed as a float.
fn capture_f64(re: &Regex, text: &str) -> Option<f64> {
    let caps = re.captures(text)?;
    caps.iter()
        .skip(1)
        .flatten()
        .next()
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

/// Parse client stdout into a metrics record. Never fails.
pub fn extract(raw_output: &str) -> MetricsRecord {
    let p = patterns();

    let total_time_ms = p.total_time.find(raw_output);
    let reported_messages = p
        .total_messages
        .find(raw_output)
        .filter(|v| *v >= 0.0)
        .map(|v| v as u64);

    let throughput = p
        .throughput
        .find(raw_output)
        .or_else(|| derive_throughput(reported_messages, total_time_ms));

    let success_rate_percent = p
        .success_rate
        .find(raw_output)
        .or_else(|| derive_success_rate(p, raw_output, reported_messages));

    MetricsRecord {
        throughput,
        avg_latency_ms: p.avg_latency.find(raw_output),
        min_latency_ms: p.min_latency.find(raw_output),
        max_latency_ms: p.max_latency.find(raw_output),
        p50_latency_ms: p.p50_latency.find(raw_output),
        p95_latency_ms: p.p95_latency.find(raw_output),
        p99_latency_ms: p.p99_latency.find(raw_output),
        total_time_ms,
        reported_messages,
        success_rate_percent,
    }
}

fn derive_throughput(messages: Option<u64>, total_time_ms: Option<f64>) -> Option<f64> {
    match (messages, total_time_ms) {
        (Some(messages), Some(ms)) if ms > 0.0 => Some(messages as f64 * 1000.0 / ms),
        _ => None,
    }
}

fn derive_success_rate(p: &Patterns, text: &str, sent: Option<u64>) -> Option<f64> {
    // Single connection: acknowledged / sent.
    if let (Some(acks), Some(sent)) = (capture_f64(&p.acknowledgments, text), sent) {
        if sent > 0 {
            return Some(acks * 100.0 / sent as f64);
        }
    }
    // Load test: errors are counted per failed client.
    if let (Some(clients), Some(errors)) = (
        capture_f64(&p.total_clients, text),
        capture_f64(&p.total_errors, text),
    ) {
        if clients > 0.0 {
            return Some((clients - errors).max(0.0) * 100.0 / clients);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const SINGLE_CLIENT: &str = "Connected to server: localhost:9443\n\
        \n=== Statistics ===\n\
        Total messages sent: 50\n\
        Successful acknowledgments: 49\n\
        Average latency: 12 ms\n\
        Total time: 600 ms\n";

    const LOAD_TEST: &str = "Starting load test with 4 concurrent clients...\n\
        \n=== Load Test Results ===\n\
        Total clients: 4\n\
        Messages per client: 250\n\
        Total messages processed: 1000\n\
        Total errors: 1\n\
        Total time: 2500 ms\n\
        Throughput: 400.0 messages/second\n";

    #[test]
    fn test_throughput_fallback_from_time_and_count() {
        let text = "Total time: 2000 ms\nTotal messages sent: 400\n";
        let metrics = extract(text);
        assert_eq!(metrics.throughput, Some(200.0));
        assert_eq!(metrics.total_time_ms, Some(2000.0));
        assert_eq!(metrics.reported_messages, Some(400));
        assert_eq!(extract(text), metrics);
    }

    #[test]
    fn test_single_client_output() {
        let metrics = extract(SINGLE_CLIENT);
        assert_eq!(metrics.avg_latency_ms, Some(12.0));
        assert_eq!(metrics.reported_messages, Some(50));
        assert_eq!(metrics.success_rate_percent, Some(98.0));
        // 50 * 1000 / 600
        let throughput = metrics.throughput.unwrap();
        assert!((throughput - 83.3333).abs() < 1e-3);
        assert!(metrics.p95_latency_ms.is_none());
    }

    #[test]
    fn test_load_test_output() {
        let metrics = extract(LOAD_TEST);
        assert_eq!(metrics.throughput, Some(400.0));
        assert_eq!(metrics.reported_messages, Some(1000));
        assert_eq!(metrics.total_time_ms, Some(2500.0));
        assert_eq!(metrics.success_rate_percent, Some(75.0));
        assert!(metrics.avg_latency_ms.is_none());
    }

    #[test]
    fn test_labeled_line_wins_over_loose_phrase() {
        let text = "warmup at 10.0 msg/s\nThroughput: 250.5 messages/second\n";
        assert_eq!(extract(text).throughput, Some(250.5));
    }

    #[test]
    fn test_loose_phrases() {
        let text = "run finished: 1500 messages/sec, avg 3.5 ms, p95: 7.25 ms, \
                    p99 = 9 ms, min 1 ms, max 20 ms, median 3 ms, 99.5% success";
        let metrics = extract(text);
        assert_eq!(metrics.throughput, Some(1500.0));
        assert_eq!(metrics.avg_latency_ms, Some(3.5));
        assert_eq!(metrics.p95_latency_ms, Some(7.25));
        assert_eq!(metrics.p99_latency_ms, Some(9.0));
        assert_eq!(metrics.min_latency_ms, Some(1.0));
        assert_eq!(metrics.max_latency_ms, Some(20.0));
        assert_eq!(metrics.p50_latency_ms, Some(3.0));
        assert_eq!(metrics.success_rate_percent, Some(99.5));
    }

    #[test]
    fn test_loose_message_count() {
        let metrics = extract("delivered 640 messages in 1600 ms total\n");
        assert_eq!(metrics.reported_messages, Some(640));
        assert_eq!(metrics.total_time_ms, Some(1600.0));
        assert_eq!(metrics.throughput, Some(400.0));

        // A rate is not a count.
        assert!(extract("1500 messages/sec").reported_messages.is_none());
    }

    #[test]
    fn test_scientific_notation() {
        let text = "Throughput: 1.25E7 messages/second\n";
        assert_eq!(extract(text).throughput, Some(12_500_000.0));
    }

    #[test]
    fn test_garbage_yields_empty_record() {
        assert!(extract("").is_empty());
        assert!(extract("Exception in thread \"main\" java.net.ConnectException").is_empty());
    }

    #[test]
    fn test_zero_time_does_not_divide() {
        let metrics = extract("Total time: 0 ms\nTotal messages sent: 10\nThroughput: Infinity messages/second\n");
        assert_eq!(metrics.total_time_ms, Some(0.0));
        assert!(metrics.throughput.is_none());
    }
}
