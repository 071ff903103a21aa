//! Counter normalizer.
//!
//! Turns an arbitrarily-shaped metrics document into a flat set of
//! non-negative counters. Each logical counter names a few candidate metric
//! keys and is resolved by an ordered list of [`Strategy`] values, first
//! match wins. Nothing here fails: a counter no strategy can resolve is zero.
//!
//! Shapes understood, in precedence order:
//!
//! ```text
//! scalar          "total_messages_delivered": 42
//!                 "total_messages_delivered": {"value": 42}
//! service rollup  "total_messages_delivered": {"value": {"service": {"smtp_client": 40, "smtp_client:gmail": 12}}}
//! provider map    "total_messages_delivered": {"provider": {"google": 10, "yahoo": 4}}
//! tagged array    "total_messages_delivered": [{"labels": {...}, "value": 3}, ...]
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Normalized counters from one metrics snapshot.
///
/// `received`, `delivered`, `deferred` and `bounced` are cumulative; the rest
/// are instantaneous gauges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Counters {
    pub received: u64,
    pub delivered: u64,
    /// Transient failures only; retry/requeue counters are never folded in.
    pub deferred: u64,
    pub bounced: u64,
    pub ready: u64,
    pub scheduled: u64,
    pub queue_depth: u64,
    pub active_connections: u64,
    pub disk_free: u64,
}

/// Logical counters the normalizer resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    Received,
    Delivered,
    Deferred,
    Bounced,
    Ready,
    Scheduled,
    QueueDepth,
    ActiveConnections,
    DiskFree,
}

/// One way of reading a metric entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// A single authoritative number.
    Scalar,
    /// Per-service values, preferring known non-overlapping service keys.
    ServiceRollup,
    /// Sum over a provider-keyed map.
    ProviderSum,
    /// Sum over an array of tagged values.
    TaggedArray,
}

/// Evaluation order for every counter.
pub const STRATEGIES: [Strategy; 4] = [
    Strategy::Scalar,
    Strategy::ServiceRollup,
    Strategy::ProviderSum,
    Strategy::TaggedArray,
];

struct CounterSpec {
    counter: Counter,
    names: &'static [&'static str],
    services: &'static [&'static str],
}

const OUTBOUND_SERVICES: &[&str] = &["smtp_client", "lua", "maildir"];
const INBOUND_SERVICES: &[&str] = &["esmtp_listener", "http_listener"];

const SPECS: &[CounterSpec] = &[
    CounterSpec {
        counter: Counter::Received,
        names: &["total_messages_received", "messages_received", "received"],
        services: INBOUND_SERVICES,
    },
    CounterSpec {
        counter: Counter::Delivered,
        names: &["total_messages_delivered", "messages_delivered", "delivered"],
        services: OUTBOUND_SERVICES,
    },
    CounterSpec {
        counter: Counter::Deferred,
        names: &[
            "total_messages_transfail",
            "messages_transfail",
            "transfail",
            "deferred",
        ],
        services: OUTBOUND_SERVICES,
    },
    CounterSpec {
        counter: Counter::Bounced,
        names: &["total_messages_fail", "messages_fail", "bounced", "failed"],
        services: OUTBOUND_SERVICES,
    },
    CounterSpec {
        counter: Counter::Ready,
        names: &["ready_count", "queue_ready", "ready"],
        services: OUTBOUND_SERVICES,
    },
    CounterSpec {
        counter: Counter::Scheduled,
        names: &["scheduled_count", "queue_scheduled", "scheduled"],
        services: &[],
    },
    CounterSpec {
        counter: Counter::QueueDepth,
        names: &["queued_count", "queue_depth", "queue_size"],
        services: &[],
    },
    CounterSpec {
        counter: Counter::ActiveConnections,
        names: &["connection_count", "active_connections"],
        services: OUTBOUND_SERVICES,
    },
    CounterSpec {
        counter: Counter::DiskFree,
        names: &["disk_free_bytes", "disk_free"],
        services: &[],
    },
];

/// Normalize a metrics document. Pure: the same document always yields the
/// same counters.
#[must_use]
pub fn normalize(doc: &Value) -> Counters {
    let root = metric_root(doc);
    let get = |counter| resolve(root, counter).map_or(0, |(value, _)| value);

    let ready = get(Counter::Ready);
    let scheduled = get(Counter::Scheduled);
    let queue_depth = resolve(root, Counter::QueueDepth)
        .map_or_else(|| ready.saturating_add(scheduled), |(value, _)| value);

    Counters {
        received: get(Counter::Received),
        delivered: get(Counter::Delivered),
        deferred: get(Counter::Deferred),
        bounced: get(Counter::Bounced),
        ready,
        scheduled,
        queue_depth,
        active_connections: get(Counter::ActiveConnections),
        disk_free: get(Counter::DiskFree),
    }
}

/// Resolve a single counter, reporting which strategy produced it.
#[must_use]
pub fn resolve_counter(doc: &Value, counter: Counter) -> Option<(u64, Strategy)> {
    resolve(metric_root(doc), counter)
}

fn resolve(root: Option<&Map<String, Value>>, counter: Counter) -> Option<(u64, Strategy)> {
    let root = root?;
    let spec = SPECS.iter().find(|spec| spec.counter == counter)?;
    STRATEGIES.iter().find_map(|strategy| {
        spec.names
            .iter()
            .filter_map(|name| root.get(*name))
            .find_map(|entry| strategy.apply(entry, spec.services))
            .map(|value| (value, *strategy))
    })
}

/// Documents are either the metric map itself or wrap it under `metrics`.
fn metric_root(doc: &Value) -> Option<&Map<String, Value>> {
    let map = doc.as_object()?;
    match map.get("metrics") {
        Some(Value::Object(inner)) => Some(inner),
        _ => Some(map),
    }
}

impl Strategy {
    /// Apply this strategy to one metric entry. `None` means the entry does
    /// not have this shape.
    #[must_use]
    pub fn apply(self, entry: &Value, preferred_services: &[&str]) -> Option<u64> {
        match self {
            Self::Scalar => number(entry).or_else(|| entry.get("value").and_then(number)),
            Self::ServiceRollup => {
                let services = nested_object(entry, "service")?;
                service_rollup(services, preferred_services)
            }
            Self::ProviderSum => {
                let providers = nested_object(entry, "provider")?;
                sum_numbers(providers.values())
            }
            Self::TaggedArray => {
                let items = match entry {
                    Value::Array(items) => items,
                    _ => entry.get("value")?.as_array()?,
                };
                sum_numbers(
                    items
                        .iter()
                        .map(|item| item.get("value").unwrap_or(item)),
                )
            }
        }
    }
}

fn nested_object<'a>(entry: &'a Value, key: &str) -> Option<&'a Map<String, Value>> {
    entry
        .get("value")
        .and_then(|value| value.get(key))
        .or_else(|| entry.get(key))
        .and_then(Value::as_object)
}

/// Child entries are keyed `parent:child` and overlap their parent, so only
/// top-level keys count unless a preferred service is present.
fn service_rollup(services: &Map<String, Value>, preferred: &[&str]) -> Option<u64> {
    let preferred_sum = sum_numbers(
        preferred
            .iter()
            .filter_map(|key| services.get(*key)),
    );
    if preferred_sum.is_some() {
        return preferred_sum;
    }
    sum_numbers(
        services
            .iter()
            .filter(|(key, _)| !key.contains(':'))
            .map(|(_, value)| value),
    )
}

fn sum_numbers<'a>(values: impl Iterator<Item = &'a Value>) -> Option<u64> {
    values
        .filter_map(number)
        .fold(None, |acc: Option<u64>, value| {
            Some(acc.unwrap_or(0).saturating_add(value))
        })
}

/// Numbers and numeric strings; negatives and non-finite values become zero.
fn number(value: &Value) -> Option<u64> {
    let raw = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    Some(if raw.is_finite() && raw > 0.0 {
        raw.round() as u64
    } else {
        0
    })
}
