//! Keep-going / halt decision at checkpoints
//!
//! A run halts when any `Report` produced so far carries the `inhibitor`
//! flag. The decision is cumulative: an inhibitor from an early phase
//! still halts at a later checkpoint.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bus::{Message, MessageBus};
use crate::model::{INHIBITOR_FLAG, REPORT_MODEL, Report, Severity};

/// An inhibiting report as surfaced to the operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inhibitor {
    /// Sequence number of the report
    pub seq: u64,
    /// Actor that produced the report
    pub producer: String,
    /// Phase the report was produced in
    pub phase: String,
    /// Report severity, when the payload decodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    /// Report title
    pub title: String,
    /// Report summary
    pub summary: String,
    /// Suggested fix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

impl Inhibitor {
    fn from_message(message: &Message) -> Self {
        let text = |key: &str| {
            message
                .payload
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        match serde_json::from_value::<Report>(message.payload.clone()) {
            Ok(report) => Self {
                seq: message.seq,
                producer: message.producer.clone(),
                phase: message.phase.clone(),
                severity: Some(report.severity),
                title: report.title,
                summary: report.summary,
                remediation: report.remediation,
            },
            Err(_) => Self {
                seq: message.seq,
                producer: message.producer.clone(),
                phase: message.phase.clone(),
                severity: None,
                title: text("title"),
                summary: text("summary"),
                remediation: None,
            },
        }
    }
}

/// Whether a `Report` payload carries the inhibitor flag
fn is_inhibiting(payload: &Value) -> bool {
    payload
        .get("flags")
        .and_then(Value::as_array)
        .is_some_and(|flags| flags.iter().any(|f| f.as_str() == Some(INHIBITOR_FLAG)))
}

fn inhibiting_reports(bus: &MessageBus) -> impl Iterator<Item = &Message> {
    bus.consume(REPORT_MODEL)
        .filter(|m| is_inhibiting(&m.payload))
}

/// True iff any report on the bus carries the inhibitor flag
#[must_use]
pub fn should_halt(bus: &MessageBus) -> bool {
    inhibiting_reports(bus).next().is_some()
}

/// Every inhibiting report, in `seq` order
#[must_use]
pub fn inhibitors(bus: &MessageBus) -> Vec<Inhibitor> {
    inhibiting_reports(bus).map(Inhibitor::from_message).collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn report(bus: &mut MessageBus, producer: &str, report: &Report) {
        bus.produce(
            producer,
            "checks",
            REPORT_MODEL,
            serde_json::to_value(report).unwrap(),
        );
    }

    #[test]
    fn test_no_reports_no_halt() {
        let mut bus = MessageBus::new();
        bus.produce("a", "facts", "M1", json!({"flags": ["inhibitor"]}));

        assert!(!should_halt(&bus));
        assert!(inhibitors(&bus).is_empty());
    }

    #[test]
    fn test_plain_reports_do_not_halt() {
        let mut bus = MessageBus::new();
        report(&mut bus, "a", &Report::new(Severity::High, "t", "s"));
        report(&mut bus, "b", &Report::new(Severity::Info, "t", "s").with_flag("other"));

        assert!(!should_halt(&bus));
    }

    #[test]
    fn test_inhibitors_are_collected_in_order() {
        let mut bus = MessageBus::new();
        report(&mut bus, "a", &Report::new(Severity::Low, "fine", "s"));
        report(
            &mut bus,
            "b",
            &Report::inhibitor("Unsupported driver", "Driver X is gone")
                .with_remediation("Remove driver X"),
        );
        report(&mut bus, "c", &Report::inhibitor("Low space", "Need 2G"));

        assert!(should_halt(&bus));

        let found = inhibitors(&bus);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].producer, "b");
        assert_eq!(found[0].seq, 2);
        assert_eq!(found[0].remediation.as_deref(), Some("Remove driver X"));
        assert_eq!(found[1].title, "Low space");
    }

    #[test]
    fn test_loose_payload_still_surfaces() {
        let mut bus = MessageBus::new();
        bus.produce(
            "legacy",
            "checks",
            REPORT_MODEL,
            json!({"title": "Old format", "flags": ["inhibitor"]}),
        );

        let found = inhibitors(&bus);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].title, "Old format");
        assert_eq!(found[0].severity, None);
    }
}
