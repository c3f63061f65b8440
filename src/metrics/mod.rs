use std::fmt::Write;

use crate::core::stats::ChannelStatsSnapshot;

/// Renders channel statistics in the Prometheus text format (without
/// HELP/TYPE lines), one sample per counter and gauge.
pub fn render(snapshots: &[ChannelStatsSnapshot]) -> String {
    let mut out = String::new();
    for s in snapshots {
        let labels = format!("topic=\"{}\",channel=\"{}\"", escape(&s.topic), escape(&s.channel));
        let samples: [(&str, u64); 9] = [
            ("put_count", s.put_count),
            ("message_count", s.message_count),
            ("requeue_count", s.requeue_count),
            ("timeout_count", s.timeout_count),
            ("in_flight_count", s.in_flight_count),
            ("deferred_count", s.deferred_count),
            ("memory_depth", s.memory_depth),
            ("backend_depth", s.backend_depth),
            ("client_count", s.client_count),
        ];
        for (name, value) in samples {
            let _ = writeln!(out, "driftmq_channel_{name}{{{labels}}} {value}");
        }
    }
    out
}

fn escape(label: &str) -> String {
    label.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_labelled_samples() {
        let snap = ChannelStatsSnapshot {
            topic: "orders".into(),
            channel: "archive".into(),
            put_count: 7,
            backend_depth: 3,
            ..Default::default()
        };
        let text = render(&[snap]);
        assert!(text.contains("driftmq_channel_put_count{topic=\"orders\",channel=\"archive\"} 7\n"));
        assert!(text.contains("driftmq_channel_backend_depth{topic=\"orders\",channel=\"archive\"} 3\n"));
        assert_eq!(text.lines().count(), 9);
    }

    #[test]
    fn quotes_in_names_are_escaped() {
        let snap = ChannelStatsSnapshot {
            topic: "a\"b".into(),
            channel: "c".into(),
            ..Default::default()
        };
        assert!(render(&[snap]).contains("topic=\"a\\\"b\""));
    }
}
