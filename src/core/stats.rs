use serde_json::Value;

use super::config::PROXY_TAG;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TrafficCounters {
    pub uplink: u64,
    pub downlink: u64,
}

impl TrafficCounters {
    pub fn total(&self) -> u64 {
        self.uplink.saturating_add(self.downlink)
    }
}

fn counter_name(direction: &str) -> String {
    format!("outbound>>>{PROXY_TAG}>>>traffic>>>{direction}")
}

/// Reads the counters out of `statsquery` output. Both the JSON document
/// newer cores print and the older `name: value` line form are accepted; a
/// counter that cannot be found or parsed is 0.
pub fn parse_statsquery(output: &str) -> TrafficCounters {
    if let Ok(doc) = serde_json::from_str::<Value>(output) {
        if let Some(stats) = doc.get("stat").and_then(Value::as_array) {
            return parse_json_stats(stats);
        }
    }
    parse_stat_lines(output)
}

fn parse_json_stats(stats: &[Value]) -> TrafficCounters {
    let uplink = counter_name("uplink");
    let downlink = counter_name("downlink");
    let mut counters = TrafficCounters::default();
    for entry in stats {
        let Some(name) = entry.get("name").and_then(Value::as_str) else {
            continue;
        };
        let value = match entry.get("value") {
            Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
            _ => 0,
        };
        if name.eq_ignore_ascii_case(&uplink) {
            counters.uplink = value;
        } else if name.eq_ignore_ascii_case(&downlink) {
            counters.downlink = value;
        }
    }
    counters
}

fn parse_stat_lines(output: &str) -> TrafficCounters {
    let uplink = counter_name("uplink");
    let downlink = counter_name("downlink");
    let mut counters = TrafficCounters::default();
    for line in output.lines() {
        let lower = line.to_ascii_lowercase();
        if lower.contains(&uplink) {
            counters.uplink = trailing_number(line);
        } else if lower.contains(&downlink) {
            counters.downlink = trailing_number(line);
        }
    }
    counters
}

fn trailing_number(line: &str) -> u64 {
    line.split(|c: char| c == ':' || c == '=' || c.is_whitespace())
        .map(|part| part.trim_matches(|c: char| c == '"' || c == ',' || c == '\''))
        .filter(|part| !part.is_empty())
        .last()
        .and_then(|part| part.parse().ok())
        .unwrap_or(0)
}
