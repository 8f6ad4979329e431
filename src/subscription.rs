use std::collections::HashSet;
use std::path::PathBuf;

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use tracing::{debug, warn};

use crate::node::NodeDescriptor;

const VLESS_PREFIX: &str = "vless://";

/// Source of candidate nodes. Fetch and parse problems are swallowed: a
/// broken source simply contributes nothing.
#[async_trait]
pub trait NodeDirectory: Send + Sync {
    async fn load_nodes(&self) -> Vec<NodeDescriptor>;
}

#[derive(Debug, Clone)]
pub struct SubscriptionDirectory {
    sources: Vec<PathBuf>,
}

impl SubscriptionDirectory {
    pub fn new(sources: Vec<PathBuf>) -> Self {
        Self { sources }
    }
}

#[async_trait]
impl NodeDirectory for SubscriptionDirectory {
    async fn load_nodes(&self) -> Vec<NodeDescriptor> {
        let mut payloads = Vec::new();
        for source in &self.sources {
            match tokio::fs::read_to_string(source).await {
                Ok(text) => payloads.push(text),
                Err(e) => {
                    warn!(source = %source.display(), error = %e, "subscription source unavailable");
                }
            }
        }
        collect_nodes(payloads.iter().map(String::as_str))
    }
}

/// Parses every payload, keeps tcp vless nodes, drops duplicate URIs
/// (first occurrence wins).
pub fn collect_nodes<'a>(payloads: impl IntoIterator<Item = &'a str>) -> Vec<NodeDescriptor> {
    let mut seen = HashSet::new();
    let mut nodes = Vec::new();
    for payload in payloads {
        for line in decode_payload(payload) {
            if !starts_with_ignore_case(&line, VLESS_PREFIX) {
                continue;
            }
            let node = match NodeDescriptor::parse(&line) {
                Ok(node) => node,
                Err(e) => {
                    debug!(error = %e, "skipping malformed subscription entry");
                    continue;
                }
            };
            if !node.is_tcp() {
                debug!(node = %node.name, network = %node.network, "skipping non-tcp node");
                continue;
            }
            if seen.insert(node.original_uri.clone()) {
                nodes.push(node);
            }
        }
    }
    nodes
}

/// A payload is either a plain list of links or the same list in base64.
pub fn decode_payload(text: &str) -> Vec<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    if trimmed.to_ascii_lowercase().contains(VLESS_PREFIX) {
        return split_lines(trimmed);
    }
    match decode_base64_to_string(trimmed) {
        Some(decoded) => split_lines(&decoded),
        None => {
            debug!("subscription payload is neither links nor base64");
            Vec::new()
        }
    }
}

fn split_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn starts_with_ignore_case(value: &str, prefix: &str) -> bool {
    value
        .get(..prefix.len())
        .map(|head| head.eq_ignore_ascii_case(prefix))
        .unwrap_or(false)
}

fn add_padding(value: &str) -> String {
    let remainder = value.len() % 4;
    if remainder == 0 {
        value.to_string()
    } else {
        format!("{value}{}", "=".repeat(4 - remainder))
    }
}

fn decode_base64_to_string(input: &str) -> Option<String> {
    let cleaned: String = input.split_whitespace().collect();
    let padded = add_padding(&cleaned);
    for candidate in [cleaned.as_str(), padded.as_str()] {
        for engine in [STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD] {
            if let Ok(bytes) = engine.decode(candidate.as_bytes()) {
                if let Ok(value) = String::from_utf8(bytes) {
                    return Some(value);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAST: &str = "vless://u1@fast.example:443?type=tcp#Fast";
    const SLOW: &str = "vless://u2@slow.example:8443?type=tcp#Slow";
    const WS: &str = "vless://u3@ws.example:443?type=ws#Ws";

    #[test]
    fn test_plain_payload() {
        let payload = format!("{FAST}\r\n\r\n{SLOW}\n");
        let lines = decode_payload(&payload);
        assert_eq!(lines, vec![FAST.to_string(), SLOW.to_string()]);
    }

    #[test]
    fn test_base64_payload() {
        let encoded = STANDARD.encode(format!("{FAST}\n{SLOW}"));
        let lines = decode_payload(&encoded);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1], SLOW);
    }

    #[test]
    fn test_unpadded_url_safe_payload() {
        let encoded = URL_SAFE_NO_PAD.encode(format!("{FAST}\n"));
        assert_eq!(decode_payload(&encoded), vec![FAST.to_string()]);
    }

    #[test]
    fn test_garbage_payload() {
        assert!(decode_payload("%%% definitely not base64 %%%").is_empty());
        assert!(decode_payload("   ").is_empty());
    }

    #[test]
    fn test_collect_filters_and_dedups() {
        let first = format!("{FAST}\n{WS}\ntrojan://x@y:1\nvless://broken\n{SLOW}");
        let second = format!("{FAST}\n");
        let nodes = collect_nodes([first.as_str(), second.as_str()]);
        let names: Vec<&str> = nodes.iter().map(|node| node.name.as_str()).collect();
        assert_eq!(names, vec!["Fast", "Slow"]);
    }

    #[tokio::test]
    async fn test_directory_skips_missing_sources() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("subs.txt");
        std::fs::write(&present, STANDARD.encode(FAST)).unwrap();
        let directory =
            SubscriptionDirectory::new(vec![dir.path().join("missing.txt"), present]);

        let nodes = directory.load_nodes().await;
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].original_uri, FAST);
    }
}
