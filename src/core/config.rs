use std::path::Path;

use serde_json::{json, Value};

use crate::node::NodeDescriptor;

pub const LOCAL_HOST: &str = "127.0.0.1";
pub const PROXY_TAG: &str = "proxy";
pub const DIRECT_TAG: &str = "direct";
pub const BLOCK_TAG: &str = "block";
pub const API_TAG: &str = "api";
pub const SOCKS_TAG: &str = "socks-in";
pub const HTTP_TAG: &str = "http-in";
pub const TUN_TAG: &str = "tun-in";
const TUN_NAME: &str = "xray-tun";
const TUN_MTU: u32 = 1500;

/// Ports of the three loopback inbounds every generated config exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalPorts {
    pub socks: u16,
    pub http: u16,
    pub api: u16,
}

impl Default for LocalPorts {
    fn default() -> Self {
        Self {
            socks: 10808,
            http: 10809,
            api: 10085,
        }
    }
}

fn build_inbounds(ports: LocalPorts, tun_enabled: bool) -> Vec<Value> {
    let mut inbounds = vec![
        json!({
            "tag": SOCKS_TAG,
            "port": ports.socks,
            "listen": LOCAL_HOST,
            "protocol": "socks",
            "settings": { "udp": true }
        }),
        json!({
            "tag": HTTP_TAG,
            "port": ports.http,
            "listen": LOCAL_HOST,
            "protocol": "http",
            "settings": {}
        }),
        json!({
            "tag": API_TAG,
            "listen": LOCAL_HOST,
            "port": ports.api,
            "protocol": "dokodemo-door",
            "settings": { "address": LOCAL_HOST }
        }),
    ];
    if tun_enabled {
        inbounds.push(json!({
            "tag": TUN_TAG,
            "protocol": "tun",
            "settings": {
                "name": TUN_NAME,
                "mtu": TUN_MTU,
                "stack": "system",
                "autoRoute": true,
                "strictRoute": true
            }
        }));
    }
    inbounds
}

fn build_proxy_outbound(node: &NodeDescriptor) -> Value {
    let mut stream = json!({
        "network": "tcp",
        "security": node.security,
        "serverName": node.sni,
        "fingerprint": node.fingerprint
    });
    if node.uses_tls() {
        stream["tlsSettings"] = json!({
            "serverName": node.sni,
            "fingerprint": node.fingerprint
        });
    }

    json!({
        "tag": PROXY_TAG,
        "protocol": "vless",
        "settings": {
            "vnext": [
                {
                    "address": node.host,
                    "port": node.port,
                    "users": [
                        {
                            "id": node.uuid,
                            "encryption": "none",
                            "flow": node.flow
                        }
                    ]
                }
            ]
        },
        "streamSettings": stream
    })
}

/// Builds the core configuration. The output depends only on the arguments.
pub fn build_core_config(
    node: &NodeDescriptor,
    tun_enabled: bool,
    ports: LocalPorts,
    runtime_dir: &Path,
) -> Value {
    json!({
        "log": {
            "loglevel": "warning",
            "access": runtime_dir.join("access.log").display().to_string(),
            "error": runtime_dir.join("error.log").display().to_string()
        },
        "api": {
            "tag": API_TAG,
            "services": ["StatsService"]
        },
        "stats": {},
        "policy": {
            "system": {
                "statsOutboundUplink": true,
                "statsOutboundDownlink": true
            }
        },
        "inbounds": build_inbounds(ports, tun_enabled),
        "outbounds": [
            build_proxy_outbound(node),
            { "tag": DIRECT_TAG, "protocol": "freedom" },
            { "tag": BLOCK_TAG, "protocol": "blackhole" }
        ],
        "routing": {
            "domainStrategy": "AsIs",
            "rules": [
                {
                    "type": "field",
                    "inboundTag": [API_TAG],
                    "outboundTag": DIRECT_TAG
                }
            ]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(query: &str) -> NodeDescriptor {
        NodeDescriptor::parse(&format!("vless://id-1@edge.example:443?{query}#Edge")).unwrap()
    }

    fn inbound_tags(config: &Value) -> Vec<String> {
        config["inbounds"]
            .as_array()
            .unwrap()
            .iter()
            .map(|item| item["tag"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_no_tun_inbound_when_disabled() {
        let config = build_core_config(&node("type=tcp"), false, LocalPorts::default(), Path::new("rt"));
        assert_eq!(inbound_tags(&config), vec![SOCKS_TAG, HTTP_TAG, API_TAG]);
    }

    #[test]
    fn test_exactly_one_tun_inbound_when_enabled() {
        let config = build_core_config(&node("type=tcp"), true, LocalPorts::default(), Path::new("rt"));
        let tags = inbound_tags(&config);
        assert_eq!(tags.iter().filter(|tag| *tag == TUN_TAG).count(), 1);
        assert_eq!(tags.len(), 4);
    }

    #[test]
    fn test_local_ports() {
        let ports = LocalPorts {
            socks: 1080,
            http: 8080,
            api: 9090,
        };
        let config = build_core_config(&node(""), false, ports, Path::new("rt"));
        assert_eq!(config["inbounds"][0]["port"], 1080);
        assert_eq!(config["inbounds"][1]["port"], 8080);
        assert_eq!(config["inbounds"][2]["port"], 9090);
        assert_eq!(config["inbounds"][2]["listen"], "127.0.0.1");
    }

    #[test]
    fn test_outbounds_and_routing() {
        let config = build_core_config(
            &node("sni=front.example&fp=safari&flow=xtls-rprx-vision"),
            false,
            LocalPorts::default(),
            Path::new("rt"),
        );
        let outbounds = config["outbounds"].as_array().unwrap();
        assert_eq!(outbounds.len(), 3);
        assert_eq!(outbounds[1]["protocol"], "freedom");
        assert_eq!(outbounds[2]["protocol"], "blackhole");

        let proxy = &outbounds[0];
        assert_eq!(proxy["tag"], "proxy");
        let server = &proxy["settings"]["vnext"][0];
        assert_eq!(server["address"], "edge.example");
        assert_eq!(server["port"], 443);
        assert_eq!(server["users"][0]["id"], "id-1");
        assert_eq!(server["users"][0]["flow"], "xtls-rprx-vision");
        assert_eq!(proxy["streamSettings"]["tlsSettings"]["serverName"], "front.example");
        assert_eq!(proxy["streamSettings"]["tlsSettings"]["fingerprint"], "safari");

        let rule = &config["routing"]["rules"][0];
        assert_eq!(rule["inboundTag"][0], "api");
        assert_eq!(rule["outboundTag"], "direct");
        assert_eq!(config["api"]["services"][0], "StatsService");
        assert_eq!(config["policy"]["system"]["statsOutboundUplink"], true);
    }

    #[test]
    fn test_no_tls_settings_without_tls() {
        let config = build_core_config(&node("security=none"), false, LocalPorts::default(), Path::new("rt"));
        let stream = &config["outbounds"][0]["streamSettings"];
        assert_eq!(stream["security"], "none");
        assert!(stream.get("tlsSettings").is_none());
    }

    #[test]
    fn test_deterministic() {
        let node = node("type=tcp");
        let a = build_core_config(&node, true, LocalPorts::default(), Path::new("rt"));
        let b = build_core_config(&node, true, LocalPorts::default(), Path::new("rt"));
        assert_eq!(a, b);
    }
}
