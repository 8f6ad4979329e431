use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("no nodes found in subscriptions")]
    NoNodesAvailable,

    #[error("no reachable nodes (delay timeout)")]
    AllProbesTimedOut,

    #[error("proxy core not found at {}", .0.display())]
    CoreBinaryMissing(PathBuf),

    #[error("proxy core exited right after start{}", exit_suffix(.code))]
    CoreExitedEarly { code: Option<i32> },

    #[error("failed to write core config: {0}")]
    ConfigWrite(#[source] std::io::Error),

    #[error("failed to launch proxy core: {0}")]
    CoreSpawn(#[source] std::io::Error),

    #[error("system proxy error: {0}")]
    SystemHookFailure(String),

    #[error("stats query failed: {0}")]
    StatsQueryFailure(String),
}

impl ConnectError {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::NoNodesAvailable => "NO_NODES",
            Self::AllProbesTimedOut => "PROBE_TIMEOUT",
            Self::CoreBinaryMissing(_) => "CORE_MISSING",
            Self::CoreExitedEarly { .. } => "CORE_EXITED",
            Self::ConfigWrite(_) => "CONFIG_INVALID",
            Self::CoreSpawn(_) => "START_FAILED",
            Self::SystemHookFailure(_) => "PROXY_ERROR",
            Self::StatsQueryFailure(_) => "STATS_ERROR",
        }
    }
}

fn exit_suffix(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!(" (exit code {code})"),
        None => String::new(),
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NodeParseError {
    #[error("invalid node uri: {0}")]
    InvalidUri(String),

    #[error("only vless:// is supported")]
    UnsupportedScheme,

    #[error("vless uri missing uuid")]
    MissingUuid,

    #[error("vless uri missing host")]
    MissingHost,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_in_message() {
        let err = ConnectError::CoreExitedEarly { code: Some(23) };
        assert_eq!(err.to_string(), "proxy core exited right after start (exit code 23)");
        let err = ConnectError::CoreExitedEarly { code: None };
        assert_eq!(err.to_string(), "proxy core exited right after start");
    }

    #[test]
    fn test_tags_are_stable() {
        assert_eq!(ConnectError::NoNodesAvailable.tag(), "NO_NODES");
        assert_eq!(
            ConnectError::CoreBinaryMissing(PathBuf::from("core/xray")).tag(),
            "CORE_MISSING"
        );
    }
}
