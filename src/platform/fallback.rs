use async_trait::async_trait;
use tracing::info;

use super::{AutostartRegistrar, SystemProxy};

/// No system-wide switch is available; tell the user where the proxy listens.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManualProxy;

impl SystemProxy for ManualProxy {
    fn set_enabled(&self, enabled: bool, local_port: u16) -> std::io::Result<()> {
        if enabled {
            info!(endpoint = %format!("127.0.0.1:{local_port}"), "point applications at the local http proxy");
        } else {
            info!("local http proxy is going away");
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoAutostart;

#[async_trait]
impl AutostartRegistrar for NoAutostart {
    async fn ensure_registered(&self) -> bool {
        false
    }
}
