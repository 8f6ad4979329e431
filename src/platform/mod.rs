use async_trait::async_trait;

#[cfg(target_os = "windows")]
mod windows;
#[cfg(target_os = "windows")]
pub use self::windows::{ScheduledTaskAutostart, WinInetProxy};

#[cfg(not(target_os = "windows"))]
mod fallback;
#[cfg(not(target_os = "windows"))]
pub use self::fallback::{ManualProxy, NoAutostart};

pub trait SystemProxy: Send {
    fn set_enabled(&self, enabled: bool, local_port: u16) -> std::io::Result<()>;
}

/// Best-effort; `false` means "not registered", never an error.
#[async_trait]
pub trait AutostartRegistrar: Send + Sync {
    async fn ensure_registered(&self) -> bool;
}

#[cfg(target_os = "windows")]
pub fn default_proxy() -> Box<dyn SystemProxy> {
    Box::new(WinInetProxy)
}

#[cfg(not(target_os = "windows"))]
pub fn default_proxy() -> Box<dyn SystemProxy> {
    Box::new(ManualProxy)
}

#[cfg(target_os = "windows")]
pub fn default_autostart() -> Box<dyn AutostartRegistrar> {
    Box::new(ScheduledTaskAutostart::new())
}

#[cfg(not(target_os = "windows"))]
pub fn default_autostart() -> Box<dyn AutostartRegistrar> {
    Box::new(NoAutostart)
}
