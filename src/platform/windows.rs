use std::ffi::OsStr;
use std::io;
use std::os::windows::ffi::OsStrExt;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};
use windows_sys::Win32::Foundation::ERROR_SUCCESS;
use windows_sys::Win32::Networking::WinInet::InternetSetOptionW;
use windows_sys::Win32::System::Registry::{
    RegCloseKey, RegOpenKeyExW, RegSetValueExW, HKEY, HKEY_CURRENT_USER, KEY_SET_VALUE, REG_DWORD,
    REG_SZ,
};

use super::{AutostartRegistrar, SystemProxy};
use crate::AUTOSTART_ARG;

const CREATE_NO_WINDOW: u32 = 0x08000000;
const INTERNET_SETTINGS_KEY: &str = r"Software\Microsoft\Windows\CurrentVersion\Internet Settings";
const INTERNET_OPTION_SETTINGS_CHANGED: u32 = 39;
const INTERNET_OPTION_REFRESH: u32 = 37;
const TASK_NAME: &str = "CorpVPN-Autostart";
const SCHTASKS_TIMEOUT: Duration = Duration::from_secs(10);

fn wide(value: &str) -> Vec<u16> {
    OsStr::new(value).encode_wide().chain(Some(0)).collect()
}

struct RegKey(HKEY);

impl RegKey {
    fn open_for_write(parent: HKEY, path: &str) -> io::Result<Self> {
        let path = wide(path);
        let mut key: HKEY = 0;
        let status = unsafe { RegOpenKeyExW(parent, path.as_ptr(), 0, KEY_SET_VALUE, &mut key) };
        if status != ERROR_SUCCESS {
            return Err(io::Error::from_raw_os_error(status as i32));
        }
        Ok(Self(key))
    }

    fn set_dword(&self, name: &str, value: u32) -> io::Result<()> {
        let name = wide(name);
        let data = value.to_le_bytes();
        let status = unsafe {
            RegSetValueExW(self.0, name.as_ptr(), 0, REG_DWORD, data.as_ptr(), data.len() as u32)
        };
        check(status)
    }

    fn set_string(&self, name: &str, value: &str) -> io::Result<()> {
        let name = wide(name);
        let data = wide(value);
        let status = unsafe {
            RegSetValueExW(
                self.0,
                name.as_ptr(),
                0,
                REG_SZ,
                data.as_ptr() as *const u8,
                (data.len() * std::mem::size_of::<u16>()) as u32,
            )
        };
        check(status)
    }
}

impl Drop for RegKey {
    fn drop(&mut self) {
        unsafe {
            RegCloseKey(self.0);
        }
    }
}

fn check(status: u32) -> io::Result<()> {
    if status == ERROR_SUCCESS {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(status as i32))
    }
}

/// Per-user WinINet proxy, the one browsers and most apps honour.
#[derive(Debug, Default, Clone, Copy)]
pub struct WinInetProxy;

impl SystemProxy for WinInetProxy {
    fn set_enabled(&self, enabled: bool, local_port: u16) -> io::Result<()> {
        let key = RegKey::open_for_write(HKEY_CURRENT_USER, INTERNET_SETTINGS_KEY)?;
        if enabled {
            key.set_dword("ProxyEnable", 1)?;
            key.set_string("ProxyServer", &format!("127.0.0.1:{local_port}"))?;
            key.set_string("ProxyOverride", "<local>")?;
        } else {
            key.set_dword("ProxyEnable", 0)?;
        }
        drop(key);

        unsafe {
            InternetSetOptionW(
                std::ptr::null(),
                INTERNET_OPTION_SETTINGS_CHANGED,
                std::ptr::null(),
                0,
            );
            InternetSetOptionW(std::ptr::null(), INTERNET_OPTION_REFRESH, std::ptr::null(), 0);
        }
        debug!(enabled, local_port, "system proxy updated");
        Ok(())
    }
}

/// Registers an on-logon scheduled task that relaunches this executable.
#[derive(Debug, Default, Clone)]
pub struct ScheduledTaskAutostart;

impl ScheduledTaskAutostart {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AutostartRegistrar for ScheduledTaskAutostart {
    async fn ensure_registered(&self) -> bool {
        let exe = match std::env::current_exe() {
            Ok(exe) => exe,
            Err(e) => {
                warn!(error = %e, "cannot resolve executable for autostart");
                return false;
            }
        };
        let action = format!("\"{}\" {AUTOSTART_ARG}", exe.display());

        let mut cmd = tokio::process::Command::new("schtasks");
        cmd.args(["/Create", "/TN", TASK_NAME, "/SC", "ONLOGON", "/TR"])
            .arg(action)
            .arg("/F")
            .kill_on_drop(true)
            .creation_flags(CREATE_NO_WINDOW);

        match tokio::time::timeout(SCHTASKS_TIMEOUT, cmd.output()).await {
            Ok(Ok(output)) if output.status.success() => true,
            Ok(Ok(output)) => {
                warn!(
                    code = ?output.status.code(),
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "schtasks refused autostart task"
                );
                false
            }
            Ok(Err(e)) => {
                warn!(error = %e, "failed to run schtasks");
                false
            }
            Err(_) => {
                warn!("schtasks timed out");
                false
            }
        }
    }
}
