use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, System};
use tracing::debug;

#[cfg(target_os = "windows")]
use windows_sys::Win32::Foundation::CloseHandle;
#[cfg(target_os = "windows")]
use windows_sys::Win32::System::JobObjects::{
    AssignProcessToJobObject, CreateJobObjectW, JobObjectExtendedLimitInformation,
    SetInformationJobObject, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
    JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
};

/// Kills every process descended from `root`, deepest first. `root` itself
/// is left to the caller, which owns its handle.
pub fn kill_descendants(root: u32) -> usize {
    let system = System::new_with_specifics(
        RefreshKind::new().with_processes(ProcessRefreshKind::new()),
    );

    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (pid, process) in system.processes() {
        if let Some(parent) = process.parent() {
            children.entry(parent).or_default().push(*pid);
        }
    }

    let mut found = Vec::new();
    let mut stack = vec![Pid::from_u32(root)];
    while let Some(pid) = stack.pop() {
        if let Some(kids) = children.get(&pid) {
            for kid in kids {
                found.push(*kid);
                stack.push(*kid);
            }
        }
    }

    let mut killed = 0;
    for pid in found.iter().rev() {
        if let Some(process) = system.process(*pid) {
            if process.kill() {
                killed += 1;
            } else {
                debug!(pid = pid.as_u32(), "failed to kill core descendant");
            }
        }
    }
    killed
}

/// Keeps the tail of a log that grew past `max_bytes`. Returns whether the
/// file was rewritten.
pub fn trim_log_file(path: &Path, keep_bytes: u64, max_bytes: u64) -> std::io::Result<bool> {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(_) => return Ok(false),
    };
    let len = meta.len();
    if len <= max_bytes {
        return Ok(false);
    }
    let keep = keep_bytes.min(len);
    let start = len.saturating_sub(keep);
    let mut file = fs::File::open(path)?;
    file.seek(SeekFrom::Start(start))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    let mut out = OpenOptions::new().write(true).truncate(true).open(path)?;
    out.write_all(&buf)?;
    Ok(true)
}

#[cfg(target_os = "windows")]
#[derive(Debug)]
pub struct JobHandle(isize);

#[cfg(target_os = "windows")]
impl Drop for JobHandle {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.0);
        }
    }
}

#[cfg(target_os = "windows")]
impl JobHandle {
    pub fn create() -> std::io::Result<Self> {
        let handle = unsafe { CreateJobObjectW(std::ptr::null_mut(), std::ptr::null()) };
        if handle == 0 {
            return Err(std::io::Error::last_os_error());
        }
        let mut info: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = unsafe { std::mem::zeroed() };
        info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;
        let result = unsafe {
            SetInformationJobObject(
                handle,
                JobObjectExtendedLimitInformation,
                &mut info as *mut _ as *mut _,
                std::mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
            )
        };
        if result == 0 {
            let error = std::io::Error::last_os_error();
            unsafe {
                CloseHandle(handle);
            }
            return Err(error);
        }
        Ok(JobHandle(handle))
    }

    pub fn assign(&self, child: &std::process::Child) -> bool {
        use std::os::windows::io::AsRawHandle;
        unsafe { AssignProcessToJobObject(self.0, child.as_raw_handle() as isize) != 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trim_keeps_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("core.log");
        fs::write(&path, b"0123456789abcdef").unwrap();

        assert!(trim_log_file(&path, 6, 10).unwrap());
        assert_eq!(fs::read(&path).unwrap(), b"abcdef");

        assert!(!trim_log_file(&path, 6, 10).unwrap());
        assert!(!trim_log_file(&dir.path().join("absent.log"), 6, 10).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_kill_descendants_of_shell() {
        use std::process::Command;
        use std::time::{Duration, Instant};

        let mut child = Command::new("sh")
            .arg("-c")
            .arg("sleep 30 & wait")
            .spawn()
            .unwrap();

        // give the shell a moment to fork its children
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut killed = 0;
        while Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(100));
            killed = kill_descendants(child.id());
            if killed > 0 {
                break;
            }
        }
        let _ = child.kill();
        let _ = child.wait();
        assert!(killed >= 1);
    }
}
