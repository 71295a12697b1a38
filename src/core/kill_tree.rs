//! C9 helper: platform-abstracted subprocess tree termination (spec §9
//! "Subprocess tree kill"). Windows uses a per-child Job Object with
//! `JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE` (adapted from the teacher's
//! global, kill-on-app-exit Job Object into an on-demand, per-spawn one);
//! Unix spawns into a fresh process group and signals it `SIGTERM` then
//! `SIGKILL` after a grace period.

use std::time::Duration;

use tokio::process::Child;
use tokio::time::timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    AlreadyExited,
    Exit,
    Close,
    Timeout,
}

/// Prepares a [`tokio::process::Command`] so its child can later be killed as
/// a full tree via [`kill_tree`]. Call before `.spawn()`.
#[cfg(unix)]
pub fn prepare_for_tree_kill(cmd: &mut tokio::process::Command) {
    use std::os::unix::process::CommandExt;
    unsafe {
        cmd.pre_exec(|| {
            libc::setpgid(0, 0);
            Ok(())
        });
    }
}

#[cfg(windows)]
pub fn prepare_for_tree_kill(_cmd: &mut tokio::process::Command) {}

#[cfg(windows)]
mod windows_job {
    use windows::Win32::Foundation::{CloseHandle, HANDLE};
    use windows::Win32::System::JobObjects::{
        AssignProcessToJobObject, CreateJobObjectW, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
        JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE, JobObjectExtendedLimitInformation,
        SetInformationJobObject, TerminateJobObject,
    };
    use windows::Win32::System::Threading::{OpenProcess, PROCESS_ALL_ACCESS};

    pub struct JobHandle(HANDLE);

    unsafe impl Send for JobHandle {}
    unsafe impl Sync for JobHandle {}

    impl Drop for JobHandle {
        fn drop(&mut self) {
            unsafe {
                let _ = CloseHandle(self.0);
            }
        }
    }

    /// Creates a fresh Job Object, configures kill-on-close, and assigns the
    /// given child PID. The returned handle must be kept alive for the
    /// duration of the child so `TerminateJobObject`/close has something to
    /// act on.
    pub fn attach(child_pid: u32) -> Option<JobHandle> {
        unsafe {
            let job = CreateJobObjectW(None, None).ok()?;
            let mut info: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = std::mem::zeroed();
            info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;
            SetInformationJobObject(
                job,
                JobObjectExtendedLimitInformation,
                &info as *const _ as *const std::ffi::c_void,
                std::mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
            )
            .ok()?;

            let process = OpenProcess(PROCESS_ALL_ACCESS, false, child_pid).ok()?;
            let assigned = AssignProcessToJobObject(job, process);
            let _ = CloseHandle(process);
            assigned.ok()?;

            Some(JobHandle(job))
        }
    }

    pub fn terminate(job: &JobHandle) {
        unsafe {
            let _ = TerminateJobObject(job.0, 1);
        }
    }
}

/// Forces the process tree rooted at `child` down and waits up to `grace`
/// for the wait to complete, returning which branch resolved it (spec §9,
/// §4.9 step 1).
pub async fn kill_tree(child: &mut Child, grace: Duration) -> WaitOutcome {
    if let Ok(Some(_)) = child.try_wait() {
        return WaitOutcome::AlreadyExited;
    }

    #[cfg(windows)]
    {
        if let Some(pid) = child.id() {
            if let Some(job) = windows_job::attach(pid) {
                windows_job::terminate(&job);
            }
        }
    }

    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(-(pid as libc::pid_t), libc::SIGTERM);
            }
        }
        if timeout(grace, child.wait()).await.is_ok() {
            return WaitOutcome::Exit;
        }
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
            }
        }
    }

    match timeout(grace, child.wait()).await {
        Ok(Ok(_)) => WaitOutcome::Close,
        _ => {
            let _ = child.kill().await;
            match timeout(grace, child.wait()).await {
                Ok(Ok(_)) => WaitOutcome::Close,
                _ => WaitOutcome::Timeout,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::process::Command;

    #[tokio::test]
    async fn kills_a_busy_loop_process() {
        #[cfg(unix)]
        let mut cmd = {
            let mut c = Command::new("sh");
            c.arg("-c").arg("sleep 30");
            c
        };
        #[cfg(windows)]
        let mut cmd = {
            let mut c = Command::new("cmd");
            c.args(["/C", "ping -n 31 127.0.0.1 > nul"]);
            c
        };
        prepare_for_tree_kill(&mut cmd);
        let mut child = cmd.spawn().expect("spawn busy-loop process");
        let outcome = kill_tree(&mut child, Duration::from_secs(2)).await;
        assert!(matches!(outcome, WaitOutcome::Exit | WaitOutcome::Close));
    }

    #[tokio::test]
    async fn already_exited_short_circuits() {
        let mut cmd = Command::new(if cfg!(windows) { "cmd" } else { "true" });
        if cfg!(windows) {
            cmd.args(["/C", "exit 0"]);
        }
        let mut child = cmd.spawn().unwrap();
        let _ = child.wait().await;
        let outcome = kill_tree(&mut child, Duration::from_secs(1)).await;
        assert_eq!(outcome, WaitOutcome::AlreadyExited);
    }
}
