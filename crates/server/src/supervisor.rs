//! Child-process supervision: process-group spawn and phased shutdown.
//!
//! Shutdown escalates SIGINT, then SIGTERM, then SIGKILL, each with its own grace
//! period, and signals the whole process group (via a negative pid) rather than a
//! single pid so a multi-process child (e.g. ffmpeg's helper processes) is fully
//! reaped. `setsid()` in `pre_exec` makes the spawned child its own process-group
//! leader so that negative-pid signal targets only it and its descendants.

use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::time::timeout;

pub const INTERRUPT_GRACE: Duration = Duration::from_secs(60);
pub const TERMINATE_GRACE: Duration = Duration::from_secs(2);
pub const KILL_GRACE: Duration = Duration::from_millis(100);

/// Minimum time a freshly spawned child must stay alive to be considered launched
/// rather than having failed immediately (bad argv, missing binary, bad env).
pub const LIVENESS_CHECK_DELAY: Duration = Duration::from_millis(250);

pub struct Supervised {
    child: Child,
    pgid: Pid,
    stdout: Option<tokio::process::ChildStdout>,
}

impl Supervised {
    /// Spawns `program` with `args`, in its own process group (`setsid`), inheriting
    /// stdout/stderr as given. Waits `LIVENESS_CHECK_DELAY` and fails if the child has
    /// already exited by then.
    pub async fn spawn(
        program: &str,
        args: &[String],
        envs: &[(String, String)],
        stdout: Stdio,
        stderr: Stdio,
    ) -> anyhow::Result<Self> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdout(stdout)
            .stderr(stderr)
            .stdin(Stdio::null());

        // SAFETY: setsid() is async-signal-safe and this closure runs in the forked
        // child before exec, with no other threads present in that address space.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid().map_err(std::io::Error::from)?;
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(|e| {
            anyhow::anyhow!("failed to spawn {program}: {e}")
        })?;
        let pid = child
            .id()
            .ok_or_else(|| anyhow::anyhow!("spawned child has no pid"))?;
        let pgid = Pid::from_raw(pid as i32);

        let mut supervised = Self {
            child,
            pgid,
            stdout: None,
        };
        supervised.stdout = supervised.child.stdout.take();

        tokio::time::sleep(LIVENESS_CHECK_DELAY).await;
        if let Some(status) = supervised.child.try_wait()? {
            anyhow::bail!("{program} exited immediately with {status}");
        }

        Ok(supervised)
    }

    pub fn pid(&self) -> i32 {
        self.pgid.as_raw()
    }

    /// Takes ownership of the child's stdout pipe, if one was requested at spawn time.
    /// Can only be taken once; later callers get `None`.
    pub fn take_stdout(&mut self) -> Option<tokio::process::ChildStdout> {
        self.stdout.take()
    }

    pub async fn try_wait(&mut self) -> anyhow::Result<Option<std::process::ExitStatus>> {
        Ok(self.child.try_wait()?)
    }

    pub async fn wait(&mut self) -> anyhow::Result<std::process::ExitStatus> {
        Ok(self.child.wait().await?)
    }

    fn signal_group(&self, sig: Signal) -> anyhow::Result<()> {
        // Negative pid targets the whole process group led by this child.
        match signal::kill(Pid::from_raw(-self.pgid.as_raw()), sig) {
            Ok(()) => Ok(()),
            Err(nix::errno::Errno::ESRCH) => Ok(()), // already exited
            Err(e) => Err(anyhow::anyhow!("signal {sig} to pgid {} failed: {e}", self.pgid)),
        }
    }

    /// Phased shutdown: SIGINT and wait up to `INTERRUPT_GRACE`, else SIGTERM and wait
    /// up to `TERMINATE_GRACE`, else SIGKILL and wait up to `KILL_GRACE`.
    pub async fn shutdown(&mut self) -> anyhow::Result<std::process::ExitStatus> {
        if let Some(status) = self.try_wait().await? {
            return Ok(status);
        }

        self.signal_group(Signal::SIGINT)?;
        if let Ok(Ok(status)) = timeout(INTERRUPT_GRACE, self.child.wait()).await {
            return Ok(status);
        }
        tracing::warn!(pid = self.pid(), "process did not exit after SIGINT, escalating to SIGTERM");

        self.signal_group(Signal::SIGTERM)?;
        if let Ok(Ok(status)) = timeout(TERMINATE_GRACE, self.child.wait()).await {
            return Ok(status);
        }
        tracing::warn!(pid = self.pid(), "process did not exit after SIGTERM, escalating to SIGKILL");

        self.signal_group(Signal::SIGKILL)?;
        let status = timeout(KILL_GRACE, self.child.wait())
            .await
            .map_err(|_| anyhow::anyhow!("process {} unresponsive even to SIGKILL", self.pid()))??;
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawns_and_reports_liveness() {
        let supervised = Supervised::spawn(
            "sleep",
            &["5".to_string()],
            &[],
            Stdio::null(),
            Stdio::null(),
        )
        .await
        .unwrap();
        assert!(supervised.pid() > 0);
    }

    #[tokio::test]
    async fn immediate_exit_is_reported_as_error() {
        let result = Supervised::spawn(
            "false",
            &[],
            &[],
            Stdio::null(),
            Stdio::null(),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn shutdown_reaps_a_sleeping_child_via_sigint() {
        let mut supervised = Supervised::spawn(
            "sleep",
            &["30".to_string()],
            &[],
            Stdio::null(),
            Stdio::null(),
        )
        .await
        .unwrap();
        let status = tokio::time::timeout(Duration::from_secs(5), supervised.shutdown())
            .await
            .expect("shutdown took too long")
            .unwrap();
        assert!(!status.success());
    }
}
