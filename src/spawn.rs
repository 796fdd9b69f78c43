//! Launch a private `ssh-agent` for demos and end-to-end tests.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

/// How long to wait for the agent socket to appear before giving up.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

/// A child `ssh-agent` bound to a scratch socket. The process is killed
/// when this is dropped.
pub struct SpawnedAgent {
    child: Child,
    socket_path: PathBuf,
}

impl SpawnedAgent {
    /// Start `ssh-agent -D -a <socket_path>` and wait until the socket is
    /// accepting connections.
    pub fn launch(socket_path: impl Into<PathBuf>) -> Result<Self> {
        let socket_path = socket_path.into();
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)
                .with_context(|| format!("Failed to remove stale socket {:?}", socket_path))?;
        }

        let child = Command::new("ssh-agent")
            .arg("-D")
            .arg("-a")
            .arg(&socket_path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("Failed to start ssh-agent (is it installed?)")?;

        let agent = SpawnedAgent { child, socket_path };
        agent.wait_for_socket()?;
        Ok(agent)
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    fn wait_for_socket(&self) -> Result<()> {
        let deadline = Instant::now() + STARTUP_TIMEOUT;
        while Instant::now() < deadline {
            if self.socket_path.exists() {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        anyhow::bail!(
            "ssh-agent did not create socket {:?} within {:?}",
            self.socket_path,
            STARTUP_TIMEOUT
        )
    }
}

impl Drop for SpawnedAgent {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        let _ = std::fs::remove_file(&self.socket_path);
    }
}
