//! Interface to the container runtime collaborator (§4.9): image loading,
//! container lifecycle, and exit-code observation. This crate treats the
//! runtime as an external collaborator and specifies only the operations
//! it consumes; the CLI implementation shells out to whatever runtime
//! binary is on `$PATH` (docker/podman-compatible CLI surface).

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::process::Stdio;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::process::Command;
use tracing::debug;

use crate::error::{FleetError, Result};
use crate::types::BindMount;

#[derive(Debug, Clone)]
pub struct CreateContainerRequest {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub cpu_quota_cores: f64,
    pub memory_limit_bytes: Option<u64>,
    pub gpu_device_indices: Vec<u32>,
    pub network: String,
    pub reserved_ip: Option<Ipv4Addr>,
    pub mounts: Vec<BindMount>,
    pub env: BTreeMap<String, String>,
    pub privileged: bool,
    /// `false` for one-shot COMMAND workloads (auto-removed on exit); `true`
    /// for VPS workloads, which persist across stop/restart.
    pub persistent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExitOutcome {
    #[default]
    Success,
    SignalKilled(i32),
    Failed(i32),
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Pulls `image_ref` from a registry.
    async fn pull_image(&self, image_ref: &str) -> Result<()>;

    /// Loads a named environment tarball from `tarball_path` if its mtime
    /// is newer than the currently-loaded image with that name; the caller
    /// is responsible for serializing concurrent loads of the same name
    /// (§4.9 step 1).
    async fn load_environment_if_stale(&self, name: &str, tarball_path: &str) -> Result<String>;

    async fn create(&self, req: &CreateContainerRequest) -> Result<String>;

    async fn start(&self, container_id: &str) -> Result<()>;

    /// Blocks until the container exits and returns its outcome.
    async fn wait_exit(&self, container_id: &str) -> Result<ExitOutcome>;

    async fn kill(&self, container_id: &str) -> Result<()>;

    async fn pause(&self, container_id: &str) -> Result<()>;

    async fn resume(&self, container_id: &str) -> Result<()>;

    /// Stops (but does not remove) a persistent VPS container.
    async fn stop(&self, container_id: &str) -> Result<()>;

    /// Re-attaches to an existing, still-present VPS container rather than
    /// recreating it.
    async fn restart(&self, container_id: &str) -> Result<()>;

    async fn is_present(&self, container_id: &str) -> Result<bool>;

    /// Up to `max_bytes` of the container's most recent stderr, attached to
    /// FAILED status reports.
    async fn tail_stderr(&self, container_id: &str, max_bytes: usize) -> Result<Vec<u8>>;
}

pub struct CliContainerRuntime {
    binary: String,
}

impl CliContainerRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output> {
        debug!(binary = %self.binary, cmd = %args.join(" "), "container runtime CLI");
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;
        Ok(output)
    }

    /// The locally loaded image's creation timestamp, or `None` if it isn't
    /// present or the runtime's `--format` output can't be parsed.
    async fn image_loaded_at(&self, name: &str) -> Option<DateTime<Utc>> {
        let out = self.run(&["inspect", "-f", "{{.Created}}", name]).await.ok()?;
        if !out.status.success() {
            return None;
        }
        let created = String::from_utf8_lossy(&out.stdout).trim().to_string();
        DateTime::parse_from_rfc3339(&created).ok().map(|dt| dt.with_timezone(&Utc))
    }
}

#[async_trait]
impl ContainerRuntime for CliContainerRuntime {
    async fn pull_image(&self, image_ref: &str) -> Result<()> {
        let out = self.run(&["pull", image_ref]).await?;
        if !out.status.success() {
            return Err(FleetError::Transient(format!("image pull failed for {image_ref}")));
        }
        Ok(())
    }

    async fn load_environment_if_stale(&self, name: &str, tarball_path: &str) -> Result<String> {
        let tarball_mtime = tokio::fs::metadata(tarball_path)
            .await
            .ok()
            .and_then(|m| m.modified().ok())
            .map(DateTime::<Utc>::from);

        if let (Some(tarball_mtime), Some(loaded_at)) =
            (tarball_mtime, self.image_loaded_at(name).await)
        {
            if loaded_at >= tarball_mtime {
                debug!(name, "loaded environment is not stale; skipping docker load");
                return Ok(name.to_string());
            }
        }

        let out = self.run(&["load", "-i", tarball_path]).await?;
        if !out.status.success() {
            return Err(FleetError::Transient(format!(
                "environment load failed for {name} from {tarball_path}"
            )));
        }
        Ok(name.to_string())
    }

    async fn create(&self, req: &CreateContainerRequest) -> Result<String> {
        let mut args: Vec<String> = vec!["create".into(), "--name".into(), req.name.clone()];
        if req.persistent {
            args.push("--restart=unless-stopped".into());
        } else {
            args.push("--rm".into());
        }
        if req.cpu_quota_cores > 0.0 {
            args.push("--cpus".into());
            args.push(req.cpu_quota_cores.to_string());
        }
        if let Some(mem) = req.memory_limit_bytes {
            args.push("--memory".into());
            args.push(mem.to_string());
        }
        for idx in &req.gpu_device_indices {
            args.push("--gpus".into());
            args.push(format!("device={idx}"));
        }
        args.push("--network".into());
        args.push(req.network.clone());
        if let Some(ip) = req.reserved_ip {
            args.push("--ip".into());
            args.push(ip.to_string());
        }
        for mount in &req.mounts {
            let ro = if mount.read_only { ":ro" } else { "" };
            args.push("-v".into());
            args.push(format!("{}:{}{ro}", mount.host_path, mount.container_path));
        }
        for (k, v) in &req.env {
            args.push("-e".into());
            args.push(format!("{k}={v}"));
        }
        if req.privileged {
            args.push("--privileged".into());
        }
        args.push(req.image.clone());
        args.extend(req.command.iter().cloned());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = self.run(&arg_refs).await?;
        if !out.status.success() {
            return Err(FleetError::Transient(format!(
                "container create failed for {}",
                req.name
            )));
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        let out = self.run(&["start", container_id]).await?;
        if !out.status.success() {
            return Err(FleetError::Transient(format!("start failed for {container_id}")));
        }
        Ok(())
    }

    async fn wait_exit(&self, container_id: &str) -> Result<ExitOutcome> {
        let out = self.run(&["wait", container_id]).await?;
        let code: i32 = String::from_utf8_lossy(&out.stdout)
            .trim()
            .parse()
            .unwrap_or(-1);
        Ok(match code {
            0 => ExitOutcome::Success,
            137 => ExitOutcome::SignalKilled(137),
            other => ExitOutcome::Failed(other),
        })
    }

    async fn kill(&self, container_id: &str) -> Result<()> {
        self.run(&["kill", container_id]).await?;
        Ok(())
    }

    async fn pause(&self, container_id: &str) -> Result<()> {
        self.run(&["pause", container_id]).await?;
        Ok(())
    }

    async fn resume(&self, container_id: &str) -> Result<()> {
        self.run(&["unpause", container_id]).await?;
        Ok(())
    }

    async fn stop(&self, container_id: &str) -> Result<()> {
        self.run(&["stop", container_id]).await?;
        Ok(())
    }

    async fn restart(&self, container_id: &str) -> Result<()> {
        self.run(&["start", container_id]).await?;
        Ok(())
    }

    async fn is_present(&self, container_id: &str) -> Result<bool> {
        let out = self.run(&["inspect", container_id]).await?;
        Ok(out.status.success())
    }

    async fn tail_stderr(&self, container_id: &str, max_bytes: usize) -> Result<Vec<u8>> {
        let out = self.run(&["logs", "--tail", "200", container_id]).await?;
        let mut stderr = out.stderr;
        if stderr.len() > max_bytes {
            let start = stderr.len() - max_bytes;
            stderr = stderr.split_off(start);
        }
        Ok(stderr)
    }
}

/// In-memory fake used by executor tests.
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeContainerRuntime {
        pub created: Mutex<Vec<CreateContainerRequest>>,
        pub exit_outcome: Mutex<ExitOutcome>,
    }

    impl FakeContainerRuntime {
        pub fn new(exit_outcome: ExitOutcome) -> Self {
            Self {
                created: Mutex::new(Vec::new()),
                exit_outcome: Mutex::new(exit_outcome),
            }
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeContainerRuntime {
        async fn pull_image(&self, _image_ref: &str) -> Result<()> {
            Ok(())
        }

        async fn load_environment_if_stale(&self, name: &str, _tarball_path: &str) -> Result<String> {
            Ok(name.to_string())
        }

        async fn create(&self, req: &CreateContainerRequest) -> Result<String> {
            self.created.lock().unwrap().push(req.clone());
            Ok(req.name.clone())
        }

        async fn start(&self, _container_id: &str) -> Result<()> {
            Ok(())
        }

        async fn wait_exit(&self, _container_id: &str) -> Result<ExitOutcome> {
            Ok(*self.exit_outcome.lock().unwrap())
        }

        async fn kill(&self, _container_id: &str) -> Result<()> {
            Ok(())
        }

        async fn pause(&self, _container_id: &str) -> Result<()> {
            Ok(())
        }

        async fn resume(&self, _container_id: &str) -> Result<()> {
            Ok(())
        }

        async fn stop(&self, _container_id: &str) -> Result<()> {
            Ok(())
        }

        async fn restart(&self, _container_id: &str) -> Result<()> {
            Ok(())
        }

        async fn is_present(&self, _container_id: &str) -> Result<bool> {
            Ok(true)
        }

        async fn tail_stderr(&self, _container_id: &str, _max_bytes: usize) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }
}
