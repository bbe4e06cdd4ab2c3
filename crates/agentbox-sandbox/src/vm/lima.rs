//! Lima-backed VM engine.
//!
//! Each VM is a Lima instance booted from a generated template that carries
//! the requested mounts. Commands run in a throwaway container of the
//! requested image through the VM's containerd (`nerdctl run --rm`), with the
//! same mounts bound at their guest paths.
//!
//! ## Requirements
//!
//! - Lima installed: `brew install lima` (macOS) or a distribution package
//! - QEMU or Apple Virtualization.framework

use super::backend::{VmBackend, VmCommand, VmHandle, VmSpec};
use crate::config::VmConfig;
use crate::error::{SandboxError, SandboxResult};
use crate::process::run_captured;
use crate::{shell_quote, SandboxExecResult, VolumeMount};
use agentbox_util::bin::{find_binary, well_known_dirs};
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Upper bound on `limactl start`: first boot downloads the base image.
const START_TIMEOUT: Duration = Duration::from_secs(600);

const UBUNTU_AMD64: &str =
    "https://cloud-images.ubuntu.com/releases/24.04/release/ubuntu-24.04-server-cloudimg-amd64.img";
const UBUNTU_ARM64: &str =
    "https://cloud-images.ubuntu.com/releases/24.04/release/ubuntu-24.04-server-cloudimg-arm64.img";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LimaTemplate {
    images: Vec<LimaImage>,
    cpus: u32,
    memory: String,
    mounts: Vec<LimaMount>,
    containerd: LimaContainerd,
}

#[derive(Debug, Serialize)]
struct LimaImage {
    location: String,
    arch: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LimaMount {
    location: String,
    mount_point: String,
    writable: bool,
}

#[derive(Debug, Serialize)]
struct LimaContainerd {
    system: bool,
    user: bool,
}

/// Render the Lima template for `spec`.
pub(crate) fn render_template(spec: &VmSpec) -> SandboxResult<String> {
    let template = LimaTemplate {
        images: vec![
            LimaImage {
                location: UBUNTU_AMD64.to_string(),
                arch: "x86_64".to_string(),
            },
            LimaImage {
                location: UBUNTU_ARM64.to_string(),
                arch: "aarch64".to_string(),
            },
        ],
        cpus: spec.cpus,
        memory: spec.memory.clone(),
        mounts: spec
            .mounts
            .iter()
            .map(|m| LimaMount {
                location: m.host_path.to_string_lossy().into_owned(),
                mount_point: m.guest_path.to_string_lossy().into_owned(),
                writable: !m.read_only,
            })
            .collect(),
        containerd: LimaContainerd {
            system: true,
            user: false,
        },
    };
    Ok(serde_yaml::to_string(&template)?)
}

/// Lima VM engine.
pub struct LimaBackend {
    limactl: Option<PathBuf>,
    name_prefix: String,
}

impl LimaBackend {
    pub fn new(config: &VmConfig) -> Self {
        let limactl = config.limactl.clone().or_else(|| {
            find_binary("limactl", &well_known_dirs(), Some("LIMACTL_PATH"))
        });
        Self {
            limactl,
            name_prefix: config.name_prefix.clone(),
        }
    }

    fn limactl(&self) -> SandboxResult<&Path> {
        self.limactl.as_deref().ok_or_else(|| {
            SandboxError::RuntimeNotAvailable(
                "Lima (limactl) is not installed. Install with: brew install lima".to_string(),
            )
        })
    }
}

#[async_trait]
impl VmBackend for LimaBackend {
    fn name(&self) -> &str {
        "lima"
    }

    async fn is_available(&self) -> bool {
        let Ok(limactl) = self.limactl() else {
            return false;
        };
        match Command::new(limactl).arg("--version").output().await {
            Ok(output) => output.status.success(),
            Err(e) => {
                debug!(error = %e, "limactl --version failed");
                false
            }
        }
    }

    async fn start(&self, spec: &VmSpec) -> SandboxResult<Box<dyn VmHandle>> {
        let limactl = self.limactl()?.to_path_buf();
        let short_id = uuid::Uuid::new_v4().simple().to_string();
        let vm_name = format!("{}-{}", self.name_prefix, &short_id[..8]);

        let template_path = std::env::temp_dir().join(format!("{}.yaml", vm_name));
        tokio::fs::write(&template_path, render_template(spec)?)
            .await
            .map_err(|e| SandboxError::create_failed(format!("failed to write template: {}", e)))?;

        info!(vm_name = %vm_name, image = %spec.image, mounts = spec.mounts.len(), "Starting Lima VM");
        let mut cmd = Command::new(&limactl);
        cmd.arg("start")
            .arg("--tty=false")
            .arg(format!("--name={}", vm_name))
            .arg(&template_path);
        let output = run_captured(cmd, Some(START_TIMEOUT), "limactl").await;
        let _ = tokio::fs::remove_file(&template_path).await;

        let vm = LimaVm {
            limactl,
            vm_name,
            image: spec.image.clone(),
            mounts: spec.mounts.clone(),
            stopped: AtomicBool::new(false),
        };

        if !output.success() {
            if let Err(e) = vm.stop().await {
                debug!(error = %e, "Cleanup after failed start also failed");
            }
            return Err(SandboxError::start_failed(format!(
                "limactl start exited with {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }

        info!(vm_name = %vm.vm_name, "Lima VM running");
        Ok(Box::new(vm))
    }
}

/// A running Lima instance.
struct LimaVm {
    limactl: PathBuf,
    vm_name: String,
    image: String,
    mounts: Vec<VolumeMount>,
    stopped: AtomicBool,
}

impl LimaVm {
    /// The in-VM script running `command` inside a container of `self.image`.
    fn container_script(&self, command: &VmCommand) -> String {
        let mut parts = vec![
            "sudo nerdctl run --rm -i --network host".to_string(),
        ];
        for mount in &self.mounts {
            let guest = mount.guest_path.to_string_lossy();
            let bind = if mount.read_only {
                format!("{}:{}:ro", guest, guest)
            } else {
                format!("{}:{}", guest, guest)
            };
            parts.push(format!("-v {}", shell_quote(&bind)));
        }
        if let Some(cwd) = &command.cwd {
            parts.push(format!("-w {}", shell_quote(&cwd.to_string_lossy())));
        }
        let mut env: Vec<(&String, &String)> = command.env.iter().collect();
        env.sort();
        for (key, value) in env {
            parts.push(format!("-e {}", shell_quote(&format!("{}={}", key, value))));
        }
        parts.push(shell_quote(&self.image));
        parts.push(format!("sh -c {}", shell_quote(&command.command_line)));
        parts.join(" ")
    }
}

#[async_trait]
impl VmHandle for LimaVm {
    fn id(&self) -> &str {
        &self.vm_name
    }

    async fn exec(&self, command: VmCommand) -> SandboxExecResult {
        let script = self.container_script(&command);
        debug!(vm_name = %self.vm_name, command = %command.command_line, "Executing in Lima VM");

        let mut cmd = Command::new(&self.limactl);
        cmd.args(["shell", "--workdir", "/", &self.vm_name, "sh", "-c", &script]);
        run_captured(cmd, command.timeout, "limactl").await
    }

    async fn stop(&self) -> SandboxResult<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(vm_name = %self.vm_name, "Stopping Lima VM");

        let output = Command::new(&self.limactl)
            .args(["stop", "--force", &self.vm_name])
            .output()
            .await
            .map_err(|e| SandboxError::stop_failed(e.to_string()))?;
        if !output.status.success() {
            warn!(
                vm_name = %self.vm_name,
                error = %String::from_utf8_lossy(&output.stderr),
                "limactl stop failed, deleting anyway"
            );
        }

        let output = Command::new(&self.limactl)
            .args(["delete", "--force", &self.vm_name])
            .output()
            .await
            .map_err(|e| SandboxError::stop_failed(e.to_string()))?;
        if !output.status.success() {
            return Err(SandboxError::stop_failed(format!(
                "limactl delete {}: {}",
                self.vm_name,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn spec() -> VmSpec {
        VmSpec {
            image: "python:3.12-slim".to_string(),
            mounts: vec![
                VolumeMount::same_path("/work/project"),
                VolumeMount {
                    host_path: PathBuf::from("/data"),
                    guest_path: PathBuf::from("/mnt/data"),
                    read_only: true,
                },
            ],
            cpus: 4,
            memory: "4GiB".to_string(),
        }
    }

    #[test]
    fn test_render_template() {
        let yaml = render_template(&spec()).unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();

        assert_eq!(parsed["cpus"], serde_yaml::Value::from(4));
        assert_eq!(parsed["memory"], serde_yaml::Value::from("4GiB"));
        let mounts = parsed["mounts"].as_sequence().unwrap();
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0]["location"], serde_yaml::Value::from("/work/project"));
        assert_eq!(mounts[0]["writable"], serde_yaml::Value::from(true));
        assert_eq!(mounts[1]["mountPoint"], serde_yaml::Value::from("/mnt/data"));
        assert_eq!(mounts[1]["writable"], serde_yaml::Value::from(false));
        assert_eq!(parsed["containerd"]["system"], serde_yaml::Value::from(true));
    }

    #[test]
    fn test_container_script() {
        let s = spec();
        let vm = LimaVm {
            limactl: PathBuf::from("limactl"),
            vm_name: "agentbox-test".to_string(),
            image: s.image,
            mounts: s.mounts,
            stopped: AtomicBool::new(false),
        };
        let mut env = HashMap::new();
        env.insert("KEY".to_string(), "a b".to_string());
        let script = vm.container_script(&VmCommand {
            command_line: "echo 'hi'".to_string(),
            cwd: Some(PathBuf::from("/work/project")),
            env,
            timeout: None,
        });

        assert!(script.starts_with("sudo nerdctl run --rm -i"));
        assert!(script.contains("-v /work/project:/work/project"));
        assert!(script.contains("-v /mnt/data:/mnt/data:ro"));
        assert!(script.contains("-w /work/project"));
        assert!(script.contains("-e 'KEY=a b'"));
        assert!(script.ends_with("python:3.12-slim sh -c 'echo '\\''hi'\\'''"));
    }

    #[test]
    fn test_missing_limactl() {
        let backend = LimaBackend {
            limactl: None,
            name_prefix: "agentbox".to_string(),
        };
        assert!(matches!(
            backend.limactl(),
            Err(SandboxError::RuntimeNotAvailable(_))
        ));
    }
}
