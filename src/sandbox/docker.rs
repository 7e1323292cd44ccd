//! Docker-backed sandboxes.
//!
//! Each sandbox is a long-running container (`sleep infinity`); shells are
//! `docker exec` sessions with stdin attached. Docker cannot re-attach to an
//! existing exec's stdio, so live attachments are kept in a registry for the
//! lifetime of this process and handed to whichever session resumes the
//! sandbox next.

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, DownloadFromContainerOptions,
    InspectContainerOptions, LogOutput, StartContainerOptions, UploadToContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::ContainerStateStatusEnum;
use bollard::Docker;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::collections::HashMap;
use std::io::Read;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use super::{SandboxBackend, SandboxError, ShellEvent, ShellHandle};
use crate::config::SandboxConfig;

/// Label marking containers created by fleet.
const MANAGED_LABEL: &str = "fleet.managed";

/// Label carrying the owning task identifier.
const TASK_LABEL: &str = "fleet.task";

/// Upper bound for a single stdin write.
const STDIN_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

type ExecOutput = Pin<Box<dyn Stream<Item = Result<LogOutput, DockerError>> + Send>>;
type ExecInput = Pin<Box<dyn AsyncWrite + Send>>;
type EventSink = Arc<Mutex<Option<mpsc::UnboundedSender<ShellEvent>>>>;

/// Live stdio attachment to one exec'd shell.
#[derive(Clone)]
struct ShellLink {
    stdin: Arc<Mutex<ExecInput>>,
    sink: EventSink,
}

/// Sandbox backend driving containers through the Docker API.
pub(crate) struct DockerBackend {
    docker: Docker,
    config: SandboxConfig,
    shells: Arc<Mutex<HashMap<String, ShellLink>>>,
}

impl DockerBackend {
    /// Connects to the local Docker daemon.
    pub async fn connect(config: SandboxConfig) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::docker_unavailable(e.to_string()))?;

        docker
            .ping()
            .await
            .map_err(|e| SandboxError::docker_unavailable(e.to_string()))?;

        Ok(Self {
            docker,
            config,
            shells: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn build_container_config(&self, task_label: &str) -> Result<ContainerConfig<String>, SandboxError> {
        let memory = parse_memory_limit(&self.config.memory)?;
        let cpus = self.config.cpus.parse::<f64>().unwrap_or(2.0);

        let labels = HashMap::from([
            (MANAGED_LABEL.to_string(), "true".to_string()),
            (TASK_LABEL.to_string(), task_label.to_string()),
        ]);

        #[allow(clippy::cast_possible_truncation)]
        let nano_cpus = (cpus * 1_000_000_000.0) as i64;

        Ok(ContainerConfig {
            image: Some(self.config.image.clone()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            labels: Some(labels),
            host_config: Some(bollard::service::HostConfig {
                memory: Some(memory),
                nano_cpus: Some(nano_cpus),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    async fn container_status(
        &self,
        sandbox_id: &str,
    ) -> Result<Option<ContainerStateStatusEnum>, SandboxError> {
        let inspect = self
            .docker
            .inspect_container(sandbox_id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| not_found_or_transport(e, || SandboxError::sandbox_not_found(sandbox_id)))?;

        Ok(inspect.state.and_then(|state| state.status))
    }

    /// Runs a short-lived command and collects its output.
    async fn exec_oneshot(
        &self,
        sandbox_id: &str,
        cmd: Vec<&str>,
    ) -> Result<(i64, String, String), SandboxError> {
        let exec = self
            .docker
            .create_exec(
                sandbox_id,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| not_found_or_transport(e, || SandboxError::sandbox_not_found(sandbox_id)))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        match self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| SandboxError::transport(e.to_string()))?
        {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(chunk) = output.next().await {
                    match chunk {
                        Ok(LogOutput::StdOut { message } | LogOutput::Console { message }) => {
                            stdout.extend_from_slice(&message);
                        }
                        Ok(LogOutput::StdErr { message }) => stderr.extend_from_slice(&message),
                        Ok(LogOutput::StdIn { .. }) => {}
                        Err(e) => return Err(SandboxError::transport(e.to_string())),
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(SandboxError::transport("Exec was detached unexpectedly"));
            }
        }

        let exit_code = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| SandboxError::transport(e.to_string()))?
            .exit_code
            .unwrap_or(0);

        Ok((
            exit_code,
            String::from_utf8_lossy(&stdout).into_owned(),
            String::from_utf8_lossy(&stderr).into_owned(),
        ))
    }

    /// Forwards exec output into whichever sink is currently attached.
    fn spawn_pump(&self, shell_id: String, mut output: ExecOutput, sink: EventSink) {
        let docker = self.docker.clone();
        let shells = Arc::clone(&self.shells);

        tokio::spawn(async move {
            while let Some(chunk) = output.next().await {
                let event = match chunk {
                    Ok(LogOutput::StdOut { message } | LogOutput::Console { message }) => {
                        ShellEvent::Stdout(String::from_utf8_lossy(&message).into_owned())
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        ShellEvent::Stderr(String::from_utf8_lossy(&message).into_owned())
                    }
                    Ok(LogOutput::StdIn { .. }) => continue,
                    Err(e) => {
                        warn!(shell_id = %shell_id, error = %e, "Shell output stream failed");
                        break;
                    }
                };
                forward(&sink, event).await;
            }

            let exit_code = match docker.inspect_exec(&shell_id).await {
                Ok(inspect) => inspect.exit_code.unwrap_or(-1),
                Err(e) => {
                    debug!("Could not inspect finished shell {}: {}", shell_id, e);
                    -1
                }
            };

            shells.lock().await.remove(&shell_id);
            debug!("Shell {} exited with code {}", shell_id, exit_code);
            forward(&sink, ShellEvent::Exited(exit_code)).await;
        });
    }
}

async fn forward(sink: &EventSink, event: ShellEvent) {
    if let Some(tx) = sink.lock().await.as_ref() {
        // A dropped receiver means no session is listening right now.
        let _ = tx.send(event);
    }
}

#[async_trait]
impl SandboxBackend for DockerBackend {
    async fn create(&self, task_label: &str) -> Result<String, SandboxError> {
        let name = format!("fleet-{}", uuid::Uuid::new_v4().simple());
        let config = self.build_container_config(task_label)?;

        debug!("Creating container: {}", name);
        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| match e {
                DockerError::DockerResponseServerError {
                    status_code: 404, ..
                } => SandboxError::transport(format!(
                    "Container image not found: {}",
                    self.config.image
                )),
                other => SandboxError::transport(other.to_string()),
            })?;

        self.docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::transport(e.to_string()))?;

        info!(event = "sandbox_created", sandbox_id = %response.id, name = %name);
        Ok(response.id)
    }

    async fn resume(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        match self.container_status(sandbox_id).await? {
            Some(ContainerStateStatusEnum::RUNNING) => Ok(()),
            Some(ContainerStateStatusEnum::PAUSED) => {
                debug!("Unpausing container {}", sandbox_id);
                self.docker
                    .unpause_container(sandbox_id)
                    .await
                    .map_err(|e| SandboxError::transport(e.to_string()))
            }
            Some(ContainerStateStatusEnum::CREATED | ContainerStateStatusEnum::EXITED) => {
                debug!("Starting stopped container {}", sandbox_id);
                self.docker
                    .start_container(sandbox_id, None::<StartContainerOptions<String>>)
                    .await
                    .map_err(|e| SandboxError::transport(e.to_string()))
            }
            other => Err(SandboxError::transport(format!(
                "Container {sandbox_id} cannot be resumed from state {other:?}"
            ))),
        }
    }

    async fn pause(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        match self.container_status(sandbox_id).await? {
            Some(ContainerStateStatusEnum::RUNNING) => {
                self.docker
                    .pause_container(sandbox_id)
                    .await
                    .map_err(|e| SandboxError::transport(e.to_string()))?;
                info!(event = "sandbox_paused", sandbox_id = %sandbox_id);
                Ok(())
            }
            Some(ContainerStateStatusEnum::PAUSED) => Ok(()),
            other => {
                debug!("Container {} not running ({:?}), nothing to pause", sandbox_id, other);
                Ok(())
            }
        }
    }

    async fn spawn_shell(
        &self,
        sandbox_id: &str,
        signature: &str,
    ) -> Result<ShellHandle, SandboxError> {
        let exec = self
            .docker
            .create_exec(
                sandbox_id,
                CreateExecOptions {
                    cmd: Some(vec![signature]),
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| not_found_or_transport(e, || SandboxError::sandbox_not_found(sandbox_id)))?;

        match self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| SandboxError::transport(e.to_string()))?
        {
            StartExecResults::Attached { output, input } => {
                let (tx, rx) = mpsc::unbounded_channel();
                let link = ShellLink {
                    stdin: Arc::new(Mutex::new(input)),
                    sink: Arc::new(Mutex::new(Some(tx))),
                };

                self.shells
                    .lock()
                    .await
                    .insert(exec.id.clone(), link.clone());
                self.spawn_pump(exec.id.clone(), output, link.sink);

                debug!("Started shell {} in {}", exec.id, sandbox_id);
                Ok(ShellHandle {
                    id: exec.id,
                    events: rx,
                })
            }
            StartExecResults::Detached => {
                Err(SandboxError::transport("Exec was detached unexpectedly"))
            }
        }
    }

    async fn attach_shell(
        &self,
        sandbox_id: &str,
        signature: &str,
    ) -> Result<Option<ShellHandle>, SandboxError> {
        let inspect = self
            .docker
            .inspect_container(sandbox_id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| not_found_or_transport(e, || SandboxError::sandbox_not_found(sandbox_id)))?;

        for exec_id in inspect.exec_ids.unwrap_or_default() {
            let Ok(details) = self.docker.inspect_exec(&exec_id).await else {
                continue;
            };

            let running = details.running.unwrap_or(false);
            let entrypoint = details
                .process_config
                .as_ref()
                .and_then(|process| process.entrypoint.as_deref());
            if !running || entrypoint != Some(signature) {
                continue;
            }

            let shells = self.shells.lock().await;
            let Some(link) = shells.get(&exec_id) else {
                debug!("Shell {} is running but has no attachment in this process", exec_id);
                continue;
            };

            let (tx, rx) = mpsc::unbounded_channel();
            *link.sink.lock().await = Some(tx);

            debug!("Re-attached to shell {} in {}", exec_id, sandbox_id);
            return Ok(Some(ShellHandle {
                id: exec_id,
                events: rx,
            }));
        }

        Ok(None)
    }

    async fn send_stdin(&self, shell_id: &str, data: &str) -> Result<(), SandboxError> {
        let stdin = self
            .shells
            .lock()
            .await
            .get(shell_id)
            .map(|link| Arc::clone(&link.stdin))
            .ok_or_else(|| SandboxError::process_not_found(shell_id))?;

        let mut writer = stdin.lock().await;
        let write = async {
            writer.write_all(data.as_bytes()).await?;
            writer.flush().await
        };

        match tokio::time::timeout(STDIN_WRITE_TIMEOUT, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                Err(SandboxError::process_not_found(shell_id))
            }
            Ok(Err(e)) => Err(SandboxError::transport(e.to_string())),
            Err(_) => Err(SandboxError::transport(format!(
                "Writing to shell {shell_id} timed out"
            ))),
        }
    }

    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<String, SandboxError> {
        let mut stream = self.docker.download_from_container(
            sandbox_id,
            Some(DownloadFromContainerOptions {
                path: path.to_string(),
            }),
        );

        let mut archive = Vec::new();
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| not_found_or_transport(e, || SandboxError::file_not_found(path)))?;
            archive.extend_from_slice(&bytes);
        }

        extract_single_file(&archive, path)
    }

    async fn write_file(
        &self,
        sandbox_id: &str,
        path: &str,
        content: &str,
    ) -> Result<(), SandboxError> {
        let (parent, file_name) = split_parent(path);

        let (exit_code, _, stderr) = self
            .exec_oneshot(sandbox_id, vec!["mkdir", "-p", "--", parent])
            .await?;
        if exit_code != 0 {
            return Err(SandboxError::transport(format!(
                "Failed to create directory {parent}: {}",
                stderr.trim()
            )));
        }

        let archive = build_single_file_archive(file_name, content)?;

        self.docker
            .upload_to_container(
                sandbox_id,
                Some(UploadToContainerOptions {
                    path: parent.to_string(),
                    ..Default::default()
                }),
                Bytes::from(archive),
            )
            .await
            .map_err(|e| not_found_or_transport(e, || SandboxError::file_not_found(parent)))?;

        debug!("Wrote {} bytes to {}:{}", content.len(), sandbox_id, path);
        Ok(())
    }

    async fn list_dir(&self, sandbox_id: &str, path: &str) -> Result<Vec<String>, SandboxError> {
        let (exit_code, stdout, stderr) = self
            .exec_oneshot(sandbox_id, vec!["ls", "-1A", "--", path])
            .await?;

        if exit_code != 0 {
            if stderr.contains("No such file or directory") {
                return Err(SandboxError::file_not_found(path));
            }
            return Err(SandboxError::transport(format!(
                "Listing {path} failed: {}",
                stderr.trim()
            )));
        }

        Ok(stdout.lines().map(str::to_string).collect())
    }
}

fn not_found_or_transport(err: DockerError, not_found: impl FnOnce() -> SandboxError) -> SandboxError {
    match err {
        DockerError::DockerResponseServerError {
            status_code: 404, ..
        } => not_found(),
        other => SandboxError::transport(other.to_string()),
    }
}

/// Splits an absolute path into its parent directory and file name.
fn split_parent(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some(("", name)) => ("/", name),
        Some((parent, name)) => (parent, name),
        None => (".", path),
    }
}

fn build_single_file_archive(file_name: &str, content: &str) -> Result<Vec<u8>, SandboxError> {
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    #[allow(clippy::cast_sign_loss)]
    header.set_mtime(chrono::Utc::now().timestamp() as u64);

    let mut builder = tar::Builder::new(Vec::new());
    builder
        .append_data(&mut header, file_name, content.as_bytes())
        .map_err(|e| SandboxError::transport(format!("Failed to build archive: {e}")))?;
    builder
        .into_inner()
        .map_err(|e| SandboxError::transport(format!("Failed to build archive: {e}")))
}

fn extract_single_file(archive: &[u8], path: &str) -> Result<String, SandboxError> {
    let mut archive = tar::Archive::new(archive);
    let entries = archive
        .entries()
        .map_err(|e| SandboxError::transport(format!("Invalid archive for {path}: {e}")))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| SandboxError::transport(format!("Invalid archive for {path}: {e}")))?;
        if entry.header().entry_type().is_dir() {
            return Err(SandboxError::transport(format!("{path} is a directory")));
        }
        if entry.header().entry_type().is_file() {
            let mut content = String::new();
            entry
                .read_to_string(&mut content)
                .map_err(|e| SandboxError::transport(format!("{path} is not valid UTF-8 text: {e}")))?;
            return Ok(content);
        }
    }

    Err(SandboxError::file_not_found(path))
}

/// Parse memory limit string (e.g., "8g", "512m") to bytes
fn parse_memory_limit(limit: &str) -> Result<i64, SandboxError> {
    let limit = limit.to_lowercase();
    let invalid = |_| SandboxError::transport(format!("Invalid memory limit: {limit}"));

    if let Some(num) = limit.strip_suffix('g') {
        let gigs: i64 = num.parse().map_err(invalid)?;
        Ok(gigs * 1024 * 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('m') {
        let megs: i64 = num.parse().map_err(invalid)?;
        Ok(megs * 1024 * 1024)
    } else {
        limit.parse().map_err(invalid)
    }
}
