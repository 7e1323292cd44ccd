//! Scripted in-memory sandbox backend for tests.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;
use tokio::sync::mpsc;

use super::{SandboxBackend, SandboxError, ShellEvent, ShellHandle};

/// How the fake shell answers a command.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    /// Print to stdout, then the marker.
    Output(String),
    /// Print to stderr, then the marker on stdout.
    Stderr(String),
    /// Print to stdout with the marker split over two chunks.
    SplitMarker(String),
    /// Never print the marker.
    Hang,
    /// Terminate the shell with this exit code.
    Exit(i64),
}

struct FakeShell {
    sandbox_id: String,
    tx: mpsc::UnboundedSender<ShellEvent>,
    alive: bool,
}

#[derive(Default)]
struct FakeState {
    next_id: usize,
    sandboxes: HashMap<String, bool>,
    shells: HashMap<String, FakeShell>,
    current_shell: Option<String>,
    replies: HashMap<String, Reply>,
    commands: Vec<String>,
    markers: Vec<String>,
    created: usize,
    spawned: usize,
    pause_calls: usize,
    fail_next_send: bool,
    fail_resume: HashSet<String>,
    files: HashMap<String, String>,
}

#[derive(Default)]
pub(crate) struct FakeBackend {
    state: Mutex<FakeState>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an existing running sandbox.
    pub fn add_sandbox(&self, sandbox_id: &str) {
        self.state
            .lock()
            .unwrap()
            .sandboxes
            .insert(sandbox_id.to_string(), false);
    }

    pub fn reply(&self, command: &str, reply: Reply) {
        self.state
            .lock()
            .unwrap()
            .replies
            .insert(command.to_string(), reply);
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn markers(&self) -> Vec<String> {
        self.state.lock().unwrap().markers.clone()
    }

    pub fn created_sandboxes(&self) -> usize {
        self.state.lock().unwrap().created
    }

    pub fn spawned_shells(&self) -> usize {
        self.state.lock().unwrap().spawned
    }

    pub fn pause_calls(&self) -> usize {
        self.state.lock().unwrap().pause_calls
    }

    pub fn is_paused(&self, sandbox_id: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .sandboxes
            .get(sandbox_id)
            .copied()
            .unwrap_or(false)
    }

    /// Makes the next stdin write fail as if the process were gone.
    pub fn fail_next_send(&self) {
        self.state.lock().unwrap().fail_next_send = true;
    }

    /// Makes every resume of this sandbox fail.
    pub fn fail_resume(&self, sandbox_id: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_resume
            .insert(sandbox_id.to_string());
    }

    /// Pushes an event to the most recently attached shell.
    pub fn emit(&self, event: ShellEvent) {
        let state = self.state.lock().unwrap();
        if let Some(shell) = state.current_shell.as_ref().and_then(|id| state.shells.get(id)) {
            let _ = shell.tx.send(event);
        }
    }

    /// Terminates the most recently attached shell.
    pub fn kill_current_shell(&self, exit_code: i64) {
        let mut state = self.state.lock().unwrap();
        let Some(id) = state.current_shell.clone() else {
            return;
        };
        if let Some(shell) = state.shells.get_mut(&id) {
            shell.alive = false;
            let _ = shell.tx.send(ShellEvent::Exited(exit_code));
        }
    }

    pub fn set_file(&self, path: &str, content: &str) {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(path.to_string(), content.to_string());
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.state.lock().unwrap().files.get(path).cloned()
    }
}

fn split_payload(data: &str) -> Option<(&str, &str)> {
    let (command, rest) = data.rsplit_once("; echo '")?;
    let marker = rest.strip_suffix("'\n")?;
    Some((command, marker))
}

#[async_trait]
impl SandboxBackend for FakeBackend {
    async fn create(&self, _task_label: &str) -> Result<String, SandboxError> {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        state.created += 1;
        let id = format!("sbx-{}", state.next_id);
        state.sandboxes.insert(id.clone(), false);
        Ok(id)
    }

    async fn resume(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_resume.contains(sandbox_id) {
            return Err(SandboxError::transport("resume refused"));
        }
        match state.sandboxes.get_mut(sandbox_id) {
            Some(paused) => {
                *paused = false;
                Ok(())
            }
            None => Err(SandboxError::sandbox_not_found(sandbox_id)),
        }
    }

    async fn pause(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        let mut state = self.state.lock().unwrap();
        state.pause_calls += 1;
        match state.sandboxes.get_mut(sandbox_id) {
            Some(paused) => {
                *paused = true;
                Ok(())
            }
            None => Err(SandboxError::sandbox_not_found(sandbox_id)),
        }
    }

    async fn spawn_shell(
        &self,
        sandbox_id: &str,
        _signature: &str,
    ) -> Result<ShellHandle, SandboxError> {
        let mut state = self.state.lock().unwrap();
        if !state.sandboxes.contains_key(sandbox_id) {
            return Err(SandboxError::sandbox_not_found(sandbox_id));
        }
        state.next_id += 1;
        state.spawned += 1;
        let id = format!("shell-{}", state.next_id);
        let (tx, rx) = mpsc::unbounded_channel();
        state.shells.insert(
            id.clone(),
            FakeShell {
                sandbox_id: sandbox_id.to_string(),
                tx,
                alive: true,
            },
        );
        state.current_shell = Some(id.clone());
        Ok(ShellHandle { id, events: rx })
    }

    async fn attach_shell(
        &self,
        sandbox_id: &str,
        _signature: &str,
    ) -> Result<Option<ShellHandle>, SandboxError> {
        let mut state = self.state.lock().unwrap();
        let live = state
            .shells
            .iter()
            .find(|(_, shell)| shell.alive && shell.sandbox_id == sandbox_id)
            .map(|(id, _)| id.clone());
        let Some(id) = live else {
            return Ok(None);
        };
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(shell) = state.shells.get_mut(&id) {
            shell.tx = tx;
        }
        state.current_shell = Some(id.clone());
        Ok(Some(ShellHandle { id, events: rx }))
    }

    async fn send_stdin(&self, shell_id: &str, data: &str) -> Result<(), SandboxError> {
        let mut state = self.state.lock().unwrap();

        if std::mem::take(&mut state.fail_next_send) {
            if let Some(shell) = state.shells.get_mut(shell_id) {
                shell.alive = false;
            }
            return Err(SandboxError::process_not_found(shell_id));
        }

        let alive = state.shells.get(shell_id).is_some_and(|s| s.alive);
        if !alive {
            return Err(SandboxError::process_not_found(shell_id));
        }

        if data == "exit\n" {
            if let Some(shell) = state.shells.get_mut(shell_id) {
                shell.alive = false;
                let _ = shell.tx.send(ShellEvent::Exited(0));
            }
            return Ok(());
        }

        let Some((command, marker)) = split_payload(data) else {
            return Ok(());
        };
        state.commands.push(command.to_string());
        state.markers.push(marker.to_string());

        let reply = state
            .replies
            .get(command)
            .cloned()
            .unwrap_or(Reply::Output(String::new()));

        let Some(shell) = state.shells.get_mut(shell_id) else {
            return Ok(());
        };
        let marker_line = format!("{marker}\n");
        match reply {
            Reply::Output(text) => {
                let _ = shell.tx.send(ShellEvent::Stdout(format!("{text}\n")));
                let _ = shell.tx.send(ShellEvent::Stdout(marker_line));
            }
            Reply::Stderr(text) => {
                let _ = shell.tx.send(ShellEvent::Stderr(format!("{text}\n")));
                let _ = shell.tx.send(ShellEvent::Stdout(marker_line));
            }
            Reply::SplitMarker(text) => {
                let (head, tail) = marker_line.split_at(marker.len() / 2);
                let _ = shell.tx.send(ShellEvent::Stdout(format!("{text}\n{head}")));
                let _ = shell.tx.send(ShellEvent::Stdout(tail.to_string()));
            }
            Reply::Hang => {}
            Reply::Exit(code) => {
                shell.alive = false;
                let _ = shell.tx.send(ShellEvent::Exited(code));
            }
        }
        Ok(())
    }

    async fn read_file(&self, _sandbox_id: &str, path: &str) -> Result<String, SandboxError> {
        self.state
            .lock()
            .unwrap()
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| SandboxError::file_not_found(path))
    }

    async fn write_file(
        &self,
        _sandbox_id: &str,
        path: &str,
        content: &str,
    ) -> Result<(), SandboxError> {
        self.set_file(path, content);
        Ok(())
    }

    async fn list_dir(&self, _sandbox_id: &str, path: &str) -> Result<Vec<String>, SandboxError> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let entries: BTreeSet<String> = self
            .state
            .lock()
            .unwrap()
            .files
            .keys()
            .filter_map(|file| file.strip_prefix(&prefix))
            .filter_map(|rest| rest.split('/').next())
            .map(str::to_string)
            .collect();

        if entries.is_empty() {
            return Err(SandboxError::file_not_found(path));
        }
        Ok(entries.into_iter().collect())
    }
}
