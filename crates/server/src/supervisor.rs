//! Agent Process Supervisor.
//!
//! Spawns the configured agent executable as the session's owning Unix
//! user, speaks newline-delimited JSON over its stdin/stdout, and
//! restarts it on an unexpected exit with capped exponential backoff,
//! collapsed into one task since this crate owns a `Child` handle
//! directly instead of adopting orphans across a server restart.
//!
//! IMPORTANT: stdout is read by a dedicated task for as long as the
//! child lives. A piped stdout that nobody drains fills its kernel
//! buffer and wedges the agent.

use std::os::unix::process::CommandExt;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use gateway_protocol::{
    AgentStdinControl, AgentStdinUser, AgentWireEvent, ControlResponsePayload, GatewayConfig,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use crate::auth::Identity;
use crate::error::{GatewayError, GatewayResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Spawning,
    Idle,
    Processing,
    Interrupting,
    Exited,
    Dead,
}

#[derive(Debug)]
pub struct AgentEvent {
    pub session_id: Uuid,
    pub payload: AgentEventPayload,
}

#[derive(Debug)]
pub enum AgentEventPayload {
    Wire(AgentWireEvent),
    /// The agent exited cleanly (or its restart budget was exhausted)
    /// and will not be respawned.
    Gone,
}

enum StdinJob {
    User(String),
    Control(AgentStdinControl),
}

pub struct AgentSupervisor {
    session_id: Uuid,
    stdin_tx: mpsc::UnboundedSender<StdinJob>,
    state: Arc<RwLock<AgentState>>,
    restart_counter: Arc<RestartCounter>,
    task: tokio::task::JoinHandle<()>,
}

impl AgentSupervisor {
    pub fn spawn(
        session_id: Uuid,
        identity: Identity,
        working_directory: String,
        agent_session_id: Option<String>,
        config: GatewayConfig,
        events_tx: mpsc::UnboundedSender<AgentEvent>,
    ) -> Self {
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel::<StdinJob>();
        let state = Arc::new(RwLock::new(AgentState::Spawning));
        let restart_counter = Arc::new(RestartCounter::default());

        let task = tokio::spawn(run_supervision_loop(
            session_id,
            identity,
            working_directory,
            agent_session_id,
            config,
            state.clone(),
            restart_counter.clone(),
            stdin_rx,
            events_tx,
        ));

        Self {
            session_id,
            stdin_tx,
            state,
            restart_counter,
            task,
        }
    }

    pub async fn state(&self) -> AgentState {
        *self.state.read().await
    }

    /// Number of times this session's agent process has been restarted
    /// after an unexpected exit.
    pub fn restart_count(&self) -> u32 {
        self.restart_counter.get()
    }

    pub fn send_user_message(&self, content: String) -> GatewayResult<()> {
        self.stdin_tx
            .send(StdinJob::User(content))
            .map_err(|_| GatewayError::AgentCrash("agent stdin closed".to_string()))
    }

    pub fn send_control_response(
        &self,
        request_id: String,
        response: ControlResponsePayload,
    ) -> GatewayResult<()> {
        self.stdin_tx
            .send(StdinJob::Control(AgentStdinControl::ControlResponse {
                request_id,
                response,
            }))
            .map_err(|_| GatewayError::AgentCrash("agent stdin closed".to_string()))
    }

    pub fn interrupt(&self) -> GatewayResult<()> {
        self.stdin_tx
            .send(StdinJob::Control(AgentStdinControl::Interrupt))
            .map_err(|_| GatewayError::AgentCrash("agent stdin closed".to_string()))
    }

    /// Stop the supervision loop and let the child's `kill_on_drop` take
    /// the process down. Does not wait for exit.
    pub fn shutdown(self) {
        self.task.abort();
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_supervision_loop(
    session_id: Uuid,
    identity: Identity,
    working_directory: String,
    mut agent_session_id: Option<String>,
    config: GatewayConfig,
    state: Arc<RwLock<AgentState>>,
    restart_counter: Arc<RestartCounter>,
    mut stdin_rx: mpsc::UnboundedReceiver<StdinJob>,
    events_tx: mpsc::UnboundedSender<AgentEvent>,
) {
    loop {
        *state.write().await = AgentState::Spawning;

        let mut child = match spawn_child(
            &identity,
            &working_directory,
            &config.agent.command,
            agent_session_id.as_deref(),
        ) {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(%session_id, error = %e, "failed to spawn agent process");
                let _ = events_tx.send(AgentEvent {
                    session_id,
                    payload: AgentEventPayload::Gone,
                });
                *state.write().await = AgentState::Dead;
                return;
            }
        };

        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
        let reader_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line_tx.send(line).is_err() {
                    break;
                }
            }
        });
        let stderr_task = tokio::spawn(drain_stderr(session_id, stderr));

        *state.write().await = AgentState::Idle;
        tracing::info!(%session_id, pid = child.id().unwrap_or(0), restart_count = restart_counter.get(), "agent process running");

        let mut stdin = stdin;
        let exit_status = loop {
            tokio::select! {
                biased;

                line = line_rx.recv() => {
                    match line {
                        Some(line) => {
                            match serde_json::from_str::<AgentWireEvent>(&line) {
                                Ok(event) => {
                                    if let AgentWireEvent::System { session_id: Some(ref sid), .. } = event {
                                        agent_session_id = Some(sid.clone());
                                    }
                                    let is_result = matches!(event, AgentWireEvent::Result { .. });
                                    if events_tx.send(AgentEvent { session_id, payload: AgentEventPayload::Wire(event) }).is_err() {
                                        break child.wait().await;
                                    }
                                    *state.write().await = if is_result { AgentState::Idle } else { AgentState::Processing };
                                }
                                Err(e) => {
                                    tracing::warn!(%session_id, error = %e, line, "unparseable agent stdout line");
                                }
                            }
                        }
                        None => {
                            // stdout closed; the child is on its way out.
                            break child.wait().await;
                        }
                    }
                }

                job = stdin_rx.recv() => {
                    match job {
                        Some(StdinJob::User(content)) => {
                            *state.write().await = AgentState::Processing;
                            let sid = agent_session_id.clone().unwrap_or_default();
                            let payload = AgentStdinUser::new(&sid, &content);
                            if write_json_line(&mut stdin, &payload).await.is_err() {
                                break child.wait().await;
                            }
                        }
                        Some(StdinJob::Control(AgentStdinControl::Interrupt)) => {
                            *state.write().await = AgentState::Interrupting;
                            if write_json_line(&mut stdin, &AgentStdinControl::Interrupt).await.is_err() {
                                break child.wait().await;
                            }
                        }
                        Some(StdinJob::Control(inner @ AgentStdinControl::ControlResponse { .. })) => {
                            if write_json_line(&mut stdin, &inner).await.is_err() {
                                break child.wait().await;
                            }
                        }
                        None => {
                            // Supervisor dropped; stop the child and return.
                            drop(stdin);
                            let _ = child.kill().await;
                            let _ = child.wait().await;
                            reader_task.abort();
                            stderr_task.abort();
                            *state.write().await = AgentState::Exited;
                            return;
                        }
                    }
                }
            }
        };

        reader_task.abort();
        stderr_task.abort();

        let clean_exit = matches!(&exit_status, Ok(status) if status.success());
        if clean_exit {
            tracing::info!(%session_id, "agent exited cleanly");
            let _ = events_tx.send(AgentEvent {
                session_id,
                payload: AgentEventPayload::Gone,
            });
            *state.write().await = AgentState::Exited;
            return;
        }

        tracing::error!(%session_id, ?exit_status, "agent process exited unexpectedly");
        let restart_count = restart_counter.increment();
        if restart_count > config.agent.max_restarts {
            tracing::error!(%session_id, restart_count, "agent restart limit reached, giving up");
            let _ = events_tx.send(AgentEvent {
                session_id,
                payload: AgentEventPayload::Gone,
            });
            *state.write().await = AgentState::Dead;
            return;
        }

        let delay_secs = 1u64 << restart_count.min(6); // 2, 4, 8, ... capped
        tracing::warn!(%session_id, restart_count, delay_secs, "restarting agent after backoff");
        tokio::time::sleep(std::time::Duration::from_secs(delay_secs)).await;
    }
}

async fn drain_stderr(session_id: Uuid, stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(%session_id, agent_stderr = %line);
    }
}

async fn write_json_line<T: serde::Serialize>(
    stdin: &mut tokio::process::ChildStdin,
    value: &T,
) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(value).expect("agent stdin payloads always serialize");
    line.push(b'\n');
    stdin.write_all(&line).await?;
    stdin.flush().await
}

fn spawn_child(
    identity: &Identity,
    working_directory: &str,
    command: &str,
    resume_agent_session_id: Option<&str>,
) -> GatewayResult<Child> {
    let mut cmd = Command::new(command);
    cmd.current_dir(working_directory);
    cmd.env("HOME", &identity.home);
    cmd.env("USER", &identity.username);
    cmd.env("LOGNAME", &identity.username);
    if let Some(id) = resume_agent_session_id {
        cmd.arg("--resume").arg(id);
    }

    let uid = identity.uid;
    let gid = identity.gid;
    let username_c = std::ffi::CString::new(identity.username.as_str())
        .unwrap_or_else(|_| std::ffi::CString::new("nobody").unwrap());

    // SAFETY: pre_exec runs post-fork, pre-exec, in the child only.
    // initgroups/setgid/setuid drop the process to the authenticated
    // user before the agent binary ever runs.
    unsafe {
        cmd.pre_exec(move || {
            if libc::initgroups(username_c.as_ptr(), gid) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::setgid(gid) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::setuid(uid) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    cmd.spawn()
        .map_err(|e| GatewayError::AgentSpawnFailure(e.to_string()))
}

/// Per-session restart counter, shared between `AgentSupervisor` and its
/// supervision loop so `restart_count()` can be read without a lock.
#[derive(Debug, Default)]
pub struct RestartCounter(AtomicU32);

impl RestartCounter {
    pub fn increment(&self) -> u32 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_counter_increments_monotonically() {
        let counter = RestartCounter::default();
        assert_eq!(counter.increment(), 1);
        assert_eq!(counter.increment(), 2);
        assert_eq!(counter.get(), 2);
    }

    #[tokio::test]
    async fn agent_state_defaults_to_spawning_before_child_starts() {
        let state = Arc::new(RwLock::new(AgentState::Spawning));
        assert_eq!(*state.read().await, AgentState::Spawning);
    }
}
