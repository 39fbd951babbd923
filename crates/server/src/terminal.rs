//! Terminal Manager: owns per-session PTY-backed shell terminals.
//!
//! Grounded directly in `saltyskip-cthulu`'s `spawn_pty_claude` /
//! `handle_terminal`: `portable_pty::native_pty_system()`, a writer
//! taken once at spawn, a reader cloned once and drained by a
//! persistent `spawn_blocking` loop publishing into a
//! `broadcast::channel<Vec<u8>>`. Generalized from "one PTY per agent
//! session running `claude`" to "N named terminals per coordination
//! Session, running a login shell" — a client attaching late, or
//! reattaching after a disconnect, just subscribes to the same
//! broadcast channel; the shell keeps running underneath regardless of
//! whether anyone is watching.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use portable_pty::{native_pty_system, Child as PtyChild, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{RwLock, broadcast};
use uuid::Uuid;

use crate::error::{GatewayError, GatewayResult};

pub struct TerminalSummary {
    pub id: Uuid,
    pub name: String,
    pub cwd: String,
}

struct TerminalEntry {
    session_id: Uuid,
    name: String,
    cwd: String,
    master: Box<dyn MasterPty + Send>,
    writer: Arc<std::sync::Mutex<Box<dyn Write + Send>>>,
    output_tx: broadcast::Sender<Vec<u8>>,
    child: Box<dyn PtyChild + Send + Sync>,
    /// Shared with the `spawn_blocking` reader task so output alone —
    /// with no client input — still counts as activity for
    /// `sweep_idle`.
    last_activity: Arc<std::sync::Mutex<Instant>>,
}

#[derive(Default)]
pub struct TerminalManager {
    terminals: RwLock<HashMap<Uuid, TerminalEntry>>,
}

impl TerminalManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn create_terminal(
        self: &Arc<Self>,
        session_id: Uuid,
        cwd: String,
        name: Option<String>,
        cols: u16,
        rows: u16,
    ) -> GatewayResult<(Uuid, broadcast::Receiver<Vec<u8>>)> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| GatewayError::Fatal(format!("failed to open pty: {e}")))?;

        let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
        let mut cmd = CommandBuilder::new(shell);
        cmd.cwd(&cwd);

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| GatewayError::Fatal(format!("failed to spawn shell: {e}")))?;
        drop(pair.slave);

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| GatewayError::Fatal(format!("failed to take pty writer: {e}")))?;
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| GatewayError::Fatal(format!("failed to clone pty reader: {e}")))?;

        let (output_tx, output_rx) = broadcast::channel::<Vec<u8>>(256);
        let tx_for_reader = output_tx.clone();
        let last_activity = Arc::new(std::sync::Mutex::new(Instant::now()));
        let last_activity_for_reader = Arc::clone(&last_activity);

        tokio::task::spawn_blocking(move || {
            let mut reader = reader;
            let mut buf = [0u8; 4096];
            loop {
                match std::io::Read::read(&mut reader, &mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Ok(mut guard) = last_activity_for_reader.lock() {
                            *guard = Instant::now();
                        }
                        let _ = tx_for_reader.send(buf[..n].to_vec());
                    }
                    Err(_) => break,
                }
            }
        });

        let id = Uuid::new_v4();
        let entry = TerminalEntry {
            session_id,
            name: name.unwrap_or_else(|| "shell".to_string()),
            cwd,
            master: pair.master,
            writer: Arc::new(std::sync::Mutex::new(writer)),
            output_tx,
            child,
            last_activity,
        };
        self.terminals.write().await.insert(id, entry);

        Ok((id, output_rx))
    }

    pub async fn write_input(&self, id: Uuid, data: &[u8]) -> GatewayResult<()> {
        let mut terminals = self.terminals.write().await;
        let entry = terminals.get_mut(&id).ok_or(GatewayError::NotFound)?;
        if let Ok(mut guard) = entry.last_activity.lock() {
            *guard = Instant::now();
        }
        let mut writer = entry
            .writer
            .lock()
            .map_err(|_| GatewayError::Fatal("pty writer lock poisoned".to_string()))?;
        writer
            .write_all(data)
            .and_then(|_| writer.flush())
            .map_err(|e| GatewayError::Fatal(format!("pty write failed: {e}")))
    }

    pub async fn resize(&self, id: Uuid, cols: u16, rows: u16) -> GatewayResult<()> {
        let mut terminals = self.terminals.write().await;
        let entry = terminals.get_mut(&id).ok_or(GatewayError::NotFound)?;
        if let Ok(mut guard) = entry.last_activity.lock() {
            *guard = Instant::now();
        }
        entry
            .master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| GatewayError::Fatal(format!("pty resize failed: {e}")))
    }

    pub async fn close_terminal(&self, id: Uuid) -> GatewayResult<()> {
        let mut terminals = self.terminals.write().await;
        let mut entry = terminals.remove(&id).ok_or(GatewayError::NotFound)?;
        let _ = entry.child.kill();
        Ok(())
    }

    /// The session a terminal belongs to, or `None` if unknown. Used to
    /// enforce that a terminal is only observable through its owning
    /// Session (a client attached to a different Session must not be
    /// able to address it).
    pub async fn owner_of(&self, id: Uuid) -> Option<Uuid> {
        self.terminals.read().await.get(&id).map(|e| e.session_id)
    }

    pub async fn subscribe(&self, id: Uuid) -> Option<broadcast::Receiver<Vec<u8>>> {
        self.terminals
            .read()
            .await
            .get(&id)
            .map(|e| e.output_tx.subscribe())
    }

    pub async fn list_for_session(&self, session_id: Uuid) -> Vec<TerminalSummary> {
        self.terminals
            .read()
            .await
            .iter()
            .filter(|(_, e)| e.session_id == session_id)
            .map(|(id, e)| TerminalSummary {
                id: *id,
                name: e.name.clone(),
                cwd: e.cwd.clone(),
            })
            .collect()
    }

    pub async fn close_all_for_session(&self, session_id: Uuid) {
        let to_close: Vec<Uuid> = self
            .terminals
            .read()
            .await
            .iter()
            .filter(|(_, e)| e.session_id == session_id)
            .map(|(id, _)| *id)
            .collect();
        for id in to_close {
            let _ = self.close_terminal(id).await;
        }
    }

    /// Destroy terminals whose last input/resize predates `idle_for`.
    /// Returns the closed terminal ids so the caller can notify clients.
    pub async fn sweep_idle(&self, idle_for: Duration) -> Vec<Uuid> {
        let now = Instant::now();
        let expired: Vec<Uuid> = self
            .terminals
            .read()
            .await
            .iter()
            .filter(|(_, e)| {
                let last = e.last_activity.lock().map(|g| *g).unwrap_or(now);
                now.duration_since(last) >= idle_for
            })
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            let _ = self.close_terminal(*id).await;
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_terminal_spawns_a_shell_and_yields_output() {
        let manager = TerminalManager::new();
        let (id, mut rx) = manager
            .create_terminal(Uuid::new_v4(), "/tmp".to_string(), None, 80, 24)
            .await
            .expect("shell should spawn in test environment");

        manager.write_input(id, b"echo hi\n").await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        assert!(result.is_ok(), "expected some pty output before timeout");

        manager.close_terminal(id).await.unwrap();
    }

    #[tokio::test]
    async fn close_terminal_removes_it_from_session_listing() {
        let manager = TerminalManager::new();
        let session_id = Uuid::new_v4();
        let (id, _rx) = manager
            .create_terminal(session_id, "/tmp".to_string(), Some("main".to_string()), 80, 24)
            .await
            .unwrap();

        assert_eq!(manager.list_for_session(session_id).await.len(), 1);
        manager.close_terminal(id).await.unwrap();
        assert_eq!(manager.list_for_session(session_id).await.len(), 0);
    }

    #[tokio::test]
    async fn operations_on_unknown_terminal_return_not_found() {
        let manager = TerminalManager::new();
        let result = manager.write_input(Uuid::new_v4(), b"x").await;
        assert!(matches!(result, Err(GatewayError::NotFound)));
    }

    #[tokio::test]
    async fn sweep_idle_closes_terminals_past_the_threshold() {
        let manager = TerminalManager::new();
        let session_id = Uuid::new_v4();
        let (id, _rx) = manager
            .create_terminal(session_id, "/tmp".to_string(), None, 80, 24)
            .await
            .unwrap();

        let closed = manager.sweep_idle(Duration::from_millis(0)).await;
        assert_eq!(closed, vec![id]);
        assert_eq!(manager.list_for_session(session_id).await.len(), 0);
    }
}
