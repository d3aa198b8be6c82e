//! Unix-socket control plane: newline-delimited JSON, one request per
//! line, served to same-uid peers only.
//!
//! Each connection gets its own task so a checkpoint parked on a human
//! approval never blocks other layers from submitting events.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Notify;
use tracing::{debug, warn};

use agentwarden_core::ipc::{WardenRequest, WardenResponse};

use crate::engine::Engine;

/// Accepts connections until a `Shutdown` request (or the external
/// shutdown notify) fires. The socket file is created 0600.
pub async fn serve(socket_path: &Path, engine: Arc<Engine>, shutdown: Arc<Notify>) -> Result<()> {
    if let Some(parent) = socket_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create socket dir {}", parent.display()))?;
    }
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .with_context(|| format!("remove stale socket {}", socket_path.display()))?;
    }

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("bind socket {}", socket_path.display()))?;
    fs::set_permissions(socket_path, fs::Permissions::from_mode(0o600))
        .with_context(|| format!("set socket permissions {}", socket_path.display()))?;

    loop {
        let stream = tokio::select! {
            accepted = listener.accept() => accepted?.0,
            _ = shutdown.notified() => break,
        };
        if let Err(err) = check_peer_uid(&stream) {
            warn!(err = %err, "rejected connection");
            continue;
        }
        let engine = Arc::clone(&engine);
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, engine, shutdown).await {
                debug!(err = %err, "connection ended with error");
            }
        });
    }
    Ok(())
}

/// Reads requests line by line until the peer hangs up. The stream stays
/// open across requests, so an interception layer can register and then
/// keep submitting over one connection.
async fn handle_connection(
    stream: UnixStream,
    engine: Arc<Engine>,
    shutdown: Arc<Notify>,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(());
        }
        if line.trim().is_empty() {
            continue;
        }
        let (response, stop) = match serde_json::from_str::<WardenRequest>(&line) {
            Ok(request) => {
                let stop = matches!(request, WardenRequest::Shutdown);
                (engine.handle(request).await, stop)
            }
            Err(err) => (
                WardenResponse::Error(agentwarden_core::ipc::ErrorPayload {
                    code: agentwarden_core::ipc::ErrorCode::Internal,
                    message: format!("malformed request: {err}"),
                }),
                false,
            ),
        };

        let mut payload = serde_json::to_string(&response).context("serialize response")?;
        payload.push('\n');
        write_half.write_all(payload.as_bytes()).await?;
        write_half.flush().await?;

        if stop {
            shutdown.notify_waiters();
            return Ok(());
        }
    }
}

/// Only the uid that started the daemon may talk to it; the socket mode
/// alone does not survive a permissive umask on every filesystem.
fn check_peer_uid(stream: &UnixStream) -> Result<()> {
    let fd = stream.as_raw_fd();
    let mut cred: libc::ucred = libc::ucred {
        pid: 0,
        uid: 0,
        gid: 0,
    };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut libc::ucred as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(anyhow::anyhow!("failed to read peer credentials"));
    }
    let current = unsafe { libc::geteuid() };
    if cred.uid != current {
        return Err(anyhow::anyhow!("unauthorized peer uid {}", cred.uid));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentwarden_core::config::PolicyFile;
    use agentwarden_core::ids::SessionId;
    use agentwarden_core::ipc::{send_request, SubmitPayload};
    use agentwarden_core::types::{Event, EventPayload, Outcome};
    use tempfile::TempDir;

    async fn serve_fixture(toml: &str) -> (TempDir, std::path::PathBuf, Arc<Notify>) {
        let dir = TempDir::new().unwrap();
        let policy_path = dir.path().join("policy.toml");
        std::fs::write(&policy_path, toml).unwrap();
        let policy = PolicyFile::load(&policy_path).unwrap();
        let engine = Engine::start(
            policy,
            policy_path,
            &dir.path().join("audit"),
            &dir.path().join("quarantine"),
        )
        .await
        .unwrap();
        let socket_path = dir.path().join("warden.sock");
        let shutdown = Arc::new(Notify::new());
        let serve_socket = socket_path.clone();
        let serve_shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move { serve(&serve_socket, engine, serve_shutdown).await });
        // Give the listener a moment to bind.
        for _ in 0..100 {
            if socket_path.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        (dir, socket_path, shutdown)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn submit_over_the_socket_returns_a_decision() {
        let (_dir, socket_path, shutdown) = serve_fixture(
            r#"
            [[command_rules]]
            name = "block-sudo"
            commands = ["sudo"]
            decision = "deny"
            "#,
        )
        .await;

        let event = Event::new(
            SessionId::new(),
            EventPayload::Command {
                program: "sudo".to_string(),
                args: vec!["id".to_string()],
            },
        );
        let request = WardenRequest::Submit(SubmitPayload { event });
        let socket = socket_path.clone();
        let response = tokio::task::spawn_blocking(move || send_request(&socket, &request))
            .await
            .unwrap()
            .unwrap();
        match response {
            WardenResponse::Decided(payload) => {
                assert!(matches!(payload.decision.outcome, Outcome::Deny));
            }
            other => panic!("unexpected response: {other:?}"),
        }
        shutdown.notify_waiters();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ping_and_shutdown_round_trip() {
        let (_dir, socket_path, _shutdown) = serve_fixture("").await;

        let socket = socket_path.clone();
        let response = tokio::task::spawn_blocking(move || send_request(&socket, &WardenRequest::Ping))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(response, WardenResponse::Pong));

        let socket = socket_path.clone();
        let response =
            tokio::task::spawn_blocking(move || send_request(&socket, &WardenRequest::Shutdown))
                .await
                .unwrap()
                .unwrap();
        assert!(matches!(response, WardenResponse::Ack));
    }
}
