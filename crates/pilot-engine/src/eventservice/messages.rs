//! The payload message socket.
//!
//! A Unix-domain server socket, by default named
//! `EventService_EventRanges_<pid>`, carries newline-delimited UTF-8 JSON
//! frames between the pilot and the payload: one complete JSON document per
//! line, LF-terminated, no embedded newlines. The receive side polls with
//! non-blocking reads and a 10 ms idle sleep so the stop flag is observed
//! promptly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use gridpilot_core::error::{ErrorCode, PilotError};

use crate::context::Flag;

const IDLE_SLEEP: Duration = Duration::from_millis(10);
const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Default socket name for this process.
pub fn socket_name(override_name: Option<&str>) -> String {
    match override_name {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => format!("EventService_EventRanges_{}", std::process::id()),
    }
}

/// A bound, not-yet-serving message socket.
pub struct MessageServer {
    path: PathBuf,
    listener: UnixListener,
}

impl MessageServer {
    /// Bind the server socket inside `dir`.
    pub fn bind(dir: &Path, name: Option<&str>) -> Result<Self, PilotError> {
        let path = dir.join(socket_name(name));
        // a stale socket from a previous payload would fail the bind
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).map_err(|err| {
            PilotError::new(ErrorCode::MessageHandlingFailure)
                .with_kwarg("reason", format!("bind {}: {err}", path.display()))
        })?;
        info!("event-range socket listening at {}", path.display());
        Ok(Self { path, listener })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serve one payload connection until `stop` is set or the peer goes
    /// away. Inbound frames go to `inbound`; frames arriving on `outbound`
    /// are written to the payload.
    pub async fn run(
        self,
        inbound: mpsc::Sender<String>,
        mut outbound: mpsc::Receiver<String>,
        stop: Flag,
    ) {
        let stream = loop {
            if stop.is_set() {
                self.cleanup();
                return;
            }
            match tokio::time::timeout(ACCEPT_POLL, self.listener.accept()).await {
                Ok(Ok((stream, _))) => break stream,
                Ok(Err(err)) => {
                    warn!("event-range socket accept failed: {err}");
                    self.cleanup();
                    return;
                }
                Err(_) => continue,
            }
        };
        debug!("payload connected to event-range socket");

        if let Err(err) = serve(stream, &inbound, &mut outbound, &stop).await {
            warn!("event-range socket loop ended: {err}");
        }
        self.cleanup();
        info!("event-range socket closed");
    }

    fn cleanup(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn serve(
    mut stream: UnixStream,
    inbound: &mpsc::Sender<String>,
    outbound: &mut mpsc::Receiver<String>,
    stop: &Flag,
) -> Result<(), PilotError> {
    let mut linebuf: Vec<u8> = Vec::new();
    let mut buf = [0u8; 4096];

    loop {
        if stop.is_set() {
            return Ok(());
        }

        // pending frames to the payload first
        while let Ok(frame) = outbound.try_recv() {
            let mut data = frame.into_bytes();
            data.push(b'\n');
            stream.write_all(&data).await.map_err(|err| {
                PilotError::new(ErrorCode::MessageHandlingFailure)
                    .with_kwarg("reason", format!("send to payload: {err}"))
            })?;
        }

        match stream.try_read(&mut buf) {
            Ok(0) => return Ok(()), // payload closed its end
            Ok(n) => {
                linebuf.extend_from_slice(&buf[..n]);
                while let Some(pos) = linebuf.iter().position(|&b| b == b'\n') {
                    let frame: Vec<u8> = linebuf.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&frame[..frame.len() - 1])
                        .trim()
                        .to_string();
                    if line.is_empty() {
                        continue;
                    }
                    if inbound.send(line).await.is_err() {
                        return Ok(()); // executor went away
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                tokio::time::sleep(IDLE_SLEEP).await;
            }
            Err(err) => {
                return Err(PilotError::new(ErrorCode::MessageHandlingFailure)
                    .with_kwarg("reason", format!("recv from payload: {err}")));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncBufReadExt, BufReader};

    use super::*;

    #[test]
    fn default_socket_name_carries_the_pid() {
        assert_eq!(
            socket_name(None),
            format!("EventService_EventRanges_{}", std::process::id())
        );
        assert_eq!(socket_name(Some("custom")), "custom");
        assert!(socket_name(Some("")).starts_with("EventService_EventRanges_"));
    }

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let dir = tempfile::tempdir().unwrap();
        let server = MessageServer::bind(dir.path(), Some("test_socket")).unwrap();
        let path = server.path().to_path_buf();

        let (inbound_tx, mut inbound_rx) = mpsc::channel(16);
        let (outbound_tx, outbound_rx) = mpsc::channel(16);
        let stop = Flag::new();
        let task = tokio::spawn(server.run(inbound_tx, outbound_rx, stop.clone()));

        let mut client = UnixStream::connect(&path).await.unwrap();
        client
            .write_all(b"{\"id\":\"1-1\",\"status\":\"finished\"}\n{\"id\":\"1-2\",\"status\":\"failed\"}\n")
            .await
            .unwrap();

        assert_eq!(
            inbound_rx.recv().await.unwrap(),
            "{\"id\":\"1-1\",\"status\":\"finished\"}"
        );
        assert_eq!(
            inbound_rx.recv().await.unwrap(),
            "{\"id\":\"1-2\",\"status\":\"failed\"}"
        );

        outbound_tx.send("No more events".to_string()).await.unwrap();
        let mut reader = BufReader::new(&mut client);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "No more events\n");

        stop.set();
        drop(client);
        task.await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn stop_before_connect_terminates_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let server = MessageServer::bind(dir.path(), Some("stopped_socket")).unwrap();
        let (inbound_tx, _inbound_rx) = mpsc::channel(1);
        let (_outbound_tx, outbound_rx) = mpsc::channel(1);
        let stop = Flag::new();
        stop.set();
        server.run(inbound_tx, outbound_rx, stop).await;
    }
}
