//! Real processes via tokio

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{watch, Notify};

use super::{ProcessHandle, ProcessRunner, SpawnOptions};
use crate::common::{Error, Result};

/// Time allowed for the output readers to drain after exit
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Spawns real OS processes
#[derive(Debug, Default, Clone)]
pub struct LocalRunner;

#[async_trait]
impl ProcessRunner for LocalRunner {
    async fn spawn(
        &self,
        program: &Path,
        args: &[String],
        options: &SpawnOptions,
    ) -> Result<Arc<dyn ProcessHandle>> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &options.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &options.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            Error::Internal(format!("Failed to start {}: {}", program.display(), e))
        })?;

        let id = child.id();
        let output = Arc::new(Mutex::new(String::new()));

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pump(stdout, output.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pump(stderr, output.clone())));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = Arc::new(Notify::new());
        let kill_signal = kill.clone();

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_signal.notified() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            for reader in readers {
                let _ = tokio::time::timeout(DRAIN_TIMEOUT, reader).await;
            }

            let code = match status {
                Ok(status) => status.code().unwrap_or(-1),
                Err(e) => {
                    tracing::warn!("Failed to wait for process: {}", e);
                    -1
                }
            };
            let _ = exit_tx.send(Some(code));
        });

        Ok(Arc::new(LocalProcess {
            id,
            output,
            exit_rx,
            kill,
        }))
    }
}

async fn pump<R: AsyncRead + Unpin>(mut reader: R, sink: Arc<Mutex<String>>) {
    let mut buf = [0u8; 8192];
    let mut pending: Vec<u8> = Vec::new();
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                let split = pending.len() - incomplete_tail(&pending);
                append(&sink, &pending[..split]);
                pending.drain(..split);
            }
        }
    }
    append(&sink, &pending);
}

fn append(sink: &Mutex<String>, bytes: &[u8]) {
    if bytes.is_empty() {
        return;
    }
    sink.lock()
        .unwrap_or_else(|e| e.into_inner())
        .push_str(&String::from_utf8_lossy(bytes));
}

/// Length of a UTF-8 sequence cut off at the end of `bytes`
fn incomplete_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0xC0 != 0x80 {
            let width = match byte {
                0xC0..=0xDF => 2,
                0xE0..=0xEF => 3,
                0xF0..=0xF7 => 4,
                _ => 1,
            };
            return if width > back { back } else { 0 };
        }
    }
    0
}

/// Handle to a process spawned by [`LocalRunner`]
pub struct LocalProcess {
    id: Option<u32>,
    output: Arc<Mutex<String>>,
    exit_rx: watch::Receiver<Option<i32>>,
    kill: Arc<Notify>,
}

#[async_trait]
impl ProcessHandle for LocalProcess {
    fn id(&self) -> Option<u32> {
        self.id
    }

    fn exit_code(&self) -> Option<i32> {
        *self.exit_rx.borrow()
    }

    fn output(&self) -> String {
        self.output
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn kill(&self) {
        if !self.has_exited() {
            self.kill.notify_one();
        }
    }

    async fn wait_for_exit(&self, timeout: Duration) -> bool {
        let mut rx = self.exit_rx.clone();
        let exited = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|code| code.is_some())).await,
            Ok(Ok(_))
        );
        exited
    }
}
