//! Scripted process runner for tests
//!
//! Each spawn is answered by a handler that sees the argument list and
//! decides the exit code and output. Every invocation is recorded.

use async_trait::async_trait;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{ProcessHandle, ProcessRunner, SpawnOptions};
use crate::common::Result;

/// Scripted response to one invocation
#[derive(Debug, Clone)]
pub struct Scripted {
    pub exit_code: i32,
    pub output: String,
    /// Keep the process "running" until killed
    pub running: bool,
}

impl Scripted {
    pub fn ok(output: &str) -> Self {
        Self {
            exit_code: 0,
            output: output.to_string(),
            running: false,
        }
    }

    pub fn fail(exit_code: i32, output: &str) -> Self {
        Self {
            exit_code,
            output: output.to_string(),
            running: false,
        }
    }

    pub fn running(output: &str) -> Self {
        Self {
            exit_code: 0,
            output: output.to_string(),
            running: true,
        }
    }
}

type Handler = dyn Fn(&[String]) -> Scripted + Send + Sync;

pub struct ScriptedRunner {
    handler: Box<Handler>,
    calls: Mutex<Vec<Vec<String>>>,
    handles: Mutex<Vec<Arc<ScriptedHandle>>>,
}

impl ScriptedRunner {
    pub fn new(handler: impl Fn(&[String]) -> Scripted + Send + Sync + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Argument lists of every invocation so far
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of invocations whose joined arguments contain `needle`
    pub fn count(&self, needle: &str) -> usize {
        self.calls()
            .iter()
            .filter(|args| args.join(" ").contains(needle))
            .count()
    }

    pub fn last_handle(&self) -> Option<Arc<ScriptedHandle>> {
        self.handles.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl ProcessRunner for ScriptedRunner {
    async fn spawn(
        &self,
        _program: &Path,
        args: &[String],
        _options: &SpawnOptions,
    ) -> Result<Arc<dyn ProcessHandle>> {
        self.calls.lock().unwrap().push(args.to_vec());
        let scripted = (self.handler)(args);

        let handle = Arc::new(ScriptedHandle {
            exit: Mutex::new(if scripted.running {
                None
            } else {
                Some(scripted.exit_code)
            }),
            output: scripted.output,
        });
        self.handles.lock().unwrap().push(handle.clone());
        Ok(handle)
    }
}

pub struct ScriptedHandle {
    exit: Mutex<Option<i32>>,
    output: String,
}

impl ScriptedHandle {
    /// Make a running process exit on its own
    pub fn exit(&self, code: i32) {
        *self.exit.lock().unwrap() = Some(code);
    }
}

#[async_trait]
impl ProcessHandle for ScriptedHandle {
    fn id(&self) -> Option<u32> {
        None
    }

    fn exit_code(&self) -> Option<i32> {
        *self.exit.lock().unwrap()
    }

    fn output(&self) -> String {
        self.output.clone()
    }

    fn kill(&self) {
        let mut exit = self.exit.lock().unwrap();
        if exit.is_none() {
            *exit = Some(-1);
        }
    }

    async fn wait_for_exit(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.has_exited() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}
