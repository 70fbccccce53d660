//! A launched session

use std::sync::Arc;

use super::role::SessionRole;
use crate::common::Result;
use crate::device::AppInstance;

/// One role and the application running it
#[derive(Clone)]
pub struct RoleInstance {
    pub role: SessionRole,
    pub instance: Arc<dyn AppInstance>,
}

/// Every role of a session, running
pub struct SessionInstance {
    roles: Vec<RoleInstance>,
}

impl SessionInstance {
    pub fn new(roles: Vec<RoleInstance>) -> Self {
        Self { roles }
    }

    pub fn running_roles(&self) -> &[RoleInstance] {
        &self.roles
    }

    pub fn clients(&self) -> impl Iterator<Item = &RoleInstance> {
        self.roles.iter().filter(|r| r.role.role_type.is_client())
    }

    pub fn servers(&self) -> impl Iterator<Item = &RoleInstance> {
        self.roles.iter().filter(|r| r.role.role_type.is_server())
    }

    /// True while no client has exited
    pub async fn clients_running(&self) -> bool {
        all_running(self.clients()).await
    }

    /// True while no server has exited
    pub async fn server_running(&self) -> bool {
        all_running(self.servers()).await
    }

    /// True while every role is still running
    pub async fn is_running_roles(&self) -> bool {
        all_running(self.roles.iter()).await
    }

    /// Kill every role: clients, then servers, then anything else. Every kill
    /// is attempted; the first error is returned.
    pub async fn shutdown(&self) -> Result<()> {
        let mut first_error = None;

        let order = self
            .clients()
            .chain(self.servers())
            .chain(
                self.roles
                    .iter()
                    .filter(|r| !r.role.role_type.is_client() && !r.role.role_type.is_server()),
            );
        for role in order {
            if role.instance.has_exited().await {
                continue;
            }
            tracing::info!("Stopping {} on {}", role.role, role.instance.device_name());
            if let Err(e) = role.instance.kill().await {
                tracing::warn!(
                    "Failed to stop {} on {}: {}",
                    role.role,
                    role.instance.device_name(),
                    e
                );
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}

async fn all_running(roles: impl Iterator<Item = &RoleInstance>) -> bool {
    for role in roles {
        if role.instance.has_exited().await {
            return false;
        }
    }
    true
}

#[cfg(test)]
pub(crate) mod fake {
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use crate::common::{Error, Result};
    use crate::device::AppInstance;

    /// Instance whose lifetime the test controls
    pub struct FakeInstance {
        pub device: String,
        pub exited: AtomicBool,
        pub killed: AtomicBool,
        pub fail_kill: bool,
        pub output: Mutex<String>,
        pub exit_code: Mutex<Option<i32>>,
        pub saved: PathBuf,
    }

    impl FakeInstance {
        pub fn new(device: &str) -> Self {
            Self {
                device: device.to_string(),
                exited: AtomicBool::new(false),
                killed: AtomicBool::new(false),
                fail_kill: false,
                output: Mutex::new(String::new()),
                exit_code: Mutex::new(None),
                saved: PathBuf::from("/nonexistent/Saved"),
            }
        }

        pub fn exit(&self, code: i32) {
            *self.exit_code.lock().unwrap() = Some(code);
            self.exited.store(true, Ordering::SeqCst);
        }

        pub fn print(&self, text: &str) {
            self.output.lock().unwrap().push_str(text);
        }
    }

    #[async_trait]
    impl AppInstance for FakeInstance {
        fn name(&self) -> &str {
            "OrionGame"
        }

        fn device_name(&self) -> &str {
            &self.device
        }

        fn command_line(&self) -> &str {
            ""
        }

        async fn has_exited(&self) -> bool {
            self.exited.load(Ordering::SeqCst)
        }

        fn was_killed(&self) -> bool {
            self.killed.load(Ordering::SeqCst)
        }

        async fn exit_code(&self) -> Option<i32> {
            *self.exit_code.lock().unwrap()
        }

        async fn std_out(&self) -> String {
            self.output.lock().unwrap().clone()
        }

        async fn artifact_path(&self) -> PathBuf {
            self.saved.clone()
        }

        async fn kill(&self) -> Result<()> {
            if self.fail_kill {
                return Err(Error::unreachable(&self.device, "offline"));
            }
            if !self.exited.swap(true, Ordering::SeqCst) {
                self.killed.store(true, Ordering::SeqCst);
                *self.exit_code.lock().unwrap() = Some(-1);
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeInstance;
    use super::*;
    use crate::build::{Configuration, Platform, RoleType};
    use crate::common::Error;

    fn role(role_type: RoleType, instance: &Arc<FakeInstance>) -> RoleInstance {
        RoleInstance {
            role: SessionRole::new(role_type, Platform::Android, Configuration::Test),
            instance: instance.clone(),
        }
    }

    #[tokio::test]
    async fn test_clients_running_until_one_exits() {
        let a = Arc::new(FakeInstance::new("a"));
        let b = Arc::new(FakeInstance::new("b"));
        let server = Arc::new(FakeInstance::new("s"));
        let session = SessionInstance::new(vec![
            role(RoleType::Client, &a),
            role(RoleType::Client, &b),
            role(RoleType::Server, &server),
        ]);

        assert!(session.clients_running().await);
        assert!(session.is_running_roles().await);

        b.exit(0);
        assert!(!session.clients_running().await);
        assert!(session.server_running().await);
        assert!(!session.is_running_roles().await);
    }

    #[tokio::test]
    async fn test_shutdown_kills_everything_and_reports_first_error() {
        let a = Arc::new(FakeInstance::new("a"));
        let mut stuck = FakeInstance::new("stuck");
        stuck.fail_kill = true;
        let stuck = Arc::new(stuck);
        let server = Arc::new(FakeInstance::new("s"));
        let session = SessionInstance::new(vec![
            role(RoleType::Server, &server),
            role(RoleType::Client, &stuck),
            role(RoleType::Client, &a),
        ]);

        let err = session.shutdown().await.unwrap_err();
        assert!(matches!(err, Error::DeviceUnreachable { ref device, .. } if device == "stuck"));
        assert!(a.was_killed());
        assert!(server.was_killed());
    }
}
