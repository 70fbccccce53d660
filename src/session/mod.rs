//! Sessions: several roles launched together for one test
//!
//! A [`Session`] validates its roles against the build catalog and the device
//! registry, reserves a device per role from the pool, installs every role and
//! then runs every role. Launch is all-or-nothing: if any install or launch
//! fails, whatever already runs is killed, the failing device is marked as a
//! problem and the launch is retried on a fresh set of devices.

pub mod artifacts;
pub mod instance;
pub mod role;
#[cfg(test)]
pub(crate) mod testkit;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::build::catalog::BuildQuery;
use crate::build::Build;
use crate::common::{Error, ErrorKind, Result};
use crate::context::RunContext;
use crate::device::null::NullDevice;
use crate::device::{AppInstall, Device};

pub use artifacts::{save_role_artifacts, save_session_artifacts, RoleArtifacts};
pub use instance::{RoleInstance, SessionInstance};
pub use role::{AddArgs, ConfigOption, RemoveArg, RoleModifier, SessionRole, SetArg};

/// Launch attempts before giving up on finding a working set of devices
const LAUNCH_ATTEMPTS: usize = 3;

/// Directory levels searched for builds
pub const DEFAULT_MAX_RECURSION: usize = 3;

/// Why an attempt failed, and on which device
struct LaunchFailure {
    device: String,
    error: Error,
}

/// Roles to run together, and the devices they run on
pub struct Session {
    context: Arc<RunContext>,
    project: String,
    build_root: PathBuf,
    max_recursion: usize,
    roles: Vec<SessionRole>,
    reserved: Vec<Arc<dyn Device>>,
    null_devices: Vec<Arc<dyn Device>>,
    instance: Option<Arc<SessionInstance>>,
}

impl Session {
    pub fn new(
        context: Arc<RunContext>,
        project: &str,
        build_root: &Path,
        roles: Vec<SessionRole>,
    ) -> Self {
        Self {
            context,
            project: project.to_string(),
            build_root: build_root.to_path_buf(),
            max_recursion: DEFAULT_MAX_RECURSION,
            roles,
            reserved: Vec::new(),
            null_devices: Vec::new(),
            instance: None,
        }
    }

    pub fn with_max_recursion(mut self, max_recursion: usize) -> Self {
        self.max_recursion = max_recursion;
        self
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn roles(&self) -> &[SessionRole] {
        &self.roles
    }

    /// The running session, if launched
    pub fn instance(&self) -> Option<Arc<SessionInstance>> {
        self.instance.clone()
    }

    /// Find the build for `role`, appending anything that rules it out to `issues`
    pub fn can_support_role(&self, role: &SessionRole, issues: &mut Vec<String>) -> Option<Build> {
        let mut supported = true;
        if !role.is_null() && !self.context.registry.supports(role.platform) {
            issues.push(format!("{}: no device backend for {}", role, role.platform));
            supported = false;
        }

        let query = BuildQuery {
            platform: role.platform,
            configuration: role.configuration,
            role: role.role_type,
            required_flags: role.effective_flags(),
        };
        let build = match self.context.catalog.find_build(
            &self.project,
            &self.build_root,
            &query,
            self.max_recursion,
        ) {
            Ok(build) => Some(build),
            Err(e) => {
                issues.push(format!("{}: {}", role, e));
                None
            }
        };

        if supported {
            build
        } else {
            None
        }
    }

    /// Resolve a build for every role. All problems are reported together.
    pub fn resolve_builds(&self) -> Result<Vec<Build>> {
        let mut issues = Vec::new();
        let builds: Vec<Option<Build>> = self
            .roles
            .iter()
            .map(|role| self.can_support_role(role, &mut issues))
            .collect();

        if !issues.is_empty() {
            for issue in &issues {
                tracing::error!("{}", issue);
            }
            return Err(Error::Config(format!(
                "session cannot run: {}",
                issues.join("; ")
            )));
        }
        Ok(builds.into_iter().flatten().collect())
    }

    /// Install and run every role
    ///
    /// Either every role is running when this returns `Ok`, or nothing is.
    pub async fn launch_session(&mut self) -> Result<Arc<SessionInstance>> {
        if self.instance.is_some() {
            return Err(Error::invalid_state("launch a session", "running"));
        }
        let builds = self.resolve_builds()?;
        let services = self.context.services.clone();

        let mut last_error = None;
        for attempt in 1..=LAUNCH_ATTEMPTS {
            if services.is_cancelled() {
                return Err(Error::Cancelled);
            }
            tracing::info!(
                "Launching session for {} ({} role(s), attempt {}/{})",
                self.project,
                self.roles.len(),
                attempt,
                LAUNCH_ATTEMPTS
            );

            let devices = self.reserve_devices().await?;
            match self.try_launch(&builds, &devices).await {
                Ok(instance) => {
                    let instance = Arc::new(instance);
                    self.instance = Some(instance.clone());
                    return Ok(instance);
                }
                Err(failure) => {
                    tracing::warn!("Launch failed on {}: {}", failure.device, failure.error);
                    if let Err(e) = self.release_devices().await {
                        tracing::warn!("Failed to release devices: {}", e);
                    }
                    if failure.error.kind() == ErrorKind::Configuration
                        || matches!(failure.error, Error::Cancelled)
                    {
                        return Err(failure.error);
                    }
                    self.context
                        .pool
                        .mark_problem(&failure.device, &failure.error.to_string())
                        .await;
                    last_error = Some(failure.error);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Internal("session launch never attempted".into())))
    }

    /// Shut down and launch again
    pub async fn restart_session(&mut self) -> Result<Arc<SessionInstance>> {
        if let Err(e) = self.shutdown_session().await {
            tracing::warn!("Errors while shutting down before restart: {}", e);
        }
        self.launch_session().await
    }

    /// Stop every role and give the devices back. Every step is attempted;
    /// the first error is returned.
    pub async fn shutdown_session(&mut self) -> Result<()> {
        let mut first_error = None;
        if let Some(instance) = self.instance.take() {
            if let Err(e) = instance.shutdown().await {
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = self.release_devices().await {
            first_error.get_or_insert(e);
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Save the artifacts of every running role under `output_dir`
    pub async fn save_role_artifacts(&self, output_dir: &Path) -> Result<Vec<RoleArtifacts>> {
        let instance = self
            .instance
            .as_ref()
            .ok_or_else(|| Error::invalid_state("save artifacts", "not launched"))?;
        save_session_artifacts(instance, output_dir).await
    }

    /// One device per role, in role order
    async fn reserve_devices(&mut self) -> Result<Vec<Arc<dyn Device>>> {
        let platforms: Vec<_> = self
            .roles
            .iter()
            .filter(|r| !r.is_null())
            .map(|r| r.platform)
            .collect();

        let mut pooled = if platforms.is_empty() {
            Vec::new()
        } else {
            self.context
                .pool
                .reserve(&self.context.services, &self.context.registry, &platforms)
                .await?
        };
        self.reserved = pooled.clone();
        tracing::info!(
            "Reserved device(s): {}",
            pooled.iter().map(|d| d.name()).collect::<Vec<_>>().join(", ")
        );

        let mut devices = Vec::with_capacity(self.roles.len());
        pooled.reverse();
        for role in &self.roles {
            if role.is_null() {
                let device: Arc<dyn Device> = Arc::new(NullDevice::new(
                    &format!("Null{}", role.role_type),
                    role.platform,
                ));
                device.connect().await?;
                self.null_devices.push(device.clone());
                devices.push(device);
            } else {
                let device = pooled
                    .pop()
                    .ok_or_else(|| Error::Internal("pool returned too few devices".into()))?;
                devices.push(device);
            }
        }
        Ok(devices)
    }

    async fn try_launch(
        &self,
        builds: &[Build],
        devices: &[Arc<dyn Device>],
    ) -> std::result::Result<SessionInstance, LaunchFailure> {
        let services = &self.context.services;
        let mut installs: Vec<(usize, AppInstall)> = Vec::with_capacity(self.roles.len());

        for (index, ((role, build), device)) in
            self.roles.iter().zip(builds).zip(devices).enumerate()
        {
            if services.is_cancelled() {
                return Err(LaunchFailure {
                    device: device.name().to_string(),
                    error: Error::Cancelled,
                });
            }
            let config = role.app_config(&self.project, build, &services.config.session);
            tracing::info!("Installing {} on {}: {}", role, device.name(), build.describe());
            tracing::debug!("{} command line: {}", role, config.command_line);
            match device.install_application(&config).await {
                Ok(install) => installs.push((index, install)),
                Err(error) => {
                    return Err(LaunchFailure {
                        device: device.name().to_string(),
                        error,
                    })
                }
            }
        }

        let mut running: Vec<RoleInstance> = Vec::with_capacity(installs.len());
        for (index, install) in installs {
            let role = &self.roles[index];
            let device = &devices[index];
            match device.run(install).await {
                Ok(instance) => {
                    tracing::info!("Started {} on {}", role, device.name());
                    running.push(RoleInstance {
                        role: role.clone(),
                        instance,
                    });
                }
                Err(error) => {
                    for started in &running {
                        tracing::info!("Stopping {} on {}", started.role, started.instance.device_name());
                        if let Err(e) = started.instance.kill().await {
                            tracing::warn!("Failed to stop {}: {}", started.role, e);
                        }
                    }
                    return Err(LaunchFailure {
                        device: device.name().to_string(),
                        error,
                    });
                }
            }
        }

        Ok(SessionInstance::new(running))
    }

    async fn release_devices(&mut self) -> Result<()> {
        let mut first_error = None;
        let reserved = std::mem::take(&mut self.reserved);
        if let Err(e) = self.context.pool.release(&reserved).await {
            first_error.get_or_insert(e);
        }
        for device in std::mem::take(&mut self.null_devices) {
            if let Err(e) = device.disconnect().await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
