//! Run context
//!
//! Everything that is shared process-wide during a run lives here and is
//! created once at startup: the process runner, the coarse lock around
//! connection and credential changes, the gate bounding parallel device
//! commands, the adb credential cache, registries, the device pool and the
//! build catalog. [`RunContext::shutdown`] releases all of it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};

use crate::build::BuildCatalog;
use crate::common::config::Config;
use crate::common::{paths, Error, Result};
use crate::device::credentials::{AdbCredentialCache, AdbKeys};
use crate::device::ios::ConnectionRegistry;
use crate::device::{DevicePool, DeviceRegistry};
use crate::process::{run_command_with_grace, CommandOutput, LocalRunner, ProcessRunner};

/// Shared state devices use to reach the outside world
pub struct HostServices {
    pub config: Config,
    pub runner: Arc<dyn ProcessRunner>,
    /// Held around device connection and credential swaps
    pub main_lock: Mutex<()>,
    /// Held while preparing the shared iOS app cache
    pub app_cache_lock: Mutex<()>,
    /// Bounds the number of device commands in flight
    pub command_gate: Semaphore,
    pub adb_credentials: AdbCredentialCache,
    pub ios_connections: ConnectionRegistry,
    pub cache_root: PathBuf,
    cancelled: AtomicBool,
}

impl HostServices {
    pub fn new(config: Config, runner: Arc<dyn ProcessRunner>, cache_root: PathBuf) -> Result<Self> {
        let key_dir = config
            .android
            .key_dir
            .clone()
            .or_else(paths::android_key_dir)
            .unwrap_or_else(|| cache_root.join(".android"));

        let adb_credentials = AdbCredentialCache::new(
            key_dir,
            cache_root.join("AndroidADBKeys"),
            config.adb_path(),
            runner.clone(),
            Duration::from_secs(config.timeouts.adb_settle_secs),
        )?;

        Ok(Self {
            command_gate: Semaphore::new(config.executor.max_parallel_commands.max(1)),
            config,
            runner,
            main_lock: Mutex::new(()),
            app_cache_lock: Mutex::new(()),
            adb_credentials,
            ios_connections: ConnectionRegistry::default(),
            cache_root,
            cancelled: AtomicBool::new(false),
        })
    }

    /// Run a bridge tool command through the command gate
    pub async fn run_tool(
        &self,
        program: &Path,
        args: &[String],
        budget: Duration,
    ) -> Result<CommandOutput> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let _permit = self
            .command_gate
            .acquire()
            .await
            .map_err(|_| Error::Cancelled)?;
        run_command_with_grace(
            self.runner.as_ref(),
            program,
            args,
            budget,
            self.config.kill_grace(),
        )
        .await
    }

    /// Take a lease on the adb credentials, swapping keys under the coarse lock
    pub async fn acquire_adb_credentials(&self, keys: Option<&AdbKeys>) -> Result<()> {
        let _guard = self.main_lock.lock().await;
        self.adb_credentials.add_instance(keys).await
    }

    /// Release a lease taken by [`HostServices::acquire_adb_credentials`]
    pub async fn release_adb_credentials(&self) -> Result<()> {
        let _guard = self.main_lock.lock().await;
        self.adb_credentials.remove_instance().await
    }

    /// Ask everything in flight to wind down
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Everything a run needs, created at startup and shut down explicitly
pub struct RunContext {
    pub services: Arc<HostServices>,
    pub registry: DeviceRegistry,
    pub pool: DevicePool,
    pub catalog: BuildCatalog,
}

impl RunContext {
    /// Context with real processes and the default cache directory
    pub fn new(config: Config) -> Result<Self> {
        Self::with_runner(config, Arc::new(LocalRunner), paths::cache_dir())
    }

    pub fn with_runner(
        config: Config,
        runner: Arc<dyn ProcessRunner>,
        cache_root: PathBuf,
    ) -> Result<Self> {
        std::fs::create_dir_all(&cache_root)?;
        let pool = DevicePool::from_config(&config);
        let services = Arc::new(HostServices::new(config, runner, cache_root)?);

        Ok(Self {
            services,
            registry: DeviceRegistry::new(),
            pool,
            catalog: BuildCatalog::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.services.config
    }

    /// Release every device. Every device is attempted; the first error is
    /// returned.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Shutting down run context");
        self.services.cancel();
        self.pool.shutdown().await
    }
}
