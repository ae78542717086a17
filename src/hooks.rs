//! Policy hooks
//!
//! A [`PolicyHook`] is consulted at fixed points while devices are processed.
//! Every method has a no-op default, so running without a hook is the
//! [`NoopHook`] and nothing is ever vetoed.

use async_trait::async_trait;
use driverd_types::DeviceRecord;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::HookConfig;

/// Environment variable carrying the device as JSON
pub const DEVICE_ENV: &str = "DRIVERD_DEVICE";

/// Environment variable carrying the module name
pub const KMOD_ENV: &str = "DRIVERD_KMOD";

#[async_trait]
pub trait PolicyHook: Send + Sync {
    /// Called once at startup
    async fn init(&self) {}

    /// Called for every newly discovered device before resolution
    async fn on_add_device(&self, _device: &DeviceRecord) {}

    /// Veto point: returning false skips loading `kmod` for `device`
    async fn affirm(&self, _device: &DeviceRecord, _kmod: &str) -> bool {
        true
    }

    /// Called after a load was requested
    async fn on_load_kmod(&self, _device: &DeviceRecord, _kmod: &str) {}

    /// Called once per device after all candidates were handled
    async fn on_finished(&self, _device: &DeviceRecord) {}
}

/// Hook that does nothing and vetoes nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHook;

impl PolicyHook for NoopHook {}

/// Hook backed by external executables.
///
/// Each configured program is run with the device serialized to JSON in
/// `DRIVERD_DEVICE` and, where applicable, the module in `DRIVERD_KMOD`.
/// `affirm` vetoes only on a non-zero exit; a program that cannot be run is
/// logged and treated as affirming.
#[derive(Debug, Clone, Default)]
pub struct CommandHook {
    config: HookConfig,
}

impl CommandHook {
    pub fn new(config: HookConfig) -> Self {
        Self { config }
    }

    fn command(program: &Path, device: Option<&DeviceRecord>, kmod: Option<&str>) -> Command {
        let mut cmd = Command::new(program);
        if let Some(device) = device {
            match serde_json::to_string(device) {
                Ok(json) => {
                    cmd.env(DEVICE_ENV, json);
                }
                Err(e) => warn!(error = %e, "Failed to serialize device"),
            }
        }
        if let Some(kmod) = kmod {
            cmd.env(KMOD_ENV, kmod);
        }
        cmd
    }

    /// Run `program`; `None` when it could not be started.
    async fn run(
        &self,
        name: &str,
        program: &Path,
        device: Option<&DeviceRecord>,
        kmod: Option<&str>,
    ) -> Option<bool> {
        match Self::command(program, device, kmod).status().await {
            Ok(status) => {
                debug!(hook = name, program = %program.display(), %status, "Hook returned");
                Some(status.success())
            }
            Err(e) => {
                warn!(hook = name, program = %program.display(), error = %e, "Failed to run hook");
                None
            }
        }
    }
}

#[async_trait]
impl PolicyHook for CommandHook {
    async fn init(&self) {
        if let Some(program) = &self.config.init {
            self.run("init", program, None, None).await;
        }
    }

    async fn on_add_device(&self, device: &DeviceRecord) {
        if let Some(program) = &self.config.on_add_device {
            self.run("on_add_device", program, Some(device), None).await;
        }
    }

    async fn affirm(&self, device: &DeviceRecord, kmod: &str) -> bool {
        let Some(program) = &self.config.affirm else {
            return true;
        };
        self.run("affirm", program, Some(device), Some(kmod))
            .await
            .unwrap_or(true)
    }

    async fn on_load_kmod(&self, device: &DeviceRecord, kmod: &str) {
        if let Some(program) = &self.config.on_load_kmod {
            self.run("on_load_kmod", program, Some(device), Some(kmod))
                .await;
        }
    }

    async fn on_finished(&self, device: &DeviceRecord) {
        if let Some(program) = &self.config.on_finished {
            self.run("on_finished", program, Some(device), None).await;
        }
    }
}

/// Hook that records every call (for testing)
#[cfg(test)]
#[derive(Default)]
pub struct RecordingHook {
    calls: std::sync::Mutex<Vec<String>>,
    veto: Vec<String>,
}

#[cfg(test)]
impl RecordingHook {
    pub fn vetoing(kmod: &str) -> Self {
        Self {
            veto: vec![kmod.to_string()],
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[cfg(test)]
#[async_trait]
impl PolicyHook for RecordingHook {
    async fn init(&self) {
        self.record("init".to_string());
    }

    async fn on_add_device(&self, device: &DeviceRecord) {
        self.record(format!("on_add_device {:04x}:{:04x}", device.vendor, device.device));
    }

    async fn affirm(&self, _device: &DeviceRecord, kmod: &str) -> bool {
        self.record(format!("affirm {kmod}"));
        !self.veto.iter().any(|v| v == kmod)
    }

    async fn on_load_kmod(&self, _device: &DeviceRecord, kmod: &str) {
        self.record(format!("on_load_kmod {kmod}"));
    }

    async fn on_finished(&self, device: &DeviceRecord) {
        self.record(format!("on_finished {:04x}:{:04x}", device.vendor, device.device));
    }
}
