//! Network bring-up for newly attached interfaces

use std::path::PathBuf;
use tokio::process::Command;
use tracing::{info, warn};

use crate::command::CommandError;
use crate::config::NetStartConfig;

const IFNAME_PLACEHOLDER: &str = "{ifname}";

/// Starts DHCP on an interface through the configured rc script
#[derive(Debug, Clone)]
pub struct NetStart {
    command: PathBuf,
    args: Vec<String>,
}

impl Default for NetStart {
    fn default() -> Self {
        Self::from_config(&NetStartConfig::default())
    }
}

impl NetStart {
    pub fn from_config(config: &NetStartConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
        }
    }

    fn command(&self, ifname: &str) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.args(self.args.iter().map(|a| a.replace(IFNAME_PLACEHOLDER, ifname)))
            .env(format!("ifconfig_{ifname}"), "DHCP up");
        cmd
    }

    pub async fn start(&self, ifname: &str) -> Result<(), CommandError> {
        info!(ifname, "Bringing up interface");
        let command = format!("{} {}", self.command.display(), self.args.join(" "));

        let result = match self.command(ifname).output().await {
            Ok(output) if output.status.success() => Ok(()),
            Ok(output) => Err(CommandError::Failed {
                command,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
            Err(source) => Err(CommandError::Spawn { command, source }),
        };

        match &result {
            Ok(()) => info!(ifname, "Interface started"),
            Err(e) => warn!(ifname, error = %e, "Network bring-up failed"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_capture::LogCapture;
    use std::ffi::OsStr;

    #[test]
    fn test_default_command_line() {
        let cmd = NetStart::default().command("ue0");
        let std_cmd = cmd.as_std();
        assert_eq!(std_cmd.get_program(), OsStr::new("/etc/rc.d/dhclient"));
        let args: Vec<&OsStr> = std_cmd.get_args().collect();
        assert_eq!(args, vec![OsStr::new("quietstart"), OsStr::new("ue0")]);
        let env: Vec<_> = std_cmd.get_envs().collect();
        assert_eq!(
            env,
            vec![(OsStr::new("ifconfig_ue0"), Some(OsStr::new("DHCP up")))]
        );
    }

    #[tokio::test]
    async fn test_start_reports_exit_status() {
        let ok = NetStart::from_config(&NetStartConfig {
            command: PathBuf::from("true"),
            args: vec![IFNAME_PLACEHOLDER.to_string()],
        });
        assert!(ok.start("em0").await.is_ok());

        let failing = NetStart::from_config(&NetStartConfig {
            command: PathBuf::from("false"),
            args: Vec::new(),
        });
        assert!(matches!(
            failing.start("em0").await,
            Err(CommandError::Failed { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_program_is_reported() {
        let logs = LogCapture::default();
        let _guard = logs.install();

        let missing = NetStart::from_config(&NetStartConfig {
            command: PathBuf::from("/nonexistent/dhclient"),
            args: vec![IFNAME_PLACEHOLDER.to_string()],
        });
        assert!(matches!(
            missing.start("ue0").await,
            Err(CommandError::Spawn { .. })
        ));

        let warnings = logs.lines_at("WARN");
        assert_eq!(warnings.len(), 1, "{:?}", logs.contents());
        assert!(warnings[0].contains("ue0"));
        assert!(warnings[0].contains("/nonexistent/dhclient"));
    }
}
