//! systemd service control.

use std::time::Duration;

use async_trait::async_trait;

use super::cmd::HostCommand;
use super::{ProcessSupervisor, ProviderError};

pub struct Systemd {
    timeout: Duration,
}

impl Systemd {
    pub const fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn systemctl(&self, verb: &str, service: &str) -> Result<(), ProviderError> {
        HostCommand::new(format!("{verb}ing {service}"), "systemctl")
            .args([verb, service])
            .privileged()
            .timeout(self.timeout)
            .run()
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ProcessSupervisor for Systemd {
    async fn restart(&self, service: &str) -> Result<(), ProviderError> {
        self.systemctl("restart", service).await
    }

    async fn is_active(&self, service: &str) -> bool {
        HostCommand::new(format!("checking {service}"), "systemctl")
            .args(["is-active", "--quiet", service])
            .timeout(Duration::from_secs(10))
            .succeeds()
            .await
    }
}
