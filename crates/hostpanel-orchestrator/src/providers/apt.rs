//! `apt`/`dpkg` package manager.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::cmd::HostCommand;
use super::{PackageManager, ProviderError};

/// Phrases apt and dpkg print when another process holds their lock.
const LOCK_MARKERS: &[&str] = &[
    "Could not get lock",
    "Unable to acquire the dpkg frontend lock",
    "Unable to lock the administration directory",
    "dpkg was interrupted",
    "is another process using it",
];

pub struct Apt {
    timeout: Duration,
}

impl Apt {
    pub const fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn install(&self, packages: &[String]) -> Result<(), ProviderError> {
        let result = HostCommand::new(
            format!("installing {}", packages.join(", ")),
            "apt-get",
        )
        .args(["install", "-y", "-q", "--no-install-recommends"])
        .args(packages.iter().cloned())
        .env("DEBIAN_FRONTEND", "noninteractive")
        .privileged()
        .timeout(self.timeout)
        .run()
        .await;
        classify_lock(result.map(|_| ()))
    }

    async fn update_index(&self) -> Result<(), ProviderError> {
        let result = HostCommand::new("updating package index", "apt-get")
            .args(["update", "-q"])
            .env("DEBIAN_FRONTEND", "noninteractive")
            .privileged()
            .timeout(self.timeout)
            .run()
            .await;
        classify_lock(result.map(|_| ()))
    }
}

/// Turn a lock-held failure into the transient error kind.
fn classify_lock(result: Result<(), ProviderError>) -> Result<(), ProviderError> {
    match result {
        Err(ProviderError::CommandFailed { diagnostics, .. })
            if LOCK_MARKERS.iter().any(|m| diagnostics.contains(m)) =>
        {
            Err(ProviderError::LockContention(diagnostics))
        }
        other => other,
    }
}

/// `dpkg-query` prints `install ok installed` for installed packages.
fn is_installed(status: &str) -> bool {
    status.trim().ends_with("ok installed")
}

#[async_trait]
impl PackageManager for Apt {
    async fn missing(&self, packages: &[String]) -> Result<Vec<String>, ProviderError> {
        let mut missing = Vec::new();
        for package in packages {
            let out = HostCommand::new(format!("checking {package}"), "dpkg-query")
                .args(["-W", "-f=${Status}", package.as_str()])
                .timeout(Duration::from_secs(30))
                .output()
                .await?;
            if !(out.success() && is_installed(&out.stdout)) {
                missing.push(package.clone());
            }
        }
        debug!(?missing, "package check complete");
        Ok(missing)
    }

    async fn ensure_installed(&self, packages: &[String]) -> Result<(), ProviderError> {
        let missing = self.missing(packages).await?;
        if missing.is_empty() {
            info!("all {} packages already installed", packages.len());
            return Ok(());
        }

        // A stale index is the usual reason a fresh PHP package is unknown,
        // so refresh once before giving up.
        match self.install(&missing).await {
            Err(ProviderError::CommandFailed { diagnostics, .. })
                if diagnostics.contains("Unable to locate package") =>
            {
                self.update_index().await?;
                self.install(&missing).await
            }
            other => other,
        }
    }
}
