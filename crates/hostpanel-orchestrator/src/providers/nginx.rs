//! nginx virtual hosts in the Debian `sites-available`/`sites-enabled`
//! layout.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use super::cmd::HostCommand;
use super::fsutil::{self, WriteOutcome};
use super::{ProviderError, ReverseProxy};

const SERVICE: &str = "nginx";

pub struct Nginx {
    available: PathBuf,
    enabled: PathBuf,
    timeout: Duration,
}

impl Nginx {
    pub const fn new(available: PathBuf, enabled: PathBuf, timeout: Duration) -> Self {
        Self {
            available,
            enabled,
            timeout,
        }
    }

    fn config_path(&self, name: &str) -> Result<PathBuf, ProviderError> {
        plain_file_name(name)?;
        Ok(self.available.join(name))
    }

    fn link_path(&self, site: &str) -> Result<PathBuf, ProviderError> {
        plain_file_name(site)?;
        Ok(self.enabled.join(site))
    }
}

/// Names must not escape the config directories.
fn plain_file_name(name: &str) -> Result<(), ProviderError> {
    if name.is_empty() || name.contains('/') || name.starts_with('.') {
        return Err(ProviderError::Unsupported(format!(
            "invalid site config name: {name:?}"
        )));
    }
    Ok(())
}

#[async_trait]
impl ReverseProxy for Nginx {
    async fn write_virtual_host(
        &self,
        name: &str,
        content: &str,
    ) -> Result<WriteOutcome, ProviderError> {
        fsutil::write_atomic(&self.config_path(name)?, content, 0o644).await
    }

    async fn read_virtual_host(&self, name: &str) -> Result<Option<String>, ProviderError> {
        fsutil::read_optional(&self.config_path(name)?).await
    }

    async fn remove_virtual_host(&self, name: &str) -> Result<(), ProviderError> {
        fsutil::remove_file(&self.config_path(name)?).await
    }

    async fn enable(&self, site: &str, config: &str) -> Result<(), ProviderError> {
        let target = self.config_path(config)?;
        let link = self.link_path(site)?;
        if fsutil::read_link(&link).await?.as_deref() == Some(target.as_path()) {
            return Ok(());
        }
        fsutil::symlink_replace(&target, &link).await?;
        info!(site, config, "enabled site");
        Ok(())
    }

    async fn disable(&self, site: &str) -> Result<(), ProviderError> {
        fsutil::remove_file(&self.link_path(site)?).await
    }

    async fn enabled_config(&self, site: &str) -> Result<Option<String>, ProviderError> {
        let target = fsutil::read_link(&self.link_path(site)?).await?;
        Ok(target
            .and_then(|t| t.file_name().map(|n| n.to_string_lossy().into_owned())))
    }

    async fn validate_config(&self) -> Result<(), ProviderError> {
        HostCommand::new("validating nginx configuration", "nginx")
            .arg("-t")
            .privileged()
            .timeout(self.timeout)
            .run()
            .await?;
        Ok(())
    }

    async fn reload(&self) -> Result<(), ProviderError> {
        HostCommand::new("reloading nginx", "systemctl")
            .args(["reload", SERVICE])
            .privileged()
            .timeout(self.timeout)
            .run()
            .await?;
        Ok(())
    }

    fn service(&self) -> &str {
        SERVICE
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn nginx(dir: &std::path::Path) -> Nginx {
        let available = dir.join("sites-available");
        let enabled = dir.join("sites-enabled");
        std::fs::create_dir_all(&available).unwrap();
        std::fs::create_dir_all(&enabled).unwrap();
        Nginx::new(available, enabled, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn enable_switches_between_configs() {
        let dir = tempfile::tempdir().unwrap();
        let nginx = nginx(dir.path());

        nginx.write_virtual_host("shop.conf", "live").await.unwrap();
        nginx
            .write_virtual_host("shop.conf.suspended", "blocked")
            .await
            .unwrap();

        nginx.enable("shop.conf", "shop.conf").await.unwrap();
        assert_eq!(
            nginx.enabled_config("shop.conf").await.unwrap().as_deref(),
            Some("shop.conf")
        );

        nginx.enable("shop.conf", "shop.conf.suspended").await.unwrap();
        assert_eq!(
            nginx.enabled_config("shop.conf").await.unwrap().as_deref(),
            Some("shop.conf.suspended")
        );
        let served = std::fs::read_to_string(dir.path().join("sites-enabled/shop.conf")).unwrap();
        assert_eq!(served, "blocked");

        nginx.disable("shop.conf").await.unwrap();
        assert_eq!(nginx.enabled_config("shop.conf").await.unwrap(), None);
        nginx.disable("shop.conf").await.unwrap();
    }

    #[tokio::test]
    async fn rejects_path_like_names() {
        let dir = tempfile::tempdir().unwrap();
        let nginx = nginx(dir.path());
        assert!(nginx.write_virtual_host("../x", "").await.is_err());
        assert!(nginx.enable(".hidden", "a.conf").await.is_err());
    }

    #[tokio::test]
    async fn remove_tolerates_missing_config() {
        let dir = tempfile::tempdir().unwrap();
        let nginx = nginx(dir.path());
        nginx.remove_virtual_host("gone.conf").await.unwrap();
        assert_eq!(nginx.read_virtual_host("gone.conf").await.unwrap(), None);
    }
}
