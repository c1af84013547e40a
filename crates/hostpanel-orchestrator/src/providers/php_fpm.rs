//! php-fpm pools under `<php_root>/<version>/fpm/pool.d`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info};

use super::fsutil::{self, WriteOutcome};
use super::{ProviderError, RuntimePool};
use crate::naming::pool_config_path;
use crate::runtime::PhpVersion;

pub struct PhpFpm {
    php_root: PathBuf,
}

impl PhpFpm {
    pub const fn new(php_root: PathBuf) -> Self {
        Self { php_root }
    }

    /// Versions with an fpm pool directory, newest first.
    async fn pool_versions(&self) -> Result<Vec<PhpVersion>, ProviderError> {
        let mut entries = match tokio::fs::read_dir(&self.php_root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ProviderError::io(&self.php_root, e)),
        };

        let mut versions = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ProviderError::io(&self.php_root, e))?
        {
            let Some(version) = entry
                .file_name()
                .to_str()
                .and_then(|n| n.parse::<PhpVersion>().ok())
            else {
                continue;
            };
            if tokio::fs::metadata(entry.path().join("fpm").join("pool.d"))
                .await
                .is_ok_and(|m| m.is_dir())
            {
                versions.push(version);
            }
        }
        versions.sort_unstable_by(|a, b| b.cmp(a));
        debug!(?versions, "found php-fpm versions");
        Ok(versions)
    }

    fn config_for(&self, version: PhpVersion, domain: &str) -> PathBuf {
        pool_config_path(&self.php_root, version, domain)
    }
}

#[async_trait]
impl RuntimePool for PhpFpm {
    async fn installed_versions(&self) -> Result<Vec<PhpVersion>, ProviderError> {
        self.pool_versions().await
    }

    async fn write_pool_config(
        &self,
        version: PhpVersion,
        domain: &str,
        content: &str,
    ) -> Result<WriteOutcome, ProviderError> {
        for other in self.pool_versions().await? {
            if other != version {
                let stale = self.config_for(other, domain);
                if fsutil::read_optional(&stale).await?.is_some() {
                    info!(%other, domain, "removing pool config left by another PHP version");
                    fsutil::remove_file(&stale).await?;
                }
            }
        }
        fsutil::write_atomic(&self.config_for(version, domain), content, 0o644).await
    }

    async fn pool_version(&self, domain: &str) -> Result<Option<PhpVersion>, ProviderError> {
        for version in self.pool_versions().await? {
            if fsutil::read_optional(&self.config_for(version, domain))
                .await?
                .is_some()
            {
                return Ok(Some(version));
            }
        }
        Ok(None)
    }

    async fn remove_pool_configs(&self, domain: &str) -> Result<Vec<PhpVersion>, ProviderError> {
        let mut touched = Vec::new();
        for version in self.pool_versions().await? {
            let path = self.config_for(version, domain);
            if fsutil::read_optional(&path).await?.is_some() {
                fsutil::remove_file(&path).await?;
                touched.push(version);
            }
        }
        Ok(touched)
    }

    async fn socket_ready(&self, socket: &Path) -> bool {
        tokio::fs::symlink_metadata(socket).await.is_ok()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn v(s: &str) -> PhpVersion {
        s.parse().unwrap()
    }

    fn host_with(dir: &Path, versions: &[&str]) -> PhpFpm {
        for version in versions {
            std::fs::create_dir_all(dir.join(version).join("fpm").join("pool.d")).unwrap();
        }
        // cli-only installs have no pool directory
        std::fs::create_dir_all(dir.join("7.3").join("cli")).unwrap();
        PhpFpm::new(dir.to_path_buf())
    }

    #[tokio::test]
    async fn lists_only_versions_with_pools() {
        let dir = tempfile::tempdir().unwrap();
        let fpm = host_with(dir.path(), &["8.1", "8.3"]);
        assert_eq!(fpm.installed_versions().await.unwrap(), [v("8.3"), v("8.1")]);
    }

    #[tokio::test]
    async fn version_switch_moves_the_pool() {
        let dir = tempfile::tempdir().unwrap();
        let fpm = host_with(dir.path(), &["8.1", "8.3"]);

        fpm.write_pool_config(v("8.1"), "blog.example.org", "[old]\n")
            .await
            .unwrap();
        assert_eq!(
            fpm.pool_version("blog.example.org").await.unwrap(),
            Some(v("8.1"))
        );

        let outcome = fpm
            .write_pool_config(v("8.3"), "blog.example.org", "[new]\n")
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Written);
        assert_eq!(
            fpm.pool_version("blog.example.org").await.unwrap(),
            Some(v("8.3"))
        );
        assert!(!pool_config_path(dir.path(), v("8.1"), "blog.example.org").exists());

        assert_eq!(
            fpm.remove_pool_configs("blog.example.org").await.unwrap(),
            [v("8.3")]
        );
        assert_eq!(fpm.pool_version("blog.example.org").await.unwrap(), None);
    }

    #[tokio::test]
    async fn missing_php_root_means_no_versions() {
        let dir = tempfile::tempdir().unwrap();
        let fpm = PhpFpm::new(dir.path().join("absent"));
        assert!(fpm.installed_versions().await.unwrap().is_empty());
        assert!(!fpm.socket_ready(&dir.path().join("x.sock")).await);
    }
}
