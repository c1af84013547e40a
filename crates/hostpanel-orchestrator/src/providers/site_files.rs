//! Project trees on the host and the PHP tooling run inside them.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::cmd::{CommandOutput, HostCommand};
use super::fsutil;
use super::{ComposerMode, PermissionSpec, ProviderError, SiteFiles, ToolInvocation, Toolchain};

pub struct HostFiles {
    timeout: Duration,
}

impl HostFiles {
    pub const fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn command(&self, description: String, program: &str) -> HostCommand {
        HostCommand::new(description, program)
            .privileged()
            .timeout(self.timeout)
    }

    /// `find <root> -type <kind> -exec chmod <mode> {} +`
    async fn chmod_all(&self, root: &Path, kind: &str, mode: &str) -> Result<(), ProviderError> {
        self.command(
            format!("setting {kind} modes to {mode} under {}", root.display()),
            "find",
        )
        .arg(root.to_string_lossy())
        .args(["-type", kind, "-exec", "chmod", mode, "{}", "+"])
        .run()
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SiteFiles for HostFiles {
    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::symlink_metadata(path).await.is_ok()
    }

    async fn read_to_string(&self, path: &Path) -> Result<Option<String>, ProviderError> {
        fsutil::read_optional(path).await
    }

    async fn extract_archive(&self, archive: &Path, dest: &Path) -> Result<(), ProviderError> {
        self.command(format!("creating {}", dest.display()), "mkdir")
            .arg("-p")
            .arg(dest.to_string_lossy())
            .run()
            .await?;
        self.command(
            format!("extracting {} into {}", archive.display(), dest.display()),
            "unzip",
        )
        .args(["-o", "-q"])
        .arg(archive.to_string_lossy())
        .arg("-d")
        .arg(dest.to_string_lossy())
        .run()
        .await?;
        Ok(())
    }

    async fn apply_permissions(&self, spec: &PermissionSpec) -> Result<(), ProviderError> {
        let root = spec.root.to_string_lossy().into_owned();
        let owner = format!("{0}:{0}", spec.owner);

        self.command(format!("assigning {root} to {}", spec.owner), "chown")
            .args(["-R", owner.as_str(), root.as_str()])
            .run()
            .await?;
        self.chmod_all(&spec.root, "d", "755").await?;
        self.chmod_all(&spec.root, "f", "644").await?;

        for dir in &spec.writable {
            let path = spec.root.join(dir);
            if !self.exists(&path).await {
                debug!(path = %path.display(), "writable dir absent, skipping");
                continue;
            }
            self.command(format!("making {} writable", path.display()), "chmod")
                .args(["-R", "775"])
                .arg(path.to_string_lossy())
                .run()
                .await?;
        }

        self.command(
            format!("adding {} to group {}", spec.web_group, spec.owner),
            "usermod",
        )
        .args(["-aG", spec.owner.as_str(), spec.web_group.as_str()])
        .run()
        .await?;
        info!(root, owner = %spec.owner, "permissions applied");
        Ok(())
    }

    async fn remove_tree(&self, path: &Path) -> Result<(), ProviderError> {
        if !self.exists(path).await {
            return Ok(());
        }
        self.command(format!("removing {}", path.display()), "rm")
            .arg("-rf")
            .arg(path.to_string_lossy())
            .run()
            .await?;
        Ok(())
    }
}

/// composer and artisan, run as the site owner under the project's PHP.
pub struct PhpToolchain {
    timeout: Duration,
}

impl PhpToolchain {
    pub const fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn php(&self, description: String, invocation: &ToolInvocation) -> HostCommand {
        HostCommand::new(description, invocation.php.binary())
            .current_dir(&invocation.root)
            .run_as(invocation.owner.clone())
            .timeout(self.timeout)
    }
}

fn composer_args(mode: ComposerMode) -> [&'static str; 5] {
    let verb = match mode {
        ComposerMode::Install => "install",
        ComposerMode::Update => "update",
    };
    [
        "/usr/bin/composer",
        verb,
        "--no-dev",
        "--optimize-autoloader",
        "--no-interaction",
    ]
}

#[async_trait]
impl Toolchain for PhpToolchain {
    async fn composer(
        &self,
        invocation: &ToolInvocation,
        mode: ComposerMode,
    ) -> Result<CommandOutput, ProviderError> {
        let home = invocation.root.join(".composer");
        self.php(
            format!("resolving dependencies in {}", invocation.root.display()),
            invocation,
        )
        .args(composer_args(mode))
        .env("COMPOSER_HOME", home.to_string_lossy())
        .run()
        .await
    }

    async fn artisan(
        &self,
        invocation: &ToolInvocation,
        args: &[String],
    ) -> Result<CommandOutput, ProviderError> {
        self.php(format!("artisan {}", args.join(" ")), invocation)
            .arg("artisan")
            .args(args.iter().cloned())
            .run()
            .await
    }
}
