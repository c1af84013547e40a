//! All-or-nothing file operations for host config directories.
//!
//! Writes go to a temp file in the target directory and are renamed into
//! place, so a reader sees either the old content or the new, never a
//! prefix. When the process lacks permission for the directory the same
//! rename is performed through `sudo`.

use std::io::{ErrorKind, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info};

use super::ProviderError;
use super::cmd::HostCommand;

const PRIVILEGED_TIMEOUT: Duration = Duration::from_secs(30);

/// Whether a write changed anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Unchanged,
    Written,
}

impl WriteOutcome {
    pub const fn changed(self) -> bool {
        matches!(self, Self::Written)
    }
}

/// Read a file, treating absence as `None`.
pub async fn read_optional(path: &Path) -> Result<Option<String>, ProviderError> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            let out = HostCommand::new(format!("reading {}", path.display()), "cat")
                .arg(path.to_string_lossy())
                .privileged()
                .timeout(PRIVILEGED_TIMEOUT)
                .output()
                .await?;
            Ok(out.success().then_some(out.stdout))
        }
        Err(e) => Err(ProviderError::io(path, e)),
    }
}

/// Atomically replace `path` with `content` at `mode`.
///
/// Identical existing content is left untouched.
pub async fn write_atomic(
    path: &Path,
    content: &str,
    mode: u32,
) -> Result<WriteOutcome, ProviderError> {
    if read_optional(path).await?.as_deref() == Some(content) {
        debug!(path = %path.display(), "content unchanged, skipping write");
        return Ok(WriteOutcome::Unchanged);
    }

    let dir = path
        .parent()
        .ok_or_else(|| ProviderError::Unsupported(format!("{} has no parent", path.display())))?
        .to_path_buf();
    let target = path.to_path_buf();
    let bytes = content.as_bytes().to_vec();

    let direct = tokio::task::spawn_blocking(move || persist_in(&dir, &target, &bytes, mode))
        .await
        .map_err(|e| ProviderError::io(path, std::io::Error::other(e)))?;

    match direct {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            write_privileged(path, content, mode).await?;
        }
        Err(e) => return Err(ProviderError::io(path, e)),
    }

    info!(path = %path.display(), "wrote config");
    Ok(WriteOutcome::Written)
}

fn persist_in(dir: &Path, target: &Path, bytes: &[u8], mode: u32) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".hostpanel-")
        .tempfile_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.as_file()
        .set_permissions(std::fs::Permissions::from_mode(mode))?;
    tmp.persist(target).map_err(|e| e.error)?;
    Ok(())
}

/// Stage in a private temp dir, `install` next to the target, then `mv`
/// over it: the final step is still a same-directory rename.
async fn write_privileged(path: &Path, content: &str, mode: u32) -> Result<(), ProviderError> {
    let staged = tokio::task::spawn_blocking({
        let bytes = content.as_bytes().to_vec();
        move || -> std::io::Result<tempfile::TempPath> {
            let mut tmp = tempfile::NamedTempFile::new()?;
            tmp.write_all(&bytes)?;
            tmp.as_file().sync_all()?;
            Ok(tmp.into_temp_path())
        }
    })
    .await
    .map_err(|e| ProviderError::io(path, std::io::Error::other(e)))?
    .map_err(|e| ProviderError::io(path, e))?;

    let sibling = sibling_temp(path);
    HostCommand::new(format!("staging {}", path.display()), "install")
        .args(["-D".to_string(), "-m".to_string(), format!("{mode:o}")])
        .arg(staged.to_string_lossy())
        .arg(sibling.to_string_lossy())
        .privileged()
        .timeout(PRIVILEGED_TIMEOUT)
        .run()
        .await?;
    HostCommand::new(format!("installing {}", path.display()), "mv")
        .arg("-f")
        .arg(sibling.to_string_lossy())
        .arg(path.to_string_lossy())
        .privileged()
        .timeout(PRIVILEGED_TIMEOUT)
        .run()
        .await?;
    Ok(())
}

fn sibling_temp(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map_or_else(String::new, |n| n.to_string_lossy().into_owned());
    path.with_file_name(format!(".{name}.hostpanel-tmp"))
}

/// Remove a file; absence is success.
pub async fn remove_file(path: &Path) -> Result<(), ProviderError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            info!(path = %path.display(), "removed file");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            HostCommand::new(format!("removing {}", path.display()), "rm")
                .arg("-f")
                .arg(path.to_string_lossy())
                .privileged()
                .timeout(PRIVILEGED_TIMEOUT)
                .run()
                .await?;
            Ok(())
        }
        Err(e) => Err(ProviderError::io(path, e)),
    }
}

/// Point `link` at `target`, replacing any existing link in one rename.
pub async fn symlink_replace(target: &Path, link: &Path) -> Result<(), ProviderError> {
    let tmp = sibling_temp(link);
    let direct = tokio::task::spawn_blocking({
        let (target, link, tmp) = (target.to_path_buf(), link.to_path_buf(), tmp.clone());
        move || -> std::io::Result<()> {
            let _ = std::fs::remove_file(&tmp);
            std::os::unix::fs::symlink(&target, &tmp)?;
            std::fs::rename(&tmp, &link)
        }
    })
    .await
    .map_err(|e| ProviderError::io(link, std::io::Error::other(e)))?;

    match direct {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            HostCommand::new(format!("linking {}", link.display()), "ln")
                .arg("-sfn")
                .arg(target.to_string_lossy())
                .arg(link.to_string_lossy())
                .privileged()
                .timeout(PRIVILEGED_TIMEOUT)
                .run()
                .await?;
            Ok(())
        }
        Err(e) => Err(ProviderError::io(link, e)),
    }
}

/// Target of a symlink, or `None` when `link` is absent or not a link.
pub async fn read_link(link: &Path) -> Result<Option<PathBuf>, ProviderError> {
    match tokio::fs::read_link(link).await {
        Ok(target) => Ok(Some(target)),
        Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::InvalidInput) => Ok(None),
        Err(e) => Err(ProviderError::io(link, e)),
    }
}
