//! Let's Encrypt certificates through certbot.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::cmd::HostCommand;
use super::{CertificateAuthority, CertificatePaths, ProviderError};

/// Files smaller than this are placeholders, not PEM material.
const MIN_PEM_BYTES: u64 = 10;

pub struct Certbot {
    letsencrypt_root: PathBuf,
    include_www: bool,
    timeout: Duration,
}

impl Certbot {
    pub const fn new(letsencrypt_root: PathBuf, include_www: bool, timeout: Duration) -> Self {
        Self {
            letsencrypt_root,
            include_www,
            timeout,
        }
    }

    fn live_dir(&self, domain: &str) -> PathBuf {
        self.letsencrypt_root.join("live").join(domain)
    }

    /// The domain already serves a certificate, possibly from elsewhere.
    async fn served_remotely(&self, domain: &str) -> bool {
        let target = format!("{domain}:443");
        let out = HostCommand::new(format!("probing TLS on {domain}"), "openssl")
            .args(["s_client", "-connect", target.as_str(), "-servername", domain])
            .timeout(Duration::from_secs(15))
            .output()
            .await;
        out.is_ok_and(|o| o.stdout.contains("BEGIN CERTIFICATE"))
    }

    fn issue_args(&self, domain: &str, contact_email: Option<&str>) -> Vec<String> {
        let mut args: Vec<String> = ["certonly", "--nginx", "-d", domain]
            .map(String::from)
            .to_vec();
        if self.include_www {
            args.extend(["-d".to_string(), format!("www.{domain}")]);
        }
        args.extend(["--non-interactive", "--agree-tos"].map(String::from));
        match contact_email {
            Some(email) => args.extend(["--email".to_string(), email.to_string()]),
            None => args.push("--register-unsafely-without-email".to_string()),
        }
        args
    }
}

async fn non_trivial(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|m| m.len() > MIN_PEM_BYTES)
}

#[async_trait]
impl CertificateAuthority for Certbot {
    async fn exists(&self, domain: &str) -> bool {
        if self.local_certificate(domain).await.is_some() {
            return true;
        }
        let served = self.served_remotely(domain).await;
        debug!(domain, served, "no local certificate, probed remote");
        served
    }

    async fn local_certificate(&self, domain: &str) -> Option<CertificatePaths> {
        let dir = self.live_dir(domain);
        let paths = CertificatePaths {
            fullchain: dir.join("fullchain.pem"),
            private_key: dir.join("privkey.pem"),
        };
        (non_trivial(&paths.fullchain).await && non_trivial(&paths.private_key).await)
            .then_some(paths)
    }

    async fn issue(&self, domain: &str, contact_email: Option<&str>) -> Result<(), ProviderError> {
        HostCommand::new(format!("requesting certificate for {domain}"), "certbot")
            .args(self.issue_args(domain, contact_email))
            .privileged()
            .timeout(self.timeout)
            .run()
            .await?;
        if self.local_certificate(domain).await.is_none() {
            return Err(ProviderError::Check(format!(
                "certbot reported success but no certificate exists under {}",
                self.live_dir(domain).display()
            )));
        }
        info!(domain, "certificate issued");
        Ok(())
    }

    async fn remove(&self, domain: &str) -> Result<(), ProviderError> {
        if tokio::fs::symlink_metadata(self.live_dir(domain)).await.is_err() {
            debug!(domain, "no certificate to remove");
            return Ok(());
        }
        HostCommand::new(format!("deleting certificate for {domain}"), "certbot")
            .args(["delete", "--cert-name", domain, "--non-interactive"])
            .privileged()
            .timeout(self.timeout)
            .run()
            .await?;
        Ok(())
    }
}
