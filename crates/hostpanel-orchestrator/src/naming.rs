//! Input validation and name-derived host paths.
//!
//! Every host artifact of a site lives at a path computed from its domain,
//! so re-deploys and teardown find them without extra bookkeeping.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use hostpanel_core::config::PathsConfig;
use regex::Regex;

use crate::error::OrchestratorError;
use crate::runtime::PhpVersion;
use crate::storage::Framework;

static LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$").expect("static regex is valid")
});

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex is valid"));

/// Validate and normalise a domain name (lowercased, no trailing dot).
pub fn normalize_domain(domain: &str) -> Result<String, OrchestratorError> {
    let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();
    if domain.is_empty() {
        return Err(OrchestratorError::Validation(
            "domain cannot be empty".into(),
        ));
    }
    if domain.len() > 253 {
        return Err(OrchestratorError::Validation(format!(
            "domain is longer than 253 characters: {domain}"
        )));
    }
    if !domain.contains('.') {
        return Err(OrchestratorError::Validation(format!(
            "domain must contain at least one dot: {domain}"
        )));
    }
    if let Some(label) = domain.split('.').find(|label| !LABEL.is_match(label)) {
        return Err(OrchestratorError::Validation(format!(
            "invalid domain label {label:?} in {domain}"
        )));
    }
    Ok(domain)
}

/// Validate a database or user name before it reaches an engine.
pub fn validate_identifier(kind: &str, name: &str, max_len: usize) -> Result<(), OrchestratorError> {
    if name.is_empty() {
        return Err(OrchestratorError::Validation(format!(
            "{kind} cannot be empty"
        )));
    }
    if name.len() > max_len {
        return Err(OrchestratorError::Validation(format!(
            "{kind} is longer than {max_len} characters: {name}"
        )));
    }
    if !IDENTIFIER.is_match(name) {
        return Err(OrchestratorError::Validation(format!(
            "{kind} may only contain letters, digits and underscores and must not start with a digit: {name}"
        )));
    }
    Ok(())
}

/// Project name for a domain: `shop.example.com` becomes `shop_example_com`.
///
/// Deterministic, and a fixed point: deriving from an already-derived name
/// returns it unchanged.
pub fn project_name(domain: &str) -> String {
    domain
        .trim()
        .trim_matches('.')
        .to_ascii_lowercase()
        .replace('.', "_")
}

/// Paths of every host artifact belonging to one site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteLayout {
    pub domain: String,
    pub project_name: String,
    pub framework: Framework,
    pub root: PathBuf,
    pub socket: PathBuf,
    php_root: PathBuf,
}

impl SiteLayout {
    pub fn new(paths: &PathsConfig, domain: &str, framework: Framework) -> Self {
        let project_name = project_name(domain);
        Self {
            domain: domain.to_string(),
            root: paths.sites_root.join(framework.as_str()).join(&project_name),
            socket: paths.socket_dir.join(format!("{project_name}.sock")),
            php_root: paths.php_root.clone(),
            project_name,
            framework,
        }
    }

    /// Virtual-host config name under `sites-available`.
    pub fn vhost_name(&self) -> String {
        format!("{}.conf", self.project_name)
    }

    /// Config name of the static page served while suspended.
    pub fn suspended_vhost_name(&self) -> String {
        format!("{}.conf.suspended", self.project_name)
    }

    /// Pool config location for a given runtime version.
    pub fn pool_config(&self, version: PhpVersion) -> PathBuf {
        pool_config_path(&self.php_root, version, &self.domain)
    }

    /// Composer manifest inside the project root.
    pub fn manifest(&self) -> PathBuf {
        self.root.join("composer.json")
    }

    /// Document root for the web server.
    pub fn document_root(&self, has_public_dir: bool) -> PathBuf {
        if has_public_dir {
            self.root.join("public")
        } else {
            self.root.clone()
        }
    }
}

/// `{php_root}/{version}/fpm/pool.d/{domain}.conf`
pub fn pool_config_path(php_root: &Path, version: PhpVersion, domain: &str) -> PathBuf {
    php_root
        .join(version.to_string())
        .join("fpm")
        .join("pool.d")
        .join(format!("{domain}.conf"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn project_name_is_deterministic_and_idempotent() {
        let first = project_name("shop.example.com");
        assert_eq!(first, "shop_example_com");
        assert_eq!(project_name("shop.example.com"), first);
        assert_eq!(project_name(&first), first);
        assert_eq!(project_name(".Shop.Example.com."), "shop_example_com");
    }

    #[test]
    fn layout_paths_derive_from_domain_only() {
        let paths = PathsConfig::default();
        let a = SiteLayout::new(&paths, "shop.example.com", Framework::Wordpress);
        let b = SiteLayout::new(&paths, "shop.example.com", Framework::Wordpress);
        assert_eq!(a, b);

        assert_eq!(
            a.root,
            PathBuf::from("/srv/hostpanel/sites/wordpress/shop_example_com")
        );
        assert_eq!(a.socket, PathBuf::from("/run/php/shop_example_com.sock"));
        assert_eq!(a.vhost_name(), "shop_example_com.conf");
        assert_eq!(a.suspended_vhost_name(), "shop_example_com.conf.suspended");
        assert_eq!(
            a.pool_config("8.2".parse().unwrap()),
            PathBuf::from("/etc/php/8.2/fpm/pool.d/shop.example.com.conf")
        );
    }

    #[test]
    fn document_root_prefers_public() {
        let layout = SiteLayout::new(&PathsConfig::default(), "app.example.com", Framework::Laravel);
        assert!(layout.document_root(true).ends_with("app_example_com/public"));
        assert!(layout.document_root(false).ends_with("app_example_com"));
    }

    #[test]
    fn domain_validation() {
        assert_eq!(normalize_domain(" Shop.Example.COM. ").unwrap(), "shop.example.com");
        assert!(normalize_domain("").is_err());
        assert!(normalize_domain("localhost").is_err());
        assert!(normalize_domain("-bad.example.com").is_err());
        assert!(normalize_domain("bad-.example.com").is_err());
        assert!(normalize_domain("a..example.com").is_err());
        assert!(normalize_domain("shop.example.com/../etc").is_err());
        assert!(normalize_domain("xn--bcher-kva.example").is_ok());
    }

    #[test]
    fn identifier_validation() {
        assert!(validate_identifier("database name", "shop_db", 64).is_ok());
        assert!(validate_identifier("database name", "", 64).is_err());
        assert!(validate_identifier("database name", "1db", 64).is_err());
        assert!(validate_identifier("database name", "shop-db", 64).is_err());
        assert!(validate_identifier("database name", "x'; DROP", 64).is_err());
        assert!(validate_identifier("username", &"u".repeat(33), 32).is_err());
    }
}
