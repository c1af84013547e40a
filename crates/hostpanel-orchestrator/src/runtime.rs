//! PHP runtime version selection and OS package sets.

use std::fmt;
use std::str::FromStr;

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::storage::Framework;

/// A `major.minor` PHP release, as used in package and service names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PhpVersion {
    pub major: u8,
    pub minor: u8,
}

impl PhpVersion {
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// `php8.2-fpm`
    pub fn fpm_service(self) -> String {
        format!("php{self}-fpm")
    }

    /// `php8.2`
    pub fn binary(self) -> String {
        format!("php{self}")
    }
}

/// Releases the planner knows how to install, newest first.
pub const CANDIDATES: [PhpVersion; 6] = [
    PhpVersion::new(8, 4),
    PhpVersion::new(8, 3),
    PhpVersion::new(8, 2),
    PhpVersion::new(8, 1),
    PhpVersion::new(8, 0),
    PhpVersion::new(7, 4),
];

impl fmt::Display for PhpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for PhpVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = s
            .trim()
            .split_once('.')
            .ok_or_else(|| format!("invalid PHP version {s:?}: expected MAJOR.MINOR"))?;
        let major = major
            .parse()
            .map_err(|_| format!("invalid PHP major version in {s:?}"))?;
        let minor = minor
            .parse()
            .map_err(|_| format!("invalid PHP minor version in {s:?}"))?;
        Ok(Self { major, minor })
    }
}

impl TryFrom<String> for PhpVersion {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PhpVersion> for String {
    fn from(value: PhpVersion) -> Self {
        value.to_string()
    }
}

/// Fallbacks applied when the manifest does not decide.
#[derive(Debug, Clone, Copy)]
pub struct VersionPolicy {
    pub default: PhpVersion,
    pub minimum: PhpVersion,
}

/// Where the chosen version came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionSource {
    Manifest,
    Installed,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionChoice {
    pub version: PhpVersion,
    pub source: VersionSource,
    /// The detected version was below the policy minimum and got raised.
    pub raised: bool,
}

/// Pick the runtime version for a project.
///
/// A `require.php` constraint in the composer manifest wins: the newest
/// installed release satisfying it, else the newest known candidate that
/// does. Without a usable constraint the newest installed release is used,
/// then the policy default. The result is never below the policy minimum.
pub fn select_version(
    manifest: Option<&str>,
    installed: &[PhpVersion],
    policy: VersionPolicy,
) -> VersionChoice {
    let (version, source) = manifest
        .and_then(manifest_constraint)
        .and_then(|constraint| {
            let picked = pick_for_constraint(&constraint, installed);
            if picked.is_none() {
                warn!(%constraint, "no known PHP release satisfies the manifest constraint");
            }
            picked
        })
        .map(|v| (v, VersionSource::Manifest))
        .or_else(|| installed.iter().max().map(|v| (*v, VersionSource::Installed)))
        .unwrap_or((policy.default, VersionSource::Default));

    if version < policy.minimum {
        warn!(
            detected = %version,
            minimum = %policy.minimum,
            "detected PHP version is below the supported minimum, raising it"
        );
        return VersionChoice {
            version: policy.minimum,
            source,
            raised: true,
        };
    }

    debug!(%version, ?source, "selected PHP version");
    VersionChoice {
        version,
        source,
        raised: false,
    }
}

fn manifest_constraint(manifest: &str) -> Option<String> {
    let value: serde_json::Value = match serde_json::from_str(manifest) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "composer.json is not valid JSON, ignoring it");
            return None;
        }
    };
    value
        .get("require")?
        .get("php")?
        .as_str()
        .map(str::to_string)
}

fn pick_for_constraint(constraint: &str, installed: &[PhpVersion]) -> Option<PhpVersion> {
    let alternatives = parse_constraint(constraint)?;
    let matches = |v: &PhpVersion| {
        // Probe both ends of the minor series so `>=8.1.3` and `<=8.1.0`
        // both accept 8.1.
        [0, 99].into_iter().any(|patch| {
            let probe = Version::new(u64::from(v.major), u64::from(v.minor), patch);
            alternatives.iter().any(|req| req.matches(&probe))
        })
    };

    installed
        .iter()
        .copied()
        .filter(matches)
        .max()
        .or_else(|| CANDIDATES.iter().copied().find(matches))
}

/// Translate a composer constraint into semver requirements.
///
/// `|`/`||` separate alternatives; whitespace inside an alternative means AND.
fn parse_constraint(constraint: &str) -> Option<Vec<VersionReq>> {
    let mut reqs = Vec::new();
    for alternative in constraint.split('|').map(str::trim).filter(|a| !a.is_empty()) {
        let mut parts: Vec<String> = Vec::new();
        let mut pending_op = String::new();
        for token in alternative.split_whitespace() {
            if token.chars().all(|c| matches!(c, '<' | '>' | '=' | '~' | '^')) {
                pending_op.push_str(token);
                continue;
            }
            parts.push(format!("{pending_op}{}", token.trim_start_matches('v')));
            pending_op.clear();
        }
        match VersionReq::parse(&parts.join(", ")) {
            Ok(req) => reqs.push(req),
            Err(e) => {
                warn!(%constraint, error = %e, "unparseable PHP constraint");
                return None;
            }
        }
    }
    (!reqs.is_empty()).then_some(reqs)
}

/// OS packages a site needs for the given runtime.
pub fn runtime_packages(version: PhpVersion, framework: Framework, has_manifest: bool) -> Vec<String> {
    let mut packages: Vec<String> = [
        "fpm", "cli", "common", "mysql", "pgsql", "xml", "mbstring", "curl", "gd", "zip", "intl",
    ]
    .iter()
    .map(|ext| format!("php{version}-{ext}"))
    .collect();
    if framework == Framework::Wordpress {
        packages.push(format!("php{version}-imagick"));
    }
    packages.extend(["zip", "unzip", "acl"].map(String::from));
    if has_manifest {
        packages.push("composer".to_string());
    }
    packages
}
