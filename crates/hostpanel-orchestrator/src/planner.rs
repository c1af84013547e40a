//! Provisioning planner.
//!
//! Turns a project and a snapshot of its host facts into an ordered list
//! of declarative steps. Planning is pure: everything it needs from the
//! host is gathered up front into [`SiteFacts`], so plans are testable
//! without a host and the executor alone mutates anything.

use std::path::PathBuf;
use std::time::Duration;

use hostpanel_core::PanelConfig;
use tracing::{debug, warn};

use crate::error::OrchestratorError;
use crate::naming::SiteLayout;
use crate::providers::{PermissionSpec, ProviderError, Providers, ToolInvocation};
use crate::runtime::{self, PhpVersion, VersionChoice, VersionPolicy};
use crate::storage::Framework;
use crate::templates::{self, VirtualHostSpec};

/// Condition under which a Laravel artisan command is skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtisanGuard {
    /// `.env` already carries a non-empty `APP_KEY`.
    UnlessAppKey,
    /// `public/storage` already exists.
    UnlessStorageLinked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartWhen {
    Always,
    /// Only when the pool config was rewritten this run, or the pool is
    /// not up.
    IfChanged,
}

/// One idempotent unit of host work.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    InstallPackages {
        packages: Vec<String>,
    },
    ApplyPermissions(PermissionSpec),
    WritePoolConfig {
        version: PhpVersion,
        domain: String,
        content: String,
    },
    RestartPool {
        service: String,
        socket: Option<PathBuf>,
        settle: Duration,
        when: RestartWhen,
    },
    ResolveDependencies(ToolInvocation),
    Artisan {
        invocation: ToolInvocation,
        args: Vec<String>,
        guard: Option<ArtisanGuard>,
    },
    /// Rendered at execution time so locally held certificates are used.
    WriteVirtualHost {
        name: String,
        spec: VirtualHostSpec,
    },
    EnableSite {
        site: String,
        config: String,
    },
    ValidateProxy,
    ReloadProxy,
    EnsureCertificate {
        domain: String,
        contact_email: Option<String>,
    },
    /// Re-render the live host with TLS once a certificate is on disk.
    SecureVirtualHost {
        name: String,
        spec: VirtualHostSpec,
    },
    WriteSuspendedHost {
        live: String,
        suspended: String,
        domain: String,
        include_www: bool,
    },
    CheckHealth {
        services: Vec<String>,
        socket: Option<PathBuf>,
    },
    RemovePoolConfig {
        domain: String,
    },
    DisableSite {
        site: String,
    },
    RemoveVirtualHosts {
        names: Vec<String>,
    },
    RemoveCertificate {
        domain: String,
    },
    RemoveRoot {
        root: PathBuf,
    },
}

impl Step {
    /// Stable name used in logs and error reports.
    pub fn name(&self) -> String {
        match self {
            Self::InstallPackages { .. } => "install-packages".into(),
            Self::ApplyPermissions(_) => "apply-permissions".into(),
            Self::WritePoolConfig { .. } => "write-pool-config".into(),
            Self::RestartPool { .. } => "restart-pool".into(),
            Self::ResolveDependencies(_) => "resolve-dependencies".into(),
            Self::Artisan { args, .. } => format!(
                "artisan-{}",
                args.first().map_or("run", String::as_str).replace(':', "-")
            ),
            Self::WriteVirtualHost { .. } => "write-virtual-host".into(),
            Self::EnableSite { .. } => "enable-site".into(),
            Self::ValidateProxy => "validate-proxy-config".into(),
            Self::ReloadProxy => "reload-proxy".into(),
            Self::EnsureCertificate { .. } => "ensure-certificate".into(),
            Self::SecureVirtualHost { .. } => "secure-virtual-host".into(),
            Self::WriteSuspendedHost { .. } => "write-suspended-host".into(),
            Self::CheckHealth { .. } => "check-health".into(),
            Self::RemovePoolConfig { .. } => "remove-pool-config".into(),
            Self::DisableSite { .. } => "disable-site".into(),
            Self::RemoveVirtualHosts { .. } => "remove-virtual-hosts".into(),
            Self::RemoveCertificate { .. } => "remove-certificate".into(),
            Self::RemoveRoot { .. } => "remove-root".into(),
        }
    }

    /// Package installs and dependency resolution get the long timeout.
    pub const fn is_long_running(&self) -> bool {
        matches!(
            self,
            Self::InstallPackages { .. } | Self::ResolveDependencies(_)
        )
    }
}

/// How a failed step affects a teardown run. Provisioning runs abort on
/// any failure regardless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Criticality {
    /// Failure keeps the project row.
    Required,
    /// Failure is reported as a warning.
    BestEffort,
    /// Best effort, and skipped once a required step has failed.
    AfterRequired,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedStep {
    pub step: Step,
    pub criticality: Criticality,
}

/// An ordered step list for one operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub operation: &'static str,
    pub domain: String,
    pub steps: Vec<PlannedStep>,
    pub php: Option<VersionChoice>,
}

impl Plan {
    fn new(operation: &'static str, domain: &str) -> Self {
        Self {
            operation,
            domain: domain.to_string(),
            steps: Vec::new(),
            php: None,
        }
    }

    fn push(&mut self, step: Step) {
        self.push_with(step, Criticality::Required);
    }

    fn push_with(&mut self, step: Step, criticality: Criticality) {
        self.steps.push(PlannedStep { step, criticality });
    }

    pub fn step_names(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.step.name()).collect()
    }
}

/// Host-wide settings that shape plans.
#[derive(Debug, Clone)]
pub struct PlanSettings {
    pub site_owner: String,
    pub web_group: String,
    pub include_www: bool,
    pub contact_email: Option<String>,
    pub pool_settle: Duration,
    pub php: VersionPolicy,
}

impl PlanSettings {
    pub fn from_config(config: &PanelConfig) -> Result<Self, OrchestratorError> {
        let parse = |key: &str, value: &str| {
            value
                .parse::<PhpVersion>()
                .map_err(|e| OrchestratorError::Config(format!("php.{key}: {e}")))
        };
        Ok(Self {
            site_owner: config.accounts.site_owner.clone(),
            web_group: config.accounts.web_group.clone(),
            include_www: config.tls.include_www,
            contact_email: config.tls.contact_email.clone(),
            pool_settle: config.timeouts.pool_settle(),
            php: VersionPolicy {
                default: parse("default_version", &config.php.default_version)?,
                minimum: parse("minimum_version", &config.php.minimum_version)?,
            },
        })
    }
}

/// What the planner knows about a site's files and the host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SiteFacts {
    /// Contents of `composer.json`, if present.
    pub manifest: Option<String>,
    pub has_artisan: bool,
    pub has_public_dir: bool,
    pub installed_php: Vec<PhpVersion>,
    /// Version whose pool directory currently holds this site's config.
    pub pool_version: Option<PhpVersion>,
}

impl SiteFacts {
    pub async fn gather(providers: &Providers, layout: &SiteLayout) -> Result<Self, ProviderError> {
        let files = &providers.files;
        let facts = Self {
            manifest: files.read_to_string(&layout.manifest()).await?,
            has_artisan: files.exists(&layout.root.join("artisan")).await,
            has_public_dir: files.exists(&layout.root.join("public")).await,
            installed_php: providers.pool.installed_versions().await?,
            pool_version: providers.pool.pool_version(&layout.domain).await?,
        };
        debug!(
            domain = %layout.domain,
            manifest = facts.manifest.is_some(),
            artisan = facts.has_artisan,
            public = facts.has_public_dir,
            "gathered site facts"
        );
        Ok(facts)
    }
}

fn vhost_spec(layout: &SiteLayout, facts: &SiteFacts, settings: &PlanSettings) -> VirtualHostSpec {
    VirtualHostSpec {
        domain: layout.domain.clone(),
        include_www: settings.include_www,
        document_root: layout.document_root(facts.has_public_dir),
        socket: layout.socket.clone(),
        framework: layout.framework,
    }
}

fn health_check(layout: &SiteLayout, version: PhpVersion, proxy_service: &str) -> Step {
    Step::CheckHealth {
        services: vec![version.fpm_service(), proxy_service.to_string()],
        socket: Some(layout.socket.clone()),
    }
}

/// Full deployment: runtime, permissions, pool, dependencies, bootstrap,
/// virtual host, TLS.
pub fn plan_provision(
    layout: &SiteLayout,
    facts: &SiteFacts,
    settings: &PlanSettings,
    proxy_service: &str,
) -> Plan {
    let mut plan = Plan::new("provision", &layout.domain);
    let choice = runtime::select_version(
        facts.manifest.as_deref(),
        &facts.installed_php,
        settings.php,
    );
    if choice.raised {
        warn!(domain = %layout.domain, version = %choice.version, "PHP version raised to policy minimum");
    }
    plan.php = Some(choice);
    let version = choice.version;
    let framework = layout.framework;

    plan.push(Step::InstallPackages {
        packages: runtime::runtime_packages(version, framework, facts.manifest.is_some()),
    });
    plan.push(Step::ApplyPermissions(PermissionSpec {
        root: layout.root.clone(),
        owner: settings.site_owner.clone(),
        web_group: settings.web_group.clone(),
        writable: framework.writable_dirs().iter().map(PathBuf::from).collect(),
    }));
    plan.push(Step::WritePoolConfig {
        version,
        domain: layout.domain.clone(),
        content: templates::pool_config(
            version,
            &layout.domain,
            &layout.project_name,
            &settings.site_owner,
            &settings.web_group,
            &layout.socket,
            &layout.root,
        ),
    });
    plan.push(Step::RestartPool {
        service: version.fpm_service(),
        socket: Some(layout.socket.clone()),
        settle: settings.pool_settle,
        when: RestartWhen::IfChanged,
    });

    let invocation = ToolInvocation {
        root: layout.root.clone(),
        php: version,
        owner: settings.site_owner.clone(),
    };
    if facts.manifest.is_some() {
        plan.push(Step::ResolveDependencies(invocation.clone()));
    }
    if framework == Framework::Laravel && facts.has_artisan {
        let bootstrap: [(&[&str], Option<ArtisanGuard>); 5] = [
            (&["key:generate", "--force"], Some(ArtisanGuard::UnlessAppKey)),
            (&["storage:link"], Some(ArtisanGuard::UnlessStorageLinked)),
            (&["config:cache"], None),
            (&["route:cache"], None),
            (&["view:cache"], None),
        ];
        for (args, guard) in bootstrap {
            plan.push(Step::Artisan {
                invocation: invocation.clone(),
                args: args.iter().map(|a| (*a).to_string()).collect(),
                guard,
            });
        }
    }

    let spec = vhost_spec(layout, facts, settings);
    let name = layout.vhost_name();
    plan.push(Step::WriteVirtualHost {
        name: name.clone(),
        spec: spec.clone(),
    });
    plan.push(Step::EnableSite {
        site: name.clone(),
        config: name.clone(),
    });
    plan.push(Step::ValidateProxy);
    plan.push(Step::ReloadProxy);
    plan.push(Step::EnsureCertificate {
        domain: layout.domain.clone(),
        contact_email: settings.contact_email.clone(),
    });
    plan.push(Step::SecureVirtualHost { name, spec });
    plan.push(Step::ValidateProxy);
    plan.push(Step::ReloadProxy);
    plan.push(health_check(layout, version, proxy_service));
    plan
}

/// Swap the live host for the static suspended page.
pub fn plan_suspend(layout: &SiteLayout, settings: &PlanSettings) -> Plan {
    let mut plan = Plan::new("suspend", &layout.domain);
    let live = layout.vhost_name();
    let suspended = layout.suspended_vhost_name();
    plan.push(Step::WriteSuspendedHost {
        live: live.clone(),
        suspended: suspended.clone(),
        domain: layout.domain.clone(),
        include_www: settings.include_www,
    });
    plan.push(Step::EnableSite {
        site: live,
        config: suspended,
    });
    plan.push(Step::ValidateProxy);
    plan.push(Step::ReloadProxy);
    plan
}

/// Put the live host back after a suspension.
pub fn plan_resume(layout: &SiteLayout, facts: &SiteFacts, settings: &PlanSettings, proxy_service: &str) -> Plan {
    let mut plan = Plan::new("resume", &layout.domain);
    let live = layout.vhost_name();
    plan.push(Step::EnableSite {
        site: live.clone(),
        config: live,
    });
    plan.push(Step::ValidateProxy);
    plan.push(Step::ReloadProxy);
    plan.push(Step::RemoveVirtualHosts {
        names: vec![layout.suspended_vhost_name()],
    });
    if let Some(version) = pool_version(facts, settings) {
        plan.push(health_check(layout, version, proxy_service));
    }
    plan
}

/// Restart a running site's pool and reload the proxy.
pub fn plan_restart(layout: &SiteLayout, facts: &SiteFacts, settings: &PlanSettings, proxy_service: &str) -> Plan {
    let mut plan = Plan::new("restart", &layout.domain);
    let version = pool_version(facts, settings);
    if let Some(version) = version {
        plan.push(Step::RestartPool {
            service: version.fpm_service(),
            socket: Some(layout.socket.clone()),
            settle: settings.pool_settle,
            when: RestartWhen::Always,
        });
    }
    plan.push(Step::ValidateProxy);
    plan.push(Step::ReloadProxy);
    if let Some(version) = version {
        plan.push(health_check(layout, version, proxy_service));
    }
    plan
}

/// The version the site's pool runs under: where its config lives, else
/// what provisioning would pick.
fn pool_version(facts: &SiteFacts, settings: &PlanSettings) -> Option<PhpVersion> {
    facts.pool_version.or_else(|| {
        facts.manifest.as_ref().map(|_| {
            runtime::select_version(facts.manifest.as_deref(), &facts.installed_php, settings.php)
                .version
        })
    })
}

/// Remove every host artifact of a site.
///
/// Pool, virtual host, and root removal are required. Proxy reloads are
/// best effort. Certificate removal waits on the required virtual-host
/// steps, since a remaining host may still reference the certificate.
pub fn plan_teardown(layout: &SiteLayout, facts: &SiteFacts) -> Plan {
    let mut plan = Plan::new("teardown", &layout.domain);
    plan.push(Step::RemovePoolConfig {
        domain: layout.domain.clone(),
    });
    if let Some(version) = facts.pool_version {
        plan.push_with(
            Step::RestartPool {
                service: version.fpm_service(),
                socket: None,
                settle: Duration::ZERO,
                when: RestartWhen::Always,
            },
            Criticality::BestEffort,
        );
    }
    plan.push(Step::DisableSite {
        site: layout.vhost_name(),
    });
    plan.push(Step::RemoveVirtualHosts {
        names: vec![layout.vhost_name(), layout.suspended_vhost_name()],
    });
    plan.push_with(Step::ValidateProxy, Criticality::BestEffort);
    plan.push_with(Step::ReloadProxy, Criticality::BestEffort);
    plan.push_with(
        Step::RemoveCertificate {
            domain: layout.domain.clone(),
        },
        Criticality::AfterRequired,
    );
    plan.push(Step::RemoveRoot {
        root: layout.root.clone(),
    });
    plan
}
