#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! End-to-end runs of the orchestrator against the in-memory host.
//!
//! Each test wires a real registry (on disk or in memory) to `FakeHost`
//! and drives projects through provisioning, lifecycle, and teardown.

use std::path::Path;
use std::sync::Arc;

use hostpanel_core::PanelConfig;
use hostpanel_orchestrator::providers::fake::FakeHost;
use hostpanel_orchestrator::runtime::PhpVersion;
use hostpanel_orchestrator::storage::Project;
use hostpanel_orchestrator::{
    Database, Engine, ErrorKind, Framework, Orchestrator, OrchestratorError, ProjectStatus,
};

fn config() -> PanelConfig {
    let mut config = PanelConfig::default();
    config.timeouts.pool_settle_ms = 0;
    config.timeouts.lock_retry_backoff_ms = 0;
    config
}

async fn orchestrator_with(config: PanelConfig) -> (Orchestrator, Arc<FakeHost>) {
    let host = FakeHost::new();
    let db = Database::open_in_memory().await.unwrap();
    let orch = Orchestrator::new(db, host.providers(), config).unwrap();
    (orch, host)
}

async fn orchestrator() -> (Orchestrator, Arc<FakeHost>) {
    orchestrator_with(config()).await
}

/// Domain plus project with files delivered, ready to provision.
async fn uploaded(
    orch: &Orchestrator,
    host: &FakeHost,
    domain: &str,
    framework: Framework,
    database: Option<(&str, Engine)>,
    files: &[(&str, &str)],
) -> Project {
    orch.create_domain(domain, None).await.unwrap();
    let project = orch
        .create_project(domain, framework, database)
        .await
        .unwrap();
    let archive = format!("/tmp/{domain}.zip");
    host.put_archive(&archive, files);
    orch.receive_archive(project.id, Path::new(&archive))
        .await
        .unwrap()
}

#[tokio::test]
async fn wordpress_site_full_lifecycle() {
    let dir = tempfile::TempDir::new().unwrap();
    let host = FakeHost::new();
    let db = Database::open(&dir.path().join("registry.db")).await.unwrap();
    let orch = Orchestrator::new(db, host.providers(), config()).unwrap();

    orch.create_db_user("shop_user", "s3cret", Engine::Mysql)
        .await
        .unwrap();
    orch.create_database("shop_db", Engine::Mysql, "shop_user")
        .await
        .unwrap();
    let project = uploaded(
        &orch,
        &host,
        "shop.example.com",
        Framework::Wordpress,
        Some(("shop_db", Engine::Mysql)),
        &[("wp-config.php", "<?php"), ("wp-content/index.php", "<?php")],
    )
    .await;

    let project = orch.provision(project.id).await.unwrap();
    assert_eq!(project.status, ProjectStatus::Running);
    let vhost = host.vhost("shop_example_com.conf").unwrap();
    assert!(vhost.contains(&format!("root {};", project.root_directory)));
    assert!(project.root_directory.ends_with("wordpress/shop_example_com"));
    assert!(host.installed_packages().contains(&"php8.2-imagick".to_string()));

    orch.suspend(project.id).await.unwrap();
    assert_eq!(orch.status(project.id).await.unwrap(), ProjectStatus::Suspended);

    orch.restart(project.id).await.unwrap();
    assert_eq!(orch.status(project.id).await.unwrap(), ProjectStatus::Running);

    orch.delete(project.id).await.unwrap();
    let err = orch.status(project.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    // The database and its owner outlive the project.
    assert!(host.has_database(Engine::Mysql, "shop_db"));
    assert_eq!(orch.list_databases(None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn laravel_site_runs_composer_and_bootstrap() {
    let (orch, host) = orchestrator().await;
    host.set_php_versions(&[PhpVersion::new(8, 1), PhpVersion::new(8, 3)]);
    let project = uploaded(
        &orch,
        &host,
        "app.example.com",
        Framework::Laravel,
        None,
        &[
            ("composer.json", r#"{"require": {"php": "^8.1"}}"#),
            ("artisan", "#!/usr/bin/env php"),
            ("public/index.php", "<?php"),
            (".env", "APP_KEY=\n"),
        ],
    )
    .await;

    orch.provision(project.id).await.unwrap();

    assert_eq!(host.calls_to("composer-install"), ["composer-install 8.3"]);
    let artisan = host.calls_to("artisan");
    assert_eq!(
        artisan,
        [
            "artisan key:generate --force",
            "artisan storage:link",
            "artisan config:cache",
            "artisan route:cache",
            "artisan view:cache",
        ]
    );
    let (version, _) = host.pool("app.example.com").unwrap();
    assert_eq!(version, PhpVersion::new(8, 3));
    let vhost = host.vhost("app_example_com.conf").unwrap();
    assert!(vhost.contains("laravel/app_example_com/public;"));
}

#[tokio::test]
async fn duplicate_database_leaves_one_row() {
    let (orch, host) = orchestrator().await;
    orch.create_db_user("app_user", "pw", Engine::Mysql)
        .await
        .unwrap();

    orch.create_database("app_db", Engine::Mysql, "app_user")
        .await
        .unwrap();
    let err = orch
        .create_database("app_db", Engine::Mysql, "app_user")
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(err.to_string(), "Database app_db already exist");
    assert_eq!(host.calls_to("create-db").len(), 1);
    assert_eq!(
        orch.db()
            .count_databases_named("app_db", Engine::Mysql)
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn database_for_unknown_user_is_not_created() {
    let (orch, host) = orchestrator().await;
    let err = orch
        .create_database("app_db", Engine::Postgresql, "nobody")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(err.to_string().contains("user nobody"));
    assert!(host.calls_to("create-db").is_empty());
    assert!(!host.has_database(Engine::Postgresql, "app_db"));
}

#[tokio::test]
async fn suspend_of_initialized_project_is_a_state_error() {
    let (orch, host) = orchestrator().await;
    orch.create_db_user("u", "pw", Engine::Mysql).await.unwrap();
    orch.create_database("d", Engine::Mysql, "u").await.unwrap();
    orch.create_domain("blog.example.com", None).await.unwrap();
    let project = orch
        .create_project("blog.example.com", Framework::Wordpress, Some(("d", Engine::Mysql)))
        .await
        .unwrap();
    host.clear_calls();

    let err = orch.suspend(project.id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidState(_)));
    assert_eq!(
        orch.status(project.id).await.unwrap(),
        ProjectStatus::Initialized
    );
    assert!(host.calls().is_empty());
}

#[tokio::test]
async fn retry_after_failure_reuses_applied_steps() {
    let (orch, host) = orchestrator().await;
    let project = uploaded(
        &orch,
        &host,
        "app.example.com",
        Framework::Php,
        None,
        &[("index.php", "<?php")],
    )
    .await;
    host.fail_once("issue-cert", "Challenge failed for domain app.example.com");

    let err = orch.provision(project.id).await.unwrap_err();
    assert!(err.to_string().contains("ensure-certificate"));
    let failed = orch.get_project(project.id).await.unwrap();
    assert_eq!(failed.status, ProjectStatus::Error);
    assert!(failed.last_error.unwrap().contains("Challenge failed"));
    let restarts = host.restarts("php8.2-fpm");
    let pool_before = host.pool("app.example.com");

    let project = orch.provision(project.id).await.unwrap();
    assert_eq!(project.status, ProjectStatus::Running);
    assert!(project.last_error.is_none());
    // Identical pool config: written again as a no-op, pool left alone.
    assert_eq!(host.pool("app.example.com"), pool_before);
    assert_eq!(host.restarts("php8.2-fpm"), restarts);
}

#[tokio::test]
async fn package_lock_contention_is_retried() {
    let (orch, host) = orchestrator().await;
    let project = uploaded(
        &orch,
        &host,
        "app.example.com",
        Framework::Php,
        None,
        &[("index.php", "<?php")],
    )
    .await;
    host.lock_contention("install", 2);

    orch.provision(project.id).await.unwrap();
    assert_eq!(host.calls_to("install").len(), 3);
}

#[tokio::test]
async fn expired_deadline_fails_the_run() {
    let mut config = config();
    config.timeouts.pipeline_deadline_secs = 0;
    let (orch, host) = orchestrator_with(config).await;
    let project = uploaded(
        &orch,
        &host,
        "app.example.com",
        Framework::Php,
        None,
        &[("index.php", "<?php")],
    )
    .await;

    let err = orch.provision(project.id).await.unwrap_err();
    assert!(err.to_string().contains("timed out"));
    assert_eq!(orch.status(project.id).await.unwrap(), ProjectStatus::Error);
    assert!(host.calls_to("install").is_empty());
}

#[tokio::test]
async fn delete_removes_every_host_artifact() {
    let (orch, host) = orchestrator().await;
    let project = uploaded(
        &orch,
        &host,
        "app.example.com",
        Framework::Php,
        None,
        &[("index.php", "<?php")],
    )
    .await;
    orch.provision(project.id).await.unwrap();
    assert!(host.vhost("app_example_com.conf").is_some());
    assert!(host.pool("app.example.com").is_some());

    let report = orch.delete(project.id).await.unwrap();
    assert!(report.warnings.is_empty());
    assert!(host.vhost("app_example_com.conf").is_none());
    assert!(host.pool("app.example.com").is_none());
    assert!(!host.path_exists(Path::new(&project.root_directory)));
    assert_eq!(
        orch.status(project.id).await.unwrap_err().kind(),
        ErrorKind::NotFound
    );

    // The domain is free for a new project.
    orch.create_project("app.example.com", Framework::Php, None)
        .await
        .unwrap();
}

#[tokio::test]
async fn registry_refuses_to_orphan_references() {
    let (orch, host) = orchestrator().await;
    orch.create_db_user("shop_user", "pw", Engine::Mysql)
        .await
        .unwrap();
    orch.create_database("shop_db", Engine::Mysql, "shop_user")
        .await
        .unwrap();
    uploaded(
        &orch,
        &host,
        "shop.example.com",
        Framework::Wordpress,
        Some(("shop_db", Engine::Mysql)),
        &[("wp-config.php", "<?php")],
    )
    .await;

    let err = orch
        .delete_database("shop_db", Engine::Mysql)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Reference);
    assert!(host.has_database(Engine::Mysql, "shop_db"));

    let err = orch.delete_domain("shop.example.com").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Reference);
}
