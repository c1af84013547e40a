//! Registry tests.

#![allow(clippy::unwrap_used)]

use super::db::{Database, DatabaseError};
use super::models::{Engine, Framework, RowState};
use super::queries_projects::NewProject;
use crate::lifecycle::ProjectStatus;

async fn test_db() -> Database {
    Database::open_in_memory().await.unwrap()
}

async fn ready_user(db: &Database, name: &str) -> i64 {
    let user = db.reserve_db_user(name, "secret", Engine::Mysql).await.unwrap();
    db.set_db_user_state(user.id, RowState::Ready).await.unwrap();
    user.id
}

async fn ready_database(db: &Database, name: &str, user_id: i64) -> i64 {
    let record = db.reserve_database(name, Engine::Mysql, user_id).await.unwrap();
    db.set_database_state(record.id, RowState::Ready).await.unwrap();
    record.id
}

// === Domain tests ===

#[tokio::test]
async fn create_and_get_domain() {
    let db = test_db().await;
    let domain = db.create_domain("shop.example.com", Some("namecheap")).await.unwrap();

    assert_eq!(domain.domain, "shop.example.com");
    assert_eq!(domain.domain_provider.as_deref(), Some("namecheap"));
    assert!(domain.ssl_renewed_at.is_none());

    let fetched = db.get_domain_by_name("shop.example.com").await.unwrap();
    assert_eq!(fetched.id, domain.id);
}

#[tokio::test]
async fn duplicate_domain_is_already_exists() {
    let db = test_db().await;
    db.create_domain("shop.example.com", None).await.unwrap();

    let err = db.create_domain("shop.example.com", None).await.unwrap_err();
    assert!(matches!(err, DatabaseError::AlreadyExists(ref s) if s.contains("shop.example.com")));
}

#[tokio::test]
async fn domain_provider_and_ssl_renewal_update() {
    let db = test_db().await;
    db.create_domain("shop.example.com", None).await.unwrap();

    let updated = db
        .set_domain_provider("shop.example.com", Some("cloudflare"))
        .await
        .unwrap();
    assert_eq!(updated.domain_provider.as_deref(), Some("cloudflare"));

    db.record_ssl_renewal("shop.example.com", 1_750_000_000)
        .await
        .unwrap();
    let domain = db.get_domain_by_name("shop.example.com").await.unwrap();
    assert_eq!(domain.ssl_renewed_at, Some(1_750_000_000));

    assert!(matches!(
        db.set_domain_provider("missing.example.com", None).await,
        Err(DatabaseError::NotFound(_))
    ));
}

#[tokio::test]
async fn referenced_domain_cannot_be_deleted() {
    let db = test_db().await;
    let domain = db.create_domain("shop.example.com", None).await.unwrap();
    db.create_project(&NewProject {
        project_name: "shop_example_com",
        domain_id: domain.id,
        database_id: None,
        framework: Framework::Php,
        root_directory: "/srv/php/shop_example_com",
    })
    .await
    .unwrap();

    let err = db.delete_domain("shop.example.com").await.unwrap_err();
    assert!(matches!(err, DatabaseError::StillReferenced(_)));

    assert!(matches!(
        db.delete_domain("other.example.com").await,
        Err(DatabaseError::NotFound(_))
    ));
}

// === User and database tests ===

#[tokio::test]
async fn user_is_unique_per_engine() {
    let db = test_db().await;
    db.reserve_db_user("shop_user", "a", Engine::Mysql).await.unwrap();

    let err = db
        .reserve_db_user("shop_user", "b", Engine::Mysql)
        .await
        .unwrap_err();
    assert!(matches!(err, DatabaseError::AlreadyExists(_)));

    db.reserve_db_user("shop_user", "c", Engine::Postgresql)
        .await
        .unwrap();
}

#[tokio::test]
async fn pending_users_are_invisible_to_lookups() {
    let db = test_db().await;
    let user = db.reserve_db_user("shop_user", "a", Engine::Mysql).await.unwrap();
    assert_eq!(user.state, RowState::Pending);

    assert!(matches!(
        db.get_db_user_by_name("shop_user", Engine::Mysql).await,
        Err(DatabaseError::NotFound(_))
    ));
    assert!(db.list_db_users(None).await.unwrap().is_empty());

    db.set_db_user_state(user.id, RowState::Ready).await.unwrap();
    let found = db.get_db_user_by_name("shop_user", Engine::Mysql).await.unwrap();
    assert_eq!(found.id, user.id);
    assert_eq!(db.list_db_users(Some(Engine::Mysql)).await.unwrap().len(), 1);
    assert!(db.list_db_users(Some(Engine::Postgresql)).await.unwrap().is_empty());
}

#[tokio::test]
async fn password_is_not_serialized() {
    let db = test_db().await;
    let user = db.reserve_db_user("shop_user", "hunter2", Engine::Mysql).await.unwrap();

    let json = serde_json::to_string(&user).unwrap();
    assert!(!json.contains("hunter2"));
    assert!(json.contains("\"engine\":\"mysql\""));
}

#[tokio::test]
async fn duplicate_database_name_is_already_exists() {
    let db = test_db().await;
    let user_id = ready_user(&db, "shop_user").await;
    db.reserve_database("app_db", Engine::Mysql, user_id).await.unwrap();

    let err = db
        .reserve_database("app_db", Engine::Mysql, user_id)
        .await
        .unwrap_err();
    assert!(matches!(err, DatabaseError::AlreadyExists(ref s) if s.contains("app_db")));
    assert_eq!(db.count_databases_named("app_db", Engine::Mysql).await.unwrap(), 1);
}

#[tokio::test]
async fn database_with_unknown_owner_is_invalid_reference() {
    let db = test_db().await;
    let err = db
        .reserve_database("app_db", Engine::Mysql, 999)
        .await
        .unwrap_err();
    assert!(matches!(err, DatabaseError::InvalidReference(_)));
}

#[tokio::test]
async fn user_drop_is_refused_while_it_owns_a_database() {
    let db = test_db().await;
    let user_id = ready_user(&db, "shop_user").await;
    let database_id = ready_database(&db, "shop_db", user_id).await;

    assert!(!db.begin_drop_db_user(user_id).await.unwrap());
    assert!(matches!(
        db.delete_db_user(user_id).await,
        Err(DatabaseError::StillReferenced(_))
    ));

    assert!(db.begin_drop_database(database_id).await.unwrap());
    db.delete_database(database_id).await.unwrap();
    assert!(db.begin_drop_db_user(user_id).await.unwrap());
    assert_eq!(db.get_db_user(user_id).await.unwrap().state, RowState::Dropping);
    db.delete_db_user(user_id).await.unwrap();
}

#[tokio::test]
async fn database_drop_is_refused_while_a_project_uses_it() {
    let db = test_db().await;
    let user_id = ready_user(&db, "shop_user").await;
    let database_id = ready_database(&db, "shop_db", user_id).await;
    let domain = db.create_domain("shop.example.com", None).await.unwrap();
    db.create_project(&NewProject {
        project_name: "shop_example_com",
        domain_id: domain.id,
        database_id: Some(database_id),
        framework: Framework::Wordpress,
        root_directory: "/srv/wordpress/shop_example_com",
    })
    .await
    .unwrap();

    assert!(!db.begin_drop_database(database_id).await.unwrap());
    assert_eq!(db.count_projects_for_database(database_id).await.unwrap(), 1);
}

#[tokio::test]
async fn project_cannot_bind_a_dropping_database() {
    let db = test_db().await;
    let user_id = ready_user(&db, "shop_user").await;
    let database_id = ready_database(&db, "shop_db", user_id).await;
    let domain = db.create_domain("shop.example.com", None).await.unwrap();
    assert!(db.begin_drop_database(database_id).await.unwrap());

    let err = db
        .create_project(&NewProject {
            project_name: "shop_example_com",
            domain_id: domain.id,
            database_id: Some(database_id),
            framework: Framework::Wordpress,
            root_directory: "/srv/wordpress/shop_example_com",
        })
        .await
        .unwrap_err();
    assert!(matches!(err, DatabaseError::InvalidReference(_)));
    assert_eq!(db.count_projects_for_database(database_id).await.unwrap(), 0);

    // The drop can finish.
    db.delete_database(database_id).await.unwrap();
}

#[tokio::test]
async fn database_cannot_be_reserved_for_a_dropping_user() {
    let db = test_db().await;
    let user_id = ready_user(&db, "shop_user").await;
    assert!(db.begin_drop_db_user(user_id).await.unwrap());

    let err = db
        .reserve_database("late_db", Engine::Mysql, user_id)
        .await
        .unwrap_err();
    assert!(matches!(err, DatabaseError::InvalidReference(_)));
    assert_eq!(db.count_databases_for_user(user_id).await.unwrap(), 0);
    db.delete_db_user(user_id).await.unwrap();
}

#[tokio::test]
async fn database_cannot_be_reserved_for_a_pending_user() {
    let db = test_db().await;
    let user = db
        .reserve_db_user("shop_user", "secret", Engine::Mysql)
        .await
        .unwrap();

    let err = db
        .reserve_database("shop_db", Engine::Mysql, user.id)
        .await
        .unwrap_err();
    assert!(matches!(err, DatabaseError::InvalidReference(_)));
}

// === Project tests ===

#[tokio::test]
async fn project_joins_domain_and_database_names() {
    let db = test_db().await;
    let user_id = ready_user(&db, "shop_user").await;
    let database_id = ready_database(&db, "shop_db", user_id).await;
    let domain = db.create_domain("shop.example.com", None).await.unwrap();

    let project = db
        .create_project(&NewProject {
            project_name: "shop_example_com",
            domain_id: domain.id,
            database_id: Some(database_id),
            framework: Framework::Wordpress,
            root_directory: "/srv/wordpress/shop_example_com",
        })
        .await
        .unwrap();

    assert_eq!(project.domain, "shop.example.com");
    assert_eq!(project.database_name.as_deref(), Some("shop_db"));
    assert_eq!(project.database_engine, Some(Engine::Mysql));
    assert_eq!(project.status, ProjectStatus::Initialized);
    assert_eq!(project.framework, Framework::Wordpress);

    let by_domain = db.get_project_by_domain("shop.example.com").await.unwrap();
    assert_eq!(by_domain.id, project.id);
}

#[tokio::test]
async fn project_against_missing_domain_is_invalid_reference() {
    let db = test_db().await;
    let err = db
        .create_project(&NewProject {
            project_name: "ghost_example_com",
            domain_id: 42,
            database_id: None,
            framework: Framework::Php,
            root_directory: "/srv/php/ghost_example_com",
        })
        .await
        .unwrap_err();
    assert!(matches!(err, DatabaseError::InvalidReference(_)));
}

#[tokio::test]
async fn one_project_per_domain() {
    let db = test_db().await;
    let domain = db.create_domain("shop.example.com", None).await.unwrap();
    let params = NewProject {
        project_name: "shop_example_com",
        domain_id: domain.id,
        database_id: None,
        framework: Framework::Php,
        root_directory: "/srv/php/shop_example_com",
    };
    db.create_project(&params).await.unwrap();

    let err = db.create_project(&params).await.unwrap_err();
    assert!(matches!(err, DatabaseError::AlreadyExists(_)));
}

#[tokio::test]
async fn status_transition_is_compare_and_set() {
    let db = test_db().await;
    let domain = db.create_domain("shop.example.com", None).await.unwrap();
    let project = db
        .create_project(&NewProject {
            project_name: "shop_example_com",
            domain_id: domain.id,
            database_id: None,
            framework: Framework::Php,
            root_directory: "/srv/php/shop_example_com",
        })
        .await
        .unwrap();

    assert!(db
        .transition_project_status(
            project.id,
            ProjectStatus::Initialized,
            ProjectStatus::FilesUploaded,
            None
        )
        .await
        .unwrap());

    // Stale `from` must not win.
    assert!(!db
        .transition_project_status(
            project.id,
            ProjectStatus::Initialized,
            ProjectStatus::Error,
            Some("late writer")
        )
        .await
        .unwrap());

    let project = db.get_project(project.id).await.unwrap();
    assert_eq!(project.status, ProjectStatus::FilesUploaded);
    assert!(project.last_error.is_none());

    let uploaded = db
        .list_projects(Some(ProjectStatus::FilesUploaded))
        .await
        .unwrap();
    assert_eq!(uploaded.len(), 1);
    assert!(db
        .list_projects(Some(ProjectStatus::Running))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn deleted_project_is_not_found() {
    let db = test_db().await;
    let domain = db.create_domain("shop.example.com", None).await.unwrap();
    let project = db
        .create_project(&NewProject {
            project_name: "shop_example_com",
            domain_id: domain.id,
            database_id: None,
            framework: Framework::Php,
            root_directory: "/srv/php/shop_example_com",
        })
        .await
        .unwrap();

    db.delete_project(project.id).await.unwrap();
    assert!(matches!(
        db.get_project(project.id).await,
        Err(DatabaseError::NotFound(_))
    ));
    // Domain becomes deletable once unreferenced.
    db.delete_domain("shop.example.com").await.unwrap();
}
