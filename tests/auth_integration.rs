mod common;

use std::collections::BTreeSet;

use chrono::{Duration, Utc};

use codeb_control::audit::AuditKind;
use codeb_control::registry::Environment;
use codeb_control::teams::Role;

use common::{deploy_req, harness};

const ENV: Environment = Environment::Production;

#[tokio::test]
async fn test_foreign_project_is_forbidden() {
    let h = harness();
    let t = h.seed_team().await;

    // A second team owns blog.
    let (_, other_secret) = h
        .core
        .teams
        .create_team(None, "other", "Other", "free")
        .await
        .unwrap();
    let other_owner = h.core.teams.authenticate(&other_secret).await.unwrap();
    h.core
        .teams
        .assign_project(&other_owner, "other", "blog")
        .await
        .unwrap();

    // acme's member cannot touch it, and no registry is created.
    let err = h
        .core
        .deploy(&t.dev, &deploy_req("blog", ENV, "v1"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "forbidden");
    assert!(!h.base().join("registry/slots/blog-production.json").exists());

    // The denial is audited.
    let denied = h.core.audit.read(AuditKind::AuthzDenied, "blog", ENV).unwrap();
    assert_eq!(denied.len(), 1);
    assert!(!denied[0].success);
}

#[tokio::test]
async fn test_member_cannot_mint_owner() {
    let h = harness();
    let t = h.seed_team().await;
    let err = h
        .core
        .teams
        .create_token(&t.dev, "acme", Role::Owner, "evil", BTreeSet::new(), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "role_escalation");
}

#[tokio::test]
async fn test_viewer_reads_but_cannot_operate() {
    let h = harness();
    let t = h.seed_team().await;
    h.core.deploy(&t.dev, &deploy_req("web", ENV, "v1")).await.unwrap();

    let (_, viewer_secret) = h
        .core
        .teams
        .create_token(&t.owner, "acme", Role::Viewer, "auditor", BTreeSet::new(), None)
        .await
        .unwrap();
    let viewer = h.core.teams.authenticate(&viewer_secret).await.unwrap();

    // Reads work, including the audit log.
    let doc = h.core.status(&viewer, "web", ENV).await.unwrap();
    assert_eq!(doc.project, "web");
    let events = h
        .core
        .audit_events(&viewer, AuditKind::Deploy, "web", ENV)
        .await
        .unwrap();
    assert_eq!(events.len(), 1);

    // Mutations do not.
    let err = h
        .core
        .deploy(&viewer, &deploy_req("web", ENV, "v2"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "forbidden");
    let err = h.core.promote(&viewer, "web", ENV).await.unwrap_err();
    assert_eq!(err.code(), "forbidden");
    let err = h.core.cleanup(&viewer, "web", ENV, false).await.unwrap_err();
    assert_eq!(err.code(), "forbidden");
}

#[tokio::test]
async fn test_expired_token_is_unauthenticated_not_forbidden() {
    let h = harness();
    let t = h.seed_team().await;
    let (_, secret) = h
        .core
        .teams
        .create_token(
            &t.owner,
            "acme",
            Role::Member,
            "short-lived",
            BTreeSet::new(),
            Some(Utc::now() - Duration::minutes(1)),
        )
        .await
        .unwrap();
    let err = h.core.teams.authenticate(&secret).await.unwrap_err();
    assert_eq!(err.code(), "unauthenticated");
}

#[tokio::test]
async fn test_revoked_token_cannot_deploy() {
    let h = harness();
    let t = h.seed_team().await;
    let tokens = h.core.teams.list_tokens(&t.owner, "acme").await.unwrap();
    let dev_token = tokens.iter().find(|t| t.display_name == "dev").unwrap();
    h.core
        .teams
        .revoke_token(&t.owner, &dev_token.token_id)
        .await
        .unwrap();
    let err = h.core.teams.authenticate(&t.dev_secret).await.unwrap_err();
    assert_eq!(err.code(), "unauthenticated");
}

#[tokio::test]
async fn test_scoped_token_never_mutates_out_of_scope_registry() {
    let h = harness();
    let t = h.seed_team().await;
    // api belongs to acme too, but dev's token is scoped to web only.
    h.core.teams.assign_project(&t.owner, "acme", "api").await.unwrap();

    let err = h
        .core
        .deploy(&t.dev, &deploy_req("api", ENV, "v1"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "forbidden");
    assert!(!h.base().join("registry/slots/api-production.json").exists());

    // The owner can.
    let out = h.core.deploy(&t.owner, &deploy_req("api", ENV, "v1")).await.unwrap();
    assert!(out.success);
}

#[tokio::test]
async fn test_list_is_scope_filtered() {
    let h = harness();
    let t = h.seed_team().await;
    h.core.teams.assign_project(&t.owner, "acme", "api").await.unwrap();
    h.core.deploy(&t.owner, &deploy_req("web", ENV, "v1")).await.unwrap();
    h.core.deploy(&t.owner, &deploy_req("api", ENV, "v1")).await.unwrap();

    // dev sees only its scoped project; the owner sees both.
    let visible = h.core.list(&t.dev).await.unwrap();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].project, "web");
    let visible = h.core.list(&t.owner).await.unwrap();
    assert_eq!(visible.len(), 2);
}

#[tokio::test]
async fn test_status_requires_team_ownership() {
    let h = harness();
    let t = h.seed_team().await;
    h.core.deploy(&t.dev, &deploy_req("web", ENV, "v1")).await.unwrap();

    let (_, other_secret) = h
        .core
        .teams
        .create_team(None, "other", "Other", "free")
        .await
        .unwrap();
    let other_owner = h.core.teams.authenticate(&other_secret).await.unwrap();
    let err = h.core.status(&other_owner, "web", ENV).await.unwrap_err();
    assert_eq!(err.code(), "forbidden");
}
