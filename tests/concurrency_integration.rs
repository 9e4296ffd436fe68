mod common;

use std::sync::Arc;
use std::time::Duration;

use codeb_control::registry::{Environment, SlotName};

use common::{deploy_req, harness, harness_with};

const ENV: Environment = Environment::Production;

#[tokio::test]
async fn test_concurrent_deploys_never_share_a_slot() {
    let h = harness();
    let t = h.seed_team().await;
    let core = Arc::new(h.core);

    let (a, b) = {
        let core_a = core.clone();
        let core_b = core.clone();
        let auth_a = t.dev.clone();
        let auth_b = t.dev.clone();
        tokio::join!(
            async move { core_a.deploy(&auth_a, &deploy_req("web", ENV, "sha-aaa")).await },
            async move { core_b.deploy(&auth_b, &deploy_req("web", ENV, "sha-bbb")).await },
        )
    };

    let a = a.unwrap();
    let b = b.unwrap();
    assert!(a.success && b.success);

    // The lock serializes them: one prepares blue, the loser of the race
    // sees blue already deployed and lands on green.
    let slots: Vec<SlotName> = vec![a.slot.unwrap(), b.slot.unwrap()];
    assert!(slots.contains(&SlotName::Blue));
    assert!(slots.contains(&SlotName::Green));
    assert_ne!(a.slot, b.slot);

    // Exactly one pair was allocated.
    let snap = core.ports.snapshot().await.unwrap();
    assert_eq!(snap.len(), 2);
}

#[tokio::test]
async fn test_lock_wait_timeout_yields_busy() {
    // Lock wait far shorter than the time the first deploy holds the key.
    let h = harness_with(|config| {
        config.lock_timeout = Duration::from_millis(50);
        config.health_deadline = Duration::from_secs(2);
        config.health_interval = Duration::from_millis(100);
    });
    let t = h.seed_team().await;
    // The first deploy spends ~2s polling an unhealthy slot.
    h.exec.set_default_health("500");
    let core = Arc::new(h.core);

    let slow = {
        let core = core.clone();
        let auth = t.dev.clone();
        tokio::spawn(async move { core.deploy(&auth, &deploy_req("web", ENV, "sha-aaa")).await })
    };
    // Let the first call take the lock.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let err = core
        .cleanup(&t.dev, "web", ENV, false)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "busy");

    let _ = slow.await.unwrap();
}

#[tokio::test]
async fn test_independent_keys_do_not_block_each_other() {
    let h = harness();
    let t = h.seed_team().await;
    h.core.teams.assign_project(&t.owner, "acme", "api").await.unwrap();
    let core = Arc::new(h.core);

    let (a, b) = {
        let core_a = core.clone();
        let core_b = core.clone();
        let auth_a = t.owner.clone();
        let auth_b = t.owner.clone();
        tokio::join!(
            async move { core_a.deploy(&auth_a, &deploy_req("web", ENV, "v1")).await },
            async move { core_b.deploy(&auth_b, &deploy_req("api", ENV, "v1")).await },
        )
    };
    assert!(a.unwrap().success);
    assert!(b.unwrap().success);

    // The globally serialized ledger hands out disjoint pairs.
    let web = core.slots.load("web", ENV).unwrap();
    let api = core.slots.load("api", ENV).unwrap();
    let mut ports = vec![web.blue.port, web.green.port, api.blue.port, api.green.port];
    ports.sort_unstable();
    ports.dedup();
    assert_eq!(ports.len(), 4);
}

#[tokio::test]
async fn test_reads_skip_the_lock() {
    let h = harness_with(|config| {
        config.health_deadline = Duration::from_secs(2);
        config.health_interval = Duration::from_millis(100);
    });
    let t = h.seed_team().await;
    h.core.deploy(&t.dev, &deploy_req("web", ENV, "sha-aaa")).await.unwrap();
    h.exec.set_default_health("500");
    let core = Arc::new(h.core);

    // Second deploy holds the lock while failing health checks...
    let slow = {
        let core = core.clone();
        let auth = t.dev.clone();
        tokio::spawn(async move { core.deploy(&auth, &deploy_req("web", ENV, "sha-bbb")).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    // ...yet status answers immediately with the pre-state.
    let doc = tokio::time::timeout(Duration::from_millis(500), core.status(&t.dev, "web", ENV))
        .await
        .expect("status must not block on the operation lock")
        .unwrap();
    assert_eq!(doc.blue.version.as_deref(), Some("sha-aaa"));

    let _ = slow.await.unwrap();
}
