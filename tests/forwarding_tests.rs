use std::collections::BTreeSet;
use std::sync::Arc;

use corefleet::forwarding::ForwardingRuleStore;
use corefleet::storage::{InMemoryStore, Page, RuleLogQuery, Storage};
use corefleet::types::{AgentHost, HostId, RuleAction, RuleDraft};
use corefleet::Error;

async fn store() -> (ForwardingRuleStore, HostId) {
    let storage = Arc::new(InMemoryStore::new());
    let host = AgentHost::new("edge".to_string(), "http://10.0.0.1:9527".to_string());
    storage.create_host(&host).await.unwrap();
    (ForwardingRuleStore::new(storage), host.id)
}

fn draft(port: i64, enabled: bool) -> RuleDraft {
    RuleDraft {
        name: format!("relay-{}", port),
        protocol: "tcp".to_string(),
        listen_port: port,
        target_address: "10.1.0.2".to_string(),
        target_port: 8080,
        enabled,
        priority: 0,
        remark: String::new(),
    }
}

#[tokio::test]
async fn test_every_mutation_bumps_version_by_one() {
    let (rules, host_id) = store().await;

    let a = rules.create(host_id, draft(443, true)).await.unwrap();
    assert_eq!(a.version, 1);
    let b = rules.create(host_id, draft(8443, true)).await.unwrap();
    assert_eq!(b.version, 2);
    let updated = rules
        .update(host_id, a.rule.id, draft(444, true))
        .await
        .unwrap();
    assert_eq!(updated.version, 3);
    assert_eq!(rules.delete(host_id, b.rule.id).await.unwrap(), 4);

    let (logs, total) = rules.logs(host_id, &RuleLogQuery::default()).await.unwrap();
    assert_eq!(total, 4);
    let versions: Vec<u64> = logs.iter().map(|l| l.version).collect();
    assert_eq!(versions, vec![4, 3, 2, 1]);
    assert_eq!(logs[0].action, RuleAction::Delete);
    assert_eq!(logs[3].action, RuleAction::Create);
}

#[tokio::test]
async fn test_failed_mutations_leave_version_alone() {
    let (rules, host_id) = store().await;
    rules.create(host_id, draft(443, true)).await.unwrap();

    assert!(matches!(
        rules.create(host_id, draft(443, true)).await,
        Err(Error::PortConflict { port: 443 })
    ));
    assert!(matches!(
        rules.create(host_id, draft(70000, true)).await,
        Err(Error::InvalidInput(_))
    ));
    assert_eq!(rules.version_for_agent(host_id).await.unwrap(), 1);

    let (_, total) = rules.logs(host_id, &RuleLogQuery::default()).await.unwrap();
    assert_eq!(total, 1);
}

#[tokio::test]
async fn test_disabled_rules_do_not_hold_ports() {
    let (rules, host_id) = store().await;
    let disabled = rules.create(host_id, draft(443, false)).await.unwrap();
    rules.create(host_id, draft(443, true)).await.unwrap();

    // Re-enabling would put two enabled rules on 443
    assert!(matches!(
        rules.update(host_id, disabled.rule.id, draft(443, true)).await,
        Err(Error::PortConflict { port: 443 })
    ));
}

#[tokio::test]
async fn test_concurrent_edits_get_distinct_versions() {
    let (rules, host_id) = store().await;

    let mut tasks = Vec::new();
    for port in 10_000..10_032 {
        let rules = rules.clone();
        tasks.push(tokio::spawn(async move {
            rules.create(host_id, draft(port, true)).await
        }));
    }

    let mut versions = BTreeSet::new();
    for task in tasks {
        let mutation = task.await.unwrap().unwrap();
        assert!(versions.insert(mutation.version));
    }
    assert_eq!(versions, (1..=32).collect::<BTreeSet<u64>>());
    assert_eq!(rules.version_for_agent(host_id).await.unwrap(), 32);
}

#[tokio::test]
async fn test_concurrent_claims_on_one_port_admit_one() {
    let (rules, host_id) = store().await;

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let rules = rules.clone();
        tasks.push(tokio::spawn(async move {
            rules.create(host_id, draft(443, true)).await
        }));
    }

    let mut admitted = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => admitted += 1,
            Err(Error::PortConflict { port }) => assert_eq!(port, 443),
            Err(other) => panic!("unexpected error: {}", other),
        }
    }
    assert_eq!(admitted, 1);
    assert_eq!(rules.version_for_agent(host_id).await.unwrap(), 1);
}

#[tokio::test]
async fn test_log_pagination() {
    let (rules, host_id) = store().await;
    for port in 1000..1005 {
        rules.create(host_id, draft(port, true)).await.unwrap();
    }

    let query = RuleLogQuery {
        page: Page::new(Some(2), Some(1)),
        ..Default::default()
    };
    let (logs, total) = rules.logs(host_id, &query).await.unwrap();
    assert_eq!(total, 5);
    let versions: Vec<u64> = logs.iter().map(|l| l.version).collect();
    assert_eq!(versions, vec![4, 3]);
}
