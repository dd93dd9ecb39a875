//! Return-to-base and alert delivery under failure

use std::sync::Arc;
use uuid::Uuid;
use vigil_agent::audit::AuditEvent;
use vigil_agent::error::LinkError;
use vigil_agent::notify::{AlertKind, DeliveryResult, DispatchOutcome, Severity};
use vigil_agent::session::MonitoringState::*;
use vigil_agent::CycleOutcome;
use vigil_devkit::{FrameScript, MockPlatformLink, ScriptedTransport, TestHarness};

const OPS: &str = "https://ops.example/alerts";
const OPS_CHANNEL: &str = "webhook:https://ops.example/alerts";
const BACKUP: &str = "https://backup.example/alerts";

fn one_intrusion() -> vigil_devkit::ScriptedFrameSource {
    FrameScript::new().blank(10).intrusion().build()
}

#[tokio::test]
async fn test_channel_recovers_after_two_failures() {
    let transport = Arc::new(ScriptedTransport::transient_failures(2));
    let harness = TestHarness::new()
        .unwrap()
        .with_transport(OPS, transport.clone())
        .configure(|c| c.notify.max_retries = 3);

    let mut agent = harness.build(one_intrusion(), Arc::new(MockPlatformLink::acking())).unwrap();
    agent.start().unwrap();
    agent.run().await;

    assert_eq!(transport.calls(), 3);
    assert_eq!(harness.delivery_attempts(OPS_CHANNEL), 3);

    let results: Vec<DeliveryResult> = harness
        .records()
        .unwrap()
        .into_iter()
        .filter_map(|r| match r.event {
            AuditEvent::DeliveryResult { result, .. } => Some(result),
            _ => None,
        })
        .collect();
    assert_eq!(results, vec![DeliveryResult::Success { attempts: 3 }]);
}

#[tokio::test]
async fn test_sends_per_channel_are_bounded() {
    let transport = Arc::new(ScriptedTransport::down());
    let harness = TestHarness::new()
        .unwrap()
        .with_transport(OPS, transport.clone())
        .configure(|c| c.notify.max_retries = 3);

    let mut agent = harness.build(one_intrusion(), Arc::new(MockPlatformLink::acking())).unwrap();
    agent.start().unwrap();
    agent.run().await;

    assert_eq!(transport.calls(), 4);
    assert_eq!(harness.count("delivery_result"), 1);

    let alerts = agent.alerts_handle().lock().to_vec();
    assert_eq!(alerts.len(), 1);
    assert!(matches!(
        alerts[0].deliveries.get(OPS_CHANNEL),
        Some(DeliveryResult::Failure { attempts: 4, .. })
    ));
}

#[tokio::test]
async fn test_one_bad_channel_degrades_without_blocking_others() {
    let rejecting = Arc::new(ScriptedTransport::rejecting());
    let healthy = Arc::new(ScriptedTransport::ok());
    let harness = TestHarness::new()
        .unwrap()
        .with_transport(OPS, rejecting.clone())
        .with_transport(BACKUP, healthy.clone());

    let mut agent = harness.build(one_intrusion(), Arc::new(MockPlatformLink::acking())).unwrap();
    agent.start().unwrap();
    agent.run().await;

    assert_eq!(rejecting.calls(), 1);
    assert_eq!(healthy.calls(), 1);

    let outcomes: Vec<DispatchOutcome> = harness
        .records()
        .unwrap()
        .into_iter()
        .filter_map(|r| match r.event {
            AuditEvent::DispatchSummary { outcome, .. } => Some(outcome),
            _ => None,
        })
        .collect();
    assert_eq!(outcomes, vec![DispatchOutcome::Degraded]);
    // a failed channel is not a failed response
    assert_eq!(agent.state(), Cooldown);
}

#[tokio::test]
async fn test_rejected_command_escalates() {
    let transport = Arc::new(ScriptedTransport::ok());
    let link = Arc::new(MockPlatformLink::failing(vec![LinkError::Rejected("geofence".into())]));
    let harness = TestHarness::new().unwrap().with_transport(OPS, transport.clone());

    let mut agent = harness.build(one_intrusion(), link.clone()).unwrap();
    agent.start().unwrap();
    assert_eq!(agent.run().await, CycleOutcome::EndOfStream);

    assert_eq!(link.calls(), 1);
    assert_eq!(harness.count("return_to_base_failed"), 1);
    assert_eq!(harness.count("alert_escalated"), 1);

    let kinds: Vec<AlertKind> = harness.alerts_created().into_iter().map(|(_, k)| k).collect();
    assert_eq!(kinds, vec![AlertKind::Intrusion, AlertKind::LinkFailure]);
    assert_eq!(transport.calls(), 2);
    assert_eq!(harness.transitions().last(), Some(&(ReturningToBase, Cooldown)));

    let alerts = agent.alerts_handle().lock().to_vec();
    assert!(alerts.iter().all(|a| a.severity == Severity::Critical));
}

#[tokio::test]
async fn test_transient_link_failures_are_retried() {
    let link = Arc::new(MockPlatformLink::failing(vec![
        LinkError::Timeout(200),
        LinkError::Disconnected,
    ]));
    let harness = TestHarness::new()
        .unwrap()
        .with_transport(OPS, Arc::new(ScriptedTransport::ok()));

    let mut agent = harness.build(one_intrusion(), link.clone()).unwrap();
    agent.start().unwrap();
    agent.run().await;

    assert_eq!(link.calls(), 3);
    // same command id on every attempt so the platform can dedup
    let ids = link.command_ids();
    assert!(ids.iter().all(|id| *id == ids[0]));
    assert_eq!(harness.count("return_to_base_acknowledged"), 1);
    assert_eq!(harness.count("alert_escalated"), 0);
}

#[tokio::test]
async fn test_unanswered_command_times_out_and_escalates() {
    let link = Arc::new(MockPlatformLink::hanging());
    let harness = TestHarness::new()
        .unwrap()
        .with_transport(OPS, Arc::new(ScriptedTransport::ok()))
        .configure(|c| c.command.timeout_secs = 1);

    let mut agent = harness.build(one_intrusion(), link.clone()).unwrap();
    agent.start().unwrap();
    agent.run().await;

    assert_eq!(harness.count("return_to_base_failed"), 1);
    assert_eq!(harness.count("alert_escalated"), 1);
    assert_eq!(agent.state(), Cooldown);
}

#[tokio::test]
async fn test_duplicate_return_to_base_has_one_effect() {
    let link = Arc::new(MockPlatformLink::acking());
    let harness = TestHarness::new()
        .unwrap()
        .with_transport(OPS, Arc::new(ScriptedTransport::ok()));
    let agent = harness.build(FrameScript::new().build(), link.clone()).unwrap();
    let issuer = agent.issuer();

    let episode = Uuid::new_v4();
    let first = issuer.send_return_to_base(episode).await.unwrap();
    let second = issuer.send_return_to_base(episode).await.unwrap();
    assert_eq!(first, second);

    // concurrent duplicates collapse too
    let other = Uuid::new_v4();
    let (a, b) = tokio::join!(issuer.send_return_to_base(other), issuer.send_return_to_base(other));
    assert_eq!(a.unwrap(), b.unwrap());

    assert_eq!(link.calls(), 2);
    assert_eq!(harness.count("return_to_base_acknowledged"), 2);
}

#[tokio::test]
async fn test_restart_keeps_terminal_deliveries() {
    let transport = Arc::new(ScriptedTransport::ok());
    let harness = TestHarness::new().unwrap().with_transport(OPS, transport.clone());

    let mut agent = harness.build(one_intrusion(), Arc::new(MockPlatformLink::acking())).unwrap();
    agent.start().unwrap();
    agent.run().await;
    let alert_id = harness.alerts_created()[0].0;
    drop(agent);

    let ledger = vigil_agent::audit::Auditor::delivery_ledger(&harness.audit_path()).unwrap();
    assert_eq!(
        ledger.get(&(alert_id, OPS_CHANNEL.to_string())),
        Some(&DeliveryResult::Success { attempts: 1 })
    );

    // a restarted agent appends after the previous run
    let restarted = harness.build(FrameScript::new().build(), Arc::new(MockPlatformLink::acking())).unwrap();
    drop(restarted);
    assert_eq!(harness.count("agent_started"), 2);
}

#[tokio::test]
async fn test_torn_audit_tail_keeps_ledger_across_restarts() {
    use std::io::Write;

    let transport = Arc::new(ScriptedTransport::ok());
    let harness = TestHarness::new().unwrap().with_transport(OPS, transport.clone());

    let mut agent = harness.build(one_intrusion(), Arc::new(MockPlatformLink::acking())).unwrap();
    agent.start().unwrap();
    agent.run().await;
    let alert_id = harness.alerts_created()[0].0;
    drop(agent);

    // power loss halfway through a line
    let mut file = std::fs::OpenOptions::new().append(true).open(harness.audit_path()).unwrap();
    file.write_all(br#"{"seq":99,"timest"#).unwrap();
    drop(file);

    for _ in 0..2 {
        let restarted = harness.build(FrameScript::new().build(), Arc::new(MockPlatformLink::acking())).unwrap();
        drop(restarted);
    }

    let ledger = vigil_agent::audit::Auditor::delivery_ledger(&harness.audit_path()).unwrap();
    assert_eq!(
        ledger.get(&(alert_id, OPS_CHANNEL.to_string())),
        Some(&DeliveryResult::Success { attempts: 1 })
    );
    assert_eq!(harness.count("agent_started"), 3);
}
