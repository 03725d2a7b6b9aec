use crate::support::{path, settle, wire, Harness, ScriptedPeer};
use ganglion::codec::Value;
use ganglion::config::AgentConfig;
use ganglion::dispatch::Scope;
use ganglion::error::TaskError;
use ganglion::protocol::{EnvelopeKind, RequesterState};
use ganglion::scheduler::Outcome;
use ganglion::transport::Transport;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

#[test]
fn test_one_operation_per_target_at_a_time() {
    let harness = Harness::new();
    let client = harness.agent(AgentConfig::new("client"));
    let server = harness.peer("server");

    let first = client
        .request(server.address.clone(), path("/demo/a"), Scope::Direct, BTreeMap::new())
        .unwrap();
    let second = client
        .request(server.address.clone(), path("/demo/b"), Scope::Direct, BTreeMap::new())
        .unwrap();
    settle(&[&client]);

    let received = server.drain();
    assert_eq!(ScriptedPeer::kinds(&received), vec![EnvelopeKind::Init]);
    assert_eq!(received[0].envelope.token.initiator(), &first.initiator());
    assert_eq!(second.state(), RequesterState::New);

    let init = &received[0].envelope;
    let token = init.token.extend().unwrap();
    let client_addr = client.address().clone();
    server.send(&client_addr, EnvelopeKind::Ack, &token, wire(Value::Nil), Some(init.message_id));
    settle(&[&client]);
    server.send(&client_addr, EnvelopeKind::Final, &token, wire(Value::Nil), None);
    settle(&[&client]);
    assert_eq!(first.state(), RequesterState::Commit);

    let received = server.drain();
    let mut kinds = ScriptedPeer::kinds(&received);
    kinds.sort_by_key(|kind| kind.as_str());
    assert_eq!(kinds, vec![EnvelopeKind::Ack, EnvelopeKind::Init]);
    let init = received
        .iter()
        .find(|inbound| inbound.envelope.kind == EnvelopeKind::Init)
        .unwrap();
    assert_eq!(init.envelope.token.initiator(), &second.initiator());
    assert_eq!(second.state(), RequesterState::Ready);
}

#[test]
fn test_different_targets_proceed_concurrently() {
    let harness = Harness::new();
    let client = harness.agent(AgentConfig::new("client"));
    let east = harness.peer("east");
    let west = harness.peer("west");

    client
        .request(east.address.clone(), path("/demo/a"), Scope::Direct, BTreeMap::new())
        .unwrap();
    client
        .request(west.address.clone(), path("/demo/a"), Scope::Direct, BTreeMap::new())
        .unwrap();
    settle(&[&client]);

    assert_eq!(east.drain().len(), 1);
    assert_eq!(west.drain().len(), 1);
}

#[test]
fn test_timeout_releases_busy_flag() {
    let harness = Harness::new();
    let client = harness.agent(AgentConfig::new("client").with_operation_timeout(Duration::from_secs(5)));
    let silent = harness.peer("silent");

    let requester = client
        .request(silent.address.clone(), path("/demo/echo"), Scope::Direct, BTreeMap::new())
        .unwrap();
    settle(&[&client]);
    assert!(client.context().is_busy(&silent.address));
    assert_eq!(silent.drain().len(), 1);

    harness.clock.advance(Duration::from_secs(4));
    settle(&[&client]);
    assert_eq!(requester.state(), RequesterState::Ready);

    // Its own timeout starts now, so it outlives the first one.
    let queued = client
        .request(silent.address.clone(), path("/demo/echo"), Scope::Direct, BTreeMap::new())
        .unwrap();
    settle(&[&client]);
    assert_eq!(queued.state(), RequesterState::New);
    assert!(silent.drain().is_empty());

    harness.clock.advance(Duration::from_secs(2));
    settle(&[&client]);
    assert_eq!(requester.state(), RequesterState::Error);
    assert!(matches!(requester.error(), Some(TaskError::ProtocolTimeout(_))));
    assert!(matches!(
        requester.completion().outcome(),
        Outcome::Failed(TaskError::ProtocolTimeout(_))
    ));

    // The freed target goes to the queued operation.
    assert_eq!(queued.state(), RequesterState::Ready);
    assert_eq!(silent.drain().len(), 1);
    assert!(client.context().is_busy(&silent.address));
}

#[test]
fn test_unusable_transport_holds_sends() {
    let harness = Harness::new();
    let (transport, inbox) = harness.network.connect("client");
    let transport = Rc::new(transport);
    let client = ganglion::agent::Agent::new(
        &AgentConfig::new("client"),
        transport.clone(),
        inbox,
        harness.clock.clone(),
    )
    .unwrap();
    let server = harness.peer("server");

    transport.set_usable(false);
    assert!(!transport.is_usable());
    let requester = client
        .request(server.address.clone(), path("/demo/echo"), Scope::Direct, BTreeMap::new())
        .unwrap();
    settle(&[&client]);
    assert_eq!(requester.state(), RequesterState::New);
    assert!(server.drain().is_empty());

    transport.set_usable(true);
    settle(&[&client]);
    assert_eq!(requester.state(), RequesterState::Ready);
    assert_eq!(server.drain().len(), 1);
}

#[test]
fn test_shutdown_forgets_everything() {
    let harness = Harness::new();
    let client = harness.agent(AgentConfig::new("client"));
    let server = harness.peer("server");

    client
        .request(server.address.clone(), path("/demo/echo"), Scope::Direct, BTreeMap::new())
        .unwrap();
    settle(&[&client]);
    assert_eq!(client.context().active_operations(), (1, 0));

    client.shutdown();
    assert_eq!(client.context().active_operations(), (0, 0));
    assert!(!client.context().is_busy(&server.address));
    assert!(client.queue().is_empty());
}
