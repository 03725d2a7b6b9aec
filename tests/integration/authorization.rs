use crate::support::{path, settle, unwire, Harness, ScriptedPeer};
use ganglion::codec::{Codec, Value};
use ganglion::config::AgentConfig;
use ganglion::directory::{AccessPolicy, AccessRule};
use ganglion::dispatch::{Job, Scope};
use ganglion::error::TaskError;
use ganglion::protocol::{EnvelopeKind, RequesterState};
use ganglion::types::Address;
use std::cell::Cell;
use std::collections::BTreeMap;
use std::rc::Rc;

fn only_alice() -> AccessPolicy {
    AccessPolicy::Rules {
        rules: vec![AccessRule::allow(Some(Address::from("alice")), path("/demo"))],
    }
}

#[test]
fn test_denied_operation_sends_one_nack_and_skips_handler() {
    let harness = Harness::new();
    let directory = harness.agent(AgentConfig::new("directory"));
    directory.serve_directory(only_alice());
    let worker = harness.agent(AgentConfig::new("worker").with_authorizer("directory"));
    let calls = Rc::new(Cell::new(0));
    let counter = Rc::clone(&calls);
    worker.register_fn(path("/demo/echo"), "echo", Vec::new(), move |_| {
        counter.set(counter.get() + 1);
        Ok(Value::from("leaked").into())
    });
    let mallory = harness.peer("mallory");

    let job = Job::new(path("/demo/echo"), Scope::Direct, mallory.address.clone(), worker.address().clone());
    let payload = job.to_wire(&Codec::default()).unwrap();
    mallory.send(worker.address(), EnvelopeKind::Init, &job.token, payload, None);
    settle(&[&worker, &directory]);

    let received = mallory.drain();
    assert_eq!(
        ScriptedPeer::kinds(&received),
        vec![EnvelopeKind::Ack, EnvelopeKind::Nack]
    );
    assert_eq!(received[1].envelope.token, received[0].envelope.token);
    match unwire(&received[1].envelope.payload) {
        Value::String(reason) => assert!(reason.contains("mallory")),
        other => panic!("expected a reason string, got {:?}", other),
    }
    assert_eq!(calls.get(), 0);
    assert_eq!(worker.context().active_operations(), (0, 0));

    // Nothing else trickles out later.
    settle(&[&worker, &directory]);
    assert!(mallory.drain().is_empty());
}

#[test]
fn test_granted_operation_runs_handler() {
    let harness = Harness::new();
    let directory = harness.agent(AgentConfig::new("directory"));
    directory.serve_directory(only_alice());
    let worker = harness.agent(AgentConfig::new("worker").with_authorizer("directory"));
    worker.register_fn(path("/demo/echo"), "echo", Vec::new(), |job| {
        Ok(Value::from(job.origin.to_string()).into())
    });
    let alice = harness.agent(AgentConfig::new("alice"));

    let requester = alice
        .request(worker.address().clone(), path("/demo/echo"), Scope::Direct, BTreeMap::new())
        .unwrap();
    settle(&[&alice, &worker, &directory]);

    assert_eq!(requester.state(), RequesterState::Commit);
    assert_eq!(requester.results(), vec![Value::from("alice")]);
}

#[test]
fn test_requester_sees_authfail() {
    let harness = Harness::new();
    let directory = harness.agent(AgentConfig::new("directory"));
    directory.serve_directory(only_alice());
    let worker = harness.agent(AgentConfig::new("worker").with_authorizer("directory"));
    worker.register_fn(path("/demo/echo"), "echo", Vec::new(), |_| Ok(Value::from("x").into()));
    let bob = harness.agent(AgentConfig::new("bob"));

    let requester = bob
        .request(worker.address().clone(), path("/demo/echo"), Scope::Direct, BTreeMap::new())
        .unwrap();
    settle(&[&bob, &worker, &directory]);

    assert_eq!(requester.state(), RequesterState::AuthFail);
    assert!(matches!(requester.error(), Some(TaskError::AuthorizationDenied(_))));
    assert!(requester.results().is_empty());
    assert!(!bob.context().is_busy(worker.address()));
}

#[test]
fn test_unreachable_authorizer_denies() {
    let harness = Harness::new();
    let worker = harness.agent(AgentConfig::new("worker").with_authorizer("gone"));
    worker.register_fn(path("/demo/echo"), "echo", Vec::new(), |_| Ok(Value::from("x").into()));
    let client = harness.agent(AgentConfig::new("client"));

    let requester = client
        .request(worker.address().clone(), path("/demo/echo"), Scope::Direct, BTreeMap::new())
        .unwrap();
    settle(&[&client, &worker]);

    assert_eq!(requester.state(), RequesterState::AuthFail);
}
