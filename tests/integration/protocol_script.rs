use crate::support::{path, settle, unwire, wire, Harness, ScriptedPeer};
use ganglion::codec::{Codec, Value};
use ganglion::config::AgentConfig;
use ganglion::dispatch::{HandlerOutput, Job, Scope};
use ganglion::error::{DispatchError, TaskError};
use ganglion::protocol::{EnvelopeKind, RequesterState};
use ganglion::scheduler::Outcome;
use ganglion::types::Address;
use std::collections::BTreeMap;

#[test]
fn test_requester_collects_streamed_results() {
    let harness = Harness::new();
    let client = harness.agent(AgentConfig::new("client"));
    let server = harness.peer("server");

    let requester = client
        .request(server.address.clone(), path("/demo/echo"), Scope::Direct, BTreeMap::new())
        .unwrap();
    settle(&[&client]);

    let received = server.drain();
    assert_eq!(ScriptedPeer::kinds(&received), vec![EnvelopeKind::Init]);
    let init = &received[0].envelope;
    assert_eq!(received[0].from, Address::from("client"));
    assert!(!init.token.is_extended());
    assert!(client.context().is_busy(&server.address));
    assert_eq!(requester.state(), RequesterState::Ready);

    let token = init.token.extend().unwrap();
    server.send(&received[0].from, EnvelopeKind::Ack, &token, init.payload.clone(), Some(init.message_id));
    settle(&[&client]);
    assert_eq!(requester.state(), RequesterState::Consume);
    assert_eq!(requester.token(), token);

    let client_addr = Address::from("client");
    let x = server.send(&client_addr, EnvelopeKind::Data, &token, wire("x"), None);
    let y = server.send(&client_addr, EnvelopeKind::Data, &token, wire("y"), None);
    settle(&[&client]);
    let acks = server.drain();
    assert_eq!(ScriptedPeer::kinds(&acks), vec![EnvelopeKind::Ack, EnvelopeKind::Ack]);
    assert_eq!(acks[0].envelope.in_reply_to, Some(x));
    assert_eq!(acks[1].envelope.in_reply_to, Some(y));
    assert_eq!(requester.state(), RequesterState::Consume);

    let fin = server.send(&client_addr, EnvelopeKind::Final, &token, wire(Value::Nil), None);
    settle(&[&client]);
    let acks = server.drain();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].envelope.in_reply_to, Some(fin));

    assert_eq!(requester.state(), RequesterState::Commit);
    assert_eq!(requester.results(), vec![Value::from("x"), Value::from("y")]);
    assert_eq!(
        requester.completion().outcome(),
        Outcome::Succeeded(Value::List(vec![Value::from("x"), Value::from("y")]))
    );
    assert!(!client.context().is_busy(&server.address));
    assert_eq!(client.context().active_operations(), (0, 0));
}

#[test]
fn test_requester_error_keeps_partial_results() {
    let harness = Harness::new();
    let client = harness.agent(AgentConfig::new("client"));
    let server = harness.peer("server");

    let requester = client
        .request(server.address.clone(), path("/demo/echo"), Scope::Direct, BTreeMap::new())
        .unwrap();
    settle(&[&client]);
    let init = server.drain().remove(0).envelope;
    let token = init.token.extend().unwrap();
    let client_addr = Address::from("client");
    server.send(&client_addr, EnvelopeKind::Ack, &token, wire(Value::Nil), Some(init.message_id));
    settle(&[&client]);

    server.send(&client_addr, EnvelopeKind::Data, &token, wire("partial"), None);
    let fault = ganglion::codec::Fault::new("DispatchError", "handler exploded");
    server.send(&client_addr, EnvelopeKind::Error, &token, wire(fault.clone()), None);
    settle(&[&client]);

    assert_eq!(requester.state(), RequesterState::Error);
    assert_eq!(requester.results(), vec![Value::from("partial")]);
    assert_eq!(requester.error(), Some(ganglion::error::TaskError::Remote(fault)));
    assert!(!client.context().is_busy(&server.address));
}

#[test]
fn test_nack_after_ack_ends_in_authfail() {
    let harness = Harness::new();
    let client = harness.agent(AgentConfig::new("client"));
    let server = harness.peer("server");

    let requester = client
        .request(server.address.clone(), path("/demo/echo"), Scope::Direct, BTreeMap::new())
        .unwrap();
    settle(&[&client]);
    let init = server.drain().remove(0).envelope;
    let token = init.token.extend().unwrap();
    let client_addr = Address::from("client");
    server.send(&client_addr, EnvelopeKind::Ack, &token, wire(Value::Nil), Some(init.message_id));
    settle(&[&client]);
    assert_eq!(requester.state(), RequesterState::Consume);

    server.send(&client_addr, EnvelopeKind::Nack, &token, wire("client may not run /demo/echo"), None);
    settle(&[&client]);

    assert_eq!(requester.state(), RequesterState::AuthFail);
    assert_eq!(
        requester.error(),
        Some(TaskError::AuthorizationDenied("client may not run /demo/echo".to_string()))
    );
    assert!(matches!(
        requester.completion().outcome(),
        Outcome::Failed(TaskError::AuthorizationDenied(_))
    ));
    assert!(!client.context().is_busy(&server.address));
    assert_eq!(client.context().active_operations(), (0, 0));
}

#[test]
fn test_requester_ignores_strangers() {
    let harness = Harness::new();
    let client = harness.agent(AgentConfig::new("client"));
    let server = harness.peer("server");
    let stranger = harness.peer("stranger");

    let requester = client
        .request(server.address.clone(), path("/demo/echo"), Scope::Direct, BTreeMap::new())
        .unwrap();
    settle(&[&client]);
    let init = server.drain().remove(0).envelope;
    let token = init.token.extend().unwrap();

    stranger.send(&Address::from("client"), EnvelopeKind::Nack, &token, wire("no"), None);
    settle(&[&client]);
    assert_eq!(requester.state(), RequesterState::Ready);
}

#[test]
fn test_responder_streams_then_finalizes_after_acks() {
    let harness = Harness::new();
    let server = harness.agent(AgentConfig::new("server"));
    server.register_fn(path("/demo/echo"), "echo", Vec::new(), |job| {
        job.result("x");
        job.result("y");
        Ok(HandlerOutput::Empty)
    });
    let client = harness.peer("client");

    let job = Job::new(path("/demo/echo"), Scope::Direct, client.address.clone(), server.address().clone());
    let payload = job.to_wire(&Codec::default()).unwrap();
    let init = client.send(server.address(), EnvelopeKind::Init, &job.token, payload, None);
    settle(&[&server]);

    let received = client.drain();
    assert_eq!(
        ScriptedPeer::kinds(&received),
        vec![EnvelopeKind::Ack, EnvelopeKind::Data, EnvelopeKind::Data]
    );
    let ack = &received[0].envelope;
    assert_eq!(ack.in_reply_to, Some(init));
    assert_eq!(ack.token.initiator(), job.token.initiator());
    let token = ack.token.clone();
    assert!(token.is_extended());
    assert_eq!(unwire(&received[1].envelope.payload), Value::from("x"));
    assert_eq!(unwire(&received[2].envelope.payload), Value::from("y"));
    assert_eq!(server.context().active_operations(), (0, 1));

    // Final waits for both data packets to be acknowledged.
    client.ack(server.address(), &token, &received[1].envelope);
    settle(&[&server]);
    assert!(client.drain().is_empty());

    client.ack(server.address(), &token, &received[2].envelope);
    settle(&[&server]);
    let received = client.drain();
    assert_eq!(ScriptedPeer::kinds(&received), vec![EnvelopeKind::Final]);
    assert_eq!(server.context().active_operations(), (0, 1));

    client.ack(server.address(), &token, &received[0].envelope);
    settle(&[&server]);
    assert_eq!(server.context().active_operations(), (0, 0));
    assert!(server.context().packets().is_empty());
}

#[test]
fn test_responder_without_handlers_finalizes_empty() {
    let harness = Harness::new();
    let server = harness.agent(AgentConfig::new("server"));
    let client = harness.peer("client");

    let job = Job::new(path("/nothing/here"), Scope::Direct, client.address.clone(), server.address().clone());
    let payload = job.to_wire(&Codec::default()).unwrap();
    client.send(server.address(), EnvelopeKind::Init, &job.token, payload, None);
    settle(&[&server]);

    let received = client.drain();
    assert_eq!(
        ScriptedPeer::kinds(&received),
        vec![EnvelopeKind::Ack, EnvelopeKind::Final]
    );
}

#[test]
fn test_responder_reports_exhausted_single_scope() {
    let harness = Harness::new();
    let server = harness.agent(AgentConfig::new("server"));
    server.register_fn(path("/demo/fail"), "raises", Vec::new(), |_| {
        Err(DispatchError::new("raises", "boom"))
    });
    let client = harness.peer("client");

    let job = Job::new(path("/demo/fail"), Scope::Single, client.address.clone(), server.address().clone());
    let payload = job.to_wire(&Codec::default()).unwrap();
    client.send(server.address(), EnvelopeKind::Init, &job.token, payload, None);
    settle(&[&server]);

    let received = client.drain();
    assert_eq!(
        ScriptedPeer::kinds(&received),
        vec![EnvelopeKind::Ack, EnvelopeKind::Error]
    );
    match unwire(&received[1].envelope.payload) {
        Value::Fault(fault) => {
            assert_eq!(fault.class, "DispatchError");
            assert!(fault.message.contains("boom"));
        }
        other => panic!("expected a fault, got {:?}", other),
    }
    assert_eq!(server.context().active_operations(), (0, 0));
}

#[test]
fn test_responder_sends_sibling_results_before_handler_fault() {
    let harness = Harness::new();
    let server = harness.agent(AgentConfig::new("server"));
    server.register_fn(path("/demo/sum"), "one", Vec::new(), |_| Ok(Value::from(1).into()));
    server.register_fn(path("/demo/sum"), "broken", Vec::new(), |_| {
        Err(DispatchError::new("broken", "nope"))
    });
    let client = harness.peer("client");

    let job = Job::new(path("/demo/sum"), Scope::All, client.address.clone(), server.address().clone());
    let payload = job.to_wire(&Codec::default()).unwrap();
    client.send(server.address(), EnvelopeKind::Init, &job.token, payload, None);
    settle(&[&server]);

    let received = client.drain();
    assert_eq!(
        ScriptedPeer::kinds(&received),
        vec![EnvelopeKind::Ack, EnvelopeKind::Data, EnvelopeKind::Error]
    );
    assert_eq!(unwire(&received[1].envelope.payload), Value::from(1));
    match unwire(&received[2].envelope.payload) {
        Value::Fault(fault) => {
            assert_eq!(fault.class, "DispatchError");
            assert!(fault.message.contains("nope"));
        }
        other => panic!("expected a fault, got {:?}", other),
    }
    assert_eq!(server.context().active_operations(), (0, 0));
    assert!(server.context().packets().is_empty());
}
