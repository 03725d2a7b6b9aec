use crate::support::{path, settle, Harness};
use ganglion::codec::Value;
use ganglion::config::AgentConfig;
use ganglion::dispatch::{HandlerOutput, Scope};
use ganglion::error::{DispatchError, TaskError, TransportError};
use ganglion::protocol::RequesterState;
use ganglion::scheduler::{Outcome, Synapse, Verdict, RESULTS};
use std::cell::Cell;
use std::collections::BTreeMap;
use std::rc::Rc;

#[test]
fn test_round_trip_between_agents() {
    let harness = Harness::new();
    let client = harness.agent(AgentConfig::new("client"));
    let server = harness.agent(AgentConfig::new("server"));
    server.register_fn(path("/demo/echo"), "echo", Vec::new(), |job| {
        let text = job.get("message").and_then(Value::as_str).unwrap_or_default().to_string();
        job.result(text.clone());
        Ok(Value::from(text.to_uppercase()).into())
    });

    let mut args = BTreeMap::new();
    args.insert("message".to_string(), Value::from("hi"));
    let requester = client
        .request(server.address().clone(), path("/demo/echo"), Scope::Direct, args)
        .unwrap();
    settle(&[&client, &server]);

    assert_eq!(requester.state(), RequesterState::Commit);
    assert_eq!(requester.results(), vec![Value::from("hi"), Value::from("HI")]);
    assert_eq!(client.context().active_operations(), (0, 0));
    assert_eq!(server.context().active_operations(), (0, 0));
    assert!(client.context().packets().is_empty());
    assert!(server.context().packets().is_empty());
}

#[test]
fn test_single_scope_yields_surviving_answer() {
    let harness = Harness::new();
    let client = harness.agent(AgentConfig::new("client"));
    let server = harness.agent(AgentConfig::new("server"));
    server.register_fn(path("/demo/answer"), "raises", Vec::new(), |_| {
        Err(DispatchError::new("raises", "no answer here"))
    });
    server.register_fn(path("/demo/answer"), "answers", Vec::new(), |_| {
        Ok(Value::from(42).into())
    });

    let requester = client
        .request(server.address().clone(), path("/demo/answer"), Scope::Single, BTreeMap::new())
        .unwrap();
    settle(&[&client, &server]);

    assert_eq!(requester.state(), RequesterState::Commit);
    assert_eq!(requester.results(), vec![Value::from(42)]);
}

#[test]
fn test_all_scope_handler_failure_reaches_requester() {
    let harness = Harness::new();
    let client = harness.agent(AgentConfig::new("client"));
    let server = harness.agent(AgentConfig::new("server"));
    server.register_fn(path("/demo/sum"), "one", Vec::new(), |_| Ok(Value::from(1).into()));
    server.register_fn(path("/demo/sum"), "broken", Vec::new(), |_| {
        Err(DispatchError::new("broken", "nope"))
    });
    server.register_fn(path("/demo/sum"), "two", Vec::new(), |_| Ok(Value::from(2).into()));

    let requester = client
        .request(server.address().clone(), path("/demo/sum"), Scope::All, BTreeMap::new())
        .unwrap();
    settle(&[&client, &server]);

    assert_eq!(requester.state(), RequesterState::Error);
    assert_eq!(requester.results(), vec![Value::from(1), Value::from(2)]);
    match requester.error() {
        Some(TaskError::Remote(fault)) => {
            assert_eq!(fault.class, "DispatchError");
            assert!(fault.message.contains("nope"));
        }
        other => panic!("expected a remote fault, got {:?}", other),
    }
    assert!(matches!(requester.completion().outcome(), Outcome::Failed(TaskError::Remote(_))));
    assert!(!client.context().is_busy(server.address()));
    assert_eq!(server.context().active_operations(), (0, 0));
}

#[test]
fn test_single_scope_discards_fragments_of_failed_attempt() {
    let harness = Harness::new();
    let client = harness.agent(AgentConfig::new("client"));
    let server = harness.agent(AgentConfig::new("server"));
    server.register_fn(path("/demo/answer"), "half-done", Vec::new(), |job| {
        job.result("partial");
        Err(DispatchError::new("half-done", "gave up"))
    });
    server.register_fn(path("/demo/answer"), "answers", Vec::new(), |job| {
        job.result("working");
        Ok(Value::from(42).into())
    });

    let requester = client
        .request(server.address().clone(), path("/demo/answer"), Scope::Single, BTreeMap::new())
        .unwrap();
    settle(&[&client, &server]);

    assert_eq!(requester.state(), RequesterState::Commit);
    assert_eq!(requester.results(), vec![Value::from("working"), Value::from(42)]);
}

#[test]
fn test_completion_settles_after_caller_drops_requester() {
    let harness = Harness::new();
    let client = harness.agent(AgentConfig::new("client"));
    let server = harness.agent(AgentConfig::new("server"));
    server.register_fn(path("/demo/answer"), "answers", Vec::new(), |_| Ok(Value::from(42).into()));

    let completion = client
        .request(server.address().clone(), path("/demo/answer"), Scope::Direct, BTreeMap::new())
        .unwrap()
        .completion();
    settle(&[&client, &server]);

    assert_eq!(completion.outcome(), Outcome::Succeeded(Value::List(vec![Value::from(42)])));
    assert_eq!(client.context().active_operations(), (0, 0));
}

#[test]
fn test_deferred_handler_completes_later() {
    let harness = Harness::new();
    let client = harness.agent(AgentConfig::new("client"));
    let server = harness.agent(AgentConfig::new("server"));
    let ready = Rc::new(Cell::new(false));
    let gate = Rc::clone(&ready);
    let pending = Synapse::new("slow-work").when(move |task: &Synapse| {
        if gate.get() {
            task.set(RESULTS, Value::from("done"));
            Verdict::Succeed
        } else {
            Verdict::Defer
        }
    });
    server.register_fn(path("/demo/slow"), "slow", Vec::new(), move |_| {
        Ok(HandlerOutput::Deferred(pending.clone()))
    });

    let requester = client
        .request(server.address().clone(), path("/demo/slow"), Scope::Direct, BTreeMap::new())
        .unwrap();
    settle(&[&client, &server]);
    assert_eq!(requester.state(), RequesterState::Consume);

    ready.set(true);
    settle(&[&client, &server]);
    assert_eq!(requester.state(), RequesterState::Commit);
    assert_eq!(requester.results(), vec![Value::from("done")]);
}

#[test]
fn test_unreachable_target_fails_requester() {
    let harness = Harness::new();
    let client = harness.agent(AgentConfig::new("client"));

    let requester = client
        .request("nobody".into(), path("/demo/echo"), Scope::Direct, BTreeMap::new())
        .unwrap();
    settle(&[&client]);

    assert_eq!(requester.state(), RequesterState::Error);
    assert_eq!(
        requester.error(),
        Some(TaskError::Transport(TransportError::Unreachable("nobody".to_string())))
    );
    assert!(matches!(requester.completion().outcome(), Outcome::Failed(TaskError::Transport(_))));
    assert!(!client.context().is_busy(&"nobody".into()));
}
