use crate::support::{path, settle, Harness};
use ganglion::agent::Agent;
use ganglion::codec::Value;
use ganglion::config::AgentConfig;
use ganglion::directory::AccessPolicy;
use ganglion::dispatch::Scope;
use ganglion::error::AgentError;
use ganglion::protocol::RequesterState;
use ganglion::scheduler::{Outcome, Synapse};
use std::collections::BTreeMap;
use std::time::Duration;

fn member(harness: &Harness, address: &str) -> Agent {
    harness.agent(AgentConfig::new(address).with_directory("directory"))
}

fn succeeded(task: &Synapse) -> Value {
    match task.outcome() {
        Outcome::Succeeded(value) => value,
        other => panic!("{} did not succeed: {:?}", task.label(), other),
    }
}

fn strings(value: Value) -> Vec<String> {
    let mut items: Vec<String> = value
        .into_items()
        .into_iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    items.sort();
    items
}

#[test]
fn test_advertise_then_discover_until_expiry() {
    let harness = Harness::new();
    let directory = harness.agent(AgentConfig::new("directory"));
    directory.serve_directory(AccessPolicy::AllowAll);
    let worker = member(&harness, "worker");
    let client = member(&harness, "client");
    let agents = [&directory, &worker, &client];

    let advert = worker.advertise(&[path("/demo/echo")], Duration::from_secs(60)).unwrap();
    settle(&agents);
    assert_eq!(advert.state(), RequesterState::Commit);
    assert_eq!(advert.results(), vec![Value::Bool(true)]);

    // Discovery matches in both directions along the path.
    for query in ["/demo", "/demo/echo", "/demo/echo/loud"] {
        let found = client.discover(&[path(query)]).unwrap();
        settle(&agents);
        assert_eq!(strings(succeeded(&found)), vec!["worker"], "query {}", query);
    }

    let found = client.discover(&[path("/other")]).unwrap();
    settle(&agents);
    assert!(strings(succeeded(&found)).is_empty());

    harness.clock.advance(Duration::from_secs(61));
    let found = client.discover(&[path("/demo")]).unwrap();
    settle(&agents);
    assert!(strings(succeeded(&found)).is_empty());
}

#[test]
fn test_zero_ttl_withdraws() {
    let harness = Harness::new();
    let directory = harness.agent(AgentConfig::new("directory"));
    directory.serve_directory(AccessPolicy::AllowAll);
    let worker = member(&harness, "worker");
    let client = member(&harness, "client");
    let agents = [&directory, &worker, &client];

    worker.advertise(&[path("/demo/echo")], Duration::from_secs(60)).unwrap();
    settle(&agents);
    worker.advertise(&[path("/demo/echo")], Duration::ZERO).unwrap();
    settle(&agents);

    let found = client.discover(&[path("/demo")]).unwrap();
    settle(&agents);
    assert!(strings(succeeded(&found)).is_empty());
}

#[test]
fn test_sub_second_ttl_rounds_up() {
    let harness = Harness::new();
    let directory = harness.agent(AgentConfig::new("directory"));
    let cache = directory.serve_directory(AccessPolicy::AllowAll).cache();
    let worker = member(&harness, "worker");
    let agents = [&directory, &worker];

    let advert = worker.advertise(&[path("/demo/echo")], Duration::from_millis(500)).unwrap();
    settle(&agents);
    assert_eq!(advert.state(), RequesterState::Commit);
    assert_eq!(cache.borrow().discover(&path("/demo")).len(), 1);

    harness.clock.advance(Duration::from_secs(2));
    assert!(cache.borrow().discover(&path("/demo")).is_empty());
}

#[test]
fn test_discover_requires_every_resource() {
    let harness = Harness::new();
    let directory = harness.agent(AgentConfig::new("directory"));
    directory.serve_directory(AccessPolicy::AllowAll);
    let both = member(&harness, "both");
    let one = member(&harness, "one");
    let client = member(&harness, "client");
    let agents = [&directory, &both, &one, &client];

    both.advertise(&[path("/demo/echo"), path("/disk/a")], Duration::from_secs(60)).unwrap();
    one.advertise(&[path("/demo/echo")], Duration::from_secs(60)).unwrap();
    settle(&agents);

    let found = client.discover(&[path("/demo/echo"), path("/disk/a")]).unwrap();
    settle(&agents);
    assert_eq!(strings(succeeded(&found)), vec!["both"]);

    let found = client.discover(&[path("/demo/echo")]).unwrap();
    settle(&agents);
    assert_eq!(strings(succeeded(&found)), vec!["both", "one"]);
}

#[test]
fn test_perform_fans_out_to_providers() {
    let harness = Harness::new();
    let directory = harness.agent(AgentConfig::new("directory"));
    directory.serve_directory(AccessPolicy::AllowAll);
    let workers: Vec<Agent> = ["w1", "w2", "w3"].iter().map(|name| member(&harness, name)).collect();
    for worker in &workers {
        let name = worker.address().to_string();
        worker.register_fn(path("/demo/echo"), "echo", Vec::new(), move |_| {
            Ok(Value::from(name.as_str()).into())
        });
    }
    let client = member(&harness, "client");
    let mut agents: Vec<&Agent> = vec![&directory, &client];
    agents.extend(workers.iter());

    for worker in &workers {
        worker.advertise_capabilities(Duration::from_secs(60)).unwrap();
    }
    settle(&agents);

    let everyone = client.perform(path("/demo/echo"), Scope::All, BTreeMap::new()).unwrap();
    settle(&agents);
    assert_eq!(strings(succeeded(&everyone)), vec!["w1", "w2", "w3"]);

    let anyone = client.perform(path("/demo/echo"), Scope::Single, BTreeMap::new()).unwrap();
    settle(&agents);
    let picked = strings(succeeded(&anyone));
    assert_eq!(picked.len(), 1);
    assert!(["w1", "w2", "w3"].contains(&picked[0].as_str()));
}

#[test]
fn test_perform_without_providers_is_empty() {
    let harness = Harness::new();
    let directory = harness.agent(AgentConfig::new("directory"));
    directory.serve_directory(AccessPolicy::AllowAll);
    let client = member(&harness, "client");
    let agents = [&directory, &client];

    let task = client.perform(path("/demo/echo"), Scope::All, BTreeMap::new()).unwrap();
    settle(&agents);
    assert_eq!(succeeded(&task), Value::List(Vec::new()));
}

#[test]
fn test_keep_advertised_refreshes_until_stopped() {
    let harness = Harness::new();
    let directory = harness.agent(AgentConfig::new("directory"));
    let cache = directory.serve_directory(AccessPolicy::AllowAll).cache();
    let worker = member(&harness, "worker");
    let agents = [&directory, &worker];
    let demo = path("/demo");

    let handle = worker
        .keep_advertised(vec![path("/demo/echo")], Duration::from_secs(10))
        .unwrap();
    settle(&agents);
    assert!(handle.is_active());
    assert_eq!(cache.borrow().discover(&demo).len(), 1);

    // Past the first refresh point and the original expiry.
    harness.clock.advance(Duration::from_secs(6));
    settle(&agents);
    harness.clock.advance(Duration::from_secs(6));
    settle(&agents);
    assert_eq!(cache.borrow().discover(&demo).len(), 1);

    handle.stop();
    harness.clock.advance(Duration::from_secs(11));
    settle(&agents);
    assert!(cache.borrow().discover(&demo).is_empty());
}

#[test]
fn test_directory_operations_need_a_directory() {
    let harness = Harness::new();
    let loner = harness.agent(AgentConfig::new("loner"));

    assert!(matches!(
        loner.discover(&[path("/demo")]),
        Err(AgentError::ConfigError(_))
    ));
    assert!(matches!(
        loner.advertise(&[path("/demo")], Duration::from_secs(1)),
        Err(AgentError::ConfigError(_))
    ));
}
