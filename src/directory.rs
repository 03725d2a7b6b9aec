//! Directory service.
//!
//! The directory is an ordinary agent whose capabilities read and write an
//! [`AdvertCache`]: `/advertise`, `/discover` and `/authorize`.

use crate::advert::AdvertCache;
use crate::clock::Clock;
use crate::codec::Value;
use crate::dispatch::{Dispatcher, HandlerOutput, Job};
use crate::error::DispatchError;
use crate::protocol::{authorize_operation, AUTHORIZED, NOT_AUTHORIZED};
use crate::resource::ResourcePath;
use crate::types::Address;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, info};

pub fn advertise_operation() -> ResourcePath {
    ResourcePath::from_static(&["advertise"])
}

pub fn discover_operation() -> ResourcePath {
    ResourcePath::from_static(&["discover"])
}

/// One access rule. `requester: None` matches everyone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRule {
    #[serde(default)]
    pub requester: Option<Address>,
    pub resource: ResourcePath,
    pub allow: bool,
}

impl AccessRule {
    pub fn allow(requester: Option<Address>, resource: ResourcePath) -> Self {
        Self {
            requester,
            resource,
            allow: true,
        }
    }

    pub fn deny(requester: Option<Address>, resource: ResourcePath) -> Self {
        Self {
            requester,
            resource,
            allow: false,
        }
    }

    fn matches(&self, requester: &Address, resource: &ResourcePath) -> bool {
        self.requester.as_ref().map_or(true, |r| r == requester) && self.resource.provides(resource)
    }
}

/// Who may run what
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AccessPolicy {
    #[default]
    AllowAll,
    /// Ordered rules; the first rule matching a resource decides it and
    /// unmatched resources are denied.
    Rules { rules: Vec<AccessRule> },
}

impl AccessPolicy {
    pub fn permits(&self, requester: &Address, resources: &[ResourcePath]) -> bool {
        match self {
            AccessPolicy::AllowAll => true,
            AccessPolicy::Rules { rules } => resources.iter().all(|resource| {
                rules
                    .iter()
                    .find(|rule| rule.matches(requester, resource))
                    .is_some_and(|rule| rule.allow)
            }),
        }
    }
}

pub struct Directory {
    cache: Rc<RefCell<AdvertCache>>,
    policy: Rc<AccessPolicy>,
}

impl Directory {
    pub fn new(clock: Rc<dyn Clock>, policy: AccessPolicy) -> Self {
        Self {
            cache: Rc::new(RefCell::new(AdvertCache::new(clock))),
            policy: Rc::new(policy),
        }
    }

    pub fn cache(&self) -> Rc<RefCell<AdvertCache>> {
        Rc::clone(&self.cache)
    }

    /// Register the directory capabilities on `dispatcher`.
    pub fn install(&self, dispatcher: &mut Dispatcher) {
        let cache = Rc::clone(&self.cache);
        dispatcher.register_fn(
            advertise_operation(),
            "directory.advertise",
            vec![ResourcePath::root()],
            move |job| {
                let resources = resource_list(job, "resources", "directory.advertise")?;
                let ttl = job
                    .get("ttl")
                    .and_then(Value::as_int)
                    .filter(|ttl| *ttl >= 0)
                    .ok_or_else(|| {
                        DispatchError::new("directory.advertise", "'ttl' must be a non-negative integer")
                    })?;
                let mut cache = cache.borrow_mut();
                for resource in &resources {
                    cache.advertise(
                        resource.clone(),
                        job.origin.clone(),
                        Duration::from_secs(ttl as u64),
                    );
                }
                info!(advertiser = %job.origin, resources = resources.len(), ttl, "Advertised");
                Ok(Value::Bool(true).into())
            },
        );

        let cache = Rc::clone(&self.cache);
        dispatcher.register_fn(
            discover_operation(),
            "directory.discover",
            vec![ResourcePath::root()],
            move |job| {
                let resources = resource_list(job, "resources", "directory.discover")?;
                let found = cache.borrow().discover_all(&resources);
                debug!(requester = %job.origin, matches = found.len(), "Discovery");
                let addresses = found
                    .into_iter()
                    .map(|address| Value::from(address.as_str()))
                    .collect::<Vec<_>>();
                let mut answer = BTreeMap::new();
                answer.insert("addresses".to_string(), Value::List(addresses));
                Ok(HandlerOutput::Value(Value::Struct(answer)))
            },
        );

        let policy = Rc::clone(&self.policy);
        dispatcher.register_fn(
            authorize_operation(),
            "directory.authorize",
            vec![ResourcePath::root()],
            move |job| {
                let requester = job
                    .get("requester")
                    .and_then(Value::as_str)
                    .map(Address::from)
                    .ok_or_else(|| DispatchError::new("directory.authorize", "missing 'requester'"))?;
                let mut resources = resource_list(job, "resources", "directory.authorize")?;
                if let Some(operation) = job.get("operation").and_then(Value::as_resource) {
                    resources.insert(0, operation.clone());
                }
                let granted = policy.permits(&requester, &resources);
                debug!(requester = %requester, granted, "Authorization decided");
                let answer = if granted { AUTHORIZED } else { NOT_AUTHORIZED };
                Ok(Value::from(answer).into())
            },
        );
    }
}

/// Resource paths under `key`, given as resource values or path strings.
fn resource_list(job: &Job, key: &str, capability: &str) -> Result<Vec<ResourcePath>, DispatchError> {
    let Some(value) = job.get(key) else {
        return Ok(Vec::new());
    };
    let items = match value {
        Value::List(items) => items.as_slice(),
        single => std::slice::from_ref(single),
    };
    items
        .iter()
        .map(|item| match item {
            Value::Resource(path) => Ok(path.clone()),
            Value::String(text) => ResourcePath::parse(text)
                .map_err(|e| DispatchError::new(capability, e.to_string())),
            other => Err(DispatchError::new(
                capability,
                format!("'{}' entries must be resource paths, got {:?}", key, other),
            )),
        })
        .collect()
}
