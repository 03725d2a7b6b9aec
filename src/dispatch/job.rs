//! Operations as seen by capability handlers.

use crate::codec::{Codec, Value, WireTree};
use crate::error::CodecError;
use crate::resource::ResourcePath;
use crate::token::Token;
use crate::types::Address;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;

/// How many handlers an operation should reach
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// One handler (or target), picked at random, retried on failure
    Single,
    /// Every matching handler (or target)
    All,
    /// Every matching handler of one named target
    Direct,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Single => "single",
            Scope::All => "all",
            Scope::Direct => "direct",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(Scope::Single),
            "all" => Ok(Scope::All),
            "direct" => Ok(Scope::Direct),
            other => Err(format!("Unknown scope '{}' (expected single, all or direct)", other)),
        }
    }
}

/// Sink for streamed result fragments
pub type Emitter = Rc<dyn Fn(Value)>;

/// One operation: what to do, on whose behalf, with which arguments.
#[derive(Clone)]
pub struct Job {
    pub kind: ResourcePath,
    pub token: Token,
    pub scope: Scope,
    pub origin: Address,
    pub target: Address,
    pub args: BTreeMap<String, Value>,
    emitter: Option<Emitter>,
    fragments: Rc<RefCell<Vec<Value>>>,
}

impl Job {
    pub fn new(kind: ResourcePath, scope: Scope, origin: Address, target: Address) -> Self {
        Self {
            kind,
            token: Token::mint(),
            scope,
            origin,
            target,
            args: BTreeMap::new(),
            emitter: None,
            fragments: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn with_token(mut self, token: Token) -> Self {
        self.token = token;
        self
    }

    pub fn with_args(mut self, args: BTreeMap<String, Value>) -> Self {
        self.args = args;
        self
    }

    pub fn arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.args.get(key)
    }

    /// Every resource path mentioned in the arguments.
    pub fn resources(&self) -> Vec<ResourcePath> {
        self.args.values().flat_map(Value::resources).collect()
    }

    /// Route streamed fragments to `emitter` instead of buffering them.
    pub fn with_emitter(mut self, emitter: Emitter) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// Stream one result fragment ahead of the handler's return value.
    pub fn result(&self, value: impl Into<Value>) {
        let value = value.into();
        match &self.emitter {
            Some(emit) => emit(value),
            None => self.fragments.borrow_mut().push(value),
        }
    }

    /// Copy of this job with its own fragment buffer.
    pub(crate) fn for_handler(&self) -> Job {
        Job {
            fragments: Rc::new(RefCell::new(Vec::new())),
            ..self.clone()
        }
    }

    /// Copy of this job that buffers fragments even when the original streams.
    pub(crate) fn buffered(&self) -> Job {
        Job {
            emitter: None,
            ..self.for_handler()
        }
    }

    pub(crate) fn take_fragments(&self) -> Vec<Value> {
        std::mem::take(&mut *self.fragments.borrow_mut())
    }

    pub fn to_wire(&self, codec: &Codec) -> Result<WireTree, CodecError> {
        let mut fields = BTreeMap::new();
        fields.insert("type".to_string(), Value::Resource(self.kind.clone()));
        fields.insert("scope".to_string(), Value::from(self.scope.as_str()));
        fields.insert("origin".to_string(), Value::from(self.origin.as_str()));
        fields.insert("target".to_string(), Value::from(self.target.as_str()));
        fields.insert("args".to_string(), Value::Struct(self.args.clone()));
        codec.encode_struct(&fields)
    }

    pub fn from_wire(codec: &Codec, token: Token, tree: &WireTree) -> Result<Job, CodecError> {
        let mut fields = codec.decode_struct(tree)?;
        let missing = |field: &str| CodecError::Format(format!("job is missing '{}'", field));

        let kind = match fields.remove("type") {
            Some(Value::Resource(path)) => path,
            Some(Value::String(text)) => ResourcePath::parse(&text)?,
            _ => return Err(missing("type")),
        };
        let text_field = |fields: &mut BTreeMap<String, Value>, name: &str| match fields.remove(name) {
            Some(Value::String(text)) => Ok(text),
            _ => Err(missing(name)),
        };
        let scope = text_field(&mut fields, "scope")?
            .parse::<Scope>()
            .map_err(CodecError::Format)?;
        let origin = Address::from(text_field(&mut fields, "origin")?);
        let target = Address::from(text_field(&mut fields, "target")?);
        let args = match fields.remove("args") {
            Some(Value::Struct(args)) => args,
            None | Some(Value::Nil) => BTreeMap::new(),
            Some(_) => return Err(CodecError::Format("job 'args' must be a struct".to_string())),
        };

        Ok(Job {
            kind,
            token,
            scope,
            origin,
            target,
            args,
            emitter: None,
            fragments: Rc::new(RefCell::new(Vec::new())),
        })
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("kind", &self.kind)
            .field("token", &self.token)
            .field("scope", &self.scope)
            .field("origin", &self.origin)
            .field("target", &self.target)
            .field("args", &self.args)
            .field("streaming", &self.emitter.is_some())
            .finish()
    }
}
