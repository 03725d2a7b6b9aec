//! Correlation tokens.
//!
//! The initiator mints the first half when it announces an operation. The
//! first responder extends it with its own half, giving `initiator:responder`.
//! Extension happens once; a second attempt is an error.

use crate::error::TokenError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

const DELIMITER: char = ':';

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InitiatorToken(String);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResponderToken(String);

impl InitiatorToken {
    pub fn mint() -> Self {
        InitiatorToken(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl ResponderToken {
    pub fn mint() -> Self {
        ResponderToken(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InitiatorToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Two-phase correlation identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Token {
    initiator: InitiatorToken,
    responder: Option<ResponderToken>,
}

impl Token {
    /// Fresh token for a new outbound operation.
    pub fn mint() -> Self {
        Self {
            initiator: InitiatorToken::mint(),
            responder: None,
        }
    }

    pub fn initiator(&self) -> &InitiatorToken {
        &self.initiator
    }

    pub fn responder(&self) -> Option<&ResponderToken> {
        self.responder.as_ref()
    }

    pub fn is_extended(&self) -> bool {
        self.responder.is_some()
    }

    /// Extend with a freshly minted responder half.
    pub fn extend(&self) -> Result<Token, TokenError> {
        self.extend_with(ResponderToken::mint())
    }

    /// Extend with a given responder half.
    pub fn extend_with(&self, responder: ResponderToken) -> Result<Token, TokenError> {
        if self.responder.is_some() {
            return Err(TokenError::AlreadyExtended(self.to_string()));
        }
        Ok(Token {
            initiator: self.initiator.clone(),
            responder: Some(responder),
        })
    }

    /// The unextended token naming the same operation.
    pub fn initiator_only(&self) -> Token {
        Token {
            initiator: self.initiator.clone(),
            responder: None,
        }
    }

    pub fn parse(text: &str) -> Result<Self, TokenError> {
        let malformed = || TokenError::Malformed(text.to_string());
        let (initiator, responder) = match text.split_once(DELIMITER) {
            Some((initiator, responder)) => (initiator, Some(responder)),
            None => (text, None),
        };
        if initiator.is_empty() {
            return Err(malformed());
        }
        let responder = match responder {
            Some(r) if r.is_empty() || r.contains(DELIMITER) => return Err(malformed()),
            Some(r) => Some(ResponderToken(r.to_string())),
            None => None,
        };
        Ok(Token {
            initiator: InitiatorToken(initiator.to_string()),
            responder,
        })
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.responder {
            Some(responder) => write!(f, "{}{}{}", self.initiator.0, DELIMITER, responder.0),
            None => f.write_str(&self.initiator.0),
        }
    }
}

impl FromStr for Token {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Token {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Token {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(serde::de::Error::custom)
    }
}
