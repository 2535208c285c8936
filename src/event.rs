//! Event objects and event-descriptor pattern matching.
//!
//! Events carry a dotted, hierarchical name (`done.invoke.loader`,
//! `error.communication.timeout`). Transitions list *descriptors* that match
//! against those names by token prefix: the descriptor `error.communication`
//! matches `error.communication.timeout` but not `error.execution`, and `*`
//! matches everything. Longest-prefix matches are the most specific and win
//! transition selection.
//!
//! # Examples
//!
//! ```rust
//! use harelite::event::EventDescriptor;
//!
//! let desc = EventDescriptor::parse("error.communication");
//! assert!(desc.matches("error.communication.timeout"));
//! assert!(!desc.matches("error.execution"));
//! assert_eq!(desc.specificity(), 2);
//!
//! let any = EventDescriptor::parse("*");
//! assert!(any.matches("anything.at.all"));
//! assert_eq!(any.specificity(), 0);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::datamodel::DataModelValue;

/// Reserved origin type for events raised by the interpreter itself.
pub const ORIGIN_TYPE_PLATFORM: &str = "platform";

/// Origin type recorded on events posted by completed invocations.
pub const ORIGIN_TYPE_INVOKE: &str = "invoke";

/// A structured event, internal or external.
///
/// The `name` is a dotted path matched against transition descriptors.
/// `origin`/`origin_type` identify which invocation or external processor
/// produced the event; `send_id` correlates replies to `<send>` requests;
/// `invoke_id` is set on invoke-related events so that late completions from
/// cancelled invocations can be discarded by id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventObject {
    /// Dotted, hierarchical event name.
    pub name: String,
    /// Payload attached to the event.
    #[serde(default)]
    pub data: DataModelValue,
    /// Identifier of the producer (invoke id or processor address).
    #[serde(default)]
    pub origin: Option<String>,
    /// Kind of producer: [`ORIGIN_TYPE_PLATFORM`], [`ORIGIN_TYPE_INVOKE`], or
    /// an external processor discriminator.
    #[serde(default)]
    pub origin_type: Option<String>,
    /// Correlation id of the `<send>` that produced this event, if any.
    #[serde(default)]
    pub send_id: Option<String>,
    /// Invocation this event belongs to, for invoke-related events.
    #[serde(default)]
    pub invoke_id: Option<String>,
}

impl EventObject {
    /// Create a bare external event with the given name and payload.
    pub fn new(name: impl Into<String>, data: DataModelValue) -> Self {
        Self {
            name: name.into(),
            data,
            origin: None,
            origin_type: None,
            send_id: None,
            invoke_id: None,
        }
    }

    /// Create an event with no payload.
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, DataModelValue::Undefined)
    }

    /// Platform event raised when guard or executable-content evaluation
    /// fails. Consumed by ordinary transition selection so charts can define
    /// their own error handling.
    pub fn error_execution(message: impl Into<String>) -> Self {
        Self {
            name: "error.execution".to_string(),
            data: DataModelValue::object([(
                "message",
                DataModelValue::String(message.into()),
            )]),
            origin: None,
            origin_type: Some(ORIGIN_TYPE_PLATFORM.to_string()),
            send_id: None,
            invoke_id: None,
        }
    }

    /// Platform event raised when an invocation or transport operation fails.
    pub fn error_communication(invoke_id: impl Into<String>, message: impl Into<String>) -> Self {
        let invoke_id = invoke_id.into();
        Self {
            name: "error.communication".to_string(),
            data: DataModelValue::object([(
                "message",
                DataModelValue::String(message.into()),
            )]),
            origin: Some(invoke_id.clone()),
            origin_type: Some(ORIGIN_TYPE_INVOKE.to_string()),
            send_id: None,
            invoke_id: Some(invoke_id),
        }
    }

    /// `done.state.<id>` event raised when a compound or parallel state
    /// completes.
    pub fn done_state(state_doc_id: &str, data: DataModelValue) -> Self {
        Self {
            name: format!("done.state.{state_doc_id}"),
            data,
            origin: None,
            origin_type: Some(ORIGIN_TYPE_PLATFORM.to_string()),
            send_id: None,
            invoke_id: None,
        }
    }

    /// `done.invoke.<id>` event posted when an invocation completes
    /// successfully.
    pub fn done_invoke(invoke_id: impl Into<String>, data: DataModelValue) -> Self {
        let invoke_id = invoke_id.into();
        Self {
            name: format!("done.invoke.{invoke_id}"),
            data,
            origin: Some(invoke_id.clone()),
            origin_type: Some(ORIGIN_TYPE_INVOKE.to_string()),
            send_id: None,
            invoke_id: Some(invoke_id),
        }
    }

    /// Attach a send-id correlation to this event.
    #[must_use]
    pub fn with_send_id(mut self, send_id: impl Into<String>) -> Self {
        self.send_id = Some(send_id.into());
        self
    }
}

impl fmt::Display for EventObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// A transition's event pattern, matched by dotted-token prefix.
///
/// `EventDescriptor` serializes as its source string so persisted models stay
/// human-readable.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EventDescriptor {
    tokens: Vec<String>,
    wildcard: bool,
}

impl EventDescriptor {
    /// Parse a descriptor string.
    ///
    /// `"*"` is the universal wildcard. A trailing `.*` or `.` is accepted and
    /// equivalent to the bare prefix (`"error.*"` matches the same events as
    /// `"error"`).
    #[must_use]
    pub fn parse(descriptor: &str) -> Self {
        let trimmed = descriptor.trim().trim_end_matches(".*").trim_end_matches('.');
        if trimmed.is_empty() || trimmed == "*" {
            return Self {
                tokens: Vec::new(),
                wildcard: true,
            };
        }
        Self {
            tokens: trimmed.split('.').map(str::to_string).collect(),
            wildcard: false,
        }
    }

    /// Returns `true` if this descriptor matches the given event name.
    ///
    /// A descriptor matches when its tokens are a prefix of the event name's
    /// tokens: `"error"` matches `"error.communication.timeout"`, but
    /// `"error.execution"` does not.
    #[must_use]
    pub fn matches(&self, event_name: &str) -> bool {
        if self.wildcard {
            return true;
        }
        let mut event_tokens = event_name.split('.');
        for token in &self.tokens {
            match event_tokens.next() {
                Some(t) if t == token => {}
                _ => return false,
            }
        }
        true
    }

    /// Number of tokens in the descriptor; the wildcard has specificity 0.
    ///
    /// Used for the longest-prefix-wins rule during transition selection.
    #[must_use]
    pub fn specificity(&self) -> usize {
        self.tokens.len()
    }
}

impl fmt::Display for EventDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.wildcard {
            write!(f, "*")
        } else {
            write!(f, "{}", self.tokens.join("."))
        }
    }
}

impl Serialize for EventDescriptor {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for EventDescriptor {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::parse(&s))
    }
}

impl From<&str> for EventDescriptor {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}
