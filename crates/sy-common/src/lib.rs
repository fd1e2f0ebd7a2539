//! Switchyard shared types
//!
//! - `Message`: the unit routed through multicast, redelivery and storage
//! - `Failure`: cloneable delivery failure carried on messages and returned by destinations
//! - `headers`: well-known header names set by the routing core
//! - `logging`: tracing subscriber setup

pub mod logging;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Header Names
// ============================================================================

pub mod headers {
    /// Set on every failed delivery attempt: `false` on the first attempt, `true` afterwards
    pub const REDELIVERED: &str = "Switchyard.Redelivered";
    /// Number of redeliveries performed so far (0-based)
    pub const REDELIVERY_COUNTER: &str = "Switchyard.RedeliveryCounter";
    /// Set when a dead letter channel handled the failure
    pub const FAILURE_HANDLED: &str = "Switchyard.FailureHandled";
    /// Description of the failure caught by a dead letter channel
    pub const EXCEPTION_CAUGHT: &str = "Switchyard.ExceptionCaught";
    /// Position of the branch in the multicast destination list
    pub const MULTICAST_INDEX: &str = "Switchyard.MulticastIndex";
}

// ============================================================================
// Core Message Types
// ============================================================================

/// The core message structure that flows through the system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub body: Value,
    #[serde(default)]
    pub headers: HashMap<String, Value>,
    #[serde(default)]
    pub failure: Option<Failure>,
    #[serde(default)]
    pub redelivery_counter: u32,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(body: impl Into<Value>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            body: body.into(),
            headers: HashMap::new(),
            failure: None,
            redelivery_counter: 0,
            created_at: Utc::now(),
        }
    }

    /// Copy used for a fan-out branch. Keeps the id so branches correlate to the inbound message.
    pub fn copy_for_branch(&self) -> Self {
        self.clone()
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_header(name, value);
        self
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.headers.insert(name.into(), value.into());
    }

    pub fn header(&self, name: &str) -> Option<&Value> {
        self.headers.get(name)
    }

    pub fn header_bool(&self, name: &str) -> Option<bool> {
        self.headers.get(name).and_then(Value::as_bool)
    }

    pub fn header_u64(&self, name: &str) -> Option<u64> {
        self.headers.get(name).and_then(Value::as_u64)
    }

    pub fn remove_header(&mut self, name: &str) -> Option<Value> {
        self.headers.remove(name)
    }

    pub fn set_body(&mut self, body: impl Into<Value>) {
        self.body = body.into();
    }

    /// Body as a string slice when the body is a JSON string
    pub fn body_str(&self) -> Option<&str> {
        self.body.as_str()
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    pub fn set_failure(&mut self, failure: Failure) {
        self.failure = Some(failure);
    }

    pub fn take_failure(&mut self) -> Option<Failure> {
        self.failure.take()
    }
}

// ============================================================================
// Failure Types
// ============================================================================

/// Classification of a delivery failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// The destination raised an error while processing
    Processing,
    /// The destination returned a message flagged as failed
    Fault,
    /// The branch was cancelled before it produced a result
    Cancelled,
    /// The worker running the branch panicked or was torn down
    Aborted,
}

/// A delivery failure. Cloneable so it can be carried on a message and re-raised later.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[error("{kind:?} failure{}: {message}", .destination.as_ref().map(|d| format!(" at {}", d)).unwrap_or_default())]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
    pub destination: Option<String>,
}

impl Failure {
    pub fn processing(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Processing,
            message: message.into(),
            destination: None,
        }
    }

    pub fn fault(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Fault,
            message: message.into(),
            destination: None,
        }
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Aborted,
            message: message.into(),
            destination: None,
        }
    }

    pub fn at(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }
}

pub type DeliveryResult = std::result::Result<Message, Failure>;
