//! Outbox message and routing types

use crate::error::{CoordError, Result};
use crate::partition::Partition;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Event type reserved for transactional email.
pub const EMAIL_EVENT_TYPE: &str = "email";

/// Known delivery services a message can be staged for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryService {
    /// Message broker (STOMP)
    ActiveMq,
    /// Transactional email
    Email,
    /// Time-series metrics sink
    Influx,
    /// Search index sink
    Elastic,
}

impl DeliveryService {
    pub const ALL: [DeliveryService; 4] = [
        DeliveryService::ActiveMq,
        DeliveryService::Email,
        DeliveryService::Influx,
        DeliveryService::Elastic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ActiveMq => "activemq",
            Self::Email => "email",
            Self::Influx => "influx",
            Self::Elastic => "elastic",
        }
    }

    /// Routing rule: email events go only to the email service, and the
    /// email service takes only email events.
    pub fn accepts(&self, event_type: &str) -> bool {
        (event_type == EMAIL_EVENT_TYPE) == (*self == Self::Email)
    }
}

impl fmt::Display for DeliveryService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryService {
    type Err = CoordError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|service| service.as_str() == wanted)
            .ok_or_else(|| CoordError::UnknownService(s.to_string()))
    }
}

/// Validate a configured service list, keeping its order.
pub fn resolve_services(configured: &[String]) -> Result<Vec<DeliveryService>> {
    configured.iter().map(|s| s.parse()).collect()
}

/// A message to stage
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage<T> {
    pub event_type: String,
    pub payload: T,
}

impl<T> NewMessage<T> {
    pub fn new(event_type: impl Into<String>, payload: T) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }
}

/// A staged message as seen by consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub event_type: String,
    pub payload: Value,
    pub services: DeliveryService,
}

/// Filters and limits for [`super::MessageOutbox::retrieve_messages`]
#[derive(Debug, Clone, PartialEq)]
pub struct RetrieveOptions {
    /// Maximum messages returned
    pub bulk: usize,
    /// Only messages in this partition
    pub partition: Option<Partition>,
    /// Only messages of this event type
    pub event_type: Option<String>,
    /// Claim returned messages so concurrent consumers skip them
    pub lock: bool,
    /// Without `event_type`, leave out email events
    pub old_mode: bool,
    /// Only messages staged for this service
    pub service_filter: Option<DeliveryService>,
}

impl Default for RetrieveOptions {
    fn default() -> Self {
        Self {
            bulk: 1000,
            partition: None,
            event_type: None,
            lock: false,
            old_mode: true,
            service_filter: None,
        }
    }
}
