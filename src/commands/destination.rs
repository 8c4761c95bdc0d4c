//! Destinations and the URI options riding on their physical names.
//!
//! A destination's physical name may carry a query string of `consumer.*`
//! overrides (`orders?consumer.prefetchSize=0`). Options are parsed once at
//! consumer creation; the wire always carries the full physical name.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CmsError;

/// The four destination flavours the protocol distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DestinationKind {
    Queue,
    Topic,
    TemporaryQueue,
    TemporaryTopic,
}

/// A named place messages are routed through.
///
/// Temporary destinations are owned by the connection that created them and
/// die with it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    kind: DestinationKind,
    physical_name: String,
}

impl Destination {
    /// A broker-managed queue.
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            kind: DestinationKind::Queue,
            physical_name: name.into(),
        }
    }

    /// A broker-managed topic.
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            kind: DestinationKind::Topic,
            physical_name: name.into(),
        }
    }

    /// A connection-scoped temporary queue.
    pub fn temporary_queue(name: impl Into<String>) -> Self {
        Self {
            kind: DestinationKind::TemporaryQueue,
            physical_name: name.into(),
        }
    }

    /// A connection-scoped temporary topic.
    pub fn temporary_topic(name: impl Into<String>) -> Self {
        Self {
            kind: DestinationKind::TemporaryTopic,
            physical_name: name.into(),
        }
    }

    /// Rebuilds a destination from its kind and name (used when decoding).
    pub fn from_parts(kind: DestinationKind, physical_name: String) -> Self {
        Self {
            kind,
            physical_name,
        }
    }

    /// The destination flavour.
    pub fn kind(&self) -> DestinationKind {
        self.kind
    }

    /// The full physical name, query string included.
    pub fn physical_name(&self) -> &str {
        &self.physical_name
    }

    /// The physical name with any option query string removed.
    pub fn base_name(&self) -> &str {
        self.physical_name
            .split_once('?')
            .map_or(self.physical_name.as_str(), |(base, _)| base)
    }

    pub fn is_queue(&self) -> bool {
        matches!(
            self.kind,
            DestinationKind::Queue | DestinationKind::TemporaryQueue
        )
    }

    pub fn is_topic(&self) -> bool {
        !self.is_queue()
    }

    pub fn is_temporary(&self) -> bool {
        matches!(
            self.kind,
            DestinationKind::TemporaryQueue | DestinationKind::TemporaryTopic
        )
    }

    /// Parses the query-string options riding on the physical name.
    pub fn options(&self) -> HashMap<String, String> {
        let Some((_, query)) = self.physical_name.split_once('?') else {
            return HashMap::new();
        };
        query
            .split('&')
            .filter_map(|pair| {
                let (key, value) = pair.split_once('=')?;
                Some((key.to_string(), value.to_string()))
            })
            .collect()
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.kind {
            DestinationKind::Queue => "queue",
            DestinationKind::Topic => "topic",
            DestinationKind::TemporaryQueue => "temp-queue",
            DestinationKind::TemporaryTopic => "temp-topic",
        };
        write!(f, "{}://{}", scheme, self.physical_name)
    }
}

/// Consumer overrides recognised on a destination's query string.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DestinationOptions {
    pub prefetch_size: Option<i32>,
    pub maximum_pending_message_limit: Option<i32>,
    pub no_local: Option<bool>,
    pub dispatch_async: Option<bool>,
    pub exclusive: Option<bool>,
    pub retroactive: Option<bool>,
    pub priority: Option<u8>,
    pub selector: Option<String>,
    pub network_subscription: Option<bool>,
}

impl DestinationOptions {
    /// Parses `consumer.*` options, rejecting malformed values.
    pub fn parse(destination: &Destination) -> Result<Self, CmsError> {
        let raw = destination.options();
        let mut options = Self::default();

        for (key, value) in &raw {
            match key.as_str() {
                "consumer.prefetchSize" => {
                    options.prefetch_size = Some(parse_int(key, value)?);
                }
                "consumer.maximumPendingMessageLimit" => {
                    options.maximum_pending_message_limit = Some(parse_int(key, value)?);
                }
                "consumer.noLocal" => options.no_local = Some(parse_bool(key, value)?),
                "consumer.dispatchAsync" => options.dispatch_async = Some(parse_bool(key, value)?),
                "consumer.exclusive" => options.exclusive = Some(parse_bool(key, value)?),
                "consumer.retroactive" => options.retroactive = Some(parse_bool(key, value)?),
                "consumer.priority" => {
                    let priority: i32 = parse_int(key, value)?;
                    if !(0..=9).contains(&priority) {
                        return Err(CmsError::invalid_argument(format!(
                            "consumer.priority out of range: {priority}"
                        )));
                    }
                    options.priority = Some(priority as u8);
                }
                "consumer.selector" => options.selector = Some(value.clone()),
                "consumer.networkSubscription" => {
                    options.network_subscription = Some(parse_bool(key, value)?);
                }
                _ => {}
            }
        }

        Ok(options)
    }
}

fn parse_int(key: &str, value: &str) -> Result<i32, CmsError> {
    value
        .parse()
        .map_err(|_| CmsError::invalid_argument(format!("{key}: not an integer: {value}")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, CmsError> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(CmsError::invalid_argument(format!(
            "{key}: not a boolean: {other}"
        ))),
    }
}
