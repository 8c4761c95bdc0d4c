//! Connection configuration and the URI options that feed it.
//!
//! Connection URIs may carry `connection.*` query options; destination names
//! carry `consumer.*` options (parsed in [`crate::commands::destination`]).
//! Validated scalar values use domain newtypes so out-of-range settings fail
//! at configuration time, not mid-send.

use nutype::nutype;
use serde::{Deserialize, Serialize};

use crate::codec::WireFormatOptions;
use crate::error::CmsError;
use crate::policy::{RedeliveryDelayPolicy, RedeliveryPolicy};

/// Milliseconds a synchronous send may wait for the broker; zero waits forever.
#[nutype(
    validate(less_or_equal = 3_600_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 0
)]
pub struct SendTimeoutMs(u64);

impl SendTimeoutMs {
    /// Gets the value as u64.
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.into_inner()
    }
}

/// Broker-push window for one consumer; zero selects pull mode.
#[nutype(
    validate(greater_or_equal = 0, less_or_equal = 32_767),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 1000
)]
pub struct PrefetchSize(i32);

impl PrefetchSize {
    /// Gets the value as i32.
    #[must_use]
    pub fn as_i32(&self) -> i32 {
        self.into_inner()
    }
}

/// Default prefetch windows per destination flavour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrefetchPolicy {
    pub queue_prefetch: PrefetchSize,
    pub topic_prefetch: PrefetchSize,
    pub durable_topic_prefetch: PrefetchSize,
}

impl Default for PrefetchPolicy {
    fn default() -> Self {
        Self {
            queue_prefetch: PrefetchSize::default(),
            topic_prefetch: PrefetchSize::try_new(32_767).unwrap_or_default(),
            durable_topic_prefetch: PrefetchSize::try_new(100).unwrap_or_default(),
        }
    }
}

/// Everything configurable on one connection.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub client_id: Option<String>,
    pub user_name: Option<String>,
    pub password: Option<String>,
    /// Copy sends onto a session-owned queue and return immediately.
    pub use_async_send: bool,
    /// Force every send through a synchronous request, acks included.
    ///
    /// Mutually exclusive with `use_async_send`.
    pub always_sync_send: bool,
    pub send_timeout: SendTimeoutMs,
    /// Run session dispatch on a dedicated task rather than the transport's
    /// inbound path.
    pub dispatch_async: bool,
    pub prefetch_policy: PrefetchPolicy,
    pub redelivery_policy: RedeliveryPolicy,
    pub redelivery_delay_policy: RedeliveryDelayPolicy,
    pub wire_format: WireFormatOptions,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            client_id: None,
            user_name: None,
            password: None,
            use_async_send: false,
            always_sync_send: false,
            send_timeout: SendTimeoutMs::default(),
            dispatch_async: true,
            prefetch_policy: PrefetchPolicy::default(),
            redelivery_policy: RedeliveryPolicy::default(),
            redelivery_delay_policy: RedeliveryDelayPolicy::default(),
            wire_format: WireFormatOptions::default(),
        }
    }
}

impl ConnectionOptions {
    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), CmsError> {
        if self.use_async_send && self.always_sync_send {
            return Err(CmsError::invalid_argument(
                "connection.useAsyncSend and connection.alwaysSyncSend are mutually exclusive",
            ));
        }
        Ok(())
    }

    /// Applies `connection.*` options from a broker URI query string.
    pub fn apply_uri_options(&mut self, query: &str) -> Result<(), CmsError> {
        for pair in query.split('&').filter(|pair| !pair.is_empty()) {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            match key {
                "connection.useAsyncSend" => {
                    self.use_async_send = parse_bool(key, value)?;
                }
                "connection.alwaysSyncSend" => {
                    self.always_sync_send = parse_bool(key, value)?;
                }
                "connection.sendTimeout" => {
                    let millis: u64 = value.parse().map_err(|_| {
                        CmsError::invalid_argument(format!("{key}: not an integer: {value}"))
                    })?;
                    self.send_timeout = SendTimeoutMs::try_new(millis).map_err(|_| {
                        CmsError::invalid_argument(format!("{key}: out of range: {value}"))
                    })?;
                }
                "connection.dispatchAsync" => {
                    self.dispatch_async = parse_bool(key, value)?;
                }
                _ => {}
            }
        }
        self.validate()
    }
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
