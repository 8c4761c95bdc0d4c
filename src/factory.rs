//! Connection factories and the explicit runtime handle.
//!
//! A [`ConnectionFactory`] binds a broker URL (with its `connection.*`
//! query options) to a transport connector. [`CmsRuntime`] caches factories
//! by URL; construct one and pass it around rather than relying on process
//! globals.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::config::ConnectionOptions;
use crate::connection::Connection;
use crate::error::{CmsResult, TransportError};
use crate::transport::Transport;

/// Establishes transports to broker endpoints.
///
/// TCP, TLS, and failover dialing live behind this seam.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Dials the broker named by `url` (query options already stripped).
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, TransportError>;
}

/// Creates configured connections to one broker URL.
pub struct ConnectionFactory {
    broker_url: String,
    options: ConnectionOptions,
    connector: Arc<dyn TransportConnector>,
}

impl ConnectionFactory {
    /// Builds a factory, folding any `connection.*` URI options into the
    /// configuration.
    pub fn new(
        broker_url: impl Into<String>,
        mut options: ConnectionOptions,
        connector: Arc<dyn TransportConnector>,
    ) -> CmsResult<Self> {
        let broker_url = broker_url.into();
        let (base, query) = match broker_url.split_once('?') {
            Some((base, query)) => (base.to_string(), Some(query.to_string())),
            None => (broker_url.clone(), None),
        };
        if let Some(query) = query {
            options.apply_uri_options(&query)?;
        } else {
            options.validate()?;
        }
        Ok(Self {
            broker_url: base,
            options,
            connector,
        })
    }

    /// The broker URL without query options.
    pub fn broker_url(&self) -> &str {
        &self.broker_url
    }

    /// The effective configuration.
    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Dials the broker and completes the OpenWire handshake.
    pub async fn create_connection(&self) -> CmsResult<Connection> {
        let transport = self.connector.connect(&self.broker_url).await?;
        Connection::connect(transport, self.options.clone()).await
    }
}

/// An explicitly constructed registry of connection factories.
pub struct CmsRuntime {
    connector: Arc<dyn TransportConnector>,
    default_options: ConnectionOptions,
    factories: DashMap<String, Arc<ConnectionFactory>>,
}

impl CmsRuntime {
    /// A runtime using `connector` for every factory it mints.
    pub fn new(connector: Arc<dyn TransportConnector>, default_options: ConnectionOptions) -> Self {
        Self {
            connector,
            default_options,
            factories: DashMap::new(),
        }
    }

    /// The factory for a broker URL, created on first use.
    pub fn factory_for(&self, broker_url: &str) -> CmsResult<Arc<ConnectionFactory>> {
        if let Some(factory) = self.factories.get(broker_url) {
            return Ok(factory.value().clone());
        }
        let factory = Arc::new(ConnectionFactory::new(
            broker_url,
            self.default_options.clone(),
            self.connector.clone(),
        )?);
        Ok(self
            .factories
            .entry(broker_url.to_string())
            .or_insert(factory)
            .value()
            .clone())
    }

    /// Drops every cached factory.
    pub fn clear(&self) {
        self.factories.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::loopback::{LoopbackTransport, loopback_pair};

    struct NullConnector;

    #[async_trait]
    impl TransportConnector for NullConnector {
        async fn connect(&self, _url: &str) -> Result<Box<dyn Transport>, TransportError> {
            let (client, _broker): (LoopbackTransport, LoopbackTransport) = loopback_pair(8);
            Ok(Box::new(client))
        }
    }

    #[test]
    fn uri_options_fold_into_factory_config() {
        let factory = ConnectionFactory::new(
            "loopback://broker-a?connection.useAsyncSend=true",
            ConnectionOptions::default(),
            Arc::new(NullConnector),
        )
        .unwrap();
        assert_eq!(factory.broker_url(), "loopback://broker-a");
        assert!(factory.options().use_async_send);
    }

    #[test]
    fn runtime_caches_factories_by_url() {
        let runtime = CmsRuntime::new(Arc::new(NullConnector), ConnectionOptions::default());
        let first = runtime.factory_for("loopback://broker-a").unwrap();
        let second = runtime.factory_for("loopback://broker-a").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let other = runtime.factory_for("loopback://broker-b").unwrap();
        assert!(!Arc::ptr_eq(&first, &other));
    }
}
