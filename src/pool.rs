//! Broker endpoints and the rotating broker pool
//!
//! The pool is a fixed, ordered list of interchangeable endpoints plus a
//! cursor. It never mutates an endpoint; failover only moves the cursor.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use url::Url;

/// Default port for plain MQTT over TCP
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// One broker instance, identified by `(host, port)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `mqtt://host:port` (or `tcp://`). A missing port means 1883.
    pub fn parse(broker_url: &str) -> Result<Self, PoolError> {
        let url =
            Url::parse(broker_url).map_err(|_| PoolError::InvalidBrokerUrl(broker_url.into()))?;

        if !matches!(url.scheme(), "mqtt" | "tcp") {
            return Err(PoolError::UnsupportedScheme(url.scheme().to_string()));
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| PoolError::InvalidBrokerUrl(broker_url.into()))?;
        let port = url.port().unwrap_or(DEFAULT_MQTT_PORT);

        Ok(Self::new(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum PoolError {
    #[error("Broker pool must contain at least one endpoint")]
    Empty,
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Unsupported broker URL scheme: {0}")]
    UnsupportedScheme(String),
}

/// Ordered, non-empty list of candidate endpoints with a wrapping cursor
#[derive(Debug, Clone)]
pub struct BrokerPool {
    endpoints: Vec<Endpoint>,
    cursor: usize,
}

impl BrokerPool {
    pub fn new(endpoints: Vec<Endpoint>) -> Result<Self, PoolError> {
        if endpoints.is_empty() {
            return Err(PoolError::Empty);
        }
        Ok(Self {
            endpoints,
            cursor: 0,
        })
    }

    /// Build a pool from broker URLs, keeping their order
    pub fn from_urls<S: AsRef<str>>(urls: &[S]) -> Result<Self, PoolError> {
        let endpoints = urls
            .iter()
            .map(|u| Endpoint::parse(u.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(endpoints)
    }

    pub fn current(&self) -> &Endpoint {
        &self.endpoints[self.cursor]
    }

    /// Move to the next endpoint (wrapping) and return it
    pub fn advance(&mut self) -> &Endpoint {
        self.cursor = (self.cursor + 1) % self.endpoints.len();
        self.current()
    }

    /// Remember `index` as the preferred starting point for the next outage
    pub fn select(&mut self, index: usize) {
        self.cursor = index % self.endpoints.len();
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn position(&self, endpoint: &Endpoint) -> Option<usize> {
        self.endpoints.iter().position(|e| e == endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn three_node_pool() -> BrokerPool {
        BrokerPool::from_urls(&[
            "mqtt://localhost:1883",
            "mqtt://localhost:1884",
            "mqtt://localhost:1885",
        ])
        .unwrap()
    }

    #[test]
    fn test_empty_pool_is_rejected() {
        assert_eq!(BrokerPool::new(vec![]).unwrap_err(), PoolError::Empty);
    }

    #[test]
    fn test_advance_wraps_around() {
        let mut pool = three_node_pool();
        assert_eq!(pool.current().port, 1883);
        assert_eq!(pool.advance().port, 1884);
        assert_eq!(pool.advance().port, 1885);
        assert_eq!(pool.advance().port, 1883);
    }

    #[test]
    fn test_select_remembers_preferred_endpoint() {
        let mut pool = three_node_pool();
        pool.select(2);
        assert_eq!(pool.current().port, 1885);

        // Out-of-range indexes wrap instead of panicking
        pool.select(4);
        assert_eq!(pool.current().port, 1884);
    }

    #[test]
    fn test_position_lookup() {
        let pool = three_node_pool();
        assert_eq!(pool.position(&Endpoint::new("localhost", 1885)), Some(2));
        assert_eq!(pool.position(&Endpoint::new("otherhost", 1885)), None);
    }

    #[test]
    fn test_endpoint_parse() {
        assert_eq!(
            Endpoint::parse("mqtt://broker.local:1884").unwrap(),
            Endpoint::new("broker.local", 1884)
        );
        assert_eq!(
            Endpoint::parse("tcp://10.0.0.7").unwrap(),
            Endpoint::new("10.0.0.7", DEFAULT_MQTT_PORT)
        );
        assert!(matches!(
            Endpoint::parse("not a url"),
            Err(PoolError::InvalidBrokerUrl(_))
        ));
        assert!(matches!(
            Endpoint::parse("http://localhost:1883"),
            Err(PoolError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn test_endpoint_display() {
        assert_eq!(Endpoint::new("localhost", 1883).to_string(), "localhost:1883");
    }

    proptest! {
        #[test]
        fn cursor_always_valid(len in 1usize..16, steps in proptest::collection::vec(0usize..64, 0..64)) {
            let endpoints = (0..len).map(|i| Endpoint::new("h", 1000 + i as u16)).collect();
            let mut pool = BrokerPool::new(endpoints).unwrap();
            for step in steps {
                if step % 2 == 0 {
                    pool.advance();
                } else {
                    pool.select(step);
                }
                prop_assert!(pool.cursor() < pool.len());
            }
        }

        #[test]
        fn full_pass_returns_to_start(len in 1usize..16, start in 0usize..16) {
            let endpoints = (0..len).map(|i| Endpoint::new("h", 1000 + i as u16)).collect();
            let mut pool = BrokerPool::new(endpoints).unwrap();
            pool.select(start);
            let first = pool.current().clone();
            for _ in 0..len {
                pool.advance();
            }
            prop_assert_eq!(pool.current(), &first);
        }
    }
}
