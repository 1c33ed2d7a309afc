//! Quote-currency / USD exchange-rate feed

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::error::MarketError;

/// Returns the current USD price of one whole quote unit.
#[async_trait]
pub trait QuotePriceFeed: Send + Sync {
    /// Name recorded as the snapshot's source
    fn source(&self) -> &str;

    async fn fetch_rate(&self) -> Result<Decimal, MarketError>;
}

/// JSON-over-HTTP price endpoint.
///
/// Accepts either a flat `{"price": 150.1}` / `{"usd": 150.1}` body or a
/// nested one such as `{"solana": {"usd": 150.1}}`.
pub struct HttpPriceFeed {
    client: reqwest::Client,
    url: String,
}

impl HttpPriceFeed {
    pub fn new(url: impl Into<String>) -> Result<Self, MarketError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| MarketError::external("price_feed", e))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

/// Find the USD rate in a price response body.
pub fn extract_usd(value: &serde_json::Value) -> Option<Decimal> {
    match value {
        serde_json::Value::Number(n) => {
            let text = n.to_string();
            Decimal::from_str(&text)
                .or_else(|_| Decimal::from_scientific(&text))
                .ok()
        }
        serde_json::Value::String(s) => Decimal::from_str(s).ok(),
        serde_json::Value::Object(map) => {
            for key in ["usd", "price", "rate"] {
                if let Some(found) = map.get(key).and_then(extract_usd) {
                    return Some(found);
                }
            }
            if map.len() == 1 {
                return map.values().next().and_then(extract_usd);
            }
            None
        }
        _ => None,
    }
}

#[async_trait]
impl QuotePriceFeed for HttpPriceFeed {
    fn source(&self) -> &str {
        &self.url
    }

    async fn fetch_rate(&self) -> Result<Decimal, MarketError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| MarketError::external("price_feed", e))?
            .error_for_status()
            .map_err(|e| MarketError::external("price_feed", e))?;

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| MarketError::external("price_feed", format!("bad body: {}", e)))?;

        let rate = extract_usd(&body).ok_or_else(|| {
            MarketError::external("price_feed", format!("no USD price in {}", body))
        })?;
        debug!(rate = %rate, "Fetched quote price");
        Ok(rate)
    }
}

/// Feed that always returns the same rate. Used in development config and
/// tests.
pub struct FixedPriceFeed {
    rate: Decimal,
}

impl FixedPriceFeed {
    pub fn new(rate: Decimal) -> Self {
        Self { rate }
    }
}

#[async_trait]
impl QuotePriceFeed for FixedPriceFeed {
    fn source(&self) -> &str {
        "fixed"
    }

    async fn fetch_rate(&self) -> Result<Decimal, MarketError> {
        Ok(self.rate)
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Scriptable feed counting calls.
    pub struct MockPriceFeed {
        rate: Mutex<Decimal>,
        fail: AtomicBool,
        calls: AtomicUsize,
    }

    impl MockPriceFeed {
        pub fn new(rate: Decimal) -> Self {
            Self {
                rate: Mutex::new(rate),
                fail: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn set_rate(&self, rate: Decimal) {
            *self.rate.lock().unwrap() = rate;
        }

        pub fn set_fail(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl QuotePriceFeed for MockPriceFeed {
        fn source(&self) -> &str {
            "mock"
        }

        async fn fetch_rate(&self) -> Result<Decimal, MarketError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(MarketError::external("price_feed", "mock outage"));
            }
            Ok(*self.rate.lock().unwrap())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_nested() {
        let body = json!({"solana": {"usd": 151.25}});
        assert_eq!(extract_usd(&body), Some(Decimal::new(15125, 2)));
    }

    #[test]
    fn test_extract_flat() {
        assert_eq!(extract_usd(&json!({"price": "98.5"})), Some(Decimal::new(985, 1)));
        assert_eq!(extract_usd(&json!({"usd": 100})), Some(Decimal::from(100)));
    }

    #[test]
    fn test_extract_missing() {
        assert_eq!(extract_usd(&json!({"a": 1, "b": 2})), None);
        assert_eq!(extract_usd(&json!([1, 2])), None);
    }

    #[tokio::test]
    async fn test_fixed_feed() {
        let feed = FixedPriceFeed::new(Decimal::from(150));
        assert_eq!(feed.fetch_rate().await.unwrap(), Decimal::from(150));
        assert_eq!(feed.source(), "fixed");
    }
}
