//! REST exchange client
//!
//! HTTP adapter for a Coinbase-Exchange-style venue: HMAC-SHA256 signed
//! requests, order placement keyed by client order id, and decimal-string
//! prices parsed directly into `Money`. Every call consults the shared
//! rate-limit policy before dispatch and rides the retry schedule on
//! retriable failures.

use async_trait::async_trait;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use sha2::Sha256;
use std::time::Duration;
use tracing::debug;

use super::{
    with_retry, Endpoint, ExchangeAdapter, LimitBuy, RateLimitPolicy, RetryPolicy, StopLimitSell,
    VenueAck, VenueOpenOrder, VenueOrderState, VenueOrderStatus,
};
use crate::error::VenueError;
use crate::{Money, Side, Symbol};

type HmacSha256 = Hmac<Sha256>;

/// API credentials, kept off every Debug surface.
#[derive(Clone)]
pub struct Credentials {
    api_key: String,
    api_secret: String,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    /// Load from `TRAILGUARD_API_KEY` / `TRAILGUARD_API_SECRET`.
    pub fn from_env() -> anyhow::Result<Self> {
        use anyhow::Context;
        Ok(Self {
            api_key: std::env::var("TRAILGUARD_API_KEY")
                .context("TRAILGUARD_API_KEY not set")?,
            api_secret: std::env::var("TRAILGUARD_API_SECRET")
                .context("TRAILGUARD_API_SECRET not set")?,
        })
    }
}

/// Client configuration.
#[derive(Clone)]
pub struct RestVenueConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    /// Longest we will queue behind the rate limiter before reporting a
    /// rate-limit denial to the caller
    pub max_rate_limit_wait: Duration,
}

impl Default for RestVenueConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.exchange.example.com".to_string(),
            timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            max_rate_limit_wait: Duration::from_secs(2),
        }
    }
}

pub struct RestVenue {
    credentials: Credentials,
    config: RestVenueConfig,
    http: Client,
    limits: RateLimitPolicy,
}

// ==================== wire types ====================

#[derive(Debug, Deserialize)]
struct WireOrderAck {
    id: String,
}

#[derive(Debug, Deserialize)]
struct WireOrder {
    id: String,
    #[serde(default)]
    client_oid: Option<String>,
    product_id: String,
    side: String,
    price: String,
    size: String,
    #[serde(default)]
    filled_size: Option<String>,
    #[serde(default)]
    executed_price: Option<String>,
    status: String,
}

#[derive(Debug, Deserialize)]
struct WireTicker {
    price: String,
}

fn parse_money(s: &str) -> Result<Money, VenueError> {
    s.parse()
        .map_err(|_| VenueError::InvalidRequest(format!("unparseable decimal from venue: {s}")))
}

impl RestVenue {
    pub fn new(credentials: Credentials, config: RestVenueConfig, limits: RateLimitPolicy) -> Self {
        let http = Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(10)
            .build()
            .expect("failed to build HTTP client");
        Self {
            credentials,
            config,
            http,
            limits,
        }
    }

    fn sign(&self, timestamp: &str, method: &Method, path: &str, body: &str) -> String {
        let prehash = format!("{timestamp}{method}{path}{body}");
        let key = base64::engine::general_purpose::STANDARD
            .decode(&self.credentials.api_secret)
            .unwrap_or_else(|_| self.credentials.api_secret.as_bytes().to_vec());
        let mut mac =
            HmacSha256::new_from_slice(&key).expect("HMAC accepts keys of any length");
        mac.update(prehash.as_bytes());
        base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
    }

    /// One signed dispatch. Classifies HTTP failures into the venue error
    /// taxonomy; JSON bodies are only parsed on success.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<String, VenueError> {
        let url = format!("{}{}", self.config.base_url, path);
        let body_text = body
            .as_ref()
            .map(|b| b.to_string())
            .unwrap_or_default();
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let signature = self.sign(&timestamp, &method, path, &body_text);

        let mut request = self
            .http
            .request(method, &url)
            .header("X-API-KEY", &self.credentials.api_key)
            .header("X-API-SIGN", signature)
            .header("X-API-TIMESTAMP", timestamp);
        if body.is_some() {
            request = request
                .header("Content-Type", "application/json")
                .body(body_text);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                VenueError::Timeout
            } else {
                VenueError::Unavailable(e.to_string())
            }
        })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| VenueError::Unavailable(e.to_string()))?;

        if status.is_success() {
            return Ok(text);
        }
        Err(classify_http_error(status, &text))
    }

    /// Rate-limit gate shared by every endpoint call.
    async fn acquire(&self, endpoint: Endpoint) -> Result<(), VenueError> {
        if self
            .limits
            .wait_if_needed(endpoint, self.config.max_rate_limit_wait)
            .await
        {
            Ok(())
        } else {
            Err(VenueError::RateLimited)
        }
    }

    async fn lookup_by_client_id(&self, client_order_id: &str) -> Result<WireOrder, VenueError> {
        let path = format!("/orders/client:{client_order_id}");
        let text = self.request(Method::GET, &path, None).await?;
        serde_json::from_str(&text)
            .map_err(|e| VenueError::Unavailable(format!("malformed order response: {e}")))
    }

    /// Submit an order payload idempotently: a duplicate client id resolves
    /// to the already-resting order's venue id.
    async fn place(
        &self,
        client_order_id: &str,
        payload: serde_json::Value,
    ) -> Result<VenueAck, VenueError> {
        self.acquire(Endpoint::Orders).await?;
        let result = self.request(Method::POST, "/orders", Some(payload)).await;
        match result {
            Ok(text) => {
                let ack: WireOrderAck = serde_json::from_str(&text).map_err(|e| {
                    VenueError::Unavailable(format!("malformed ack response: {e}"))
                })?;
                debug!(client_order_id, venue_order_id = %ack.id, "order placed");
                Ok(VenueAck {
                    venue_order_id: ack.id,
                })
            }
            Err(VenueError::InvalidRequest(msg)) if msg.contains("duplicate") => {
                let existing = self.lookup_by_client_id(client_order_id).await?;
                debug!(client_order_id, venue_order_id = %existing.id, "resubmission resolved to existing order");
                Ok(VenueAck {
                    venue_order_id: existing.id,
                })
            }
            Err(err) => Err(err),
        }
    }
}

fn classify_http_error(status: StatusCode, body: &str) -> VenueError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => VenueError::RateLimited,
        StatusCode::NOT_FOUND => VenueError::UnknownOrder(body.to_string()),
        s if s.is_server_error() => VenueError::Unavailable(format!("{status}: {body}")),
        _ if body.contains("Insufficient funds") => VenueError::InsufficientFunds {
            product_id: String::new(),
            requested: Money::ZERO,
        },
        _ => VenueError::InvalidRequest(format!("{status}: {body}")),
    }
}

fn wire_state(status: &str) -> VenueOrderState {
    match status {
        "open" | "pending" | "active" => VenueOrderState::Open,
        "done" | "filled" => VenueOrderState::Filled,
        "cancelled" | "canceled" | "rejected" => VenueOrderState::Cancelled,
        _ => VenueOrderState::Unknown,
    }
}

#[async_trait]
impl ExchangeAdapter for RestVenue {
    async fn place_limit_buy(&self, req: &LimitBuy) -> Result<VenueAck, VenueError> {
        let payload = serde_json::json!({
            "client_oid": req.client_order_id,
            "product_id": req.product_id.as_str(),
            "side": "buy",
            "type": "limit",
            "price": req.price.to_string(),
            "size": req.qty.to_string(),
        });
        with_retry(&self.config.retry, || {
            self.place(&req.client_order_id, payload.clone())
        })
        .await
    }

    async fn place_stop_limit(&self, req: &StopLimitSell) -> Result<VenueAck, VenueError> {
        let payload = serde_json::json!({
            "client_oid": req.client_order_id,
            "product_id": req.product_id.as_str(),
            "side": "sell",
            "type": "limit",
            "stop": "loss",
            "stop_price": req.stop_trigger.to_string(),
            "price": req.limit_price.to_string(),
            "size": req.qty.to_string(),
        });
        with_retry(&self.config.retry, || {
            self.place(&req.client_order_id, payload.clone())
        })
        .await
    }

    async fn cancel_order(
        &self,
        product_id: &Symbol,
        venue_order_id: &str,
    ) -> Result<(), VenueError> {
        let path = format!("/orders/{venue_order_id}?product_id={product_id}");
        with_retry(&self.config.retry, || {
            let path = path.clone();
            async move {
                self.acquire(Endpoint::Cancel).await?;
                self.request(Method::DELETE, &path, None).await?;
                Ok(())
            }
        })
        .await
    }

    async fn get_order_status(
        &self,
        _product_id: &Symbol,
        client_order_id: &str,
    ) -> Result<VenueOrderStatus, VenueError> {
        let result = with_retry(&self.config.retry, || async move {
            self.acquire(Endpoint::Status).await?;
            self.lookup_by_client_id(client_order_id).await
        })
        .await;

        match result {
            Ok(order) => Ok(VenueOrderStatus {
                state: wire_state(&order.status),
                filled_qty: order
                    .filled_size
                    .as_deref()
                    .map(parse_money)
                    .transpose()?
                    .unwrap_or(Money::ZERO),
                avg_fill_price: order
                    .executed_price
                    .as_deref()
                    .map(parse_money)
                    .transpose()?,
                venue_order_id: Some(order.id),
            }),
            // The venue has no record; reconciliation treats this as Unknown
            Err(VenueError::UnknownOrder(_)) => Ok(VenueOrderStatus::unknown()),
            Err(err) => Err(err),
        }
    }

    async fn get_last_trade_price(&self, product_id: &Symbol) -> Result<Money, VenueError> {
        let path = format!("/products/{product_id}/ticker");
        let ticker: WireTicker = with_retry(&self.config.retry, || {
            let path = path.clone();
            async move {
                self.acquire(Endpoint::MarketData).await?;
                let text = self.request(Method::GET, &path, None).await?;
                serde_json::from_str(&text)
                    .map_err(|e| VenueError::Unavailable(format!("malformed ticker: {e}")))
            }
        })
        .await?;
        parse_money(&ticker.price)
    }

    async fn list_open_orders(
        &self,
        product_id: &Symbol,
    ) -> Result<Vec<VenueOpenOrder>, VenueError> {
        let path = format!("/orders?product_id={product_id}&status=open");
        let orders: Vec<WireOrder> = with_retry(&self.config.retry, || {
            let path = path.clone();
            async move {
                self.acquire(Endpoint::Status).await?;
                let text = self.request(Method::GET, &path, None).await?;
                serde_json::from_str(&text)
                    .map_err(|e| VenueError::Unavailable(format!("malformed order list: {e}")))
            }
        })
        .await?;

        orders
            .into_iter()
            .map(|o| {
                Ok(VenueOpenOrder {
                    venue_order_id: o.id,
                    client_order_id: o.client_oid,
                    product_id: Symbol::new(&o.product_id),
                    side: if o.side == "buy" { Side::Buy } else { Side::Sell },
                    price: parse_money(&o.price)?,
                    qty: parse_money(&o.size)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_error_classification() {
        assert!(matches!(
            classify_http_error(StatusCode::TOO_MANY_REQUESTS, ""),
            VenueError::RateLimited
        ));
        assert!(matches!(
            classify_http_error(StatusCode::BAD_GATEWAY, "upstream"),
            VenueError::Unavailable(_)
        ));
        assert!(matches!(
            classify_http_error(StatusCode::NOT_FOUND, "no such order"),
            VenueError::UnknownOrder(_)
        ));
        assert!(matches!(
            classify_http_error(StatusCode::BAD_REQUEST, "Insufficient funds"),
            VenueError::InsufficientFunds { .. }
        ));
        assert!(matches!(
            classify_http_error(StatusCode::BAD_REQUEST, "size too small"),
            VenueError::InvalidRequest(_)
        ));
    }

    #[test]
    fn test_wire_state_mapping() {
        assert_eq!(wire_state("open"), VenueOrderState::Open);
        assert_eq!(wire_state("done"), VenueOrderState::Filled);
        assert_eq!(wire_state("cancelled"), VenueOrderState::Cancelled);
        assert_eq!(wire_state("???"), VenueOrderState::Unknown);
    }

    #[test]
    fn test_signature_is_deterministic() {
        let venue = RestVenue::new(
            Credentials::new("key", "secret"),
            RestVenueConfig::default(),
            RateLimitPolicy::with_defaults(),
        );
        let a = venue.sign("170000", &Method::POST, "/orders", "{}");
        let b = venue.sign("170000", &Method::POST, "/orders", "{}");
        assert_eq!(a, b);
        let c = venue.sign("170001", &Method::POST, "/orders", "{}");
        assert_ne!(a, c);
    }
}
