use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use super::gateway::Gateway;
use crate::models::{Market, OrderStatus, Quote, Side};

const MAX_RETRIES: u32 = 3;
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// What the exchange reports about one order when polled
#[derive(Debug, Clone, Copy)]
pub struct OrderReport {
    pub status: OrderStatus,
    pub cumulative_filled: f64,
    pub avg_fill_price: f64,
}

/// Every outbound exchange operation the bot performs. Implemented by the
/// REST client in production and by scripted fakes in tests.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Place a limit order, returning the exchange-assigned order id
    async fn submit_order(&self, market: &str, side: Side, size: f64, price: f64)
        -> Result<String>;

    /// Request cancellation; true if the exchange accepted the cancel
    async fn cancel_order(&self, order_id: &str) -> Result<bool>;

    /// Current status, cumulative filled size and VWAP for one order
    async fn get_order(&self, order_id: &str) -> Result<OrderReport>;

    /// Top of book for one token
    async fn get_price(&self, market: &str) -> Result<Quote>;

    /// Active markets for scanning
    async fn list_markets(&self, limit: usize) -> Result<Vec<Market>>;
}

#[derive(Debug, Serialize)]
struct SubmitOrderRequest<'a> {
    market: &'a str,
    side: &'a str,
    size: f64,
    price: f64,
}

#[derive(Debug, Deserialize)]
struct SubmitOrderResponse {
    #[serde(default = "default_true")]
    success: bool,
    #[serde(default, alias = "orderID")]
    order_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct CancelOrderResponse {
    #[serde(alias = "cancelled")]
    canceled: bool,
}

#[derive(Debug, Deserialize)]
struct OrderStatusResponse {
    status: String,
    #[serde(default)]
    size_matched: f64,
    #[serde(default, alias = "average_price")]
    avg_fill_price: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct BookResponse {
    bid: f64,
    ask: f64,
    #[serde(default)]
    mid: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct MarketsResponse {
    data: Vec<MarketEntry>,
}

#[derive(Debug, Deserialize)]
struct MarketEntry {
    id: String,
    #[serde(default)]
    slug: String,
    #[serde(default)]
    question: String,
    token_id_yes: String,
    token_id_no: String,
    #[serde(default)]
    price_yes: f64,
    #[serde(default)]
    price_no: f64,
    #[serde(default)]
    best_bid: f64,
    #[serde(default)]
    best_ask: f64,
    #[serde(default)]
    volume_24h: f64,
    #[serde(default)]
    end_date: Option<DateTime<Utc>>,
    #[serde(default = "default_true")]
    active: bool,
}

/// Exchange statuses use a few spellings across endpoints
fn parse_wire_status(s: &str) -> Option<OrderStatus> {
    match s.to_ascii_uppercase().as_str() {
        "LIVE" | "OPEN" => Some(OrderStatus::Live),
        "PARTIALLY_FILLED" | "PARTIAL" => Some(OrderStatus::PartiallyFilled),
        "MATCHED" | "FILLED" => Some(OrderStatus::Matched),
        "CANCELED" | "CANCELLED" => Some(OrderStatus::Cancelled),
        "EXPIRED" => Some(OrderStatus::Expired),
        _ => None,
    }
}

/// REST client for the order-book exchange. Every request is admitted by the
/// shared [`Gateway`] before it leaves the process; transient failures (429,
/// 5xx, transport errors) retry here with exponential backoff, while 4xx
/// responses fail immediately.
pub struct ExchangeClient {
    client: Client,
    gate: Arc<Gateway>,
    base_url: String,
    retry_base_ms: u64,
}

impl ExchangeClient {
    pub fn new(base_url: impl Into<String>, gate: Arc<Gateway>) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            gate,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            retry_base_ms: 1000,
        })
    }

    /// Shrinks retry backoff for tests
    pub fn with_retry_base_ms(mut self, base_ms: u64) -> Self {
        self.retry_base_ms = base_ms;
        self
    }

    /// Send with rate limiting and retry on transient failures
    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        for attempt in 1..=MAX_RETRIES {
            let req = request
                .try_clone()
                .ok_or_else(|| anyhow!("request body is not cloneable"))?;

            match self.gate.invoke(req.send()).await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        if attempt == MAX_RETRIES {
                            bail!("exchange returned {} after {} attempts", status, attempt);
                        }
                        let backoff = self.retry_base_ms * 2u64.pow(attempt);
                        warn!(
                            "Exchange returned {}, backing off {}ms (attempt {}/{})",
                            status, backoff, attempt, MAX_RETRIES
                        );
                        tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
                        continue;
                    }

                    let body = response.text().await.unwrap_or_default();
                    bail!("exchange rejected request ({}): {}", status, body);
                }
                Err(e) => {
                    if attempt == MAX_RETRIES {
                        return Err(e).context("exchange request failed");
                    }
                    let backoff = self.retry_base_ms * 2u64.pow(attempt);
                    warn!(
                        "Exchange request error ({}), backing off {}ms (attempt {}/{})",
                        e, backoff, attempt, MAX_RETRIES
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
                }
            }
        }
        bail!("exchange request failed after {} attempts", MAX_RETRIES)
    }
}

#[async_trait]
impl Exchange for ExchangeClient {
    async fn submit_order(
        &self,
        market: &str,
        side: Side,
        size: f64,
        price: f64,
    ) -> Result<String> {
        let url = format!("{}/orders", self.base_url);
        let body = SubmitOrderRequest {
            market,
            side: side.as_str(),
            size,
            price,
        };

        let response = self.execute(self.client.post(&url).json(&body)).await?;
        let parsed: SubmitOrderResponse = response
            .json()
            .await
            .context("Failed to parse order submission response")?;

        if !parsed.success {
            bail!(
                "order rejected by exchange: {}",
                parsed.error.unwrap_or_else(|| "no reason given".to_string())
            );
        }
        parsed
            .order_id
            .ok_or_else(|| anyhow!("exchange accepted order but returned no order id"))
    }

    async fn cancel_order(&self, order_id: &str) -> Result<bool> {
        let url = format!("{}/orders/{}", self.base_url, order_id);
        let response = self.execute(self.client.delete(&url)).await?;
        let parsed: CancelOrderResponse = response
            .json()
            .await
            .context("Failed to parse cancel response")?;
        Ok(parsed.canceled)
    }

    async fn get_order(&self, order_id: &str) -> Result<OrderReport> {
        let url = format!("{}/orders/{}", self.base_url, order_id);
        let response = self.execute(self.client.get(&url)).await?;
        let parsed: OrderStatusResponse = response
            .json()
            .await
            .context("Failed to parse order status response")?;

        let status = parse_wire_status(&parsed.status)
            .ok_or_else(|| anyhow!("unknown order status {:?}", parsed.status))?;

        Ok(OrderReport {
            status,
            cumulative_filled: parsed.size_matched,
            avg_fill_price: parsed.avg_fill_price.unwrap_or(0.0),
        })
    }

    async fn get_price(&self, market: &str) -> Result<Quote> {
        let url = format!("{}/book/{}", self.base_url, market);
        let response = self.execute(self.client.get(&url)).await?;
        let parsed: BookResponse = response
            .json()
            .await
            .context("Failed to parse book response")?;

        Ok(Quote {
            bid: parsed.bid,
            ask: parsed.ask,
            mid: parsed.mid.unwrap_or((parsed.bid + parsed.ask) / 2.0),
        })
    }

    async fn list_markets(&self, limit: usize) -> Result<Vec<Market>> {
        let url = format!("{}/markets?active=true&limit={}", self.base_url, limit);
        let response = self.execute(self.client.get(&url)).await?;
        let parsed: MarketsResponse = response
            .json()
            .await
            .context("Failed to parse markets response")?;

        Ok(parsed
            .data
            .into_iter()
            .map(|entry| Market {
                id: entry.id,
                slug: entry.slug,
                question: entry.question,
                token_id_yes: entry.token_id_yes,
                token_id_no: entry.token_id_no,
                price_yes: entry.price_yes,
                price_no: entry.price_no,
                best_bid: entry.best_bid,
                best_ask: entry.best_ask,
                volume_24h: entry.volume_24h,
                end_date: entry.end_date,
                active: entry.active,
            })
            .collect())
    }
}
