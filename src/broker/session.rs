// =============================================================================
// Broker Session — REST client + bar-feed subscription, HMAC-SHA256 signed
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. Signed requests
// carry the API key as a header plus an HMAC signature of the query string.
//
// The session owns its own throttle (a minimum delay between REST requests)
// and surfaces failures as structured `BrokerError`s; the core never retries
// broker calls.
// =============================================================================

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use futures_util::StreamExt;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::broker::rate_limit::RequestPacer;
use crate::market_data::{SourceBar, Timeframe};
use crate::types::Side;

type HmacSha256 = Hmac<Sha256>;

/// Minimum delay between REST requests (the session's own rate limit).
const MIN_REQUEST_DELAY: Duration = Duration::from_millis(120);

/// Per-request timeout for the REST client.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Upstream failures, exposed verbatim to the caller.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker refused the connection: {0}")]
    ConnectionRefused(String),
    #[error("broker request timed out")]
    Timeout,
    #[error("broker session disconnected")]
    Disconnected,
    #[error("unknown symbol: {0}")]
    InvalidSymbol(String),
    #[error("broker returned malformed data: {0}")]
    DataError(String),
    #[error("broker rate limit hit")]
    RateLimited,
}

impl BrokerError {
    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_connect() {
            Self::ConnectionRefused(e.to_string())
        } else {
            Self::DataError(e.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Order instructions
// ---------------------------------------------------------------------------

/// An order instruction accepted by the session.
#[derive(Debug, Clone)]
pub struct OrderInstruction {
    pub symbol: String,
    pub side: Side,
    pub quantity: i64,
    /// `None` places a market order.
    pub limit_price: Option<f64>,
}

/// Acknowledgement returned after an order is accepted.
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub client_order_id: String,
    pub broker_order_id: Option<i64>,
}

// ---------------------------------------------------------------------------
// BrokerSession
// ---------------------------------------------------------------------------

/// Brokerage session: historical bars, live bar subscription, and order
/// instructions against a REST + WebSocket endpoint pair.
pub struct BrokerSession {
    api_key: String,
    secret: String,
    base_url: String,
    feed_url: String,
    client: reqwest::Client,
    pacer: RequestPacer,
    connected: RwLock<bool>,
}

impl BrokerSession {
    /// Create a session against `base_url` (REST) and `feed_url` (WebSocket).
    ///
    /// * `api_key` — sent as a header, never in query params.
    /// * `secret`  — used exclusively for HMAC signing.
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        base_url: impl Into<String>,
        feed_url: impl Into<String>,
    ) -> Self {
        let api_key = api_key.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-API-KEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key,
            secret: secret.into(),
            base_url: base_url.into(),
            feed_url: feed_url.into(),
            client,
            pacer: RequestPacer::new(MIN_REQUEST_DELAY),
            connected: RwLock::new(false),
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Current UNIX timestamp in milliseconds.
    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Full query string for a signed request (timestamp + signature).
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}")
        } else {
            format!("{params}&timestamp={ts}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Session lifecycle
    // -------------------------------------------------------------------------

    /// Verify the endpoint answers and mark the session connected.
    #[instrument(skip(self), name = "broker::connect")]
    pub async fn connect(&self) -> Result<(), BrokerError> {
        self.pacer.pace().await;
        let url = format!("{}/v1/ping", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(BrokerError::from_reqwest)?;

        if !resp.status().is_success() {
            return Err(BrokerError::ConnectionRefused(format!(
                "ping returned {}",
                resp.status()
            )));
        }
        *self.connected.write() = true;
        info!(base_url = %self.base_url, "broker session connected");
        Ok(())
    }

    /// Mark the session disconnected. Idempotent.
    pub fn disconnect(&self) {
        *self.connected.write() = false;
        info!("broker session disconnected");
    }

    /// Whether the session believes itself connected.
    pub fn is_healthy(&self) -> bool {
        *self.connected.read()
    }

    pub fn pacer_snapshot(&self) -> crate::broker::rate_limit::PacerSnapshot {
        self.pacer.snapshot()
    }

    // -------------------------------------------------------------------------
    // Historical bars
    // -------------------------------------------------------------------------

    /// Fetch historical bars covering `duration` back from now at `bar_size`
    /// resolution, oldest first.
    #[instrument(skip(self), name = "broker::fetch_historical_bars")]
    pub async fn fetch_historical_bars(
        &self,
        symbol: &str,
        bar_size: Timeframe,
        duration: chrono::Duration,
    ) -> Result<Vec<SourceBar>, BrokerError> {
        self.pacer.pace().await;

        let limit = (duration.num_seconds() / bar_size.seconds()).max(1);
        let url = format!(
            "{}/v1/bars?symbol={}&interval={}&limit={}",
            self.base_url,
            symbol,
            bar_size.as_str(),
            limit
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(BrokerError::from_reqwest)?;

        match resp.status().as_u16() {
            429 => return Err(BrokerError::RateLimited),
            404 => return Err(BrokerError::InvalidSymbol(symbol.to_string())),
            s if s >= 400 => {
                let body = resp.text().await.unwrap_or_default();
                return Err(BrokerError::DataError(format!("HTTP {s}: {body}")));
            }
            _ => {}
        }

        let rows: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BrokerError::DataError(e.to_string()))?;
        let rows = rows
            .as_array()
            .ok_or_else(|| BrokerError::DataError("bars response is not an array".into()))?;

        let mut bars = Vec::with_capacity(rows.len());
        for row in rows {
            bars.push(parse_bar_row(row)?);
        }
        debug!(symbol, count = bars.len(), "historical bars fetched");
        Ok(bars)
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// Submit an order instruction (signed). Assigns a uuid client order id.
    #[instrument(skip(self), name = "broker::place_order")]
    pub async fn place_order(
        &self,
        instruction: &OrderInstruction,
    ) -> Result<OrderAck, BrokerError> {
        if !self.is_healthy() {
            return Err(BrokerError::Disconnected);
        }
        self.pacer.pace().await;

        let client_order_id = Uuid::new_v4().to_string();
        let order_type = if instruction.limit_price.is_some() {
            "LIMIT"
        } else {
            "MARKET"
        };
        let mut params = format!(
            "symbol={}&side={}&type={}&quantity={}&clientOrderId={}",
            instruction.symbol,
            instruction.side,
            order_type,
            instruction.quantity,
            client_order_id
        );
        if let Some(price) = instruction.limit_price {
            params.push_str(&format!("&price={price}"));
        }

        let qs = self.signed_query(&params);
        let url = format!("{}/v1/order?{}", self.base_url, qs);

        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(BrokerError::from_reqwest)?;

        match resp.status().as_u16() {
            429 => return Err(BrokerError::RateLimited),
            s if s >= 400 => {
                let body = resp.text().await.unwrap_or_default();
                return Err(BrokerError::DataError(format!("HTTP {s}: {body}")));
            }
            _ => {}
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BrokerError::DataError(e.to_string()))?;
        let broker_order_id = body.get("orderId").and_then(|v| v.as_i64());

        info!(
            symbol = %instruction.symbol,
            side = %instruction.side,
            quantity = instruction.quantity,
            client_order_id = %client_order_id,
            broker_order_id = ?broker_order_id,
            "order submitted"
        );

        Ok(OrderAck {
            client_order_id,
            broker_order_id,
        })
    }

    /// Cancel a previously submitted order by client order id (signed).
    #[instrument(skip(self), name = "broker::cancel_order")]
    pub async fn cancel_order(
        &self,
        symbol: &str,
        client_order_id: &str,
    ) -> Result<(), BrokerError> {
        if !self.is_healthy() {
            return Err(BrokerError::Disconnected);
        }
        self.pacer.pace().await;

        let params = format!("symbol={symbol}&clientOrderId={client_order_id}");
        let qs = self.signed_query(&params);
        let url = format!("{}/v1/order?{}", self.base_url, qs);

        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(BrokerError::from_reqwest)?;

        if resp.status().as_u16() == 429 {
            return Err(BrokerError::RateLimited);
        }
        if !resp.status().is_success() {
            return Err(BrokerError::DataError(format!(
                "cancel returned {}",
                resp.status()
            )));
        }
        info!(symbol, client_order_id, "order cancelled");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Live bar subscription
    // -------------------------------------------------------------------------

    /// Subscribe to the live bar feed for `symbol`. Bars arrive on the
    /// returned channel; the feed task reconnects with a fixed backoff until
    /// the receiver is dropped.
    pub fn subscribe_bars(&self, symbol: &str) -> mpsc::UnboundedReceiver<SourceBar> {
        let (tx, rx) = mpsc::unbounded_channel();
        let feed_url = self.feed_url.clone();
        let symbol = symbol.to_string();

        tokio::spawn(async move {
            loop {
                if tx.is_closed() {
                    return;
                }
                if let Err(e) = run_bar_stream(&feed_url, &symbol, &tx).await {
                    error!(symbol = %symbol, error = %e, "bar stream error — reconnecting in 5s");
                }
                if tx.is_closed() {
                    return;
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });

        rx
    }
}

impl std::fmt::Debug for BrokerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The secret never appears in Debug output.
        f.debug_struct("BrokerSession")
            .field("base_url", &self.base_url)
            .field("feed_url", &self.feed_url)
            .field("api_key_set", &!self.api_key.is_empty())
            .field("connected", &*self.connected.read())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Feed parsing
// ---------------------------------------------------------------------------

/// Connect to the bar feed for one symbol and forward parsed bars into `tx`.
///
/// Runs until the stream disconnects or errors, then returns so the caller
/// can handle reconnection.
pub async fn run_bar_stream(
    feed_url: &str,
    symbol: &str,
    tx: &mpsc::UnboundedSender<SourceBar>,
) -> Result<()> {
    let url = format!("{feed_url}/bars/{}", symbol.to_lowercase());
    info!(url = %url, symbol, "connecting to bar feed");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to bar feed")?;

    info!(symbol, "bar feed connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_feed_message(&text) {
                        Ok((feed_symbol, bar)) => {
                            if feed_symbol != symbol {
                                continue;
                            }
                            debug!(symbol, close = bar.close, "bar received");
                            if tx.send(bar).is_err() {
                                // Receiver gone — engine is shutting down.
                                return Ok(());
                            }
                        }
                        Err(e) => {
                            warn!(symbol, error = %e, "failed to parse feed message");
                        }
                    }
                }
                // Ping/Pong/Binary/Close frames are handled by tungstenite.
            }
            Some(Err(e)) => {
                error!(symbol, error = %e, "bar feed read error");
                return Err(e.into());
            }
            None => {
                warn!(symbol, "bar feed stream ended");
                return Ok(());
            }
        }
    }
}

/// Parse one feed message into a validated source bar.
///
/// Expected shape:
/// ```json
/// { "symbol": "AAPL", "bar": { "ts": 1763371805, "open": "150.0",
///   "high": "150.5", "low": "149.5", "close": "150.2",
///   "volume": 1000, "complete": true } }
/// ```
fn parse_feed_message(text: &str) -> Result<(String, SourceBar)> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse feed JSON")?;

    let symbol = root["symbol"]
        .as_str()
        .context("missing field symbol")?
        .to_uppercase();

    let b = &root["bar"];
    let ts_secs = b["ts"].as_i64().context("missing field bar.ts")?;
    let timestamp: DateTime<Utc> = Utc
        .timestamp_opt(ts_secs, 0)
        .single()
        .context("bar.ts out of range")?;

    let open = parse_numeric(&b["open"], "bar.open")?;
    let high = parse_numeric(&b["high"], "bar.high")?;
    let low = parse_numeric(&b["low"], "bar.low")?;
    let close = parse_numeric(&b["close"], "bar.close")?;
    let volume = b["volume"].as_u64().context("missing field bar.volume")?;

    let mut bar = SourceBar::new(timestamp, open, high, low, close, volume)
        .context("feed bar failed validation")?;
    bar.complete = b["complete"].as_bool().unwrap_or(true);

    Ok((symbol, bar))
}

/// Feeds send numeric values either as JSON numbers or as strings.
fn parse_numeric(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}
