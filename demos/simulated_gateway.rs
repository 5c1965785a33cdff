//! Drives the rate limiter and the shard manager against in-process fakes.
//!
//! Run with `RUST_LOG=gateway_flow=debug cargo run --example simulated_gateway`.

use gateway_flow::{
    DisconnectReason, Error, HeaderValue, HttpResponse, ManagerDelegate, RateLimitKey,
    RateLimiter, RateLimiterConfig, Shard, ShardInfo, ShardManager, ShardManagerConfig,
    ShardSignals, StatusCode, Transport, TransportError, LIMIT_HEADER, REMAINING_HEADER,
    RESET_HEADER,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Fake API server granting 3 requests per 2 second window per route
struct FakeApi {
    windows: Mutex<HashMap<String, (u32, f64)>>,
}

const WINDOW_LIMIT: u32 = 3;
const WINDOW_SECS: f64 = 2.0;

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

impl Transport for FakeApi {
    type Request = String;

    async fn send(&self, route: &String) -> Result<HttpResponse, TransportError> {
        tokio::time::sleep(Duration::from_millis(20)).await;

        let now = now_secs();
        let (used, reset) = {
            let mut windows = self.windows.lock();
            let window = windows
                .entry(route.clone())
                .or_insert((0, now + WINDOW_SECS));
            if now >= window.1 {
                *window = (0, now + WINDOW_SECS);
            }
            window.0 += 1;
            *window
        };

        let mut response = if used > WINDOW_LIMIT {
            HttpResponse::new(StatusCode::TOO_MANY_REQUESTS)
        } else {
            HttpResponse::new(StatusCode::OK)
        };
        let remaining = WINDOW_LIMIT.saturating_sub(used);
        response
            .headers
            .insert(LIMIT_HEADER, HeaderValue::from(WINDOW_LIMIT));
        response
            .headers
            .insert(REMAINING_HEADER, HeaderValue::from(remaining));
        if let Ok(value) = HeaderValue::from_str(&format!("{:.3}", reset)) {
            response.headers.insert(RESET_HEADER, value);
        }
        Ok(response)
    }
}

/// Fake gateway connection that becomes ready shortly after connecting
struct FakeShard {
    info: ShardInfo,
    signals: ShardSignals,
    connected: Arc<AtomicBool>,
}

impl Shard for FakeShard {
    type Payload = String;

    fn info(&self) -> ShardInfo {
        self.info
    }

    async fn connect(&self) -> Result<(), Error> {
        let signals = self.signals.clone();
        let connected = self.connected.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            connected.store(true, Ordering::SeqCst);
            signals.connected();
        });
        Ok(())
    }

    fn disconnect(&self) {
        let signals = self.signals.clone();
        let connected = self.connected.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            connected.store(false, Ordering::SeqCst);
            signals.disconnected();
        });
    }

    async fn send_gateway_payload(&self, payload: String) -> Result<(), Error> {
        info!("[SHARD-{}] -> {}", self.info.index, payload);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

struct Client {
    ready: tokio::sync::Notify,
    closed: tokio::sync::Notify,
}

impl ManagerDelegate for Client {
    fn on_manager_connected(&self) {
        info!("Client: gateway ready");
        self.ready.notify_one();
    }

    fn on_manager_disconnected(&self, reason: &DisconnectReason) {
        info!("Client: gateway down ({})", reason);
        self.closed.notify_one();
    }
}

async fn send_one(
    limiter: &RateLimiter<FakeApi>,
    i: usize,
    route: &str,
    key: &RateLimitKey,
) -> (usize, gateway_flow::Result<StatusCode>) {
    let response = limiter.send(route.to_string(), key).await;
    (i, response.map(|r| r.status))
}

#[tokio::main]
async fn main() -> gateway_flow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // REST: 8 messages to one channel, 2 to another
    let limiter = RateLimiter::new(
        RateLimiterConfig::default(),
        FakeApi {
            windows: Mutex::new(HashMap::new()),
        },
    );

    let busy = RateLimitKey::from_route("/channels/100/messages");
    let quiet = RateLimitKey::from_route("/channels/200/messages");

    let sends = (0..10).map(|i| {
        let (route, key) = if i < 8 {
            ("/channels/100/messages", &busy)
        } else {
            ("/channels/200/messages", &quiet)
        };
        send_one(&limiter, i, route, key)
    });

    for (i, result) in futures_util::future::join_all(sends).await {
        info!("request {} -> {:?}", i, result);
    }

    let snapshot = limiter.metrics().snapshot();
    info!(
        "admitted={} queued={} replayed={} rate_limited={}",
        snapshot.requests_admitted_total,
        snapshot.requests_queued_total,
        snapshot.requests_replayed_total,
        snapshot.rate_limited_total
    );

    // Gateway: 3 shards, 250ms apart
    let client = Arc::new(Client {
        ready: tokio::sync::Notify::new(),
        closed: tokio::sync::Notify::new(),
    });
    let config = ShardManagerConfig::builder()
        .connect_stagger(Duration::from_millis(250))
        .build()?;
    let manager = ShardManager::new(config, |info: ShardInfo, signals: ShardSignals| FakeShard {
        info,
        signals,
        connected: Arc::new(AtomicBool::new(false)),
    });
    manager.set_delegate(&client);
    manager.shatter(3);

    manager.connect();
    client.ready.notified().await;

    manager
        .send_payload(r#"{"op":3,"d":{"status":"online"}}"#.to_string(), 1)
        .await?;

    manager.disconnect();
    client.closed.notified().await;

    Ok(())
}
