use reqwest::Client;
use std::time::Duration;

/// Outbound client with a hard overall timeout so a slow provider cannot
/// stall the request that is waiting on it.
pub fn build_client(timeout: Duration) -> Client {
    let connect = std::env::var("HTTP_CONNECT_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(5);
    Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(connect).min(timeout))
        .build()
        .unwrap_or_else(|_| Client::new())
}
