pub mod fake_engine;
pub mod mock_h2_server;

use std::time::Duration;

/// Poll `condition` until it holds or `limit` elapses.
#[allow(dead_code)]
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("muxreq=debug")
        .with_test_writer()
        .try_init();
}
