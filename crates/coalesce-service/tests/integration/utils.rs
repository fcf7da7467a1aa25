use chrono::{DateTime, Utc};
use coalesce_service::config::Config;
use coalesce_service::quakes::QuakeClient;
use coalesce_test as test;

pub use test::HitCounter;

/// The point in time the feed fixture was generated.
///
/// The first two quakes in the feed are less than an hour older, the third one is not.
pub fn now() -> DateTime<Utc> {
    DateTime::from_timestamp_millis(1_700_000_600_000).unwrap()
}

/// Setup tests and create a quake client reading `feed` from a test server.
///
/// The `update_config` closure can modify the default configuration before the client is
/// created. Keep the returned [`HitCounter`] alive until the test has finished.
pub fn setup_client(
    feed: &str,
    update_config: impl FnOnce(&mut Config),
) -> (QuakeClient, HitCounter) {
    test::setup();

    let server = HitCounter::new();
    let mut config = Config {
        feed_url: Some(server.url(feed)),
        ..Default::default()
    };
    update_config(&mut config);

    let handle = tokio::runtime::Handle::current();
    let client = QuakeClient::from_config(&config, handle).unwrap();

    (client, server)
}
