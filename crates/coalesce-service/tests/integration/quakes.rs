use std::time::Duration;

use coalesce_service::error::FetchError;

use crate::{now, setup_client};

#[tokio::test]
async fn test_quakes() {
    let (client, server) = setup_client("fixtures/feed.json", |_| {});

    let quakes = client.quakes_as_of(now()).await.unwrap();
    assert_eq!(quakes.len(), 3);

    let nc = &quakes[0];
    assert_eq!(nc.code, "nc0001");
    assert_eq!(nc.magnitude, 1.72);
    assert_eq!(nc.detail, server.url("fixtures/detail/nc0001.json"));
    let location = nc.location.as_ref().unwrap();
    assert_eq!((location.longitude(), location.latitude()), (-122.8, 38.8));

    let us = quakes[1].location.as_ref().unwrap();
    assert_eq!((us.longitude(), us.latitude()), (142.3, 37.5));

    assert_eq!(quakes[2].location, None);

    assert_eq!(server.hits("fixtures/feed.json"), 1);
    assert_eq!(server.hits("fixtures/detail/nc0001.json"), 1);
    assert_eq!(server.hits("fixtures/detail/us0002.json"), 1);
    assert_eq!(server.hits("fixtures/detail/ak0003.json"), 0);
}

#[tokio::test]
async fn test_refresh_reuses_locations() {
    let (client, server) = setup_client("fixtures/feed.json", |_| {});

    let first = client.quakes_as_of(now()).await.unwrap();
    let second = client.quakes_as_of(now()).await.unwrap();
    assert_eq!(first, second);

    assert_eq!(server.hits("fixtures/feed.json"), 2);
    assert_eq!(server.hits("fixtures/detail/nc0001.json"), 1);
    assert_eq!(server.hits("fixtures/detail/us0002.json"), 1);
}

#[tokio::test]
async fn test_missing_detail_is_retried() {
    let (client, server) = setup_client("fixtures/feed.json", |config| {
        config.location_window = Duration::from_secs(6 * 3600);
    });
    let missing = server.url("fixtures/detail/ak0003.json");

    for _ in 0..2 {
        let result = client.quakes_as_of(now()).await;
        assert_eq!(
            result,
            Err(FetchError::MissingResource(missing.to_string()))
        );
    }

    // failures are evicted and fetched again, successes are kept
    assert_eq!(server.hits("fixtures/detail/ak0003.json"), 2);
    assert_eq!(server.hits("fixtures/detail/nc0001.json"), 1);
    assert_eq!(client.locations().peek(&missing), None);
}

#[tokio::test]
async fn test_incomplete_feed() {
    let (client, _server) = setup_client("fixtures/feed_incomplete.json", |_| {});

    let result = client.quakes_as_of(now()).await;
    assert!(matches!(result, Err(FetchError::Decode(_))), "{result:?}");
}

#[tokio::test]
async fn test_feed_server_error() {
    let (client, _server) = setup_client("respond_statuscode/503/feed.json", |_| {});

    assert_eq!(
        client.quakes_as_of(now()).await,
        Err(FetchError::Transport(
            "server responded with 503 Service Unavailable".into()
        ))
    );
}

#[tokio::test]
async fn test_feed_timeout() {
    let (client, _server) = setup_client("delay/1s/fixtures/feed.json", |config| {
        config.request_timeout = Duration::from_millis(100);
    });

    assert_eq!(
        client.quakes_as_of(now()).await,
        Err(FetchError::Timeout(Duration::from_millis(100)))
    );
}

#[tokio::test]
async fn test_no_feed_configured() {
    let (client, server) = setup_client("fixtures/feed.json", |config| {
        config.feed_url = None;
    });

    assert!(matches!(
        client.quakes().await,
        Err(FetchError::MissingResource(_))
    ));
    assert_eq!(server.accesses(), 0);
}
