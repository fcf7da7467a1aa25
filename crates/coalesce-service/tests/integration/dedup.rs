use std::future::IntoFuture;
use std::time::Duration;

use coalesce_service::error::FetchError;
use coalesce_service::sources::{CachedSource, HttpSource, create_client};
use coalesce_test as test;
use tokio_util::sync::CancellationToken;

use crate::{HitCounter, setup_client};

#[tokio::test]
async fn test_concurrent_lookups_share_download() {
    let (client, server) = setup_client("fixtures/feed.json", |_| {});
    let url = server.url("delay/200ms/fixtures/detail/nc0001.json");

    let lookups = (0..10).map(|_| client.quake_location(&url).into_future());
    let locations = futures::future::join_all(lookups).await;

    for location in locations {
        assert_eq!(location.unwrap().latitude(), 38.8);
    }
    assert_eq!(server.hits("delay/200ms/fixtures/detail/nc0001.json"), 1);
    assert_eq!(server.hits("fixtures/detail/nc0001.json"), 1);

    // served from memory from now on
    let location = client.quake_location(&url);
    assert!(location.is_settled());
    assert_eq!(server.accesses(), 2);
}

fn cached_downloads() -> CachedSource<url::Url, HttpSource> {
    let client = create_client(Duration::from_secs(1)).unwrap();
    let source = HttpSource::new(
        client,
        tokio::runtime::Handle::current(),
        Duration::from_secs(5),
    );
    CachedSource::new("downloads", source)
}

#[tokio::test]
async fn test_cancelled_download_is_evicted() {
    test::setup();
    let server = HitCounter::new();
    let downloads = cached_downloads();
    let token = CancellationToken::new();

    let url = server.url("delay/1s/fixtures/detail/us0002.json");
    let download = downloads.get_cancellable(&url, token.clone());
    let attached = downloads.get(&url);
    assert_eq!(downloads.cache().in_flight(), 1);

    token.cancel();
    assert_eq!(download.await, Err(FetchError::Cancelled));
    assert_eq!(attached.await, Err(FetchError::Cancelled));
    assert!(downloads.cache().is_empty());

    let url = server.url("fixtures/detail/us0002.json");
    let data = downloads.get(&url).await.unwrap();
    assert_eq!(downloads.cache().peek(&url), Some(data));
}

#[tokio::test]
async fn test_failed_download_is_retried() {
    test::setup();
    let server = HitCounter::new();
    let downloads = cached_downloads();

    let url = server.url("respond_statuscode/502/feed.json");
    for _ in 0..3 {
        assert!(matches!(
            downloads.get(&url).await,
            Err(FetchError::Transport(_))
        ));
    }

    // one request per attempt, nothing is cached
    assert_eq!(server.hits("respond_statuscode/502/feed.json"), 3);
    assert!(downloads.cache().is_empty());
}
