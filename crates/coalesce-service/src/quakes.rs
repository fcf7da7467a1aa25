//! A client for the USGS earthquake feeds.
//!
//! The feed lists recent earthquakes, but not their coordinates. Those are part of a separate
//! detail document per quake. [`QuakeClient::quakes`] loads the feed and then resolves the
//! locations of the most recent quakes concurrently. Detail documents are cached by URL, so
//! refreshing the feed only downloads details for quakes that are new.

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::cache::DeduplicatingCache;
use crate::config::Config;
use crate::error::{FetchError, Outcome};
use crate::promise::Future;
use crate::sources::{CachedSource, HttpSource, OperationSource};

/// A single earthquake from the feed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Feature")]
pub struct Quake {
    pub magnitude: f64,
    pub place: String,
    pub time: DateTime<Utc>,
    pub code: String,
    /// The URL of the detail document, which contains the location.
    pub detail: Url,
    /// Only resolved for quakes within the location window.
    pub location: Option<QuakeLocation>,
}

/// Where an earthquake happened.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QuakeLocation {
    /// Longitude, latitude, and depth, in that order.
    pub coordinates: Vec<f64>,
}

impl QuakeLocation {
    pub fn longitude(&self) -> f64 {
        self.coordinates.first().copied().unwrap_or(0.0)
    }

    pub fn latitude(&self) -> f64 {
        self.coordinates.get(1).copied().unwrap_or(0.0)
    }
}

/// The summary feed.
#[derive(Clone, Debug, Deserialize)]
pub struct GeoJson {
    pub features: Vec<Quake>,
}

#[derive(Deserialize)]
struct Feature {
    properties: Properties,
}

#[derive(Deserialize)]
struct Properties {
    mag: Option<f64>,
    place: Option<String>,
    /// Milliseconds since the unix epoch.
    time: Option<i64>,
    code: Option<String>,
    detail: Option<Url>,
}

impl TryFrom<Feature> for Quake {
    type Error = FetchError;

    fn try_from(feature: Feature) -> Result<Self, Self::Error> {
        let missing = |field: &str| FetchError::Decode(format!("missing quake {field}"));
        let Properties {
            mag,
            place,
            time,
            code,
            detail,
        } = feature.properties;

        Ok(Quake {
            magnitude: mag.ok_or_else(|| missing("magnitude"))?,
            place: place.ok_or_else(|| missing("place"))?,
            time: time
                .and_then(DateTime::from_timestamp_millis)
                .ok_or_else(|| missing("time"))?,
            code: code.ok_or_else(|| missing("code"))?,
            detail: detail.ok_or_else(|| missing("detail"))?,
            location: None,
        })
    }
}

/// The detail document of a single quake.
#[derive(Clone, Debug, Deserialize)]
struct QuakeDetail {
    geometry: QuakeLocation,
}

/// Resolves detail URLs to locations, downloading through `S`.
#[derive(Debug)]
pub struct LocationSource<S> {
    downloader: Arc<S>,
}

impl<S> OperationSource<Url> for LocationSource<S>
where
    S: OperationSource<Url, Output = Bytes>,
{
    type Output = QuakeLocation;

    fn fetch(&self, url: &Url) -> Future<QuakeLocation> {
        locate(self.downloader.fetch(url))
    }

    fn fetch_cancellable(&self, url: &Url, token: CancellationToken) -> Future<QuakeLocation> {
        locate(self.downloader.fetch_cancellable(url, token))
    }
}

fn locate(data: Future<Bytes>) -> Future<QuakeLocation> {
    data.decoded::<QuakeDetail>()
        .transform(|detail| Ok(detail.geometry))
}

/// Loads earthquakes and their locations.
#[derive(Debug)]
pub struct QuakeClient<S: OperationSource<Url, Output = Bytes> = HttpSource> {
    downloader: Arc<S>,
    locations: CachedSource<Url, LocationSource<S>>,
    feed_url: Option<Url>,
    location_window: Duration,
}

impl QuakeClient<HttpSource> {
    /// Creates a client that downloads over HTTP, spawning downloads on `runtime`.
    pub fn from_config(config: &Config, runtime: Handle) -> reqwest::Result<Self> {
        let downloader = HttpSource::from_config(config, runtime)?;
        Ok(Self::new(
            downloader,
            config.feed_url.clone(),
            config.location_window,
        ))
    }
}

impl<S> QuakeClient<S>
where
    S: OperationSource<Url, Output = Bytes>,
{
    pub fn new(downloader: S, feed_url: Option<Url>, location_window: Duration) -> Self {
        let downloader = Arc::new(downloader);
        let locations = CachedSource::new(
            "quake_locations",
            LocationSource {
                downloader: Arc::clone(&downloader),
            },
        );

        Self {
            downloader,
            locations,
            feed_url,
            location_window,
        }
    }

    /// Loads the feed and resolves the locations of recent quakes.
    ///
    /// Fails if the feed cannot be loaded, or if any of the locations cannot be resolved.
    pub async fn quakes(&self) -> Outcome<Vec<Quake>> {
        self.quakes_as_of(Utc::now()).await
    }

    /// Like [`quakes`](Self::quakes), but with an explicit current time.
    ///
    /// The feed is ordered from newest to oldest. Locations are resolved for the leading run of
    /// quakes that happened within the location window before `now`.
    pub async fn quakes_as_of(&self, now: DateTime<Utc>) -> Outcome<Vec<Quake>> {
        let feed_url = self
            .feed_url
            .as_ref()
            .ok_or_else(|| FetchError::MissingResource("no feed url configured".into()))?;

        let feed = self.downloader.fetch(feed_url).decoded::<GeoJson>().await?;
        let mut quakes = feed.features;

        let window = TimeDelta::from_std(self.location_window).unwrap_or(TimeDelta::MAX);
        let recent = quakes
            .iter()
            .take_while(|quake| now.signed_duration_since(quake.time) <= window)
            .count();
        tracing::debug!(
            total = quakes.len(),
            recent,
            "Resolving locations of recent quakes"
        );

        let lookups = quakes[..recent]
            .iter()
            .map(|quake| self.quake_location(&quake.detail).into_future());
        let locations = futures::future::try_join_all(lookups).await?;

        for (quake, location) in quakes.iter_mut().zip(locations) {
            quake.location = Some(location);
        }

        Ok(quakes)
    }

    /// Resolves the location in the detail document at `url`.
    ///
    /// Concurrent lookups of the same URL share one download, and resolved locations are
    /// cached. Failed lookups are retried on the next call.
    pub fn quake_location(&self, url: &Url) -> Future<QuakeLocation> {
        self.locations.get(url)
    }

    /// The cache of resolved locations.
    pub fn locations(&self) -> &DeduplicatingCache<Url, QuakeLocation> {
        self.locations.cache()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;
    use crate::sources::source_fn;
    use crate::test;

    const FEED: &str = "http://quakes.invalid/feed.json";

    fn detail_url(code: &str) -> Url {
        Url::parse(&format!("http://quakes.invalid/detail/{code}.json")).unwrap()
    }

    fn feature(code: &str, time: i64) -> serde_json::Value {
        serde_json::json!({
            "type": "Feature",
            "properties": {
                "mag": 1.5,
                "place": format!("near {code}"),
                "time": time,
                "code": code,
                "detail": detail_url(code),
            }
        })
    }

    fn detail(lon: f64, lat: f64) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "geometry": { "type": "Point", "coordinates": [lon, lat, 10.0] }
        }))
        .unwrap()
    }

    /// Serves documents from memory, counting downloads per URL.
    #[derive(Default)]
    struct Documents {
        documents: HashMap<String, Vec<u8>>,
        downloads: Mutex<HashMap<String, usize>>,
    }

    impl Documents {
        fn with(mut self, url: &str, data: Vec<u8>) -> Self {
            self.documents.insert(url.to_owned(), data);
            self
        }

        fn downloads(&self, url: &str) -> usize {
            self.downloads.lock().get(url).copied().unwrap_or_default()
        }
    }

    impl OperationSource<Url> for Documents {
        type Output = Bytes;

        fn fetch(&self, url: &Url) -> Future<Bytes> {
            *self.downloads.lock().entry(url.to_string()).or_default() += 1;
            match self.documents.get(url.as_str()) {
                Some(data) => Future::resolved(Bytes::from(data.clone())),
                None => Future::rejected(FetchError::MissingResource(url.to_string())),
            }
        }
    }

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_700_000_600_000).unwrap()
    }

    fn documents() -> Documents {
        let feed = serde_json::json!({
            "type": "FeatureCollection",
            "features": [
                feature("nc0001", 1_700_000_000_000),
                feature("us0002", 1_699_998_200_000),
                feature("ak0003", 1_699_990_000_000),
            ]
        });

        Documents::default()
            .with(FEED, serde_json::to_vec(&feed).unwrap())
            .with(detail_url("nc0001").as_str(), detail(-122.8, 38.8))
            .with(detail_url("us0002").as_str(), detail(142.3, 38.3))
    }

    fn client(documents: Documents) -> QuakeClient<Documents> {
        QuakeClient::new(
            documents,
            Some(Url::parse(FEED).unwrap()),
            Duration::from_secs(3600),
        )
    }

    #[test]
    fn test_decode_feed() {
        let feed = serde_json::json!({ "features": [feature("nc0001", 1_700_000_000_000)] });
        let feed: GeoJson = serde_json::from_value(feed).unwrap();

        let quake = &feed.features[0];
        assert_eq!(quake.code, "nc0001");
        assert_eq!(quake.place, "near nc0001");
        assert_eq!(quake.time.timestamp(), 1_700_000_000);
        assert_eq!(quake.detail, detail_url("nc0001"));
        assert_eq!(quake.location, None);
    }

    #[test]
    fn test_decode_missing_field() {
        let data = Bytes::from(
            serde_json::to_vec(&serde_json::json!({
                "features": [{ "properties": { "mag": 2.0, "place": "nowhere" } }]
            }))
            .unwrap(),
        );

        let feed = Future::resolved(data).decoded::<GeoJson>();
        match feed.outcome() {
            Some(Err(FetchError::Decode(message))) => assert!(message.contains("missing quake")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_location_accessors() {
        let location = QuakeLocation {
            coordinates: vec![-122.8, 38.8, 2.1],
        };
        assert_eq!(location.longitude(), -122.8);
        assert_eq!(location.latitude(), 38.8);

        let partial = QuakeLocation {
            coordinates: vec![12.5],
        };
        assert_eq!(partial.longitude(), 12.5);
        assert_eq!(partial.latitude(), 0.0);
        assert_eq!(QuakeLocation::default().longitude(), 0.0);
    }

    #[tokio::test]
    async fn test_recent_locations_are_resolved() {
        test::setup();
        let client = client(documents());

        let quakes = client.quakes_as_of(now()).await.unwrap();

        let codes: Vec<_> = quakes.iter().map(|quake| quake.code.as_str()).collect();
        assert_eq!(codes, ["nc0001", "us0002", "ak0003"]);

        let location = quakes[0].location.as_ref().unwrap();
        assert_eq!((location.longitude(), location.latitude()), (-122.8, 38.8));
        assert_eq!(quakes[1].location.as_ref().unwrap().longitude(), 142.3);
        // outside of the window, and its detail document does not even exist
        assert_eq!(quakes[2].location, None);
    }

    #[tokio::test]
    async fn test_locations_are_cached() {
        test::setup();
        let client = client(documents());

        client.quakes_as_of(now()).await.unwrap();
        client.quakes_as_of(now()).await.unwrap();

        let documents = &client.downloader;
        assert_eq!(documents.downloads(FEED), 2);
        assert_eq!(documents.downloads(detail_url("nc0001").as_str()), 1);
        assert_eq!(documents.downloads(detail_url("us0002").as_str()), 1);
        assert_eq!(client.locations().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_location_fails_quakes() {
        test::setup();
        let client = client(documents());

        // a wider window reaches the quake without a detail document
        let wide = QuakeClient::new(
            documents(),
            Some(Url::parse(FEED).unwrap()),
            Duration::from_secs(6 * 3600),
        );

        let result = wide.quakes_as_of(now()).await;
        assert_eq!(
            result,
            Err(FetchError::MissingResource(
                detail_url("ak0003").to_string()
            ))
        );
        // the failure is not cached, but the successful lookups are
        assert_eq!(wide.locations().peek(&detail_url("ak0003")), None);
        assert!(wide.locations().peek(&detail_url("nc0001")).is_some());

        assert!(client.quakes_as_of(now()).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_feed_url() {
        test::setup();
        let client = QuakeClient::new(Documents::default(), None, Duration::from_secs(3600));

        assert!(matches!(
            client.quakes().await,
            Err(FetchError::MissingResource(_))
        ));
        assert_eq!(client.downloader.downloads(FEED), 0);
    }

    #[test]
    fn test_concurrent_lookups_share_download() {
        test::setup();

        let downloads = Arc::new(AtomicUsize::new(0));
        let pending = Arc::new(Mutex::new(Vec::new()));
        let source = source_fn({
            let downloads = Arc::clone(&downloads);
            let pending = Arc::clone(&pending);
            move |_: &Url| {
                downloads.fetch_add(1, Ordering::SeqCst);
                let promise = crate::promise::Promise::new();
                let future = promise.future();
                pending.lock().push(promise);
                future
            }
        });
        let client = QuakeClient::new(source, None, Duration::from_secs(3600));

        let url = detail_url("nc0001");
        let lookups: Vec<_> = (0..10).map(|_| client.quake_location(&url)).collect();
        assert_eq!(downloads.load(Ordering::SeqCst), 1);

        for promise in pending.lock().drain(..) {
            promise.resolve(Bytes::from(detail(1.0, 2.0))).unwrap();
        }
        for lookup in lookups {
            assert_eq!(lookup.outcome().unwrap().unwrap().latitude(), 2.0);
        }
    }
}
