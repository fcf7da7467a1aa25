//! Support to fetch resources from HTTP servers.

use std::time::{Duration, Instant};

use bytes::Bytes;
use reqwest::{Client, StatusCode, Url, header};
use sentry::{Hub, SentryFutureExt};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{FetchError, Outcome};
use crate::promise::{Future, Promise};

use super::OperationSource;

/// The user agent sent with every request.
pub const USER_AGENT: &str = concat!("coalesce/", env!("CARGO_PKG_VERSION"));

/// Creates a [`reqwest::Client`] with the provided timeout for establishing connections.
///
/// The overall request timeout is enforced by the [`HttpSource`], so that it can be reported
/// as a [`FetchError::Timeout`].
pub fn create_client(connect_timeout: Duration) -> reqwest::Result<Client> {
    reqwest::ClientBuilder::new()
        .gzip(true)
        .hickory_dns(true)
        .connect_timeout(connect_timeout)
        .pool_idle_timeout(Duration::from_secs(30))
        .build()
}

/// An [`OperationSource`] that downloads the body behind a URL.
///
/// Downloads run as tasks on the given tokio runtime, so [`fetch`](OperationSource::fetch) can
/// be called from any thread.
#[derive(Clone, Debug)]
pub struct HttpSource {
    client: Client,
    runtime: Handle,
    timeout: Duration,
}

impl HttpSource {
    pub fn new(client: Client, runtime: Handle, timeout: Duration) -> Self {
        Self {
            client,
            runtime,
            timeout,
        }
    }

    /// Creates a source with the timeouts from `config`.
    pub fn from_config(config: &Config, runtime: Handle) -> reqwest::Result<Self> {
        let client = create_client(config.connect_timeout)?;
        Ok(Self::new(client, runtime, config.request_timeout))
    }

    fn spawn_download(&self, url: &Url, token: Option<CancellationToken>) -> Future<Bytes> {
        let promise = Promise::new();
        let future = promise.future();

        let client = self.client.clone();
        let url = url.clone();
        let timeout = self.timeout;

        let task = async move {
            let start = Instant::now();
            let request = download(&client, &url, timeout);

            let outcome = match token {
                Some(token) => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => Err(FetchError::Cancelled),
                        outcome = request => outcome,
                    }
                }
                None => request.await,
            };

            let status = match &outcome {
                Ok(_) => "ok",
                Err(error) => {
                    tracing::debug!(%url, %error, "Failed to fetch");
                    error.kind()
                }
            };
            metric!(counter("fetch.status") += 1, "status" => status);
            metric!(timer("fetch.duration") = start.elapsed(), "status" => status);

            promise.settle(outcome).ok();
        };

        // A task that never runs drops the promise, which fails the future as abandoned.
        self.runtime
            .spawn(task.bind_hub(Hub::new_from_top(Hub::current())));

        future
    }
}

impl OperationSource<Url> for HttpSource {
    type Output = Bytes;

    fn fetch(&self, url: &Url) -> Future<Bytes> {
        self.spawn_download(url, None)
    }

    fn fetch_cancellable(&self, url: &Url, token: CancellationToken) -> Future<Bytes> {
        self.spawn_download(url, Some(token))
    }
}

async fn download(client: &Client, url: &Url, timeout: Duration) -> Outcome<Bytes> {
    tracing::debug!("Fetching `{}`", url);

    match tokio::time::timeout(timeout, send_request(client, url)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(FetchError::Timeout(timeout)),
    }
}

async fn send_request(client: &Client, url: &Url) -> Outcome<Bytes> {
    let response = client
        .get(url.clone())
        .header(header::USER_AGENT, USER_AGENT)
        .send()
        .await?;

    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return Err(FetchError::MissingResource(url.to_string()));
    }
    if !status.is_success() {
        return Err(FetchError::Transport(format!(
            "server responded with {status}"
        )));
    }

    Ok(response.bytes().await?)
}
