//! Statsd reporting for caches and fetches.
//!
//! Metrics are only sent once [`configure_statsd`] has been called. Until then, and in tests,
//! [`metric!`](crate::metric) is a no-op.
use std::collections::BTreeMap;
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use cadence::{Metric, MetricBuilder, StatsdClient, UdpMetricSink};

static STATSD: OnceLock<Reporter> = OnceLock::new();

#[doc(hidden)]
pub mod prelude {
    pub use cadence::prelude::*;
}

/// A statsd client plus the tags that go out with every metric.
#[derive(Debug)]
pub struct Reporter {
    client: StatsdClient,
    tags: BTreeMap<String, String>,
}

impl Reporter {
    /// The underlying statsd client, used by [`metric!`](crate::metric) to build metrics.
    pub fn client(&self) -> &StatsdClient {
        &self.client
    }

    /// Attaches the global tags to `metric` and sends it.
    pub fn send<'a, T>(&'a self, metric: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        self.tags
            .iter()
            .fold(metric, |metric, (key, value)| metric.with_tag(key, value))
            .send()
    }
}

/// Starts reporting to the statsd server at `host`.
///
/// Every metric name is prefixed with `prefix` and carries `tags`. Metrics can only be
/// configured once per process.
pub fn configure_statsd<A: ToSocketAddrs>(
    prefix: &str,
    host: A,
    tags: BTreeMap<String, String>,
) -> Result<()> {
    let addrs: Vec<_> = host
        .to_socket_addrs()
        .context("failed to resolve statsd host")?
        .collect();
    let Some(addr) = addrs.first() else {
        anyhow::bail!("statsd host resolved to no addresses");
    };
    tracing::info!(%addr, prefix, "Reporting metrics to statsd");

    let socket = UdpSocket::bind("0.0.0.0:0").context("failed to bind statsd socket")?;
    socket.set_nonblocking(true)?;
    let sink = UdpMetricSink::from(&addrs[..], socket).context("failed to create statsd sink")?;

    let reporter = Reporter {
        client: StatsdClient::from_sink(prefix, sink),
        tags,
    };
    STATSD
        .set(reporter)
        .map_err(|_| anyhow::anyhow!("metrics are already configured"))
}

/// Calls `f` with the configured [`Reporter`], if there is one.
#[doc(hidden)]
#[inline(always)]
pub fn report<F: FnOnce(&Reporter)>(f: F) {
    if let Some(reporter) = STATSD.get() {
        f(reporter);
    }
}

/// Emits a metric.
///
/// ```ignore
/// metric!(counter("caches.dedup.promoted") += 1, "cache" => name);
/// metric!(timer("fetch.duration") = elapsed, "status" => "ok");
/// ```
#[macro_export]
macro_rules! metric {
    (counter($id:expr) += $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metrics::report(|reporter| {
            use $crate::metrics::prelude::*;
            reporter.send(reporter.client().count_with_tags($id, $value) $(.with_tag($k, $v))*);
        })
    };

    (timer($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metrics::report(|reporter| {
            use $crate::metrics::prelude::*;
            reporter.send(reporter.client().time_with_tags($id, $value) $(.with_tag($k, $v))*);
        })
    };
}
