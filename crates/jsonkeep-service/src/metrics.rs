//! Statsd metrics.
//!
//! Nothing is reported until [`configure_statsd`] ran, before that every
//! [`metric!`](crate::metric) is a no-op.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use cadence::{Metric, MetricBuilder, MetricError, StatsdClient, UdpMetricSink};

static CLIENT: OnceLock<MetricsClient> = OnceLock::new();

#[doc(hidden)]
pub mod prelude {
    pub use cadence::prelude::*;
}

/// A statsd client, together with the tags added to every metric it sends.
#[derive(Debug)]
pub struct MetricsClient {
    statsd: StatsdClient,
    default_tags: BTreeMap<String, String>,
}

impl MetricsClient {
    pub fn statsd(&self) -> &StatsdClient {
        &self.statsd
    }

    /// Adds the default tags and sends the metric.
    pub fn send<'a, T>(&'a self, builder: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        self.default_tags
            .iter()
            .fold(builder, |builder, (key, value)| builder.with_tag(key, value))
            .send()
    }
}

fn log_metric_error(error: MetricError) {
    tracing::debug!(error = &error as &dyn std::error::Error, "Failed to send metric");
}

/// Starts reporting metrics to the statsd server at `host`.
///
/// Fails if the host can not be resolved, or if metrics were configured before.
pub fn configure_statsd<A>(prefix: &str, host: A, default_tags: BTreeMap<String, String>) -> Result<()>
where
    A: ToSocketAddrs + fmt::Display,
{
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_nonblocking(true)?;
    let description = host.to_string();
    let sink = UdpMetricSink::from(host, socket)
        .with_context(|| format!("failed to resolve statsd host `{description}`"))?;

    let statsd = StatsdClient::builder(prefix, sink)
        .with_error_handler(log_metric_error)
        .build();
    CLIENT
        .set(MetricsClient {
            statsd,
            default_tags,
        })
        .map_err(|_| anyhow::anyhow!("metrics are already configured"))?;

    tracing::info!("Reporting metrics to statsd at {}", description);
    Ok(())
}

/// Calls `f` with the configured client, does nothing if metrics are not configured.
#[inline(always)]
pub fn with_client<F>(f: F)
where
    F: FnOnce(&MetricsClient),
{
    if let Some(client) = CLIENT.get() {
        f(client);
    }
}

/// Emits a metric.
///
/// ```ignore
/// metric!(counter("keep.fetch") += 1, "status" => "ok");
/// metric!(gauge("keep.entries") = 12);
/// metric!(timer("keep.fetch.duration") = start.elapsed());
/// metric!(histogram("store.persist.size") = 1024);
/// ```
#[macro_export]
macro_rules! metric {
    (@send $method:ident, $id:expr, $value:expr $(, $k:expr => $v:expr)*) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.send(client.statsd().$method($id, $value)$(.with_tag($k, $v))*);
        })
    }};
    (counter($id:expr) += $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send count_with_tags, $id, $value $(, $k => $v)*)
    };
    (gauge($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send gauge_with_tags, $id, $value $(, $k => $v)*)
    };
    (timer($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send time_with_tags, $id, $value $(, $k => $v)*)
    };
    (histogram($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send histogram_with_tags, $id, $value $(, $k => $v)*)
    };
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_unconfigured_metrics_are_noops() {
        metric!(counter("test.counter") += 1, "tag" => "value");
        metric!(gauge("test.gauge") = 1u64);
        metric!(timer("test.timer") = std::time::Duration::from_millis(1));
        metric!(histogram("test.histogram") = 1u64);
    }
}
