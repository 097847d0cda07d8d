use std::{net::SocketAddr, time::Instant};

use metrics::{describe_counter, Histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install and start a prometheus http exporter listening on `metrics_addr`
/// and define all metrics.
pub(crate) fn install_prom(metrics_addr: &str) -> anyhow::Result<()> {
    let metrics_addr: SocketAddr = metrics_addr.parse()?;

    // exponential bucket bounds starting at 250 micros. reconcile passes are
    // cheap, pool pushes are a full http round trip.
    const US_PER_SEC: f64 = 1000000.0;
    let buckets: Vec<f64> = (0..16)
        .map(|i| (2u32.pow(i) as f64) * 250.0 / US_PER_SEC)
        .collect();

    let builder = PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .set_buckets(&buckets)
        .expect("invalid bucket settings. this is a bug");
    builder.install()?;

    describe_metrics();

    Ok(())
}

fn describe_metrics() {
    describe_timer!(
        "reconcile_time",
        "Time to process one reconciler message (seconds)",
    );
    describe_timer!(
        "publish_time",
        "Time to build and push a pool definition (seconds)",
    );
    describe_counter!(
        "publish_errors",
        "The total number of failed pool definition pushes",
    );
}

/// Describe a timer. Shorthand for `describe_histogram!(name, Unit::Seconds,
/// description)` so you don't have to remember what units timers are in.
macro_rules! describe_timer {
    ($name:expr, $description:expr $(,)?) => {{
        ::metrics::describe_histogram!($name, ::metrics::Unit::Seconds, $description)
    }};
}
pub(crate) use describe_timer;

/// Creates a timer that runs until it goes out of scope. Timed values are
/// tracked with a metrics histogram and assumes that durations are recorded as
/// an f64 number of seconds.
macro_rules! scoped_timer {
    ($name:expr $(, $label_key:expr $(=> $label_value:expr)?)* $(,)?) => {{
        let hist = ::metrics::histogram!($name $(, $label_key $(=> $label_value)?)*);
        crate::metrics::TimerGuard::new_at(hist, std::time::Instant::now())
    }};
}
pub(crate) use scoped_timer;

/// An RAII timer guard that records its duration on drop.
///
/// Created with [scoped_timer].
pub(crate) struct TimerGuard {
    hist: Histogram,
    started_at: Instant,
}

impl TimerGuard {
    pub(crate) fn new_at(hist: Histogram, started_at: Instant) -> Self {
        Self { hist, started_at }
    }
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.hist.record(self.started_at.elapsed().as_secs_f64());
    }
}
