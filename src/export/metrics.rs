use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::device::stats::{Counter, PipelineStats, MAX_COUNTER};
use crate::poller::PollerSummary;

const NAMESPACE: &str = "ttperf";

/// Prometheus metrics for the postprocessing pipeline, all under the
/// "ttperf" namespace.
pub struct PipelineMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Cumulative pipeline counters by stage.
    pub pipeline_counters: GaugeVec,
    /// Traces drained per scratch queue.
    pub traces_per_queue: GaugeVec,
    /// Time to write the reports of one epoch (1ms-5s buckets).
    pub epoch_report_duration: Histogram,
    /// Run-level throughput from the epoch summary.
    pub samples_per_second: Gauge,
    /// Whether every performance check passed so far (1=yes, 0=no).
    pub perf_check_passed: Gauge,
}

impl PipelineMetrics {
    /// Creates a metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let pipeline_counters = GaugeVec::new(
            Opts::new(
                "pipeline_events",
                "Cumulative pipeline events by stage.",
            )
            .namespace(NAMESPACE),
            &["stage"],
        )?;
        let traces_per_queue = GaugeVec::new(
            Opts::new("traces_per_queue", "Thread dumps drained per scratch queue.")
                .namespace(NAMESPACE),
            &["queue"],
        )?;
        let epoch_report_duration = Histogram::with_opts(
            HistogramOpts::new(
                "epoch_report_duration_seconds",
                "Time spent writing the reports of one epoch.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        let samples_per_second = Gauge::with_opts(
            Opts::new(
                "samples_per_second",
                "Inputs per second over all epochs, excluding the last epoch of each program.",
            )
            .namespace(NAMESPACE),
        )?;
        let perf_check_passed = Gauge::with_opts(
            Opts::new(
                "perf_check_passed",
                "Whether every performance check passed (1=yes, 0=no).",
            )
            .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(pipeline_counters.clone()))?;
        registry.register(Box::new(traces_per_queue.clone()))?;
        registry.register(Box::new(epoch_report_duration.clone()))?;
        registry.register(Box::new(samples_per_second.clone()))?;
        registry.register(Box::new(perf_check_passed.clone()))?;

        perf_check_passed.set(1.0);

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            pipeline_counters,
            traces_per_queue,
            epoch_report_duration,
            samples_per_second,
            perf_check_passed,
        })
    }

    /// Copy the current pipeline counters into their gauges.
    pub fn observe_stats(&self, stats: &PipelineStats) {
        for raw in 0..=MAX_COUNTER {
            let Some(counter) = u8::try_from(raw).ok().and_then(Counter::from_u8) else {
                continue;
            };
            self.pipeline_counters
                .with_label_values(&[counter.as_str()])
                .set(stats.get(counter) as f64);
        }
    }

    pub fn observe_poller(&self, summary: &PollerSummary) {
        for (queue, traces) in summary.traces_per_queue.iter().enumerate() {
            self.traces_per_queue
                .with_label_values(&[&queue.to_string()])
                .set(*traces as f64);
        }
    }

    /// Prometheus text exposition of every registered metric.
    pub fn render(&self) -> Result<String> {
        encode(&self.registry)
    }

    /// Serve /metrics and /healthz until `stop`. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let bind_addr = match self.addr.as_str() {
            "" => "0.0.0.0:9090".to_string(),
            shorthand if shorthand.starts_with(':') => format!("0.0.0.0{shorthand}"),
            addr => addr.to_string(),
        };

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(Arc::new(AppState {
                registry: self.registry.clone(),
                perf_check_passed: self.perf_check_passed.clone(),
            }));

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("binding metrics server to {bind_addr}"))?;
        let local_addr = listener.local_addr().context("reading metrics server address")?;

        let cancel = CancellationToken::new();
        if let Some(previous) = self.shutdown.lock().replace(cancel.clone()) {
            previous.cancel();
        }

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "metrics server started");
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await;
            if let Err(e) = served {
                tracing::error!(error = %e, "metrics server error");
            }
        });

        Ok(local_addr)
    }

    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
            tracing::debug!("metrics server stopping");
        }
        Ok(())
    }
}

fn encode(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

struct AppState {
    registry: Registry,
    perf_check_passed: Gauge,
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "encoding metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "encoding error".to_string())
        }
    }
}

/// 503 once any performance check has failed.
async fn healthz_handler(State(state): State<Arc<AppState>>) -> (StatusCode, &'static str) {
    if state.perf_check_passed.get() > 0.0 {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "performance check failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_stats_and_render() {
        let metrics = PipelineMetrics::new("").expect("metrics");
        let stats = PipelineStats::new();
        stats.record_n(Counter::FullCores, 3);
        metrics.observe_stats(&stats);
        metrics.observe_poller(&PollerSummary {
            traces_per_queue: vec![4, 0],
            corrupt_slots: 0,
        });

        let text = metrics.render().expect("render");
        assert!(text.contains("ttperf_pipeline_events{stage=\"full_cores\"} 3"));
        assert!(text.contains("ttperf_pipeline_events{stage=\"epochs_reported\"} 0"));
        assert!(text.contains("ttperf_traces_per_queue{queue=\"0\"} 4"));
        assert!(text.contains("ttperf_perf_check_passed 1"));
    }

    #[tokio::test]
    async fn test_server_start_stop() {
        let metrics = PipelineMetrics::new("127.0.0.1:0").expect("metrics");
        let addr = metrics.start().await.expect("start");
        assert_ne!(addr.port(), 0);
        metrics.stop().await.expect("stop");
        assert!(metrics.shutdown.lock().is_none());
    }

    #[tokio::test]
    async fn test_healthz_follows_perf_check() {
        let metrics = PipelineMetrics::new("").expect("metrics");
        let state = Arc::new(AppState {
            registry: metrics.registry.clone(),
            perf_check_passed: metrics.perf_check_passed.clone(),
        });

        let (status, _) = healthz_handler(State(Arc::clone(&state))).await;
        assert_eq!(status, StatusCode::OK);

        metrics.perf_check_passed.set(0.0);
        let (status, body) = healthz_handler(State(state)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, "performance check failed");
    }
}
