use std::io;
use std::path::Path;
use std::sync::OnceLock;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

static RECORDER: OnceLock<PrometheusHandle> = OnceLock::new();

/// Process-wide telemetry: env-filtered tracing on stderr (stdout stays
/// clean for CLI output) and an in-process prometheus recorder. There is no
/// scrape endpoint; metric values are rendered into the run directory.
pub struct Telemetry {
    prometheus: PrometheusHandle,
    _tracing_guard: Option<WorkerGuard>,
}

impl Telemetry {
    /// Idempotent per process: a second call reuses the installed recorder
    /// and leaves the existing subscriber in place.
    pub fn init() -> Self {
        let filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy();
        let (writer, guard) = tracing_appender::non_blocking(io::stderr());
        let installed = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .try_init()
            .is_ok();

        let prometheus = RECORDER
            .get_or_init(|| {
                PrometheusBuilder::new()
                    .install_recorder()
                    .expect("install prometheus recorder")
            })
            .clone();

        Self {
            prometheus,
            // The guard flushes buffered lines on drop; without a live
            // subscriber there is nothing to flush.
            _tracing_guard: installed.then_some(guard),
        }
    }

    pub fn prometheus(&self) -> PrometheusHandle {
        self.prometheus.clone()
    }

    pub fn write_snapshot(&self, dir: &Path) {
        write_prometheus_snapshot(&self.prometheus, dir);
    }
}

/// Renders current metric values into `<dir>/metrics.prom`. Best effort; a
/// failed snapshot never interrupts trading.
pub fn write_prometheus_snapshot(handle: &PrometheusHandle, dir: &Path) {
    let _ = std::fs::create_dir_all(dir);
    let _ = std::fs::write(dir.join("metrics.prom"), handle.render());
}
