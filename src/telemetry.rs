//! Telemetry and structured logging for the batch supervisor.

use crate::job::{JobSnapshot, JobStatus};
use opentelemetry::trace::{Span, Tracer};
use opentelemetry::{global, KeyValue};
use tracing::{info, warn};

const TRACER_NAME: &str = "batch-supervisor";

/// Records telemetry for a job that reached a terminal state.
///
/// Emits a structured log line and an OpenTelemetry span carrying:
/// - Job duration (ms)
/// - Final status and exit code
/// - Input size and tag count
/// - Error message (if failed)
pub fn record_job_telemetry(job: &JobSnapshot) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("batch_job");

    span.set_attribute(KeyValue::new("job_id", job.job_id.clone()));
    span.set_attribute(KeyValue::new("status", job.status.to_string()));
    span.set_attribute(KeyValue::new("total_urls", job.total_urls as i64));
    span.set_attribute(KeyValue::new("batch_size", job.config.batch_size as i64));
    span.set_attribute(KeyValue::new("tag_count", job.config.tags.len() as i64));

    if let Some(code) = job.exit_code {
        span.set_attribute(KeyValue::new("exit_code", code as i64));
    }

    if let Some(progress) = &job.progress {
        span.set_attribute(KeyValue::new("processed", progress.processed as i64));
        span.set_attribute(KeyValue::new("failed_urls", progress.failed as i64));
    }

    if let Some(duration_ms) = job.duration_ms() {
        span.set_attribute(KeyValue::new("duration_ms", duration_ms));

        info!(
            job_id = %job.job_id,
            status = %job.status,
            exit_code = ?job.exit_code,
            total_urls = job.total_urls,
            duration_ms = duration_ms,
            "Batch job finished"
        );
    }

    if job.status == JobStatus::Failed {
        if let Some(ref error) = job.error {
            span.set_attribute(KeyValue::new("error", error.clone()));
            warn!(
                job_id = %job.job_id,
                error = %error,
                "Batch job failed"
            );
        }
    }

    span.end();
}

/// Records a supervisor heartbeat with the number of live jobs.
pub fn record_supervisor_heartbeat(active_jobs: usize) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("supervisor_heartbeat");

    span.set_attribute(KeyValue::new("active_jobs", active_jobs as i64));
    span.end();

    info!(active_jobs = active_jobs, "Supervisor heartbeat");
}

/// Initializes OpenTelemetry with the OTLP exporter.
///
/// Call once at startup, inside the Tokio runtime. Reads:
/// - `OTEL_EXPORTER_OTLP_ENDPOINT` - Collector endpoint (default: http://localhost:4317)
/// - `OTEL_SERVICE_NAME` - Service name (default: batch-supervisor)
pub fn init_telemetry() -> Result<(), Box<dyn std::error::Error>> {
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::trace::Config;

    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4317".to_string());

    let service_name =
        std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| TRACER_NAME.to_string());

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(&endpoint),
        )
        .with_trace_config(Config::default().with_resource(
            opentelemetry_sdk::Resource::new(vec![
                KeyValue::new("service.name", service_name),
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            ]),
        ))
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    if let Some(provider) = tracer.provider() {
        global::set_tracer_provider(provider);
    }

    info!("Telemetry initialized: endpoint={}", endpoint);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobConfig, JobFiles};

    fn job() -> JobSnapshot {
        JobSnapshot::new(
            "batch_1_abcdefabc".to_string(),
            JobConfig::default(),
            10,
            JobFiles {
                csv_path: "/tmp/j/urls.csv".into(),
                log_path: "/tmp/j/batch.log".into(),
                progress_path: "/tmp/j/progress.json".into(),
                config_path: "/tmp/j/config.json".into(),
            },
        )
    }

    #[test]
    fn test_record_completed_job() {
        // No provider installed: spans go to the global no-op tracer.
        let mut job = job();
        job.mark_running();
        job.finish(JobStatus::Completed);
        job.exit_code = Some(0);

        record_job_telemetry(&job);
    }

    #[test]
    fn test_record_failed_job() {
        let mut job = job();
        job.mark_failed("Process exited with code 1".to_string());

        record_job_telemetry(&job);
    }

    #[test]
    fn test_heartbeat() {
        record_supervisor_heartbeat(3);
    }
}
