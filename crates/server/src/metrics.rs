use anyhow::Result;
use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

pub fn describe() {
    describe_counter!(
        "pulse_opinions_submitted_total",
        "Number of opinions accepted."
    );
    describe_counter!(
        "pulse_badge_runs_total",
        "Monthly badge ranking runs, by status."
    );
    describe_counter!(
        "pulse_badges_assigned_total",
        "Number of top-5 badges written."
    );
    describe_counter!(
        "pulse_db_query_errors_total",
        "Database operations that returned an error."
    );
    describe_histogram!(
        "pulse_db_query_latency_ms",
        "Database operation latency in milliseconds."
    );
}

pub fn install_prometheus(port: u16) -> Result<PrometheusHandle> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    Ok(PrometheusBuilder::new()
        .with_http_listener(addr)
        .install_recorder()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prometheus_handle_renders_metric_names() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        describe();

        metrics::with_local_recorder(&recorder, || {
            let c = metrics::counter!("pulse_opinions_submitted_total");
            c.increment(1);
        });

        let rendered = handle.render();
        assert!(rendered.contains("pulse_opinions_submitted_total"));
    }
}
