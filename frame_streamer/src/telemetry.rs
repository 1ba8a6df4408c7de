use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Histogram, MeterProvider},
    KeyValue,
};
use prometheus::Registry;
use std::collections::HashSet;

pub struct Metrics {
    frames_sent: Counter<u64>,
    ticks_skipped: Counter<u64>,
    results: Counter<u64>,
    transport_errors: Counter<u64>,
    round_trip: Histogram<u64>,
    people_count: Gauge<u64>,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build prometheus exporter: {:?}", e))?;

        let provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
            .with_reader(exporter)
            .build();

        let meter = provider.meter("frame_streamer");
        global::set_meter_provider(provider);

        let frames_sent = meter
            .u64_counter("frames_sent")
            .with_description("Frames handed to the transport")
            .build();

        let ticks_skipped = meter
            .u64_counter("ticks_skipped")
            .with_description("Sampling ticks that produced no send, by reason")
            .build();

        let results = meter
            .u64_counter("results_delivered")
            .with_description("Inference results passed to the result sink")
            .build();

        let transport_errors = meter
            .u64_counter("transport_errors")
            .with_description("Failed or timed out frames, by kind")
            .build();

        let boundaries = generate_boundaries((10, 100, 500, 2000, 10000), (10, 50, 250, 1000));

        let round_trip = meter
            .u64_histogram("round_trip_ms")
            .with_boundaries(boundaries)
            .with_description("Time from send to result in milliseconds")
            .build();

        let people_count = meter
            .u64_gauge("people_count")
            .with_description("Most recent people count")
            .build();

        Ok(Metrics {
            frames_sent,
            ticks_skipped,
            results,
            transport_errors,
            round_trip,
            people_count,
            registry,
        })
    }

    pub fn record_frame_sent(&self) {
        self.frames_sent.add(1, &[]);
    }

    pub fn record_skipped_tick(&self, reason: &'static str) {
        self.ticks_skipped.add(1, &[KeyValue::new("reason", reason)]);
    }

    pub fn record_result(&self, people_count: u32, round_trip_ms: Option<u64>) {
        self.results.add(1, &[]);
        self.people_count.record(people_count as u64, &[]);
        if let Some(elapsed) = round_trip_ms {
            self.round_trip.record(elapsed, &[]);
        }
    }

    pub fn record_transport_error(&self, kind: &'static str) {
        self.transport_errors.add(1, &[KeyValue::new("kind", kind)]);
    }
}

/// Histogram bucket edges: four ranges between the five `parts`, each walked
/// with its own step from `steps`. Shared edges appear once.
fn generate_boundaries(parts: (u64, u64, u64, u64, u64), steps: (usize, usize, usize, usize)) -> Vec<f64> {
    let first_part = (parts.0..=parts.1).step_by(steps.0);
    let middle_part = (parts.1..=parts.2).step_by(steps.1);
    let end_part = (parts.2..=parts.3).step_by(steps.2);
    let tail_part = (parts.3..=parts.4).step_by(steps.3);

    let mut seen = HashSet::new();
    first_part
        .chain(middle_part)
        .chain(end_part)
        .chain(tail_part)
        .filter(|&x| seen.insert(x))
        .map(|x| x as f64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{Encoder, TextEncoder};

    #[test]
    fn test_generate_boundaries() {
        let get = generate_boundaries((2, 22, 26, 46, 146), (10, 2, 20, 100));
        let expected = vec![2.0, 12.0, 22.0, 24.0, 26.0, 46.0, 146.0];

        assert_eq!(get, expected);
    }

    #[test]
    fn test_recorded_values_are_exported() {
        let metrics = Metrics::new().unwrap();
        metrics.record_frame_sent();
        metrics.record_skipped_tick("backpressure");
        metrics.record_result(3, Some(120));
        metrics.record_transport_error("response_timeout");

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&metrics.registry.gather(), &mut buffer)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();

        assert!(text.contains("frames_sent"));
        assert!(text.contains("backpressure"));
        assert!(text.contains("response_timeout"));
        assert!(text.contains("people_count"));
    }
}
