// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Scheduler --------
pub static CALLS_SCHEDULED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("pricing_calls_scheduled_total", "debounced calls scheduled").unwrap()
});

pub static CALLS_ISSUED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("pricing_calls_issued_total", "remote calls issued after quiescence").unwrap()
});

pub static CALLS_CANCELLED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("pricing_calls_cancelled_total", "calls explicitly cancelled").unwrap()
});

pub static STALE_SUPPRESSED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "pricing_stale_suppressed_total",
        "completions dropped because a newer call superseded them",
    )
    .unwrap()
});

// -------- Coordinator --------
pub static RESULTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("pricing_results_total", "delivered results by outcome"),
        &["outcome"],
    )
    .unwrap()
});

pub static BELOW_MINIMUM: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("pricing_below_minimum_total", "line submissions blocked by minimum weight")
        .unwrap()
});

// Remote latency (milliseconds)
pub static TARIFF_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(HistogramOpts::new("tariff_latency_ms", "Tariff call latency (ms)"))
        .unwrap()
});

// ---- Config visibility ----
pub static CONFIG_TARIFF_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_tariff_mode", "tariff backend (label: mode)"),
        &["mode"],
    )
    .unwrap()
});

pub fn init() {
    for m in [
        REGISTRY.register(Box::new(CALLS_SCHEDULED.clone())),
        REGISTRY.register(Box::new(CALLS_ISSUED.clone())),
        REGISTRY.register(Box::new(CALLS_CANCELLED.clone())),
        REGISTRY.register(Box::new(STALE_SUPPRESSED.clone())),
        REGISTRY.register(Box::new(RESULTS.clone())),
        REGISTRY.register(Box::new(BELOW_MINIMUM.clone())),
        REGISTRY.register(Box::new(TARIFF_LATENCY.clone())),
        REGISTRY.register(Box::new(CONFIG_TARIFF_MODE.clone())),
    ] {
        if let Err(e) = m {
            tracing::warn!(?e, "metric registration failed");
        }
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics) — tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/plain; version=0.0.4; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Metrics server on a dedicated OS thread (keeps the Tokio runtime clean)
pub fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(%addr, ?e, "metrics bind failed");
                return;
            }
        };
        tracing::info!("metrics listening on http://{addr}/ (and /metrics)");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => tracing::warn!(?e, "metrics accept error"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_metrics_are_encoded() {
        init();
        RESULTS.with_label_values(&["applied"]).inc();
        let text = String::from_utf8(encode_metrics()).unwrap();
        assert!(text.contains("pricing_results_total"));
    }
}
