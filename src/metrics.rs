use actix_web::{http::header, HttpResponse};
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder};

pub static WS_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "presence_ws_connections",
        "Live WebSocket sessions registered in this instance",
    )
    .expect("failed to create presence_ws_connections");
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .expect("failed to register presence_ws_connections");
    gauge
});

pub static CONNECT_REJECTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "presence_connect_rejections_total",
            "WebSocket handshakes rejected, by reason",
        ),
        &["reason"],
    )
    .expect("failed to create presence_connect_rejections_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register presence_connect_rejections_total");
    counter
});

pub static PUSH_OUTCOMES: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "presence_push_outcomes_total",
            "Push requests by outcome (delivered, queued, dropped, failed)",
        ),
        &["outcome"],
    )
    .expect("failed to create presence_push_outcomes_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register presence_push_outcomes_total");
    counter
});

pub static OFFLINE_REPLAYED: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "presence_offline_replayed_total",
        "Offline queue entries replayed to a live session",
    )
    .expect("failed to create presence_offline_replayed_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register presence_offline_replayed_total");
    counter
});

pub static OFFLINE_DISCARDED: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "presence_offline_discarded_total",
        "Offline queue entries removed because they could not be decoded",
    )
    .expect("failed to create presence_offline_discarded_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register presence_offline_discarded_total");
    counter
});

pub fn record_push(outcome: &str) {
    PUSH_OUTCOMES.with_label_values(&[outcome]).inc();
}

pub fn record_rejection(reason: &str) {
    CONNECT_REJECTIONS.with_label_values(&[reason]).inc();
}

pub async fn metrics_handler() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .insert_header((header::CONTENT_TYPE, encoder.format_type()))
        .body(buffer)
}
