//metrics.rs
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, register_int_gauge, Counter,
    CounterVec, Histogram, HistogramOpts, IntGauge, Opts,
};

// Define metrics
lazy_static! {
    // Pipeline metrics
    pub static ref EVENTS_INGESTED: Counter = register_counter!(Opts::new(
        "events_ingested_total",
        "Total number of domain events ingested"
    ))
    .unwrap();

    pub static ref EVENTS_DEDUPLICATED: Counter = register_counter!(Opts::new(
        "events_deduplicated_total",
        "Total number of duplicate domain events dropped"
    ))
    .unwrap();

    pub static ref NOTIFICATIONS_CREATED: Counter = register_counter!(Opts::new(
        "notifications_created_total",
        "Total number of notification records created"
    ))
    .unwrap();

    pub static ref NOTIFICATIONS_DEFERRED: Counter = register_counter!(Opts::new(
        "notifications_deferred_total",
        "Total number of notifications deferred for a digest"
    ))
    .unwrap();

    // Per-channel delivery metrics
    pub static ref CHANNEL_ATTEMPTS: CounterVec = register_counter_vec!(
        Opts::new("channel_attempts_total", "Delivery attempts per channel"),
        &["channel"]
    )
    .unwrap();

    pub static ref CHANNEL_SUCCESSES: CounterVec = register_counter_vec!(
        Opts::new("channel_successes_total", "Successful deliveries per channel"),
        &["channel"]
    )
    .unwrap();

    pub static ref CHANNEL_FAILURES: CounterVec = register_counter_vec!(
        Opts::new("channel_failures_total", "Failed deliveries per channel"),
        &["channel"]
    )
    .unwrap();

    pub static ref EMAIL_FALLBACK_USED: Counter = register_counter!(Opts::new(
        "email_fallback_used_total",
        "Emails submitted via the SMTP fallback"
    ))
    .unwrap();

    pub static ref DIGESTS_SENT: Counter = register_counter!(Opts::new(
        "digests_sent_total",
        "Total number of digest emails sent"
    ))
    .unwrap();

    pub static ref RETRIES_SCHEDULED: Counter = register_counter!(Opts::new(
        "retries_scheduled_total",
        "Failed notifications handed back to the dispatcher"
    ))
    .unwrap();

    pub static ref NOTIFICATIONS_EXPIRED: Counter = register_counter!(Opts::new(
        "notifications_expired_total",
        "Notifications failed terminally because they expired"
    ))
    .unwrap();

    // Websocket metrics
    pub static ref WS_CONNECTIONS: IntGauge = register_int_gauge!(Opts::new(
        "ws_connections",
        "Currently open websocket connections"
    ))
    .unwrap();

    pub static ref WS_FRAMES_SENT: Counter = register_counter!(Opts::new(
        "ws_frames_sent_total",
        "Server-to-client websocket frames sent"
    ))
    .unwrap();

    // Timing metrics
    pub static ref DISPATCH_TIME: Histogram = register_histogram!(
        HistogramOpts::new(
            "dispatch_time_seconds",
            "Time taken to dispatch one notification across its channels"
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0])
    )
    .unwrap();

    pub static ref EMAIL_SUBMIT_TIME: Histogram = register_histogram!(
        HistogramOpts::new(
            "email_submit_time_seconds",
            "Time taken to submit an email to a provider"
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0])
    )
    .unwrap();
}

// Function to expose metrics endpoint
pub fn metrics_handler() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        return format!("Error encoding metrics: {}", e);
    }

    match String::from_utf8(buffer) {
        Ok(metrics) => metrics,
        Err(e) => format!("Error converting metrics to string: {}", e),
    }
}
