use prometheus::{IntCounterVec, IntGauge, Opts, Registry};

// ============================================================================
// Metrics Module - Prometheus metrics for the event store
// ============================================================================
//
// Provides counters for:
// - Messages published and publish failures
// - Messages handed to subscribers
// - Payloads that failed to decode (the out-of-band sink for decode errors)
// - Callback handlers that panicked
// - Currently active subscriptions
//
// Every counter is labelled by topic. The registry is exposed so the host
// application can merge it into its own scrape endpoint.
// ============================================================================

pub struct EventMetrics {
    registry: Registry,

    pub events_published: IntCounterVec,
    pub events_publish_failed: IntCounterVec,
    pub events_delivered: IntCounterVec,
    pub events_decode_failed: IntCounterVec,
    pub events_handler_panicked: IntCounterVec,
    pub active_subscriptions: IntGauge,
}

impl EventMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let events_published = IntCounterVec::new(
            Opts::new("events_published_total", "Total messages published to the broker"),
            &["topic"],
        )?;
        registry.register(Box::new(events_published.clone()))?;

        let events_publish_failed = IntCounterVec::new(
            Opts::new("events_publish_failed_total", "Total messages that failed to publish"),
            &["topic"],
        )?;
        registry.register(Box::new(events_publish_failed.clone()))?;

        let events_delivered = IntCounterVec::new(
            Opts::new("events_delivered_total", "Total decoded messages handed to subscribers"),
            &["topic"],
        )?;
        registry.register(Box::new(events_delivered.clone()))?;

        let events_decode_failed = IntCounterVec::new(
            Opts::new("events_decode_failed_total", "Total inbound payloads that failed to decode"),
            &["topic"],
        )?;
        registry.register(Box::new(events_decode_failed.clone()))?;

        let events_handler_panicked = IntCounterVec::new(
            Opts::new("events_handler_panicked_total", "Total callback handler invocations that panicked"),
            &["topic"],
        )?;
        registry.register(Box::new(events_handler_panicked.clone()))?;

        let active_subscriptions = IntGauge::new(
            "active_subscriptions",
            "Subscriptions currently registered on the store",
        )?;
        registry.register(Box::new(active_subscriptions.clone()))?;

        Ok(Self {
            registry,
            events_published,
            events_publish_failed,
            events_delivered,
            events_decode_failed,
            events_handler_panicked,
            active_subscriptions,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_published(&self, topic: &str) {
        self.events_published.with_label_values(&[topic]).inc();
    }

    pub fn record_publish_failed(&self, topic: &str) {
        self.events_publish_failed.with_label_values(&[topic]).inc();
    }

    pub fn record_delivered(&self, topic: &str) {
        self.events_delivered.with_label_values(&[topic]).inc();
    }

    pub fn record_decode_failed(&self, topic: &str) {
        self.events_decode_failed.with_label_values(&[topic]).inc();
    }

    pub fn record_handler_panic(&self, topic: &str) {
        self.events_handler_panicked.with_label_values(&[topic]).inc();
    }

    pub fn decode_failures(&self, topic: &str) -> u64 {
        self.events_decode_failed.with_label_values(&[topic]).get()
    }

    pub fn delivered(&self, topic: &str) -> u64 {
        self.events_delivered.with_label_values(&[topic]).get()
    }

    pub fn handler_panics(&self, topic: &str) -> u64 {
        self.events_handler_panicked.with_label_values(&[topic]).get()
    }
}
