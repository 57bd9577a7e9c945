//! Router metrics for observability.
//!
//! Uses the global OpenTelemetry meter provider which must be initialized
//! by the host application. Without one installed every call is a no-op.

use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

static METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    METER.get_or_init(|| opentelemetry::global::meter("xop-router"))
}

// ============================================================================
// Counters (Cumulative)
// ============================================================================

/// Counter for stanzas entering the router.
pub fn stanzas_received() -> Counter<u64> {
    meter()
        .u64_counter("xop.stanzas.received")
        .with_description("Total stanzas handed to the router")
        .with_unit("stanza")
        .build()
}

/// Counter for stanza copies delivered to components.
pub fn stanzas_routed() -> Counter<u64> {
    meter()
        .u64_counter("xop.stanzas.routed")
        .with_description("Total stanza copies delivered to components")
        .with_unit("stanza")
        .build()
}

/// Counter for stanzas rejected by an interceptor.
pub fn stanzas_intercepted() -> Counter<u64> {
    meter()
        .u64_counter("xop.stanzas.intercepted")
        .with_description("Total stanzas rejected by the interceptor chain")
        .with_unit("stanza")
        .build()
}

/// Counter for stanzas no component accepted.
pub fn stanzas_unhandled() -> Counter<u64> {
    meter()
        .u64_counter("xop.stanzas.unhandled")
        .with_description("Total stanzas no component accepted")
        .with_unit("stanza")
        .build()
}

/// Counter for stanzas the delivery queue refused.
pub fn delivery_rejected() -> Counter<u64> {
    meter()
        .u64_counter("xop.delivery.rejected")
        .with_description("Total stanzas dropped by the delivery queue")
        .with_unit("stanza")
        .build()
}

/// Counter for IQ requests reaped after their timeout.
pub fn iq_timeouts() -> Counter<u64> {
    meter()
        .u64_counter("xop.iq.timeouts")
        .with_description("Total IQ requests answered with a synthesized error")
        .with_unit("iq")
        .build()
}

/// Counter for component failures.
pub fn component_failures() -> Counter<u64> {
    meter()
        .u64_counter("xop.component.failures")
        .with_description("Total component init, process or stop failures")
        .with_unit("failure")
        .build()
}

// ============================================================================
// Gauges (Current State)
// ============================================================================

/// Gauge for registered routes.
pub fn routes_active() -> Gauge<i64> {
    meter()
        .i64_gauge("xop.routes.active")
        .with_description("Current number of routes in the route table")
        .with_unit("route")
        .build()
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Record a stanza entering the router.
pub fn record_received(kind: &str) {
    stanzas_received().add(1, &[KeyValue::new("kind", kind.to_string())]);
}

/// Record a stanza copy delivered to a component.
pub fn record_routed(kind: &str) {
    stanzas_routed().add(1, &[KeyValue::new("kind", kind.to_string())]);
}

/// Record a stanza rejected by the named interceptor.
pub fn record_intercepted(interceptor: &str) {
    stanzas_intercepted().add(1, &[KeyValue::new("interceptor", interceptor.to_string())]);
}

/// Record a stanza nobody accepted.
pub fn record_unhandled(kind: &str) {
    stanzas_unhandled().add(1, &[KeyValue::new("kind", kind.to_string())]);
}

/// Record a delivery rejection.
pub fn record_delivery_rejected(reason: &str) {
    delivery_rejected().add(1, &[KeyValue::new("reason", reason.to_string())]);
}

/// Record a reaped IQ.
pub fn record_iq_timeout() {
    iq_timeouts().add(1, &[]);
}

/// Record a component failure in the given lifecycle phase.
pub fn record_component_failure(component: &str, phase: &str) {
    component_failures().add(
        1,
        &[
            KeyValue::new("component", component.to_string()),
            KeyValue::new("phase", phase.to_string()),
        ],
    );
}

/// Record the current route count.
pub fn record_route_count(count: usize) {
    routes_active().record(count as i64, &[]);
}
