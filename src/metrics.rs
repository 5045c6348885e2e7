use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Prometheus-compatible datapath counters.
pub struct Metrics {
    pub packets_egress_total: AtomicU64,
    pub packets_ingress_total: AtomicU64,
    pub drops_auth_failed: AtomicU64,
    pub drops_freshness_failed: AtomicU64,
    pub drops_transition_denied: AtomicU64,
    pub drops_spoofed_source: AtomicU64,
    pub drops_zone_lookup: AtomicU64,
    pub drops_bad_header: AtomicU64,
    pub drops_key_unavailable: AtomicU64,
    pub drops_other: AtomicU64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            packets_egress_total: AtomicU64::new(0),
            packets_ingress_total: AtomicU64::new(0),
            drops_auth_failed: AtomicU64::new(0),
            drops_freshness_failed: AtomicU64::new(0),
            drops_transition_denied: AtomicU64::new(0),
            drops_spoofed_source: AtomicU64::new(0),
            drops_zone_lookup: AtomicU64::new(0),
            drops_bad_header: AtomicU64::new(0),
            drops_key_unavailable: AtomicU64::new(0),
            drops_other: AtomicU64::new(0),
        })
    }

    pub fn inc_egress(&self) {
        self.packets_egress_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_ingress(&self) {
        self.packets_ingress_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Bucket a dropped packet by its error kind label.
    pub fn record_drop(&self, kind: &str) {
        let counter = match kind {
            "auth_failed" => &self.drops_auth_failed,
            "freshness_failed" => &self.drops_freshness_failed,
            "transition_denied" => &self.drops_transition_denied,
            "spoofed_source" => &self.drops_spoofed_source,
            "zone_not_found" | "zone_ambiguous" | "policy_unavailable" => &self.drops_zone_lookup,
            "bad_header" => &self.drops_bad_header,
            "key_unavailable" | "nonce_exhausted" | "timeout" => &self.drops_key_unavailable,
            _ => &self.drops_other,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Format counters in Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        let gauges = [
            (
                "ztp_packets_egress_total",
                "Packets entering the egress pipeline",
                &self.packets_egress_total,
            ),
            (
                "ztp_packets_ingress_total",
                "Packets entering the ingress pipeline",
                &self.packets_ingress_total,
            ),
            (
                "ztp_drops_auth_failed_total",
                "Packets dropped on AEAD verification failure",
                &self.drops_auth_failed,
            ),
            (
                "ztp_drops_freshness_failed_total",
                "Packets dropped outside the freshness window",
                &self.drops_freshness_failed,
            ),
            (
                "ztp_drops_transition_denied_total",
                "Packets dropped by the zone allow-set",
                &self.drops_transition_denied,
            ),
            (
                "ztp_drops_spoofed_source_total",
                "Packets dropped for spoofed source addresses",
                &self.drops_spoofed_source,
            ),
            (
                "ztp_drops_zone_lookup_total",
                "Packets dropped on failed or ambiguous zone lookups",
                &self.drops_zone_lookup,
            ),
            (
                "ztp_drops_bad_header_total",
                "Packets dropped with unparseable IP headers",
                &self.drops_bad_header,
            ),
            (
                "ztp_drops_key_unavailable_total",
                "Packets dropped because no key could be obtained",
                &self.drops_key_unavailable,
            ),
            (
                "ztp_drops_other_total",
                "Packets dropped for other reasons",
                &self.drops_other,
            ),
        ];
        let mut out = String::new();
        for (name, help, counter) in gauges {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {}\n",
                counter.load(Ordering::Relaxed)
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_are_bucketed_by_kind() {
        let m = Metrics::new();
        m.record_drop("auth_failed");
        m.record_drop("auth_failed");
        m.record_drop("zone_not_found");
        m.record_drop("something_unexpected");
        assert_eq!(m.drops_auth_failed.load(Ordering::Relaxed), 2);
        assert_eq!(m.drops_zone_lookup.load(Ordering::Relaxed), 1);
        assert_eq!(m.drops_other.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn prometheus_output_contains_all_series() {
        let m = Metrics::new();
        m.inc_egress();
        let text = m.to_prometheus();
        assert!(text.contains("ztp_packets_egress_total 1"));
        assert!(text.contains("# TYPE ztp_drops_auth_failed_total counter"));
    }
}
