use arc_swap::ArcSwap;
use gyre_async::time;
use std::sync::Arc;

/// Network engine configuration. All knobs are runtime-mutable through
/// [`OverridableConfig`]; durations are stored in milliseconds so the struct
/// round-trips through plain JSON config files.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize, smart_default::SmartDefault)]
#[serde(default)]
pub struct NetworkConfig {
    /// Initial hops-to-live on locally originated requests.
    #[default = 18]
    pub htl_max: u8,
    /// Probability that a hop at maximal HTL decrements it (obscures the
    /// chain origin).
    #[default = 0.5]
    pub htl_decrement_probability_at_max: f64,
    /// How long to wait for `Accepted` after forwarding a request.
    #[default = 10_000]
    pub accepted_timeout_ms: u64,
    /// Overall deadline for the terminal reply from an accepted hop.
    #[default = 120_000]
    pub fetch_timeout_ms: u64,
    /// Deadline per offered-key probe.
    #[default = 10_000]
    pub get_offer_timeout_ms: u64,
    /// Urgency of gap-driven resend requests in the transport.
    #[default = 100]
    pub max_coalescing_delay_ms: u64,
    /// A successful remote fetch triggers a random reinsert with probability
    /// 1/this.
    #[default = 200]
    pub random_reinsert_interval: u32,
    /// Peers with locations older than this are treated as locationless.
    #[default = 86_400_000]
    pub max_circle_age_ms: u64,
    /// Negative-cache lifetime and the recently-completed UID window.
    #[default = 600_000]
    pub reject_time_ms: u64,
    #[default = 10_000]
    pub recently_completed_window_size: usize,
    /// Hard liveness guard on a whole request; a sender still running past
    /// this is broken and reports `InternalError`.
    #[default = 300_000]
    pub overall_deadline_ms: u64,
    /// Per-packet deadline during a block transfer.
    #[default = 30_000]
    pub block_transfer_packet_timeout_ms: u64,
    /// Period of the failure-table / known-peers flush to storage.
    #[default = 60_000]
    pub store_flush_interval_ms: u64,
    /// Whether this node participates in opennet path folding as an
    /// originator.
    #[default = false]
    pub path_folding: bool,
}

macro_rules! duration_accessors {
    ($($name:ident <- $field:ident;)*) => {
        impl NetworkConfig {
            $(pub fn $name(&self) -> time::Duration {
                time::Duration::milliseconds(self.$field as i64)
            })*
        }
    };
}

duration_accessors! {
    accepted_timeout <- accepted_timeout_ms;
    fetch_timeout <- fetch_timeout_ms;
    get_offer_timeout <- get_offer_timeout_ms;
    max_coalescing_delay <- max_coalescing_delay_ms;
    max_circle_age <- max_circle_age_ms;
    reject_time <- reject_time_ms;
    overall_deadline <- overall_deadline_ms;
    block_transfer_packet_timeout <- block_transfer_packet_timeout_ms;
    store_flush_interval <- store_flush_interval_ms;
}

/// Shared, atomically swappable view of the config. Readers take a cheap
/// snapshot per operation, so a runtime update applies to the next operation
/// rather than tearing a running one.
pub struct OverridableConfig(ArcSwap<NetworkConfig>);

impl OverridableConfig {
    pub fn new(config: NetworkConfig) -> Self {
        OverridableConfig(ArcSwap::from_pointee(config))
    }

    pub fn get(&self) -> Arc<NetworkConfig> {
        self.0.load_full()
    }

    pub fn set(&self, config: NetworkConfig) {
        self.0.store(Arc::new(config));
    }

    pub fn update(&self, f: impl FnOnce(&mut NetworkConfig)) {
        let mut config = (*self.0.load_full()).clone();
        f(&mut config);
        self.set(config);
    }
}

impl Default for OverridableConfig {
    fn default() -> Self {
        OverridableConfig::new(NetworkConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = NetworkConfig::default();
        assert_eq!(config.htl_max, 18);
        assert_eq!(config.accepted_timeout(), time::Duration::seconds(10));
        assert_eq!(config.fetch_timeout(), time::Duration::seconds(120));
        assert_eq!(config.reject_time(), time::Duration::minutes(10));
        assert_eq!(config.recently_completed_window_size, 10_000);
    }

    #[test]
    fn config_deserializes_with_partial_fields() {
        let config: NetworkConfig =
            serde_json::from_str(r#"{"htl_max": 12, "accepted_timeout_ms": 500}"#).unwrap();
        assert_eq!(config.htl_max, 12);
        assert_eq!(config.accepted_timeout_ms, 500);
        assert_eq!(config.fetch_timeout_ms, 120_000);
    }

    #[test]
    fn runtime_update_is_visible_to_next_reader() {
        let config = OverridableConfig::default();
        config.update(|c| c.htl_max = 10);
        assert_eq!(config.get().htl_max, 10);
    }
}
