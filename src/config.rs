//! Stack configuration
//!
//! All tunables live in [`StackConfig`]. The defaults match the classic
//! sizing of the stack (32 neighbor slots, 1 ms timer tick); deployments
//! that load configuration from a file can deserialize a partial config
//! and fall back to the defaults for everything else.

use serde::Deserialize;
use std::time::Duration;

/// Tunable parameters for a [`crate::NetStack`] instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    /// Number of neighbor cache slots.
    pub arp_cache_size: usize,
    /// How long an unanswered INCOMPLETE neighbor entry may occupy a slot
    /// before the ARP timer releases it.
    pub arp_incomplete_timeout: Duration,
    /// Maximum number of entries queued per protocol ingress FIFO.
    pub ingress_queue_depth: usize,
    /// Period of the interval timer driving the timer subsystem.
    pub timer_tick: Duration,
    /// Number of UDP protocol control blocks.
    pub udp_pcb_count: usize,
    /// Number of TCP protocol control blocks.
    pub tcp_pcb_count: usize,
    /// Interval at which the TCP retransmission timer walks the PCBs.
    pub tcp_retransmit_interval: Duration,
    /// Initial retransmission timeout for a freshly queued TCP segment.
    pub tcp_initial_rto: Duration,
    /// Give up and reset a connection once a segment has been outstanding
    /// this long.
    pub tcp_retransmit_deadline: Duration,
}

impl Default for StackConfig {
    fn default() -> Self {
        StackConfig {
            arp_cache_size: 32,
            arp_incomplete_timeout: Duration::from_secs(1),
            ingress_queue_depth: 1024,
            timer_tick: Duration::from_millis(1),
            udp_pcb_count: 16,
            tcp_pcb_count: 16,
            tcp_retransmit_interval: Duration::from_millis(100),
            tcp_initial_rto: Duration::from_secs(1),
            tcp_retransmit_deadline: Duration::from_secs(12),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StackConfig::default();
        assert_eq!(config.arp_cache_size, 32);
        assert_eq!(config.timer_tick, Duration::from_millis(1));
    }

    #[test]
    fn test_partial_deserialization() {
        let config: StackConfig =
            serde_json::from_str(r#"{"arp_cache_size": 8}"#).unwrap();
        assert_eq!(config.arp_cache_size, 8);
        assert_eq!(config.ingress_queue_depth, 1024);
    }
}
