//! Per-worker counter block.
//!
//! # Responsibilities
//! - Hold one atomic slot per named statistic
//! - Expose increment / decrement / set / snapshot
//!
//! # Design Decisions
//! - Fixed-size array indexed by the `Stat` enum; no map lookups on the hot path
//! - Relaxed ordering: each worker is the only writer of its block

use std::sync::atomic::{AtomicU64, Ordering};

/// Every statistic a worker exports. Variant order fixes the slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Stat {
    CmdGet,
    CmdGetCount,
    CmdSet,
    CmdSetCount,
    CmdAdd,
    CmdAddCount,
    CmdReplace,
    CmdReplaceCount,
    CmdDelete,
    CmdDeleteCount,
    CmdIncr,
    CmdIncrCount,
    CmdDecr,
    CmdDecrCount,
    CmdMeta,
    CmdLeaseGet,
    CmdLeaseGetCount,
    CmdLeaseSet,
    CmdLeaseSetCount,
    CmdStats,
    CmdStatsCount,
    CmdOther,
    CmdOtherCount,
    ProxyReqsProcessing,
    ProxyReqsWaiting,
    ProxyRequestNumOutstanding,
    RequestSent,
    RequestSentCount,
    RequestReplied,
    RequestRepliedCount,
    RequestSuccess,
    RequestSuccessCount,
    RequestError,
    RequestErrorCount,
    RttMin,
    Rtt,
    RttMax,
    NumServers,
    ConfigLastSuccess,
}

impl Stat {
    pub const COUNT: usize = Stat::ConfigLastSuccess as usize + 1;

    /// The exported name. These strings are a contract with stats consumers.
    pub fn name(self) -> &'static str {
        match self {
            Stat::CmdGet => "cmd_get_stat",
            Stat::CmdGetCount => "cmd_get_count_stat",
            Stat::CmdSet => "cmd_set_stat",
            Stat::CmdSetCount => "cmd_set_count_stat",
            Stat::CmdAdd => "cmd_add_stat",
            Stat::CmdAddCount => "cmd_add_count_stat",
            Stat::CmdReplace => "cmd_replace_stat",
            Stat::CmdReplaceCount => "cmd_replace_count_stat",
            Stat::CmdDelete => "cmd_delete_stat",
            Stat::CmdDeleteCount => "cmd_delete_count_stat",
            Stat::CmdIncr => "cmd_incr_stat",
            Stat::CmdIncrCount => "cmd_incr_count_stat",
            Stat::CmdDecr => "cmd_decr_stat",
            Stat::CmdDecrCount => "cmd_decr_count_stat",
            Stat::CmdMeta => "cmd_meta_stat",
            Stat::CmdLeaseGet => "cmd_lease_get_stat",
            Stat::CmdLeaseGetCount => "cmd_lease_get_count_stat",
            Stat::CmdLeaseSet => "cmd_lease_set_stat",
            Stat::CmdLeaseSetCount => "cmd_lease_set_count_stat",
            Stat::CmdStats => "cmd_stats_stat",
            Stat::CmdStatsCount => "cmd_stats_count_stat",
            Stat::CmdOther => "cmd_other_stat",
            Stat::CmdOtherCount => "cmd_other_count_stat",
            Stat::ProxyReqsProcessing => "proxy_reqs_processing_stat",
            Stat::ProxyReqsWaiting => "proxy_reqs_waiting_stat",
            Stat::ProxyRequestNumOutstanding => "proxy_request_num_outstanding_stat",
            Stat::RequestSent => "request_sent_stat",
            Stat::RequestSentCount => "request_sent_count_stat",
            Stat::RequestReplied => "request_replied_stat",
            Stat::RequestRepliedCount => "request_replied_count_stat",
            Stat::RequestSuccess => "request_success_stat",
            Stat::RequestSuccessCount => "request_success_count_stat",
            Stat::RequestError => "request_error_stat",
            Stat::RequestErrorCount => "request_error_count_stat",
            Stat::RttMin => "rtt_min_stat",
            Stat::Rtt => "rtt_stat",
            Stat::RttMax => "rtt_max_stat",
            Stat::NumServers => "num_servers_stat",
            Stat::ConfigLastSuccess => "config_last_success_stat",
        }
    }

    fn all() -> [Stat; Stat::COUNT] {
        use Stat::*;
        [
            CmdGet,
            CmdGetCount,
            CmdSet,
            CmdSetCount,
            CmdAdd,
            CmdAddCount,
            CmdReplace,
            CmdReplaceCount,
            CmdDelete,
            CmdDeleteCount,
            CmdIncr,
            CmdIncrCount,
            CmdDecr,
            CmdDecrCount,
            CmdMeta,
            CmdLeaseGet,
            CmdLeaseGetCount,
            CmdLeaseSet,
            CmdLeaseSetCount,
            CmdStats,
            CmdStatsCount,
            CmdOther,
            CmdOtherCount,
            ProxyReqsProcessing,
            ProxyReqsWaiting,
            ProxyRequestNumOutstanding,
            RequestSent,
            RequestSentCount,
            RequestReplied,
            RequestRepliedCount,
            RequestSuccess,
            RequestSuccessCount,
            RequestError,
            RequestErrorCount,
            RttMin,
            Rtt,
            RttMax,
            NumServers,
            ConfigLastSuccess,
        ]
    }
}

/// The worker's counter block.
#[derive(Debug)]
pub struct ProxyStats {
    slots: [AtomicU64; Stat::COUNT],
}

impl ProxyStats {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    pub fn incr(&self, stat: Stat) {
        self.slots[stat as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn decr(&self, stat: Stat) {
        self.slots[stat as usize].fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add(&self, stat: Stat, n: u64) {
        self.slots[stat as usize].fetch_add(n, Ordering::Relaxed);
    }

    pub fn set(&self, stat: Stat, value: u64) {
        self.slots[stat as usize].store(value, Ordering::Relaxed);
    }

    pub fn get(&self, stat: Stat) -> u64 {
        self.slots[stat as usize].load(Ordering::Relaxed)
    }

    /// Snapshot every stat as `(name, value)` pairs, in slot order.
    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        Stat::all()
            .iter()
            .map(|s| (s.name(), self.get(*s)))
            .collect()
    }
}

impl Default for ProxyStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incr_decr_set_roundtrip() {
        let stats = ProxyStats::new();
        stats.incr(Stat::CmdGet);
        stats.incr(Stat::CmdGet);
        stats.decr(Stat::CmdGet);
        assert_eq!(stats.get(Stat::CmdGet), 1);

        stats.set(Stat::NumServers, 7);
        assert_eq!(stats.get(Stat::NumServers), 7);
    }

    #[test]
    fn snapshot_covers_every_slot_with_contract_names() {
        let stats = ProxyStats::new();
        let snap = stats.snapshot();
        assert_eq!(snap.len(), Stat::COUNT);
        let names: Vec<&str> = snap.iter().map(|(n, _)| *n).collect();
        assert!(names.contains(&"cmd_get_stat"));
        assert!(names.contains(&"proxy_reqs_waiting_stat"));
        assert!(names.contains(&"config_last_success_stat"));
        // every name is distinct
        let mut dedup = names.clone();
        dedup.sort();
        dedup.dedup();
        assert_eq!(dedup.len(), names.len());
    }
}
