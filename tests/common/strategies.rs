//! Proptest strategies shared by the property-based tests

use proptest::prelude::*;
use vulnscan_core::models::{FailurePolicy, Severity};
use vulnscan_core::state_machine::{ShardEvent, ShardState};

/// Distinct IPv4 host targets inside 10.0.0.0/8
pub fn host_targets(max: usize) -> impl Strategy<Value = Vec<String>> {
    prop::collection::btree_set(1u32..0x00ff_ffff, 1..=max).prop_map(|hosts| {
        hosts
            .into_iter()
            .map(|h| {
                format!(
                    "10.{}.{}.{}",
                    (h >> 16) & 0xff,
                    (h >> 8) & 0xff,
                    h & 0xff
                )
            })
            .collect()
    })
}

/// IPv4 CIDR blocks small enough to expand in a test
pub fn small_cidr() -> impl Strategy<Value = (String, u8)> {
    (0u8..=255, 0u8..=255, 24u8..=32).prop_map(|(b, c, prefix)| (format!("192.{b}.{c}.0/{prefix}"), prefix))
}

pub fn partition_size() -> impl Strategy<Value = usize> {
    1usize..64
}

pub fn priority() -> impl Strategy<Value = u8> {
    1u8..=10
}

pub fn severity() -> impl Strategy<Value = Severity> {
    prop_oneof![
        Just(Severity::Critical),
        Just(Severity::High),
        Just(Severity::Medium),
        Just(Severity::Low),
        Just(Severity::Info),
    ]
}

pub fn failure_policy() -> impl Strategy<Value = FailurePolicy> {
    prop_oneof![Just(FailurePolicy::FailFast), Just(FailurePolicy::BestEffort)]
}

pub fn shard_state() -> impl Strategy<Value = ShardState> {
    prop_oneof![
        Just(ShardState::Queued),
        Just(ShardState::Assigned),
        Just(ShardState::Running),
        Just(ShardState::Completed),
        Just(ShardState::Failed),
        Just(ShardState::Cancelled),
    ]
}

pub fn shard_event() -> impl Strategy<Value = ShardEvent> {
    prop_oneof![
        Just(ShardEvent::Assign),
        Just(ShardEvent::Start),
        Just(ShardEvent::Complete),
        any::<bool>().prop_map(|retryable| ShardEvent::Fail {
            reason: "check crashed".into(),
            retryable,
        }),
        Just(ShardEvent::Requeue {
            reason: "node lost".into()
        }),
        Just(ShardEvent::Release),
        Just(ShardEvent::Cancel),
    ]
}
