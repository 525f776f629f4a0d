mod common;

use std::sync::Arc;

use booking_jobs::{JobStore, MemoryStore, StoreOptions};

fn store_with(options: StoreOptions) -> Arc<dyn JobStore> {
    Arc::new(MemoryStore::with_options(options))
}

fn store() -> Arc<dyn JobStore> {
    store_with(common::options())
}

#[tokio::test]
async fn c01_lease_assigns_token() {
    common::lease_assigns_token(store()).await;
}

#[tokio::test]
async fn c02_lease_respects_due_time_and_limit() {
    common::lease_respects_due_time_and_limit(store()).await;
}

#[tokio::test]
async fn c03_only_lease_holder_can_complete() {
    common::only_lease_holder_can_complete(store()).await;
}

#[tokio::test]
async fn c04_retryable_failure_backs_off() {
    common::retryable_failure_backs_off(store()).await;
}

#[tokio::test]
async fn c05_exhausted_attempts_fail() {
    common::exhausted_attempts_fail(store()).await;
}

#[tokio::test]
async fn c06_permanent_failure_is_terminal() {
    common::permanent_failure_is_terminal(store()).await;
}

#[tokio::test]
async fn c07_reschedule_replaces_pending() {
    common::reschedule_replaces_pending(store()).await;
}

#[tokio::test]
async fn c08_reschedule_in_flight_is_deferred() {
    common::reschedule_in_flight_is_deferred(store()).await;
}

#[tokio::test]
async fn c09_reject_policy_refuses_duplicates() {
    common::reject_policy_refuses_duplicates(store_with(common::reject_options())).await;
}

#[tokio::test]
async fn c10_cancel_pending_and_in_flight() {
    common::cancel_pending_and_in_flight(store()).await;
}

#[tokio::test]
async fn c11_terminal_job_frees_dedupe_key() {
    common::terminal_job_frees_dedupe_key(store()).await;
}

#[tokio::test]
async fn c12_expired_lease_is_reclaimed() {
    common::expired_lease_is_reclaimed(store()).await;
}

#[tokio::test]
async fn c13_reclaim_exhausts_attempts() {
    common::reclaim_exhausts_attempts(store()).await;
}

#[tokio::test]
async fn c14_live_lease_survives_reclaim() {
    common::live_lease_survives_reclaim(store()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn c15_concurrent_leases_are_disjoint() {
    common::concurrent_leases_are_disjoint(store()).await;
}

#[tokio::test]
async fn c16_unknown_job_is_not_found() {
    common::unknown_job_is_not_found(store()).await;
}

#[tokio::test]
async fn c17_purge_keeps_live_jobs() {
    common::purge_keeps_live_jobs(store()).await;
}

#[tokio::test]
async fn c18_lifecycle_events_are_published() {
    common::lifecycle_events_are_published(store()).await;
}
