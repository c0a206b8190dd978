//! Admission gate: a flood of bogus CSRs must not exhaust the approver, so
//! each reconcile pass first compares the recently-pending count against a
//! ceiling derived from the cluster size.

use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;

use crate::csr::{is_approved, NODE_BOOTSTRAPPER_USERNAME, NODE_USER_PREFIX};

/// Slack on top of max(#machines, #nodes). Covers bursts of parallel
/// provisioning without opening the gate to unbounded floods.
const MAX_PENDING_SLACK: usize = 100;

/// How far back a pending CSR still counts against the ceiling.
const PENDING_WINDOW_HOURS: i64 = 1;

/// Future skew tolerated on CSR creation timestamps. Matched to the
/// bootstrap server's own tolerance; do not widen independently.
const PENDING_FUTURE_SKEW_SECS: i64 = 10;

/// Admission ceiling for the current cluster size.
pub fn max_pending_csrs(machine_count: usize, node_count: usize) -> usize {
    machine_count.max(node_count) + MAX_PENDING_SLACK
}

/// Count CSRs that are node-related, unapproved, and created inside
/// `[now - 1h, now + 10s]`. `now` is a parameter so the window is testable.
pub fn recently_pending_csrs(
    csrs: &[CertificateSigningRequest],
    now: DateTime<Utc>,
) -> usize {
    let earliest = now - Duration::hours(PENDING_WINDOW_HOURS);
    let latest = now + Duration::seconds(PENDING_FUTURE_SKEW_SECS);
    csrs.iter()
        .filter(|csr| is_node_requester(csr))
        .filter(|csr| !is_approved(csr))
        .filter(|csr| {
            csr.metadata
                .creation_timestamp
                .as_ref()
                .map(|t| t.0 >= earliest && t.0 <= latest)
                .unwrap_or(false)
        })
        .count()
}

fn is_node_requester(csr: &CertificateSigningRequest) -> bool {
    match csr.spec.username.as_deref() {
        Some(NODE_BOOTSTRAPPER_USERNAME) => true,
        Some(user) => user.starts_with(NODE_USER_PREFIX),
        None => false,
    }
}
