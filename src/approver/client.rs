//! Client-bootstrap pipeline: a freshly provisioned machine asks for its
//! first API client certificate. Every check must pass; refusals carry the
//! reason so the operator can find them in the logs.

use anyhow::{bail, Result};
use chrono::Duration;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;

use crate::config::ApproverConfig;
use crate::csr::{node_name_from_cn, ParsedRequest};
use crate::machines::{find_by_internal_dns, MachineRecord};

/// Tolerated clock skew between the machine controller and this process.
const MACHINE_CLOCK_SKEW_SECS: i64 = 10;

/// A bootstrap CSR arriving later than this after machine creation belongs
/// to an expired provisioning attempt and must not be completed.
const MAX_BOOTSTRAP_DELAY_HOURS: i64 = 2;

/// Whether bootstrap CSRs may be approved at all. A disabled flow leaves
/// them pending without error.
pub fn client_pipeline_enabled(config: &ApproverConfig) -> bool {
    !config.node_client_cert.disabled
}

/// Run the six-check client pipeline. `node_exists` is the result of the
/// node lookup by the CSR's node name. Returns Ok(()) when the CSR should
/// be approved; every refusal is an error naming the failed check.
pub fn authorize_node_client(
    csr: &CertificateSigningRequest,
    req: &ParsedRequest,
    machines: &[MachineRecord],
    node_exists: bool,
) -> Result<()> {
    let csr_name = csr.metadata.name.as_deref().unwrap_or("unknown");

    let node_name = match node_name_from_cn(&req.common_name) {
        Some(name) => name,
        None => bail!("CSR {}: empty node name in subject common name", csr_name),
    };

    if node_exists {
        bail!(
            "CSR {}: node {} already exists and should renew, not bootstrap",
            csr_name,
            node_name
        );
    }

    let machine = match find_by_internal_dns(machines, node_name) {
        Some(m) => m,
        None => bail!(
            "CSR {}: no machine with internal DNS name {}",
            csr_name,
            node_name
        ),
    };

    if machine.node_ref_name.is_some() {
        bail!(
            "CSR {}: machine {} is already linked to a node",
            csr_name,
            machine.name
        );
    }

    let machine_created = match machine.created {
        Some(t) => t,
        None => bail!(
            "CSR {}: machine {} has no creation timestamp",
            csr_name,
            machine.name
        ),
    };
    let csr_created = match csr.metadata.creation_timestamp.as_ref() {
        Some(t) => t.0,
        None => bail!("CSR {} has no creation timestamp", csr_name),
    };

    let earliest = machine_created - Duration::seconds(MACHINE_CLOCK_SKEW_SECS);
    let latest = machine_created + Duration::hours(MAX_BOOTSTRAP_DELAY_HOURS);
    if csr_created < earliest || csr_created > latest {
        bail!(
            "CSR {}: creation time {} outside of admission window ({}, {})",
            csr_name,
            csr_created,
            earliest,
            latest
        );
    }

    Ok(())
}
