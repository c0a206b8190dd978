//! Serving-certificate cascade. Three independent strategies are tried in
//! order; the first success approves, and only if every applicable strategy
//! fails is the aggregated reason surfaced.

use std::collections::BTreeSet;

use anyhow::{bail, Result};
use ipnet::IpNet;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use openssl::nid::Nid;
use openssl::x509::{X509Ref, X509};

use crate::csr::{ip_from_bytes, node_name_from_username, ParsedRequest, NODE_USER_PREFIX};
use crate::machines::{
    find_by_node_ref, MachineRecord, EXTERNAL_DNS, EXTERNAL_IP, HOSTNAME, INTERNAL_DNS,
    INTERNAL_IP,
};
use crate::probe::leaf_chains_to;

/// Additional source addresses a node legitimately serves under when the
/// cluster network assigns egress IPs. Present only when the network plugin
/// is of the egress-IP-bearing kind.
#[derive(Debug, Clone, Default)]
pub struct EgressContext {
    pub egress_ips: Vec<String>,
    pub egress_cidrs: Vec<String>,
}

/// Decide a NodeServing CSR. `leaf` is the certificate currently presented
/// by the node's kubelet, when one could be fetched. Ok(()) means approve;
/// the error carries every strategy's failure.
pub fn authorize_node_serving(
    csr: &CertificateSigningRequest,
    req: &ParsedRequest,
    machines: &[MachineRecord],
    leaf: Option<&X509>,
    ca_bundle: Option<&[X509]>,
    egress: Option<&EgressContext>,
) -> Result<()> {
    let csr_name = csr.metadata.name.as_deref().unwrap_or("unknown");
    let node_name = match node_name_from_username(csr) {
        Some(n) => n,
        None => bail!("CSR {}: no node name in requester username", csr_name),
    };

    let mut failures: Vec<String> = Vec::new();

    match (leaf, ca_bundle) {
        (Some(leaf), Some(bundle)) => {
            match renewal_against_live_cert(req, node_name, leaf, bundle) {
                Ok(()) => return Ok(()),
                Err(e) => failures.push(format!("renewal: {}", e)),
            }
        }
        _ => failures.push("renewal: no live serving certificate available".to_string()),
    }

    match cross_validate_machine(req, node_name, machines) {
        Ok(()) => return Ok(()),
        Err(e) => failures.push(format!("machine validation: {}", e)),
    }

    if let (Some(leaf), Some(bundle), Some(egress)) = (leaf, ca_bundle, egress) {
        match renewal_with_egress(req, node_name, leaf, bundle, egress) {
            Ok(()) => return Ok(()),
            Err(e) => failures.push(format!("egress-aware renewal: {}", e)),
        }
    }

    bail!("CSR {}: {}", csr_name, failures.join("; "))
}

/// Owned view of the identity a live certificate presents.
struct LeafIdentity {
    common_name: String,
    dns_names: BTreeSet<String>,
    email_addresses: BTreeSet<String>,
    ip_addresses: BTreeSet<String>,
    uris: BTreeSet<String>,
}

fn leaf_identity(leaf: &X509Ref) -> Result<LeafIdentity> {
    let common_name = leaf
        .subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|e| e.data().as_utf8().ok())
        .map(|s| s.to_string())
        .unwrap_or_default();

    let mut dns_names = BTreeSet::new();
    let mut email_addresses = BTreeSet::new();
    let mut ip_addresses = BTreeSet::new();
    let mut uris = BTreeSet::new();
    if let Some(sans) = leaf.subject_alt_names() {
        for san in &sans {
            if let Some(dns) = san.dnsname() {
                dns_names.insert(dns.to_string());
            } else if let Some(mail) = san.email() {
                email_addresses.insert(mail.to_string());
            } else if let Some(uri) = san.uri() {
                uris.insert(uri.to_string());
            } else if let Some(bytes) = san.ipaddress() {
                ip_addresses.insert(ip_from_bytes(bytes)?.to_string());
            }
        }
    }

    Ok(LeafIdentity {
        common_name,
        dns_names,
        email_addresses,
        ip_addresses,
        uris,
    })
}

fn check_leaf_identity(req: &ParsedRequest, node_name: &str, leaf: &LeafIdentity) -> Result<()> {
    let expected_cn = format!("{}{}", NODE_USER_PREFIX, node_name);
    if leaf.common_name != expected_cn {
        bail!(
            "live certificate common name {:?} does not match {:?}",
            leaf.common_name,
            expected_cn
        );
    }
    if req.common_name != leaf.common_name {
        bail!(
            "CSR common name {:?} does not match live certificate {:?}",
            req.common_name,
            leaf.common_name
        );
    }
    Ok(())
}

/// Renewal fast-path: the node is renewing an equivalent certificate. The
/// leaf must chain to the kubelet CA and carry exactly the identity the
/// CSR asks for.
fn renewal_against_live_cert(
    req: &ParsedRequest,
    node_name: &str,
    leaf: &X509,
    ca_bundle: &[X509],
) -> Result<()> {
    if !leaf_chains_to(ca_bundle, leaf)? {
        bail!("live certificate does not chain to the kubelet CA bundle");
    }
    let identity = leaf_identity(leaf)?;
    check_leaf_identity(req, node_name, &identity)?;

    same_set("DNS name", &to_set(&req.dns_names), &identity.dns_names)?;
    same_set(
        "email address",
        &to_set(&req.email_addresses),
        &identity.email_addresses,
    )?;
    same_set("IP address", &req.ip_strings(), &identity.ip_addresses)?;
    same_set("URI", &to_set(&req.uris), &identity.uris)?;
    Ok(())
}

/// Machine cross-validation: every SAN must be an address the machine
/// record vouches for. DNS comparisons are case-insensitive; IP
/// comparisons are exact string matches on the canonical form.
fn cross_validate_machine(
    req: &ParsedRequest,
    node_name: &str,
    machines: &[MachineRecord],
) -> Result<()> {
    let machine = match find_by_node_ref(machines, node_name) {
        Some(m) => m,
        None => bail!("no machine has a node reference to {}", node_name),
    };

    for dns in &req.dns_names {
        let known = [INTERNAL_DNS, EXTERNAL_DNS, HOSTNAME]
            .into_iter()
            .flat_map(|t| machine.addresses_of(t))
            .any(|a| a.eq_ignore_ascii_case(dns));
        if !known {
            bail!(
                "DNS name {:?} not listed on machine {}",
                dns,
                machine.name
            );
        }
    }

    for ip in req.ip_strings() {
        let known = [INTERNAL_IP, EXTERNAL_IP]
            .into_iter()
            .flat_map(|t| machine.addresses_of(t))
            .any(|a| a == ip);
        if !known {
            bail!("IP address {:?} not listed on machine {}", ip, machine.name);
        }
    }

    Ok(())
}

/// Egress-aware renewal: like the plain renewal path, except each
/// requested IP may also be an egress IP or fall inside an egress CIDR
/// declared for this node. Non-IP SANs must still match the live
/// certificate exactly.
fn renewal_with_egress(
    req: &ParsedRequest,
    node_name: &str,
    leaf: &X509,
    ca_bundle: &[X509],
    egress: &EgressContext,
) -> Result<()> {
    if !leaf_chains_to(ca_bundle, leaf)? {
        bail!("live certificate does not chain to the kubelet CA bundle");
    }
    let identity = leaf_identity(leaf)?;
    check_leaf_identity(req, node_name, &identity)?;

    same_set("DNS name", &to_set(&req.dns_names), &identity.dns_names)?;
    same_set(
        "email address",
        &to_set(&req.email_addresses),
        &identity.email_addresses,
    )?;
    same_set("URI", &to_set(&req.uris), &identity.uris)?;

    for ip in &req.ip_addresses {
        let ip_str = ip.to_string();
        if identity.ip_addresses.contains(&ip_str) {
            continue;
        }
        if egress.egress_ips.iter().any(|e| *e == ip_str) {
            continue;
        }
        let in_cidr = egress.egress_cidrs.iter().any(|cidr| {
            cidr.parse::<IpNet>()
                .map(|net| net.contains(ip))
                .unwrap_or(false)
        });
        if !in_cidr {
            bail!(
                "IP address {:?} is neither on the live certificate nor an egress address of {}",
                ip_str,
                node_name
            );
        }
    }

    Ok(())
}

fn to_set(values: &[String]) -> BTreeSet<String> {
    values.iter().cloned().collect()
}

fn same_set(kind: &str, requested: &BTreeSet<String>, live: &BTreeSet<String>) -> Result<()> {
    if requested != live {
        bail!(
            "{} set {:?} does not match live certificate {:?}",
            kind,
            requested,
            live
        );
    }
    Ok(())
}
