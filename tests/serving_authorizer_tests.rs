use chrono::Utc;

use machine_approver::approver::{authorize_node_serving, EgressContext};
use machine_approver::csr::{parse_csr, NODE_SERVING_SIGNER};
use machine_approver::probe::leaf_chains_to;

mod common;
use common::*;

const MACHINE_ADDRESSES: [(&str, &str); 4] = [
    ("InternalIP", "127.0.0.1"),
    ("ExternalIP", "10.0.0.1"),
    ("InternalDNS", "node1.local"),
    ("ExternalDNS", "node1"),
];

fn serving_csr(
    dns: &[&str],
    ips: &[&str],
) -> k8s_openapi::api::certificates::v1::CertificateSigningRequest {
    let pem = csr_pem("system:node:test", &["system:nodes"], dns, ips);
    csr_object(
        "csr-serving",
        NODE_SERVING_SIGNER,
        "system:node:test",
        &SERVING_GROUPS,
        &SERVING_USAGES,
        &pem,
        Utc::now(),
    )
}

#[test]
fn approves_when_machine_vouches_for_all_sans() {
    let machines = vec![machine("m-test", None, Some("test"), &MACHINE_ADDRESSES)];
    let csr = serving_csr(&["node1", "node1.local"], &["10.0.0.1", "127.0.0.1"]);
    let parsed = parse_csr(&csr).unwrap();

    authorize_node_serving(&csr, &parsed, &machines, None, None, None).unwrap();
}

#[test]
fn machine_dns_match_is_case_insensitive() {
    let machines = vec![machine(
        "m-test",
        None,
        Some("test"),
        &[("InternalIP", "127.0.0.1"), ("InternalDNS", "NODE1.Local")],
    )];
    let csr = serving_csr(&["node1.local"], &["127.0.0.1"]);
    let parsed = parse_csr(&csr).unwrap();

    authorize_node_serving(&csr, &parsed, &machines, None, None, None).unwrap();
}

#[test]
fn refuses_ip_the_machine_does_not_know() {
    let machines = vec![machine("m-test", None, Some("test"), &MACHINE_ADDRESSES)];
    let csr = serving_csr(
        &["node1", "node1.local"],
        &["10.0.0.1", "127.0.0.1", "99.0.1.1"],
    );
    let parsed = parse_csr(&csr).unwrap();

    let err = authorize_node_serving(&csr, &parsed, &machines, None, None, None).unwrap_err();
    assert!(err.to_string().contains("99.0.1.1"));
}

#[test]
fn refuses_without_machine_node_reference() {
    let machines = vec![machine("m-test", None, None, &MACHINE_ADDRESSES)];
    let csr = serving_csr(&["node1"], &[]);
    let parsed = parse_csr(&csr).unwrap();

    let err = authorize_node_serving(&csr, &parsed, &machines, None, None, None).unwrap_err();
    assert!(err.to_string().contains("node reference"));
}

#[test]
fn egress_ip_unlocks_the_extra_san() {
    let (ca, ca_key) = make_ca("kubelet-ca");
    let leaf = make_leaf(
        &ca,
        &ca_key,
        "system:node:test",
        &["node1", "node1.local"],
        &["10.0.0.1", "127.0.0.1"],
    );
    let machines = vec![machine("m-test", None, Some("test"), &MACHINE_ADDRESSES)];
    let csr = serving_csr(
        &["node1", "node1.local"],
        &["10.0.0.1", "127.0.0.1", "99.0.1.1"],
    );
    let parsed = parse_csr(&csr).unwrap();
    let bundle = vec![ca];
    let egress = EgressContext {
        egress_ips: vec!["99.0.1.1".to_string()],
        egress_cidrs: vec![],
    };

    authorize_node_serving(
        &csr,
        &parsed,
        &machines,
        Some(&leaf),
        Some(&bundle),
        Some(&egress),
    )
    .unwrap();
}

#[test]
fn egress_cidr_contains_the_extra_san() {
    let (ca, ca_key) = make_ca("kubelet-ca");
    let leaf = make_leaf(&ca, &ca_key, "system:node:test", &[], &["127.0.0.1"]);
    let csr = serving_csr(&[], &["127.0.0.1", "99.0.1.7"]);
    let parsed = parse_csr(&csr).unwrap();
    let bundle = vec![ca];
    let egress = EgressContext {
        egress_ips: vec![],
        egress_cidrs: vec!["99.0.1.0/24".to_string()],
    };

    authorize_node_serving(&csr, &parsed, &[], Some(&leaf), Some(&bundle), Some(&egress))
        .unwrap();
}

#[test]
fn renewal_fast_path_needs_no_machine() {
    let (ca, ca_key) = make_ca("kubelet-ca");
    let leaf = make_leaf(
        &ca,
        &ca_key,
        "system:node:test",
        &["node1", "node1.local"],
        &["10.0.0.1", "127.0.0.1"],
    );
    let csr = serving_csr(&["node1", "node1.local"], &["10.0.0.1", "127.0.0.1"]);
    let parsed = parse_csr(&csr).unwrap();
    let bundle = vec![ca];

    authorize_node_serving(&csr, &parsed, &[], Some(&leaf), Some(&bundle), None).unwrap();
}

#[test]
fn renewal_refuses_leaf_from_unknown_ca() {
    let (trusted_ca, _trusted_key) = make_ca("kubelet-ca");
    let (rogue_ca, rogue_key) = make_ca("rogue-ca");
    let leaf = make_leaf(&rogue_ca, &rogue_key, "system:node:test", &["node1"], &[]);
    let csr = serving_csr(&["node1"], &[]);
    let parsed = parse_csr(&csr).unwrap();
    let bundle = vec![trusted_ca];

    let err =
        authorize_node_serving(&csr, &parsed, &[], Some(&leaf), Some(&bundle), None).unwrap_err();
    assert!(err.to_string().contains("chain"));
}

#[test]
fn renewal_refuses_common_name_mismatch() {
    let (ca, ca_key) = make_ca("kubelet-ca");
    let leaf = make_leaf(&ca, &ca_key, "system:node:imposter", &["node1"], &[]);
    let csr = serving_csr(&["node1"], &[]);
    let parsed = parse_csr(&csr).unwrap();
    let bundle = vec![ca];

    let err =
        authorize_node_serving(&csr, &parsed, &[], Some(&leaf), Some(&bundle), None).unwrap_err();
    assert!(err.to_string().contains("common name"));
}

#[test]
fn renewal_refuses_san_set_drift() {
    let (ca, ca_key) = make_ca("kubelet-ca");
    let leaf = make_leaf(&ca, &ca_key, "system:node:test", &["node1"], &["127.0.0.1"]);
    // The request asks for a DNS name the live certificate never carried.
    let csr = serving_csr(&["node1", "sneaky.example"], &["127.0.0.1"]);
    let parsed = parse_csr(&csr).unwrap();
    let bundle = vec![ca];

    let err =
        authorize_node_serving(&csr, &parsed, &[], Some(&leaf), Some(&bundle), None).unwrap_err();
    assert!(err.to_string().contains("DNS name"));
}

#[test]
fn chain_verification_helper_accepts_and_rejects() {
    let (ca, ca_key) = make_ca("kubelet-ca");
    let (other_ca, _other_key) = make_ca("other-ca");
    let leaf = make_leaf(&ca, &ca_key, "system:node:test", &[], &[]);

    assert!(leaf_chains_to(&[ca], &leaf).unwrap());
    assert!(!leaf_chains_to(&[other_ca], &leaf).unwrap());
}
