//! Shared fixtures: CSR objects with real PEM payloads, machine records,
//! and an openssl-minted CA/leaf pair for the renewal strategies.

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestCondition, CertificateSigningRequestSpec,
    CertificateSigningRequestStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use k8s_openapi::ByteString;
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::stack::Stack;
use openssl::x509::extension::{BasicConstraints, SubjectAlternativeName};
use openssl::x509::{X509NameBuilder, X509ReqBuilder, X509};

use machine_approver::machines::{MachineAddress, MachineRecord};

pub const BOOTSTRAPPER_GROUPS: [&str; 3] = [
    "system:serviceaccounts:openshift-machine-config-operator",
    "system:serviceaccounts",
    "system:authenticated",
];
pub const SERVING_GROUPS: [&str; 2] = ["system:nodes", "system:authenticated"];

pub const CLIENT_USAGES: [&str; 3] = ["digital signature", "key encipherment", "client auth"];
pub const SERVING_USAGES: [&str; 3] = ["digital signature", "key encipherment", "server auth"];

fn keypair() -> PKey<Private> {
    PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap()
}

/// PEM-encoded certification request with the given subject and SANs.
pub fn csr_pem(cn: &str, orgs: &[&str], dns: &[&str], ips: &[&str]) -> String {
    let key = keypair();
    let mut req = X509ReqBuilder::new().unwrap();
    req.set_pubkey(&key).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", cn).unwrap();
    for org in orgs {
        name.append_entry_by_text("O", org).unwrap();
    }
    let name = name.build();
    req.set_subject_name(&name).unwrap();

    if !dns.is_empty() || !ips.is_empty() {
        let mut san = SubjectAlternativeName::new();
        for d in dns {
            san.dns(d);
        }
        for ip in ips {
            san.ip(ip);
        }
        let ext = san.build(&req.x509v3_context(None)).unwrap();
        let mut extensions = Stack::new().unwrap();
        extensions.push(ext).unwrap();
        req.add_extensions(&extensions).unwrap();
    }

    req.sign(&key, MessageDigest::sha256()).unwrap();
    String::from_utf8(req.build().to_pem().unwrap()).unwrap()
}

pub fn csr_object(
    name: &str,
    signer: &str,
    username: &str,
    groups: &[&str],
    usages: &[&str],
    request_pem: &str,
    created: DateTime<Utc>,
) -> CertificateSigningRequest {
    CertificateSigningRequest {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            creation_timestamp: Some(Time(created)),
            ..Default::default()
        },
        spec: CertificateSigningRequestSpec {
            request: ByteString(request_pem.as_bytes().to_vec()),
            signer_name: signer.to_string(),
            username: Some(username.to_string()),
            groups: Some(groups.iter().map(|g| g.to_string()).collect()),
            usages: Some(usages.iter().map(|u| u.to_string()).collect()),
            ..Default::default()
        },
        status: None,
    }
}

pub fn with_condition(
    mut csr: CertificateSigningRequest,
    type_: &str,
    status: &str,
    message: &str,
    updated: DateTime<Utc>,
) -> CertificateSigningRequest {
    let condition = CertificateSigningRequestCondition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: None,
        message: Some(message.to_string()),
        last_update_time: Some(Time(updated)),
        last_transition_time: Some(Time(updated)),
    };
    csr.status = Some(CertificateSigningRequestStatus {
        conditions: Some(vec![condition]),
        ..Default::default()
    });
    csr
}

pub fn machine(
    name: &str,
    created: Option<DateTime<Utc>>,
    node_ref: Option<&str>,
    addresses: &[(&str, &str)],
) -> MachineRecord {
    MachineRecord {
        name: name.to_string(),
        created,
        node_ref_name: node_ref.map(str::to_string),
        addresses: addresses
            .iter()
            .map(|(t, a)| MachineAddress {
                address_type: t.to_string(),
                address: a.to_string(),
            })
            .collect(),
    }
}

/// Self-signed CA suitable as a one-entry kubelet bundle.
pub fn make_ca(cn: &str) -> (X509, PKey<Private>) {
    let key = keypair();
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", cn).unwrap();
    let name = name.build();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(365).unwrap())
        .unwrap();
    builder
        .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
        .unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    (builder.build(), key)
}

/// Serving leaf signed by the given CA, shaped like a kubelet certificate.
pub fn make_leaf(
    ca: &X509,
    ca_key: &PKey<Private>,
    cn: &str,
    dns: &[&str],
    ips: &[&str],
) -> X509 {
    let key = keypair();
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", cn).unwrap();
    name.append_entry_by_text("O", "system:nodes").unwrap();
    let name = name.build();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(2).unwrap().to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(ca.subject_name()).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(30).unwrap())
        .unwrap();

    if !dns.is_empty() || !ips.is_empty() {
        let mut san = SubjectAlternativeName::new();
        for d in dns {
            san.dns(d);
        }
        for ip in ips {
            san.ip(ip);
        }
        let ext = san
            .build(&builder.x509v3_context(Some(ca), None))
            .unwrap();
        builder.append_extension(ext).unwrap();
    }

    builder.sign(ca_key, MessageDigest::sha256()).unwrap();
    builder.build()
}
