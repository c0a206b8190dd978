//! Serving-cert probe: fetch the certificate a node's kubelet currently
//! presents. Failures here are never fatal to the pipeline; they only make
//! the renewal fast-path fall through.

use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use k8s_openapi::api::core::v1::Node;
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use openssl::stack::Stack;
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::{X509StoreContext, X509};
use thiserror::Error;
use tokio::task;

/// Deadline for the TCP connect and for each TLS read/write.
const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Port the kubelet serves on when the node does not publish one.
const DEFAULT_KUBELET_PORT: i32 = 10250;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("no kubelet CA bundle available")]
    NoCaBundle,
    #[error("node {0} has no internal IP address")]
    NoInternalIp(String),
    #[error("connect to {addr} failed: {source}")]
    Dial {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("TLS handshake with {addr} failed: {reason}")]
    Handshake { addr: SocketAddr, reason: String },
    #[error("peer at {0} presented no certificate")]
    NoPeerCertificate(SocketAddr),
    #[error("openssl: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),
    #[error("probe task failed: {0}")]
    Join(#[from] task::JoinError),
}

/// Dial the node's kubelet endpoint over TLS, trusting only `ca_bundle`,
/// and return the leaf certificate it presents. The peer is pinned to the
/// node's first internal IP.
pub async fn fetch_serving_cert(node: &Node, ca_bundle: &[X509]) -> Result<X509, ProbeError> {
    if ca_bundle.is_empty() {
        return Err(ProbeError::NoCaBundle);
    }
    let node_name = node.metadata.name.clone().unwrap_or_default();
    let status = node.status.as_ref();

    let internal_ip = status
        .and_then(|s| s.addresses.as_ref())
        .and_then(|addrs| {
            addrs
                .iter()
                .find(|a| a.type_ == crate::machines::INTERNAL_IP)
        })
        .map(|a| a.address.clone())
        .ok_or_else(|| ProbeError::NoInternalIp(node_name.clone()))?;
    let ip = internal_ip
        .parse()
        .map_err(|_| ProbeError::NoInternalIp(node_name))?;

    let port = status
        .and_then(|s| s.daemon_endpoints.as_ref())
        .and_then(|d| d.kubelet_endpoint.as_ref())
        .map(|k| k.port)
        .unwrap_or(DEFAULT_KUBELET_PORT) as u16;

    let addr = SocketAddr::new(ip, port);
    let bundle = ca_bundle.to_vec();

    // openssl handshakes are blocking; the socket deadlines bound the wait.
    task::spawn_blocking(move || dial(addr, ip, &bundle)).await?
}

fn dial(
    addr: SocketAddr,
    ip: std::net::IpAddr,
    ca_bundle: &[X509],
) -> Result<X509, ProbeError> {
    let stream = TcpStream::connect_timeout(&addr, DIAL_TIMEOUT)
        .map_err(|source| ProbeError::Dial { addr, source })?;
    stream
        .set_read_timeout(Some(DIAL_TIMEOUT))
        .map_err(|source| ProbeError::Dial { addr, source })?;
    stream
        .set_write_timeout(Some(DIAL_TIMEOUT))
        .map_err(|source| ProbeError::Dial { addr, source })?;

    let mut store = X509StoreBuilder::new()?;
    for cert in ca_bundle {
        store.add_cert(cert.clone())?;
    }
    let mut builder = SslConnector::builder(SslMethod::tls_client())?;
    builder.set_cert_store(store.build());
    builder.set_verify(SslVerifyMode::PEER);
    let connector = builder.build();

    let mut config = connector.configure()?;
    // The expected server name is a literal IP; pin it on the verify
    // parameters instead of openssl's hostname matching.
    config.set_verify_hostname(false);
    config.set_use_server_name_indication(false);
    config.param_mut().set_ip(ip)?;

    let tls = config
        .connect(&ip.to_string(), stream)
        .map_err(|e| ProbeError::Handshake {
            addr,
            reason: e.to_string(),
        })?;
    tls.ssl()
        .peer_certificate()
        .ok_or(ProbeError::NoPeerCertificate(addr))
}

/// Verify that `leaf` chains to the given roots. Used by the renewal
/// strategies to re-check the certificate obtained from the wire.
pub fn leaf_chains_to(ca_bundle: &[X509], leaf: &X509) -> Result<bool, openssl::error::ErrorStack> {
    let mut builder = X509StoreBuilder::new()?;
    for cert in ca_bundle {
        builder.add_cert(cert.clone())?;
    }
    let store = builder.build();
    let chain = Stack::new()?;
    let mut ctx = X509StoreContext::new()?;
    ctx.init(&store, leaf, &chain, |c| c.verify_cert())
}

/// Parse a PEM bundle (the configmap's `ca-bundle.crt` value) into roots.
pub fn parse_ca_bundle(pem: &str) -> Result<Vec<X509>, openssl::error::ErrorStack> {
    X509::stack_from_pem(pem.as_bytes())
}
