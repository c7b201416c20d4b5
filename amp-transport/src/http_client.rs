//! Outbound hyper client for the HTTP binding.

use std::sync::Arc;
use std::time::Duration;

use hyper::client::HttpConnector;
use hyper::{Body, Client};
use hyper_rustls::HttpsConnector;
use rustls::{ClientConfig, OwnedTrustAnchor, RootCertStore};
use webpki_roots::TLS_SERVER_ROOTS;

pub(crate) type HyperClient = Client<HttpsConnector<HttpConnector>, Body>;

const IDLE_CONNECTIONS_PER_PEER: usize = 8;

/// Pooled client for `http://` and `https://` peers.
///
/// Connecting is bounded by `connect_timeout`; idle connections are dropped
/// after the same interval.
pub(crate) fn build_client(connect_timeout: Duration) -> HyperClient {
    let tls = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(trust_roots())
        .with_no_client_auth();

    let mut tcp = HttpConnector::new();
    tcp.enforce_http(false);
    tcp.set_nodelay(true);
    tcp.set_connect_timeout(Some(connect_timeout));

    Client::builder()
        .pool_idle_timeout(connect_timeout)
        .pool_max_idle_per_host(IDLE_CONNECTIONS_PER_PEER)
        .build::<_, Body>(HttpsConnector::from((tcp, Arc::new(tls))))
}

fn trust_roots() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    roots.add_trust_anchors(TLS_SERVER_ROOTS.iter().map(|anchor| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            anchor.subject,
            anchor.spki,
            anchor.name_constraints,
        )
    }));
    roots
}
