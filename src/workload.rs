//! Workload identity agent access
//!
//! [`IdentityAgent`] is the black-box boundary the refresher talks to.
//! [`WorkloadApiClient`] implements it against the SPIFFE Workload API: gRPC
//! over HTTP/2 on the agent's Unix domain socket.

use crate::error::{Error, Result};
use crate::spiffe_id::SpiffeId;
use crate::svid::{CertChainSource, KeySource, X509Svid};
use crate::trust_bundle::{BundleSet, TrustBundle};
use async_trait::async_trait;
use hyper_util::rt::TokioIo;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::UnixStream;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::codec::{ProstCodec, Streaming};
use tonic::metadata::MetadataValue;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::{debug, info};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;
use zeroize::Zeroizing;

/// Default SPIRE agent socket path
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/spire-agent/public/api.sock";

/// Header every Workload API call must carry
const SECURITY_HEADER: &str = "workload.spiffe.io";

const FETCH_X509_SVID: &str = "/SpiffeWorkloadAPI/FetchX509SVID";
const FETCH_X509_BUNDLES: &str = "/SpiffeWorkloadAPI/FetchX509Bundles";

// Placeholder authority; the connector ignores it and dials the socket.
const CHANNEL_URI: &str = "http://[::]:50051";

/// Workload API messages (`workload.proto`), only the X.509 half
pub(crate) mod proto {
    use std::collections::HashMap;

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct X509SvidRequest {}

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct X509SvidResponse {
        #[prost(message, repeated, tag = "1")]
        pub svids: Vec<X509Svid>,
        #[prost(bytes = "vec", repeated, tag = "2")]
        pub crl: Vec<Vec<u8>>,
        #[prost(map = "string, bytes", tag = "3")]
        pub federated_bundles: HashMap<String, Vec<u8>>,
    }

    /// One SVID; certificate and bundle fields are concatenated ASN.1 DER
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct X509Svid {
        #[prost(string, tag = "1")]
        pub spiffe_id: String,
        #[prost(bytes = "vec", tag = "2")]
        pub x509_svid: Vec<u8>,
        #[prost(bytes = "vec", tag = "3")]
        pub x509_svid_key: Vec<u8>,
        #[prost(bytes = "vec", tag = "4")]
        pub bundle: Vec<u8>,
        #[prost(string, tag = "5")]
        pub hint: String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct X509BundlesRequest {}

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct X509BundlesResponse {
        #[prost(bytes = "vec", repeated, tag = "1")]
        pub crl: Vec<Vec<u8>>,
        #[prost(map = "string, bytes", tag = "2")]
        pub bundles: HashMap<String, Vec<u8>>,
    }
}

/// Source of identity documents and trust bundles
#[async_trait]
pub trait IdentityAgent: Send + Sync {
    /// Fetch the current identity document for this workload
    async fn fetch_identity(&self) -> Result<X509Svid>;

    /// Fetch the trust bundles known to the agent
    async fn fetch_trust_bundle(&self) -> Result<BundleSet>;
}

/// Configuration for Workload API client
#[derive(Clone, Debug)]
pub struct WorkloadApiConfig {
    /// Socket path for SPIRE agent
    pub socket_path: PathBuf,
    /// Bound on establishing the socket connection
    pub connect_timeout: Duration,
    /// Bound on a single call, up to the first streamed response
    pub request_timeout: Duration,
}

impl Default for WorkloadApiConfig {
    fn default() -> Self {
        WorkloadApiConfig {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Workload API client for fetching SVIDs and bundles
#[derive(Clone, Debug)]
pub struct WorkloadApiClient {
    config: WorkloadApiConfig,
}

impl WorkloadApiClient {
    /// Create a new Workload API client. No connection is made until the
    /// first fetch.
    pub fn new(config: WorkloadApiConfig) -> Self {
        WorkloadApiClient { config }
    }

    async fn connect(&self) -> Result<tonic::client::Grpc<Channel>> {
        let path = self.config.socket_path.clone();
        let display = path.display().to_string();

        let endpoint = Endpoint::from_static(CHANNEL_URI)
            .connect_timeout(self.config.connect_timeout)
            .timeout(self.config.request_timeout);

        let channel = endpoint
            .connect_with_connector(service_fn(move |_: Uri| {
                let path = path.clone();
                async move { Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(path).await?)) }
            }))
            .await
            .map_err(|e| Error::agent_error(format!("Failed to connect to {display}: {e}")))?;

        Ok(tonic::client::Grpc::new(channel))
    }

    /// Issue one server-streaming call and return its first message. The
    /// agent keeps the stream open to push rotations; one message is all a
    /// fetch needs.
    async fn first_message<Req, Resp>(&self, method: &'static str, request: Req) -> Result<Resp>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let call = async {
            let mut grpc = self.connect().await?;
            grpc.ready()
                .await
                .map_err(|e| Error::agent_error(format!("{method}: channel not ready: {e}")))?;

            let mut request = tonic::Request::new(request);
            request
                .metadata_mut()
                .insert(SECURITY_HEADER, MetadataValue::from_static("true"));

            let codec: ProstCodec<Req, Resp> = ProstCodec::default();
            let mut stream: Streaming<Resp> = grpc
                .server_streaming(request, PathAndQuery::from_static(method), codec)
                .await
                .map_err(|status| status_error(method, status))?
                .into_inner();

            stream
                .message()
                .await
                .map_err(|status| status_error(method, status))?
                .ok_or_else(|| Error::agent_error(format!("{method}: empty response stream")))
        };

        let response = tokio::time::timeout(self.config.request_timeout, call)
            .await
            .map_err(|_| Error::agent_error(format!("{method} timed out")))??;

        debug!(method, "Workload API call complete");
        Ok(response)
    }
}

#[async_trait]
impl IdentityAgent for WorkloadApiClient {
    async fn fetch_identity(&self) -> Result<X509Svid> {
        info!(socket = %self.config.socket_path.display(), "Fetching X.509 SVID from agent");

        let response: proto::X509SvidResponse = self
            .first_message(FETCH_X509_SVID, proto::X509SvidRequest {})
            .await?;
        svid_from_response(response)
    }

    async fn fetch_trust_bundle(&self) -> Result<BundleSet> {
        let response: proto::X509BundlesResponse = self
            .first_message(FETCH_X509_BUNDLES, proto::X509BundlesRequest {})
            .await?;
        bundles_from_response(response)
    }
}

fn status_error(method: &str, status: tonic::Status) -> Error {
    Error::agent_error(format!(
        "{method} failed ({:?}): {}",
        status.code(),
        status.message()
    ))
}

/// The first SVID in the response is this workload's default identity.
pub(crate) fn svid_from_response(mut response: proto::X509SvidResponse) -> Result<X509Svid> {
    if response.svids.is_empty() {
        return Err(Error::agent_error("Agent returned no X.509 SVIDs"));
    }
    let mut entry = response.svids.swap_remove(0);
    let key = Zeroizing::new(std::mem::take(&mut entry.x509_svid_key));

    let svid = X509Svid::from_agent_parts(
        CertChainSource::Der(split_der_certificates(&entry.x509_svid)?),
        KeySource::Der(key),
    )?;

    if !entry.spiffe_id.is_empty() {
        let claimed = SpiffeId::parse(&entry.spiffe_id)?;
        if &claimed != svid.spiffe_id() {
            return Err(Error::invalid_identity(format!(
                "Agent claimed {} but certificate carries {}",
                claimed,
                svid.spiffe_id()
            )));
        }
    }

    Ok(svid)
}

pub(crate) fn bundles_from_response(response: proto::X509BundlesResponse) -> Result<BundleSet> {
    let mut set = BundleSet::new();
    for (trust_domain, der) in response.bundles {
        let authorities = split_der_certificates(&der)
            .map_err(|e| Error::TrustBundleError(format!("{trust_domain}: {e}")))?;
        set.insert(TrustBundle::new(trust_domain, authorities));
    }
    if set.is_empty() {
        return Err(Error::agent_error("Agent returned no trust bundles"));
    }
    Ok(set)
}

/// Split a run of concatenated DER certificates into one buffer each
fn split_der_certificates(mut der: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut certs = Vec::new();
    while !der.is_empty() {
        let (rest, _) = X509Certificate::from_der(der)
            .map_err(|e| Error::invalid_identity(format!("Malformed DER certificate: {e}")))?;
        let consumed = der.len() - rest.len();
        certs.push(der[..consumed].to_vec());
        der = rest;
    }
    if certs.is_empty() {
        return Err(Error::invalid_identity("No certificates present"));
    }
    Ok(certs)
}
