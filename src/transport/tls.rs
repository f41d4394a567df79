//! TLS client settings shared by the tcp, http, grpc and quic dialers

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_rustls::rustls::{self, pki_types::ServerName, ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::common::{Address, Host, Result, Stream};
use crate::error::Error;

/// ALPN offered when none is configured
pub const DEFAULT_ALPN: &[&str] = &["h2", "http/1.1"];

/// TLS identity of an outbound. Part of the pool key, so two outbounds that
/// differ only in TLS settings never share a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TlsSettings {
    /// Server name for SNI, defaults to the destination host
    pub server_name: Option<String>,
    /// Skip certificate verification
    pub allow_insecure: bool,
    /// ALPN protocols
    pub alpn: Vec<String>,
}

impl TlsSettings {
    /// Insecure settings with a fixed server name.
    pub fn insecure(server_name: impl Into<String>) -> Self {
        Self {
            server_name: Some(server_name.into()),
            allow_insecure: true,
            alpn: vec![],
        }
    }

    /// Server name to present for `dest`.
    pub fn server_name_for(&self, dest: &Address) -> Result<ServerName<'static>> {
        let name = match &self.server_name {
            Some(name) => name.clone(),
            None => match dest.host() {
                Host::Domain(domain) => domain,
                Host::Ip(ip) => return Ok(ServerName::IpAddress(ip.into())),
            },
        };
        ServerName::try_from(name.clone())
            .map_err(|_| Error::Config(format!("Invalid server name: {}", name)))
    }

    /// Build a rustls client config. `fallback_alpn` is used when no ALPN is configured.
    pub fn client_config(&self, fallback_alpn: &[&str]) -> Result<ClientConfig> {
        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut tls_config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Config(format!("TLS configuration rejected: {}", e)))?
            .with_root_certificates(root_store)
            .with_no_client_auth();

        tls_config.alpn_protocols = if self.alpn.is_empty() {
            fallback_alpn.iter().map(|s| s.as_bytes().to_vec()).collect()
        } else {
            self.alpn.iter().map(|s| s.as_bytes().to_vec()).collect()
        };

        if self.allow_insecure {
            tls_config
                .dangerous()
                .set_certificate_verifier(Arc::new(InsecureVerifier));
        }

        Ok(tls_config)
    }

    /// Run a client handshake over `stream`.
    pub async fn connect(&self, dest: &Address, stream: Stream, fallback_alpn: &[&str]) -> Result<TlsStream> {
        let connector = TlsConnector::from(Arc::new(self.client_config(fallback_alpn)?));
        let domain = self.server_name_for(dest)?;
        let tls_stream = connector.connect(domain, stream).await?;
        Ok(tls_stream)
    }
}

/// Client TLS stream over a boxed transport stream
pub type TlsStream = tokio_rustls::client::TlsStream<Stream>;

/// Negotiated ALPN protocol of a client TLS stream.
pub fn negotiated_alpn(stream: &TlsStream) -> Option<Vec<u8>> {
    stream.get_ref().1.alpn_protocol().map(|p| p.to_vec())
}

/// Insecure certificate verifier
#[derive(Debug)]
struct InsecureVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_name_defaults_to_destination() {
        let settings = TlsSettings::default();

        let name = settings.server_name_for(&Address::domain("example.com", 443)).unwrap();
        match name {
            ServerName::DnsName(dns) => assert_eq!(dns.as_ref(), "example.com"),
            other => panic!("unexpected server name {:?}", other),
        }

        let name = settings
            .server_name_for(&Address::Socket("1.2.3.4:443".parse().unwrap()))
            .unwrap();
        assert!(matches!(name, ServerName::IpAddress(_)));
    }

    #[test]
    fn test_fallback_alpn() {
        let config = TlsSettings::default().client_config(&["h2"]).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec()]);

        let custom = TlsSettings {
            alpn: vec!["h3".into()],
            ..Default::default()
        };
        let config = custom.client_config(&["h2"]).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h3".to_vec()]);
    }
}
