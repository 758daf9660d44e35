use std::sync::Arc;
use tokio_rustls::rustls::client::{ServerCertVerified, ServerCertVerifier, WebPkiVerifier};
use tokio_rustls::rustls::{
    Certificate, ClientConfig, OwnedTrustAnchor, RootCertStore, ServerName,
};
use tokio_rustls::TlsConnector;

pub fn build_tls_connector(insecure: bool) -> TlsConnector {
    let config = ClientConfig::builder().with_safe_defaults();

    let verifier: Arc<dyn ServerCertVerifier> = if insecure {
        struct VerifyAll;
        impl ServerCertVerifier for VerifyAll {
            fn verify_server_cert(
                &self,
                _: &Certificate,
                _: &[Certificate],
                _: &ServerName,
                _: &mut dyn Iterator<Item = &[u8]>,
                _: &[u8],
                _: std::time::SystemTime,
            ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
                Ok(ServerCertVerified::assertion())
            }
        }
        Arc::new(VerifyAll {})
    } else {
        let mut root_cert_store = RootCertStore::empty();

        root_cert_store.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
            OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        }));
        Arc::new(WebPkiVerifier::new(root_cert_store, None))
    };

    let config = config
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();

    TlsConnector::from(Arc::new(config))
}
