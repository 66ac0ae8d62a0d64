//! rustls client configuration.

use std::path::Path;
use std::sync::Arc;

use carapace_core::error::TransportError;
use carapace_core::options::ConnectOptions;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

fn tls_err(e: impl std::fmt::Display) -> TransportError {
    TransportError::Tls(e.to_string())
}

/// Build a client config from the TLS paths in `options`.
///
/// Roots come from `tls_ca_file` when set, otherwise from the bundled web
/// PKI roots. A client certificate is only presented when both the
/// certificate chain and the key are configured.
pub fn client_config(options: &ConnectOptions) -> Result<Arc<ClientConfig>, TransportError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(tls_err)?;

    let roots = match &options.tls_ca_file {
        Some(path) => load_roots(path)?,
        None => {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            roots
        }
    };
    let builder = builder.with_root_certificates(roots);

    let config = match (&options.tls_cert_file, &options.tls_key_file) {
        (Some(cert), Some(key)) => {
            let chain = load_certs(cert)?;
            let key = PrivateKeyDer::from_pem_file(key).map_err(tls_err)?;
            builder.with_client_auth_cert(chain, key).map_err(tls_err)?
        }
        _ => builder.with_no_client_auth(),
    };
    Ok(Arc::new(config))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    CertificateDer::pem_file_iter(path)
        .map_err(tls_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(tls_err)
}

fn load_roots(path: &Path) -> Result<RootCertStore, TransportError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert).map_err(tls_err)?;
    }
    if roots.is_empty() {
        return Err(TransportError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(roots)
}

/// Connector plus the name presented for SNI and verification.
pub(crate) fn connector(
    config: Arc<ClientConfig>,
    host: &str,
) -> Result<(TlsConnector, ServerName<'static>), TransportError> {
    let name = ServerName::try_from(host.to_string()).map_err(tls_err)?;
    Ok((TlsConnector::from(config), name))
}
