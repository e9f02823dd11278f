//! Upstream trust bootstrap.
//!
//! The upstream presents a certificate issued by a private CA. Its root is
//! fetched once at startup, cached on disk and installed as the only trust
//! anchor of the forwarding client.

use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::config::UpstreamConfig;
use crate::error::{GatewayError, Result};

/// Download the PEM root served at `ca_url`.
pub async fn fetch_ca(client: &reqwest::Client, ca_url: &str) -> Result<Vec<u8>> {
    let response = client
        .get(ca_url)
        .send()
        .await
        .and_then(|response| response.error_for_status())
        .map_err(|e| GatewayError::Trust(format!("Could not fetch CA from {}: {}", ca_url, e)))?;

    let pem = response
        .bytes()
        .await
        .map_err(|e| GatewayError::Trust(format!("Could not read CA contents: {}", e)))?;

    info!(url = %ca_url, bytes = pem.len(), "Fetched CA certificate");
    Ok(pem.to_vec())
}

/// Write the root to `path`, readable only by the owner.
pub async fn write_cache(path: &Path, pem: &[u8]) -> Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(pem).await?;
    file.flush().await?;

    debug!(path = %path.display(), "Cached CA certificate");
    Ok(())
}

/// Parse every certificate in a PEM bundle into a root store.
pub fn root_store_from_pem(pem: &[u8]) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();

    for cert in CertificateDer::pem_slice_iter(pem) {
        let cert =
            cert.map_err(|e| GatewayError::Trust(format!("Invalid PEM certificate: {:?}", e)))?;
        roots
            .add(cert)
            .map_err(|e| GatewayError::Trust(format!("Invalid CA certificate: {}", e)))?;
    }

    if roots.is_empty() {
        return Err(GatewayError::Trust(
            "CA bundle contains no certificates".to_string(),
        ));
    }
    Ok(roots)
}

/// A TLS client configuration trusting only `roots`.
pub fn client_tls_config(roots: RootCertStore) -> Result<ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| GatewayError::Trust(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(config)
}

/// Fetch, cache and load the upstream trust root.
///
/// Returns `None` when no CA endpoint is configured, leaving the forwarding
/// client on its built-in roots. Any failure is fatal to startup.
pub async fn bootstrap(config: &UpstreamConfig) -> Result<Option<ClientConfig>> {
    let Some(ca_url) = config.ca_url.as_deref() else {
        info!("No CA endpoint configured, using built-in trust roots");
        return Ok(None);
    };

    let client = reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(config.connect_timeout_secs))
        .build()
        .map_err(|e| GatewayError::Trust(e.to_string()))?;

    let pem = fetch_ca(&client, ca_url).await?;
    write_cache(&config.ca_cache_path, &pem).await?;
    let roots = root_store_from_pem(&pem)?;

    info!(certificates = roots.len(), "Loaded CA");
    client_tls_config(roots).map(Some)
}
