//! Certificate forging for the intercepting proxy.
//!
//! The CA material (generated or user-supplied PEM) is re-hydrated into an
//! rcgen issuer; per-host leaf certificates are signed on demand and the
//! resulting rustls server configurations cached by host name.

use std::sync::Arc;

use dashmap::DashMap;
use rcgen::{Certificate, CertificateParams, ExtendedKeyUsagePurpose, KeyPair, KeyUsagePurpose};
use rustls::pki_types::PrivateKeyDer;
use rustls::ServerConfig;
use time::{Duration, OffsetDateTime};
use tracing::debug;

use crate::error::TlsError;

const LEAF_VALIDITY_DAYS: i64 = 90;

pub struct CertificateAuthority {
    ca_cert: Certificate,
    ca_key: KeyPair,
    ca_cert_pem: String,
    server_configs: DashMap<String, Arc<ServerConfig>>,
}

impl CertificateAuthority {
    /// Builds the authority from PEM-encoded CA certificate and key.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, TlsError> {
        let ca_key = KeyPair::from_pem(key_pem).map_err(|e| TlsError::CertLoad(e.to_string()))?;

        let params = CertificateParams::from_ca_cert_pem(cert_pem)
            .map_err(|e| TlsError::CertLoad(e.to_string()))?;

        let ca_cert = params
            .self_signed(&ca_key)
            .map_err(|e| TlsError::CertLoad(e.to_string()))?;

        Ok(Self {
            ca_cert,
            ca_key,
            ca_cert_pem: cert_pem.to_string(),
            server_configs: DashMap::new(),
        })
    }

    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Returns (generating and caching on first use) the server
    /// configuration presenting a forged certificate for the host.
    pub fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>, TlsError> {
        if let Some(config) = self.server_configs.get(host) {
            return Ok(config.clone());
        }

        debug!(host, "Generating forged certificate.");

        let (cert_der, key_der) = self.generate_host_cert(host)?;

        let ca_der = self.ca_cert.der().clone();

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der, ca_der], key_der)
            .map_err(|e| TlsError::InvalidCert(e.to_string()))?;

        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        let config = Arc::new(config);

        self.server_configs.insert(host.to_string(), config.clone());

        Ok(config)
    }

    fn generate_host_cert(
        &self,
        host: &str,
    ) -> Result<(rustls::pki_types::CertificateDer<'static>, PrivateKeyDer<'static>), TlsError>
    {
        let mut params = CertificateParams::new(vec![host.to_string()])
            .map_err(|e| TlsError::CertGeneration(e.to_string()))?;

        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, host);

        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::days(1);
        params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);

        let key_pair = KeyPair::generate().map_err(|e| TlsError::CertGeneration(e.to_string()))?;

        let cert = params
            .signed_by(&key_pair, &self.ca_cert, &self.ca_key)
            .map_err(|e| TlsError::CertGeneration(e.to_string()))?;

        let cert_der = cert.der().clone();
        let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
            .map_err(|e| TlsError::InvalidCert(format!("{e:?}")))?;

        Ok((cert_der, key_der))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;

    fn authority() -> CertificateAuthority {
        let (cert_pem, key_pem) = crypto::generate_rsa_ca_certificate().expect("CA generation failed");

        CertificateAuthority::from_pem(&cert_pem, &key_pem).expect("authority construction failed")
    }

    #[test]
    fn forged_configs_are_cached_per_host() {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let ca = authority();

        let first = ca.server_config("example.com").expect("config failed");
        let second = ca.server_config("example.com").expect("config failed");
        let other = ca.server_config("other.test").expect("config failed");

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[test]
    fn authority_keeps_the_original_pem() {
        let (cert_pem, key_pem) = crypto::generate_rsa_ca_certificate().expect("CA generation failed");

        let ca = CertificateAuthority::from_pem(&cert_pem, &key_pem).expect("construction failed");

        assert_eq!(ca.ca_cert_pem(), cert_pem);
    }
}
