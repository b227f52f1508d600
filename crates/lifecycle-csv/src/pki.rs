//! Serving certificates for owned APIServices
//!
//! Every owned APIService gets its own CA. The CA bundle is published on the
//! APIService so the aggregator can verify the serving deployment, and the
//! leaf certificate plus key are stored in a Secret mounted into the pod.
//!
//! Leaf certificates are reissued once 80% of their lifetime has passed or
//! when they no longer cover the Service's DNS names.

use chrono::{DateTime, Utc};
use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use thiserror::Error;
use x509_parser::prelude::*;

/// Validity period for the per-APIService CA
pub const CA_VALIDITY_DAYS: i64 = 730;

/// Validity period for serving certificates
pub const CERT_VALIDITY_DAYS: i64 = 730;

/// Fraction of a certificate's lifetime after which it is reissued
pub const ROTATION_THRESHOLD: f64 = 0.80;

const ORGANIZATION: &str = "lifecycle-operator";

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Certificate parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

fn compute_validity(days: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    (now, now + ::time::Duration::days(days))
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(ORGANIZATION.to_string()),
    );
    dn
}

/// Parse PEM-encoded data and return the DER bytes
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

/// A CA certificate and a leaf certificate it signed, all PEM-encoded
#[derive(Clone, Debug, PartialEq)]
pub struct ServingCertificate {
    /// CA certificate, published as the APIService caBundle
    pub ca_pem: String,
    /// Leaf certificate presented by the serving deployment
    pub cert_pem: String,
    /// Private key of the leaf certificate
    pub key_pem: String,
}

impl ServingCertificate {
    /// Issue a fresh CA and a serving certificate valid for `hosts`.
    ///
    /// The CA key is discarded once the leaf is signed.
    pub fn issue(common_name: &str, hosts: &[String]) -> Result<Self> {
        let mut ca_params = CertificateParams::default();
        ca_params.distinguished_name = distinguished_name(&format!("{common_name}-ca"));
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        ca_params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let (not_before, not_after) = compute_validity(CA_VALIDITY_DAYS);
        ca_params.not_before = not_before;
        ca_params.not_after = not_after;

        let ca_key = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate CA key: {}", e))
        })?;
        let ca_cert = ca_params.self_signed(&ca_key).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
        })?;
        let ca_pem = ca_cert.pem();

        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];
        let (not_before, not_after) = compute_validity(CERT_VALIDITY_DAYS);
        params.not_before = not_before;
        params.not_after = not_after;
        params.subject_alt_names = hosts
            .iter()
            .map(|host| {
                Ia5String::try_from(host.clone())
                    .map(SanType::DnsName)
                    .map_err(|e| {
                        PkiError::CertificateGenerationFailed(format!(
                            "invalid DNS name '{}': {}",
                            host, e
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        let key = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate serving key: {}", e))
        })?;
        let key_pem = key.serialize_pem();

        let issuer = Issuer::from_ca_cert_pem(&ca_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;
        let cert = params.signed_by(&key, &issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to sign serving cert: {}", e))
        })?;

        Ok(Self {
            ca_pem,
            cert_pem: cert.pem(),
            key_pem,
        })
    }
}

/// Validity window and DNS names of a certificate
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    /// When the certificate becomes valid (Unix timestamp)
    pub not_before: i64,
    /// When the certificate expires (Unix timestamp)
    pub not_after: i64,
    /// DNS subject alternative names
    pub dns_names: Vec<String>,
}

impl CertificateInfo {
    /// Parse certificate info from a PEM-encoded certificate
    pub fn from_pem(pem_data: &str) -> Result<Self> {
        let der = parse_pem(pem_data)?;
        let (_, cert) = X509Certificate::from_der(&der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

        let dns_names = cert
            .subject_alternative_name()
            .map_err(|e| PkiError::ParseError(format!("invalid SAN extension: {}", e)))?
            .map(|ext| {
                ext.value
                    .general_names
                    .iter()
                    .filter_map(|name| match name {
                        GeneralName::DNSName(dns) => Some(dns.to_string()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            dns_names,
        })
    }

    /// True once `now` is past [`ROTATION_THRESHOLD`] of the lifetime
    pub fn needs_rotation(&self, now: DateTime<Utc>) -> bool {
        let lifetime = (self.not_after - self.not_before) as f64;
        if lifetime <= 0.0 {
            return true;
        }
        let age = (now.timestamp() - self.not_before) as f64;
        age / lifetime >= ROTATION_THRESHOLD
    }

    /// True when every host is listed as a DNS SAN
    pub fn covers(&self, hosts: &[String]) -> bool {
        hosts.iter().all(|h| self.dns_names.iter().any(|n| n == h))
    }
}

/// Decide whether stored serving material can be kept.
///
/// Returns false if any piece is unparseable, the leaf no longer covers
/// `hosts`, or the leaf is due for rotation.
pub fn is_reusable(cert: &ServingCertificate, hosts: &[String], now: DateTime<Utc>) -> bool {
    if parse_pem(&cert.ca_pem).is_err() || KeyPair::from_pem(&cert.key_pem).is_err() {
        return false;
    }
    match CertificateInfo::from_pem(&cert.cert_pem) {
        Ok(info) => info.covers(hosts) && !info.needs_rotation(now),
        Err(_) => false,
    }
}
