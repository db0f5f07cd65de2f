//! Quote extraction from RA-TLS certificates.

use crate::error::{Error, Result};
use std::borrow::Cow;
use tracing::debug;
use x509_parser::der_parser::oid::Oid;
use x509_parser::prelude::*;

/// OID of the SGX quote extension: 1.2.840.113741.1.13.1
pub const SGX_QUOTE_OID: Oid<'static> = Oid::new(Cow::Borrowed(&[
    0x2a, 0x86, 0x48, 0x86, 0xf8, 0x4d, 0x01, 0x0d, 0x01,
]));

/// Extract the opaque attestation quote from a DER-encoded certificate.
pub fn extract_quote(cert_der: &[u8]) -> Result<Vec<u8>> {
    let (rest, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| Error::CertificateUnparsable(e.to_string()))?;
    if !rest.is_empty() {
        return Err(Error::CertificateUnparsable(format!(
            "{} trailing bytes after certificate",
            rest.len()
        )));
    }

    let extensions = cert
        .extensions_map()
        .map_err(|e| Error::CertificateUnparsable(e.to_string()))?;

    let extension = extensions
        .get(&SGX_QUOTE_OID)
        .ok_or_else(|| Error::QuoteMissing("SGX quote extension missing".into()))?;

    if extension.value.is_empty() {
        return Err(Error::QuoteMissing("SGX quote extension empty".into()));
    }

    debug!(
        "Extracted SGX quote of length {} (prefix {})",
        extension.value.len(),
        hex::encode(&extension.value[..extension.value.len().min(8)])
    );

    Ok(extension.value.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, CustomExtension, KeyPair};

    const QUOTE_OID_ARCS: &[u64] = &[1, 2, 840, 113741, 1, 13, 1];

    fn cert_with_extensions(extensions: Vec<CustomExtension>) -> Vec<u8> {
        let key_pair = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec!["enclave.test".to_string()]).unwrap();
        params.custom_extensions = extensions;
        params.self_signed(&key_pair).unwrap().der().to_vec()
    }

    #[test]
    fn test_oid_constant_matches_dotted_form() {
        assert_eq!(SGX_QUOTE_OID.to_id_string(), "1.2.840.113741.1.13.1");
    }

    #[test]
    fn test_extracts_quote_bytes() {
        let der = cert_with_extensions(vec![CustomExtension::from_oid_content(
            QUOTE_OID_ARCS,
            b"GOODQUOTE".to_vec(),
        )]);

        assert_eq!(extract_quote(&der).unwrap(), b"GOODQUOTE");
    }

    #[test]
    fn test_ignores_other_extensions() {
        let der = cert_with_extensions(vec![
            CustomExtension::from_oid_content(&[1, 2, 840, 113741, 1, 13, 2], b"other".to_vec()),
            CustomExtension::from_oid_content(QUOTE_OID_ARCS, b"\x03\x00quote".to_vec()),
        ]);

        assert_eq!(extract_quote(&der).unwrap(), b"\x03\x00quote");
    }

    #[test]
    fn test_missing_extension() {
        let der = cert_with_extensions(Vec::new());

        assert!(matches!(extract_quote(&der), Err(Error::QuoteMissing(_))));
    }

    #[test]
    fn test_empty_extension_is_missing() {
        let der = cert_with_extensions(vec![CustomExtension::from_oid_content(
            QUOTE_OID_ARCS,
            Vec::new(),
        )]);

        assert!(matches!(extract_quote(&der), Err(Error::QuoteMissing(_))));
    }

    #[test]
    fn test_garbage_is_unparsable() {
        assert!(matches!(
            extract_quote(b"definitely not a certificate"),
            Err(Error::CertificateUnparsable(_))
        ));
        assert!(matches!(
            extract_quote(&[]),
            Err(Error::CertificateUnparsable(_))
        ));
    }
}
