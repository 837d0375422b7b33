//! OCSP revocation check for pki-mode client certificates.
//!
//! The exchange is the classic unsigned-request flow: build a CertID for
//! the presented leaf, POST it to the responder named in the leaf's
//! authority-information-access extension, and read the certStatus out of
//! the basic response. Only the status is consumed.
//!
//! TODO: verify the responder signature over tbsResponseData once a raw
//! signature verifier is wired in; until then policy `on` plus a trusted
//! responder endpoint is the supported hard-fail deployment.

use reqwest::header::CONTENT_TYPE;
use rustls::pki_types::CertificateDer;
use sha1::{Digest, Sha1};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use x509_parser::oid_registry::OID_PKIX_ACCESS_DESCRIPTOR_OCSP;
use x509_parser::prelude::*;

#[derive(Error, Debug)]
pub enum OcspError {
    #[error("certificate parse: {0}")]
    Cert(String),
    #[error("no issuer certificate in presented chain")]
    NoIssuer,
    #[error("certificate names no ocsp responder")]
    NoResponder,
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("responder returned http status {0}")]
    HttpStatus(u16),
    #[error("responder rejected request with status {0}")]
    ResponderStatus(u8),
    #[error("malformed response: {0}")]
    Malformed(&'static str),
    #[error("{0}")]
    Inconclusive(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationStatus {
    Good,
    Revoked,
    Unknown,
}

/// Check the leaf of a presented chain against its OCSP responder.
pub async fn check_chain(
    chain: &[CertificateDer<'static>],
    timeout: Duration,
) -> Result<RevocationStatus, OcspError> {
    let leaf_der = chain.first().ok_or(OcspError::NoIssuer)?;
    let (_, leaf) = X509Certificate::from_der(leaf_der.as_ref())
        .map_err(|e| OcspError::Cert(e.to_string()))?;

    // The issuer must be somewhere in the chain the client sent.
    let mut issuer = None;
    for candidate_der in &chain[1..] {
        let (_, candidate) = X509Certificate::from_der(candidate_der.as_ref())
            .map_err(|e| OcspError::Cert(e.to_string()))?;
        if candidate.subject().as_raw() == leaf.issuer().as_raw() {
            issuer = Some(candidate);
            break;
        }
    }
    let issuer = issuer.ok_or(OcspError::NoIssuer)?;

    let url = responder_url(&leaf).ok_or(OcspError::NoResponder)?;
    let cert_id = build_cert_id(&leaf, &issuer);
    let request = build_request(&cert_id);
    debug!(%url, "querying ocsp responder");

    let client = reqwest::Client::builder().timeout(timeout).build()?;
    let response = client
        .post(&url)
        .header(CONTENT_TYPE, "application/ocsp-request")
        .body(request)
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(OcspError::HttpStatus(response.status().as_u16()));
    }
    let body = response.bytes().await?;
    parse_response(&body, &cert_id)
}

/// OCSP URL from the authority-information-access extension.
pub fn responder_url(cert: &X509Certificate<'_>) -> Option<String> {
    for ext in cert.extensions() {
        if let ParsedExtension::AuthorityInfoAccess(aia) = ext.parsed_extension() {
            for desc in &aia.accessdescs {
                if desc.access_method == OID_PKIX_ACCESS_DESCRIPTOR_OCSP {
                    if let GeneralName::URI(uri) = &desc.access_location {
                        return Some(uri.to_string());
                    }
                }
            }
        }
    }
    None
}

// =============================================================================
// DER ENCODING
// =============================================================================

/// AlgorithmIdentifier for SHA-1, the digest OCSP CertIDs conventionally use.
const SHA1_ALG_ID: &[u8] = &[
    0x30, 0x09, 0x06, 0x05, 0x2b, 0x0e, 0x03, 0x02, 0x1a, 0x05, 0x00,
];

/// id-pkix-ocsp-basic, the only response type we understand.
const OID_OCSP_BASIC: &[u8] = &[0x2b, 0x06, 0x01, 0x05, 0x05, 0x07, 0x30, 0x01, 0x01];

fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    let len = content.len();
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        out.push(0x80 | (bytes.len() - skip) as u8);
        out.extend_from_slice(&bytes[skip..]);
    }
    out.extend_from_slice(content);
    out
}

/// CertID ::= SEQUENCE { hashAlgorithm, issuerNameHash, issuerKeyHash,
/// serialNumber }. Hashes are over the issuer name as it appears in the
/// leaf and over the issuer's public key bits.
fn build_cert_id(leaf: &X509Certificate<'_>, issuer: &X509Certificate<'_>) -> Vec<u8> {
    let name_hash = Sha1::digest(leaf.issuer().as_raw());
    let key_hash = Sha1::digest(issuer.public_key().subject_public_key.data.as_ref());
    let mut content = Vec::new();
    content.extend_from_slice(SHA1_ALG_ID);
    content.extend_from_slice(&tlv(0x04, &name_hash));
    content.extend_from_slice(&tlv(0x04, &key_hash));
    content.extend_from_slice(&tlv(0x02, leaf.raw_serial()));
    tlv(0x30, &content)
}

/// OCSPRequest ::= SEQUENCE { tbsRequest SEQUENCE { requestList SEQUENCE OF
/// SEQUENCE { reqCert CertID } } }. Unsigned, single request.
fn build_request(cert_id: &[u8]) -> Vec<u8> {
    let request = tlv(0x30, cert_id);
    let request_list = tlv(0x30, &request);
    let tbs = tlv(0x30, &request_list);
    tlv(0x30, &tbs)
}

// =============================================================================
// DER DECODING
// =============================================================================

struct Der<'a> {
    bytes: &'a [u8],
}

impl<'a> Der<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Read one TLV, returning (tag, content) and advancing past it.
    fn read(&mut self) -> Result<(u8, &'a [u8]), OcspError> {
        let truncated = OcspError::Malformed("truncated der");
        let (&tag, rest) = self.bytes.split_first().ok_or(truncated)?;
        let (&first, mut rest) = rest.split_first().ok_or(OcspError::Malformed("truncated der"))?;
        let len = if first < 0x80 {
            first as usize
        } else {
            let count = (first & 0x7f) as usize;
            if count == 0 || count > 4 || rest.len() < count {
                return Err(OcspError::Malformed("bad length"));
            }
            let mut len = 0usize;
            for _ in 0..count {
                let (&b, r) = rest.split_first().expect("length checked");
                len = (len << 8) | b as usize;
                rest = r;
            }
            len
        };
        if rest.len() < len {
            return Err(OcspError::Malformed("content overruns buffer"));
        }
        let (content, remainder) = rest.split_at(len);
        self.bytes = remainder;
        Ok((tag, content))
    }

    fn expect(&mut self, want: u8, what: &'static str) -> Result<&'a [u8], OcspError> {
        let (tag, content) = self.read()?;
        if tag != want {
            return Err(OcspError::Malformed(what));
        }
        Ok(content)
    }
}

/// Extract the certStatus for our CertID from an OCSPResponse.
fn parse_response(body: &[u8], cert_id: &[u8]) -> Result<RevocationStatus, OcspError> {
    let mut outer = Der::new(body);
    let mut response = Der::new(outer.expect(0x30, "expected OCSPResponse sequence")?);

    let status = response.expect(0x0a, "expected responseStatus")?;
    match status {
        [0] => {}
        [code] => return Err(OcspError::ResponderStatus(*code)),
        _ => return Err(OcspError::Malformed("bad responseStatus")),
    }

    let mut response_bytes =
        Der::new(response.expect(0xa0, "expected responseBytes")?);
    let mut wrapper = Der::new(response_bytes.expect(0x30, "expected ResponseBytes sequence")?);
    let response_type = wrapper.expect(0x06, "expected responseType oid")?;
    if response_type != OID_OCSP_BASIC {
        return Err(OcspError::Malformed("unsupported response type"));
    }
    let basic = wrapper.expect(0x04, "expected response octet string")?;

    let mut basic = Der::new(Der::new(basic).expect(0x30, "expected BasicOCSPResponse")?);
    let mut tbs = Der::new(basic.expect(0x30, "expected tbsResponseData")?);

    // version / responderID / producedAt precede the responses list.
    let responses = loop {
        let (tag, content) = tbs.read()?;
        match tag {
            0xa0 | 0xa1 | 0xa2 | 0x18 => continue,
            0x30 => break content,
            _ => return Err(OcspError::Malformed("unexpected field in tbsResponseData")),
        }
    };

    let mut responses = Der::new(responses);
    while !responses.is_empty() {
        let mut single = Der::new(responses.expect(0x30, "expected SingleResponse")?);
        let (tag, echoed) = single.read()?;
        if tag != 0x30 {
            return Err(OcspError::Malformed("expected certID"));
        }
        let matches = tlv(0x30, echoed) == cert_id;
        let (status_tag, _) = single.read()?;
        if !matches {
            continue;
        }
        return Ok(match status_tag {
            0x80 => RevocationStatus::Good,
            0xa1 => RevocationStatus::Revoked,
            _ => RevocationStatus::Unknown,
        });
    }
    Ok(RevocationStatus::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cert_id_fixture() -> Vec<u8> {
        let mut content = Vec::new();
        content.extend_from_slice(SHA1_ALG_ID);
        content.extend_from_slice(&tlv(0x04, &[0x11; 20]));
        content.extend_from_slice(&tlv(0x04, &[0x22; 20]));
        content.extend_from_slice(&tlv(0x02, &[0x01, 0x02]));
        tlv(0x30, &content)
    }

    /// Build a successful OCSPResponse holding one SingleResponse.
    fn response_fixture(cert_id: &[u8], status_tlv: Vec<u8>) -> Vec<u8> {
        let mut single = cert_id.to_vec();
        single.extend_from_slice(&status_tlv);
        single.extend_from_slice(&tlv(0x18, b"20260101000000Z"));
        let responses = tlv(0x30, &tlv(0x30, &single));

        let mut tbs = Vec::new();
        tbs.extend_from_slice(&tlv(0xa2, &tlv(0x04, &[0x33; 20])));
        tbs.extend_from_slice(&tlv(0x18, b"20260101000000Z"));
        tbs.extend_from_slice(&responses);
        let tbs = tlv(0x30, &tbs);

        let mut basic = tbs;
        basic.extend_from_slice(SHA1_ALG_ID);
        basic.extend_from_slice(&tlv(0x03, &[0x00, 0xde, 0xad]));
        let basic = tlv(0x30, &basic);

        let mut wrapper = tlv(0x06, OID_OCSP_BASIC);
        wrapper.extend_from_slice(&tlv(0x04, &basic));
        let response_bytes = tlv(0xa0, &tlv(0x30, &wrapper));

        let mut outer = tlv(0x0a, &[0x00]);
        outer.extend_from_slice(&response_bytes);
        tlv(0x30, &outer)
    }

    #[test]
    fn request_is_nested_sequences_around_cert_id() {
        let cert_id = cert_id_fixture();
        let request = build_request(&cert_id);
        let mut outer = Der::new(&request);
        let tbs = outer.expect(0x30, "outer").unwrap();
        let list = Der::new(tbs).expect(0x30, "tbs").unwrap();
        let req = Der::new(list).expect(0x30, "list").unwrap();
        let echoed = Der::new(req).read().unwrap();
        assert_eq!(tlv(0x30, echoed.1), cert_id);
    }

    #[test]
    fn parses_good_status() {
        let cert_id = cert_id_fixture();
        let body = response_fixture(&cert_id, tlv(0x80, &[]));
        assert_eq!(parse_response(&body, &cert_id).unwrap(), RevocationStatus::Good);
    }

    #[test]
    fn parses_revoked_status() {
        let cert_id = cert_id_fixture();
        let revoked_info = tlv(0xa1, &tlv(0x18, b"20251801000000Z"));
        let body = response_fixture(&cert_id, revoked_info);
        assert_eq!(parse_response(&body, &cert_id).unwrap(), RevocationStatus::Revoked);
    }

    #[test]
    fn parses_unknown_status() {
        let cert_id = cert_id_fixture();
        let body = response_fixture(&cert_id, tlv(0x82, &[]));
        assert_eq!(parse_response(&body, &cert_id).unwrap(), RevocationStatus::Unknown);
    }

    #[test]
    fn foreign_cert_id_is_unknown() {
        let cert_id = cert_id_fixture();
        let mut other = Vec::new();
        other.extend_from_slice(SHA1_ALG_ID);
        other.extend_from_slice(&tlv(0x04, &[0x44; 20]));
        other.extend_from_slice(&tlv(0x04, &[0x55; 20]));
        other.extend_from_slice(&tlv(0x02, &[0x09]));
        let other = tlv(0x30, &other);

        let body = response_fixture(&other, tlv(0x80, &[]));
        assert_eq!(parse_response(&body, &cert_id).unwrap(), RevocationStatus::Unknown);
    }

    #[test]
    fn non_success_status_is_an_error() {
        let mut outer = tlv(0x0a, &[0x06]);
        outer.extend_from_slice(&tlv(0xa0, &[]));
        let body = tlv(0x30, &outer);
        assert!(matches!(
            parse_response(&body, &cert_id_fixture()),
            Err(OcspError::ResponderStatus(6))
        ));
    }

    #[test]
    fn truncated_response_is_malformed() {
        let cert_id = cert_id_fixture();
        let mut body = response_fixture(&cert_id, tlv(0x80, &[]));
        body.truncate(body.len() / 2);
        assert!(matches!(
            parse_response(&body, &cert_id),
            Err(OcspError::Malformed(_))
        ));
    }

    #[test]
    fn responder_url_reads_aia_extension() {
        // authorityInfoAccess: one AccessDescription naming an OCSP URI.
        let url = b"http://ocsp.cluster.test/check";
        let mut access = tlv(0x06, &[0x2b, 0x06, 0x01, 0x05, 0x05, 0x07, 0x30, 0x01]);
        access.extend_from_slice(&tlv(0x86, url));
        let aia = tlv(0x30, &tlv(0x30, &access));

        let key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::new(vec!["dp.cluster.test".to_string()]).unwrap();
        params.custom_extensions = vec![rcgen::CustomExtension::from_oid_content(
            &[1, 3, 6, 1, 5, 5, 7, 1, 1],
            aia,
        )];
        let cert = params.self_signed(&key).unwrap();
        let der = cert.der().clone();
        let (_, parsed) = X509Certificate::from_der(der.as_ref()).unwrap();
        assert_eq!(
            responder_url(&parsed).as_deref(),
            Some("http://ocsp.cluster.test/check")
        );
    }
}
