//! TLS composition for upstream listeners
//!
//! Every downstream that declares a `tls` block contributes a PEM pair.
//! The union becomes the listener's server configuration; selection is
//! SNI-based with names pulled from each certificate's subject alternative
//! names (and common name as a fallback). Clients that send no SNI, or a
//! name nobody claims, get the first certificate.

use super::MasterError;
use rustls::pki_types::CertificateDer;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

pub(crate) struct CertSet {
    by_name: HashMap<String, Arc<CertifiedKey>>,
    default: Arc<CertifiedKey>,
}

impl CertSet {
    fn lookup(&self, server_name: &str) -> Arc<CertifiedKey> {
        let name = server_name.to_ascii_lowercase();
        if let Some(ck) = self.by_name.get(&name) {
            return ck.clone();
        }
        if let Some((_, rest)) = name.split_once('.') {
            if let Some(ck) = self.by_name.get(&format!("*.{}", rest)) {
                return ck.clone();
            }
        }
        self.default.clone()
    }
}

impl fmt::Debug for CertSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertSet")
            .field("names", &self.by_name.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ResolvesServerCert for CertSet {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        match client_hello.server_name() {
            Some(name) => Some(self.lookup(name)),
            None => Some(self.default.clone()),
        }
    }
}

/// Build a server config from PEM `(cert, key)` pairs. Unusable pairs are
/// skipped; `None` when nothing usable remains.
pub(crate) fn build_server_config(
    pairs: &[(String, String)],
) -> Result<Option<rustls::ServerConfig>, MasterError> {
    let Some(set) = build_cert_set(pairs) else {
        return Ok(None);
    };
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(set));
    Ok(Some(config))
}

fn build_cert_set(pairs: &[(String, String)]) -> Option<CertSet> {
    let mut by_name: HashMap<String, Arc<CertifiedKey>> = HashMap::new();
    let mut default = None;
    for (cert_pem, key_pem) in pairs {
        let (certified, names) = match load_certified(cert_pem, key_pem) {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!("skipping unusable downstream certificate: {}", e);
                continue;
            }
        };
        let certified = Arc::new(certified);
        if default.is_none() {
            default = Some(certified.clone());
        }
        for name in names {
            by_name
                .entry(name.to_ascii_lowercase())
                .or_insert_with(|| certified.clone());
        }
    }
    default.map(|default| CertSet { by_name, default })
}

fn load_certified(
    cert_pem: &str,
    key_pem: &str,
) -> Result<(CertifiedKey, Vec<String>), MasterError> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(MasterError::NoCertificate);
    }
    let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())?
        .ok_or(MasterError::NoCertificate)?;
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)?;
    let names = certificate_names(&certs[0]);
    Ok((CertifiedKey::new(certs, signing_key), names))
}

/// DNS names a certificate claims: SANs first, common name as fallback.
fn certificate_names(der: &CertificateDer<'_>) -> Vec<String> {
    let mut names = Vec::new();
    if let Ok((_, cert)) = X509Certificate::from_der(der.as_ref()) {
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for general_name in &san.value.general_names {
                if let GeneralName::DNSName(dns) = general_name {
                    names.push(dns.to_string());
                }
            }
        }
        if names.is_empty() {
            for cn in cert.subject().iter_common_name() {
                if let Ok(value) = cn.as_str() {
                    names.push(value.to_string());
                }
            }
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed(names: &[&str]) -> (String, String) {
        let params =
            rcgen::CertificateParams::new(names.iter().map(|n| n.to_string()).collect::<Vec<_>>())
                .unwrap();
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key_pair).unwrap();
        (cert.pem(), key_pair.serialize_pem())
    }

    #[test]
    fn test_empty_pairs_yield_no_config() {
        assert!(build_server_config(&[]).unwrap().is_none());
    }

    #[test]
    fn test_union_and_sni_selection() {
        let a = self_signed(&["svc.a.example"]);
        let b = self_signed(&["svc.b.example", "*.wild.example"]);
        let set = build_cert_set(&[a, b]).unwrap();

        let a_cert = set.lookup("svc.a.example");
        let b_cert = set.lookup("svc.b.example");
        assert!(!Arc::ptr_eq(&a_cert, &b_cert));

        // Wildcard match.
        let wild = set.lookup("deep.wild.example");
        assert!(Arc::ptr_eq(&wild, &b_cert));

        // Unknown names fall back to the first certificate.
        let fallback = set.lookup("unclaimed.example");
        assert!(Arc::ptr_eq(&fallback, &a_cert));

        // The composed config carries the same resolver.
        assert!(build_server_config(&[self_signed(&["x.example"])])
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_bad_pairs_are_skipped() {
        let good = self_signed(&["ok.example"]);
        let pairs = vec![("garbage".to_string(), "garbage".to_string()), good];
        let config = build_server_config(&pairs).unwrap();
        assert!(config.is_some());
    }
}
