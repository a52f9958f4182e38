use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::sync::Arc;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(ErrorKind::InvalidInput, msg.into())
}

fn load_certs(path: &str) -> io::Result<Vec<CertificateDer<'static>>> {
    let certs: Vec<_> =
        rustls_pemfile::certs(&mut BufReader::new(File::open(path)?)).collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(invalid(format!("no certificates in {path}")));
    }
    Ok(certs)
}

fn load_key(path: &str) -> io::Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut BufReader::new(File::open(path)?))?
        .ok_or_else(|| invalid(format!("no private key in {path}")))
}

/// TLS acceptor from a PEM certificate chain and key. Both paths or neither;
/// neither means plaintext only.
pub fn load_tls_acceptor(
    cert_path: Option<&str>,
    key_path: Option<&str>,
) -> io::Result<Option<TlsAcceptor>> {
    let (cert_path, key_path) = match (cert_path, key_path) {
        (None, None) => return Ok(None),
        (Some(c), Some(k)) => (c, k),
        _ => {
            return Err(invalid(
                "both SLOTMATCH_TLS_CERT and SLOTMATCH_TLS_KEY must be set, or neither",
            ));
        }
    };

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(load_certs(cert_path)?, load_key(key_path)?)
        .map_err(|e| invalid(e.to_string()))?;
    config.alpn_protocols = vec![b"postgresql".to_vec()];

    tracing::info!(cert = cert_path, "TLS enabled");
    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

#[cfg(test)]
mod tests {
    use super::*;

    // `TlsAcceptor` has no `Debug`, so `unwrap_err` is unavailable.
    fn acceptor_err(cert: Option<&str>, key: Option<&str>) -> io::Error {
        let Err(err) = load_tls_acceptor(cert, key) else {
            panic!("expected an error for cert={cert:?} key={key:?}");
        };
        err
    }

    #[test]
    fn neither_path_means_plaintext() {
        assert!(load_tls_acceptor(None, None).unwrap().is_none());
    }

    #[test]
    fn one_path_alone_is_rejected() {
        let err = acceptor_err(Some("cert.pem"), None);
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        let err = acceptor_err(None, Some("key.pem"));
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn missing_files_are_io_errors() {
        let err = acceptor_err(
            Some("/nonexistent/slotmatch.crt"),
            Some("/nonexistent/slotmatch.key"),
        );
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn empty_pem_has_no_certificates() {
        let dir = std::env::temp_dir().join("slotmatch_test_tls");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("empty.pem");
        std::fs::write(&path, "").unwrap();
        let err = load_certs(path.to_str().unwrap()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
}
