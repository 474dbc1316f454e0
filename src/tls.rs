use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::Path;
use std::sync::Arc;

use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::TlsAcceptor;

use crate::config::Config;

/// TLS acceptor for the configured certificate pair, or `None` when TLS is off.
/// Setting only one of the two paths is an error.
pub fn load_tls_acceptor(config: &Config) -> io::Result<Option<TlsAcceptor>> {
    match (config.tls_cert.as_deref(), config.tls_key.as_deref()) {
        (None, None) => Ok(None),
        (Some(cert), Some(key)) => acceptor_from_pem(Path::new(cert), Path::new(key)).map(Some),
        _ => Err(io::Error::new(
            ErrorKind::InvalidInput,
            "SLOTBOOK_TLS_CERT and SLOTBOOK_TLS_KEY must be set together",
        )),
    }
}

fn acceptor_from_pem(cert_path: &Path, key_path: &Path) -> io::Result<TlsAcceptor> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("no certificates in {}", cert_path.display()),
        ));
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| {
            io::Error::new(
                ErrorKind::InvalidInput,
                format!("no private key in {}", key_path.display()),
            )
        })?;

    let mut server = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
    server.alpn_protocols = vec![b"postgresql".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(server)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(cert: Option<&str>, key: Option<&str>) -> Config {
        let mut config = Config::from_lookup(|_| None);
        config.tls_cert = cert.map(str::to_string);
        config.tls_key = key.map(str::to_string);
        config
    }

    #[test]
    fn tls_off_without_paths() {
        assert!(load_tls_acceptor(&config(None, None)).unwrap().is_none());
    }

    #[test]
    fn half_configured_pair_is_rejected() {
        let err = load_tls_acceptor(&config(Some("cert.pem"), None)).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        let err = load_tls_acceptor(&config(None, Some("key.pem"))).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn missing_files_surface_io_errors() {
        let dir = std::env::temp_dir().join("slotbook_test_tls");
        let cert = dir.join("absent-cert.pem");
        let key = dir.join("absent-key.pem");
        let err = load_tls_acceptor(&config(cert.to_str(), key.to_str())).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn empty_certificate_file_is_rejected() {
        let dir = std::env::temp_dir().join("slotbook_test_tls");
        std::fs::create_dir_all(&dir).unwrap();
        let cert = dir.join("empty-cert.pem");
        let key = dir.join("empty-key.pem");
        std::fs::write(&cert, "").unwrap();
        std::fs::write(&key, "").unwrap();
        let err = load_tls_acceptor(&config(cert.to_str(), key.to_str())).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
}
