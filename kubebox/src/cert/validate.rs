//! Certificate inspection and TLS reachability checks.

use std::fs::File;
use std::io::BufReader;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kubebox_shared::errors::{KubeboxError, KubeboxResult};
use rcgen::{KeyPair, PublicKeyData};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, RootCertStore};
use x509_parser::pem::parse_x509_pem;

use crate::machine::AuthOptions;

/// Dial timeout for [`validate_certificate`].
pub const TLS_DIAL_TIMEOUT: Duration = Duration::from_secs(20);

fn read_pem(path: &Path) -> KubeboxResult<Vec<u8>> {
    std::fs::read(path).map_err(|e| {
        KubeboxError::Certificate(format!("failed to read {}: {}", path.display(), e))
    })
}

/// Run `f` against the leaf certificate in `path`.
fn with_certificate<T>(
    path: &Path,
    f: impl FnOnce(&x509_parser::certificate::X509Certificate<'_>) -> T,
) -> KubeboxResult<T> {
    let bytes = read_pem(path)?;
    let (_, pem) = parse_x509_pem(&bytes).map_err(|e| {
        KubeboxError::Certificate(format!("failed to decode PEM {}: {}", path.display(), e))
    })?;
    let cert = pem.parse_x509().map_err(|e| {
        KubeboxError::Certificate(format!("failed to parse {}: {}", path.display(), e))
    })?;
    Ok(f(&cert))
}

/// Unix timestamp of the certificate's `not_after`.
pub fn not_after(path: &Path) -> KubeboxResult<i64> {
    with_certificate(path, |cert| cert.validity().not_after.timestamp())
}

/// Whether the certificate in `path` has not yet expired.
pub fn check_certificate_date(path: &Path) -> KubeboxResult<bool> {
    let expires = not_after(path)?;
    let fresh = Utc::now().timestamp() < expires;
    if !fresh {
        tracing::info!(cert = %path.display(), expires, "Certificate has expired");
    }
    Ok(fresh)
}

/// Whether `cert_path` carries a valid signature from the CA in `ca_path`.
pub fn is_signed_by(cert_path: &Path, ca_path: &Path) -> KubeboxResult<bool> {
    let ca_bytes = read_pem(ca_path)?;
    let (_, ca_pem) = parse_x509_pem(&ca_bytes).map_err(|e| {
        KubeboxError::Certificate(format!("failed to decode PEM {}: {}", ca_path.display(), e))
    })?;
    let ca = ca_pem.parse_x509().map_err(|e| {
        KubeboxError::Certificate(format!("failed to parse {}: {}", ca_path.display(), e))
    })?;

    with_certificate(cert_path, |cert| {
        cert.issuer().as_raw() == ca.subject().as_raw() && cert.verify_signature(Some(ca.public_key())).is_ok()
    })
}

/// Whether the private key in `key_path` belongs to the certificate.
pub fn key_matches_certificate(cert_path: &Path, key_path: &Path) -> KubeboxResult<bool> {
    let key_pem = String::from_utf8(read_pem(key_path)?).map_err(|e| {
        KubeboxError::Certificate(format!("{} is not PEM: {}", key_path.display(), e))
    })?;
    let Ok(key) = KeyPair::from_pem(&key_pem) else {
        return Ok(false);
    };
    with_certificate(cert_path, |cert| {
        cert.public_key().subject_public_key.data.as_ref() == key.der_bytes()
    })
}

fn load_certs(path: &Path) -> KubeboxResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        KubeboxError::Certificate(format!("failed to open {}: {}", path.display(), e))
    })?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| KubeboxError::Certificate(format!("failed to read {}: {}", path.display(), e)))
}

fn load_private_key(path: &Path) -> KubeboxResult<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| {
        KubeboxError::Certificate(format!("failed to open {}: {}", path.display(), e))
    })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| KubeboxError::Certificate(format!("failed to read {}: {}", path.display(), e)))?
        .ok_or_else(|| {
            KubeboxError::Certificate(format!("no private key found in {}", path.display()))
        })
}

/// Client TLS configuration trusting only the kubebox CA and presenting the
/// client certificate.
pub fn read_tls_config(auth: &AuthOptions) -> KubeboxResult<ClientConfig> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(&auth.ca_cert_path)? {
        roots
            .add(cert)
            .map_err(|e| KubeboxError::Certificate(format!("invalid CA certificate: {}", e)))?;
    }
    let chain = load_certs(&auth.client_cert_path)?;
    let key = load_private_key(&auth.client_key_path)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| KubeboxError::Certificate(format!("unsupported TLS versions: {}", e)))?
        .with_root_certificates(roots)
        .with_client_auth_cert(chain, key)
        .map_err(|e| KubeboxError::Certificate(format!("invalid client certificate: {}", e)))
}

/// Split `tcp://host:port` (or `host:port`) into the TLS server name and a
/// socket address.
fn resolve(addr: &str) -> KubeboxResult<(String, SocketAddr)> {
    let hostport = addr
        .strip_prefix("tcp://")
        .or_else(|| addr.strip_prefix("https://"))
        .unwrap_or(addr)
        .trim_end_matches('/');
    let (host, _) = hostport.rsplit_once(':').ok_or_else(|| {
        KubeboxError::Config(format!("address {:?} has no port", addr))
    })?;
    let host = host.trim_start_matches('[').trim_end_matches(']').to_string();

    let socket = hostport
        .to_socket_addrs()
        .map_err(|e| KubeboxError::Certificate(format!("failed to resolve {}: {}", addr, e)))?
        .next()
        .ok_or_else(|| KubeboxError::Certificate(format!("no address for {}", addr)))?;
    Ok((host, socket))
}

/// Complete a TLS handshake with `addr` using the client key pair in `auth`.
///
/// # Returns
/// * `Ok(true)` - The server presented a certificate signed by our CA
/// * `Ok(false)` - The handshake failed or the server certificate was rejected
/// * `Err(...)` - Local TLS material is unusable or the endpoint can't be dialed
pub fn validate_certificate(addr: &str, auth: &AuthOptions) -> KubeboxResult<bool> {
    let config = Arc::new(read_tls_config(auth)?);
    let (host, socket) = resolve(addr)?;
    let server_name = ServerName::try_from(host.clone())
        .map_err(|e| KubeboxError::Certificate(format!("invalid server name {:?}: {}", host, e)))?;

    let mut conn = ClientConnection::new(config, server_name)
        .map_err(|e| KubeboxError::Certificate(format!("TLS setup failed: {}", e)))?;
    let mut stream = TcpStream::connect_timeout(&socket, TLS_DIAL_TIMEOUT)
        .map_err(|e| KubeboxError::Certificate(format!("failed to dial {}: {}", addr, e)))?;
    stream.set_read_timeout(Some(TLS_DIAL_TIMEOUT))?;
    stream.set_write_timeout(Some(TLS_DIAL_TIMEOUT))?;

    while conn.is_handshaking() {
        if let Err(e) = conn.complete_io(&mut stream) {
            tracing::debug!(addr, error = %e, "TLS handshake failed");
            return Ok(false);
        }
    }
    tracing::debug!(addr, "TLS handshake succeeded");
    Ok(true)
}
