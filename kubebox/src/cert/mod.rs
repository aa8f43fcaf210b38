//! PKI for talking to the container runtime inside machines.
//!
//! One self-signed CA and one client certificate are shared by every machine
//! under a kubebox home; each machine additionally gets a server certificate
//! signed by the same CA.

mod bootstrap;
mod validate;

use std::path::{Path, PathBuf};
use std::time::Duration;

use kubebox_shared::errors::{KubeboxError, KubeboxResult};
use rand::TryRngCore;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, PKCS_RSA_SHA256, SerialNumber,
};
use rsa::RsaPrivateKey;
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use time::OffsetDateTime;

use crate::machine::AuthOptions;
use crate::util::fs::write_atomic;

pub use bootstrap::{BootstrapReport, bootstrap_certificates};
pub use validate::{
    check_certificate_date, is_signed_by, key_matches_certificate, not_after, read_tls_config,
    validate_certificate,
};

/// Default lifetime of generated certificates.
pub const DEFAULT_VALIDITY: Duration = Duration::from_secs(1080 * 24 * 60 * 60);

/// How far in the past `not_before` is placed to tolerate host/guest clock skew.
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(5 * 60);

pub const DEFAULT_KEY_BITS: usize = 2048;

const CERT_FILE_MODE: u32 = 0o644;
const KEY_FILE_MODE: u32 = 0o600;

/// Knobs for every certificate this module issues.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertSettings {
    /// Subject organization, normally the local user name
    pub organization: String,
    pub key_bits: usize,
    pub validity: Duration,
    pub clock_skew: Duration,
}

impl Default for CertSettings {
    fn default() -> Self {
        Self {
            organization: crate::util::current_username(),
            key_bits: DEFAULT_KEY_BITS,
            validity: DEFAULT_VALIDITY,
            clock_skew: DEFAULT_CLOCK_SKEW,
        }
    }
}

/// Inputs for issuing a CA-signed certificate.
#[derive(Clone, Debug)]
pub struct CertOptions {
    /// SANs; a single empty entry (or no entries) means a client certificate
    pub hosts: Vec<String>,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub ca_file: PathBuf,
    pub ca_key_file: PathBuf,
}

impl CertOptions {
    fn is_client(&self) -> bool {
        self.hosts.iter().all(|h| h.is_empty())
    }
}

/// Write a new self-signed CA certificate and key.
pub fn generate_ca_certificate(
    cert_file: &Path,
    key_file: &Path,
    settings: &CertSettings,
) -> KubeboxResult<()> {
    let mut params = certificate_template(Vec::new(), settings)?;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages.push(KeyUsagePurpose::KeyCertSign);

    let key_pair = generate_key_pair(settings.key_bits)?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| KubeboxError::Certificate(format!("failed to self-sign CA: {}", e)))?;

    write_pair(&cert, &key_pair, cert_file, key_file)?;
    tracing::info!(cert = %cert_file.display(), "Generated CA certificate");
    Ok(())
}

/// Write a certificate and key signed by the CA in `opts`.
///
/// With no host names the result is a client-auth certificate; otherwise a
/// server-auth certificate carrying the hosts as IP or DNS SANs.
pub fn generate_certificate(opts: &CertOptions, settings: &CertSettings) -> KubeboxResult<()> {
    let (ca_cert, ca_key) = load_ca(&opts.ca_file, &opts.ca_key_file)?;

    let mut params = if opts.is_client() {
        let mut params = certificate_template(Vec::new(), settings)?;
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params
    } else {
        let hosts: Vec<String> = opts.hosts.iter().filter(|h| !h.is_empty()).cloned().collect();
        let mut params = certificate_template(hosts, settings)?;
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params
    };
    params.use_authority_key_identifier_extension = true;

    let key_pair = generate_key_pair(settings.key_bits)?;
    let cert = params
        .signed_by(&key_pair, &ca_cert, &ca_key)
        .map_err(|e| KubeboxError::Certificate(format!("failed to sign certificate: {}", e)))?;

    write_pair(&cert, &key_pair, &opts.cert_file, &opts.key_file)?;
    tracing::debug!(
        cert = %opts.cert_file.display(),
        client = opts.is_client(),
        "Generated CA-signed certificate"
    );
    Ok(())
}

/// Issue the machine's server certificate for `hosts` plus the configured SANs.
pub fn generate_server_certificate(
    auth: &AuthOptions,
    hosts: &[String],
    settings: &CertSettings,
) -> KubeboxResult<()> {
    let mut all_hosts: Vec<String> = Vec::new();
    for host in hosts.iter().chain(auth.server_cert_sans.iter()) {
        if !host.is_empty() && !all_hosts.contains(host) {
            all_hosts.push(host.clone());
        }
    }
    if all_hosts.is_empty() {
        return Err(KubeboxError::Certificate(
            "server certificate needs at least one host".to_string(),
        ));
    }

    generate_certificate(
        &CertOptions {
            hosts: all_hosts,
            cert_file: auth.server_cert_path.clone(),
            key_file: auth.server_key_path.clone(),
            ca_file: auth.ca_cert_path.clone(),
            ca_key_file: auth.ca_private_key_path.clone(),
        },
        settings,
    )
}

fn certificate_template(
    hosts: Vec<String>,
    settings: &CertSettings,
) -> KubeboxResult<CertificateParams> {
    let mut params = CertificateParams::new(hosts)
        .map_err(|e| KubeboxError::Certificate(format!("invalid subject alt name: {}", e)))?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, settings.organization.as_str());
    params.distinguished_name = dn;

    let not_before = OffsetDateTime::now_utc() - settings.clock_skew;
    params.not_before = not_before;
    params.not_after = not_before + settings.validity;
    params.serial_number = Some(random_serial()?);
    params.key_usages = vec![
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyAgreement,
    ];
    Ok(params)
}

/// 128-bit positive serial from the OS RNG.
fn random_serial() -> KubeboxResult<SerialNumber> {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| KubeboxError::Certificate(format!("failed to generate serial number: {}", e)))?;
    bytes[0] &= 0x7f;
    Ok(SerialNumber::from_slice(&bytes))
}

fn generate_key_pair(bits: usize) -> KubeboxResult<KeyPair> {
    let private_key = RsaPrivateKey::new(&mut rand_core::OsRng, bits)
        .map_err(|e| KubeboxError::Certificate(format!("failed to generate RSA key: {}", e)))?;
    let pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| KubeboxError::Certificate(format!("failed to encode RSA key: {}", e)))?;
    KeyPair::from_pem_and_sign_algo(&pem, &PKCS_RSA_SHA256)
        .map_err(|e| KubeboxError::Certificate(format!("failed to load RSA key: {}", e)))
}

fn load_ca(cert_file: &Path, key_file: &Path) -> KubeboxResult<(Certificate, KeyPair)> {
    let read = |path: &Path| {
        std::fs::read_to_string(path).map_err(|e| {
            KubeboxError::Certificate(format!("failed to read {}: {}", path.display(), e))
        })
    };
    let cert_pem = read(cert_file)?;
    let key_pem = read(key_file)?;

    let key = KeyPair::from_pem_and_sign_algo(&key_pem, &PKCS_RSA_SHA256)
        .map_err(|e| KubeboxError::Certificate(format!("failed to load CA key pair: {}", e)))?;
    let params = CertificateParams::from_ca_cert_pem(&cert_pem)
        .map_err(|e| KubeboxError::Certificate(format!("failed to parse CA certificate: {}", e)))?;
    let cert = params
        .self_signed(&key)
        .map_err(|e| KubeboxError::Certificate(format!("failed to load CA certificate: {}", e)))?;
    Ok((cert, key))
}

fn write_pair(
    cert: &Certificate,
    key_pair: &KeyPair,
    cert_file: &Path,
    key_file: &Path,
) -> KubeboxResult<()> {
    write_atomic(cert_file, cert.pem().as_bytes(), CERT_FILE_MODE)?;
    write_atomic(key_file, key_pair.serialize_pem().as_bytes(), KEY_FILE_MODE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use x509_parser::prelude::*;

    fn settings() -> CertSettings {
        CertSettings {
            organization: "tester".to_string(),
            ..Default::default()
        }
    }

    fn parse(path: &Path, f: impl FnOnce(&X509Certificate<'_>)) {
        let bytes = std::fs::read(path).unwrap();
        let (_, pem) = parse_x509_pem(&bytes).unwrap();
        let cert = pem.parse_x509().unwrap();
        f(&cert);
    }

    fn make_ca(dir: &Path) -> (PathBuf, PathBuf) {
        let ca = dir.join("ca.pem");
        let ca_key = dir.join("ca-key.pem");
        generate_ca_certificate(&ca, &ca_key, &settings()).unwrap();
        (ca, ca_key)
    }

    #[test]
    fn test_ca_properties() {
        let dir = TempDir::new().unwrap();
        let (ca, _) = make_ca(dir.path());

        parse(&ca, |cert| {
            assert!(cert.is_ca());
            let org: Vec<_> = cert.subject().iter_organization().collect();
            assert_eq!(org[0].as_str().unwrap(), "tester");

            let usage = cert.key_usage().unwrap().unwrap().value;
            assert!(usage.key_cert_sign());
            assert!(usage.digital_signature());
            assert!(usage.key_encipherment());
            assert!(usage.key_agreement());

            let now = OffsetDateTime::now_utc().unix_timestamp();
            let not_before = cert.validity().not_before.timestamp();
            let not_after = cert.validity().not_after.timestamp();
            assert!(not_before <= now - 4 * 60);
            assert!(not_after - not_before >= 1080 * 24 * 60 * 60 - 1);
        });
        assert!(check_certificate_date(&ca).unwrap());
    }

    #[test]
    fn test_client_certificate() {
        let dir = TempDir::new().unwrap();
        let (ca, ca_key) = make_ca(dir.path());
        let opts = CertOptions {
            hosts: vec![String::new()],
            cert_file: dir.path().join("cert.pem"),
            key_file: dir.path().join("key.pem"),
            ca_file: ca.clone(),
            ca_key_file: ca_key,
        };
        generate_certificate(&opts, &settings()).unwrap();

        parse(&opts.cert_file, |cert| {
            assert!(!cert.is_ca());
            let eku = cert.extended_key_usage().unwrap().unwrap().value;
            assert!(eku.client_auth);
            assert!(!eku.server_auth);
            assert!(cert.subject_alternative_name().unwrap().is_none());
        });
        assert!(is_signed_by(&opts.cert_file, &ca).unwrap());
        assert!(key_matches_certificate(&opts.cert_file, &opts.key_file).unwrap());
    }

    #[test]
    fn test_server_certificate_sans() {
        let dir = TempDir::new().unwrap();
        let (ca, ca_key) = make_ca(dir.path());
        let mut auth = AuthOptions::default();
        auth.ca_cert_path = ca.clone();
        auth.ca_private_key_path = ca_key;
        auth.server_cert_path = dir.path().join("server.pem");
        auth.server_key_path = dir.path().join("server-key.pem");
        auth.server_cert_sans = vec!["kube.local".to_string(), "127.0.0.1".to_string()];

        generate_server_certificate(
            &auth,
            &["192.168.49.2".to_string(), "127.0.0.1".to_string()],
            &settings(),
        )
        .unwrap();

        parse(&auth.server_cert_path, |cert| {
            let eku = cert.extended_key_usage().unwrap().unwrap().value;
            assert!(eku.server_auth);
            let san = cert.subject_alternative_name().unwrap().unwrap().value;
            let mut dns = Vec::new();
            let mut ips = Vec::new();
            for name in &san.general_names {
                match name {
                    GeneralName::DNSName(d) => dns.push(d.to_string()),
                    GeneralName::IPAddress(b) => ips.push(b.to_vec()),
                    _ => {}
                }
            }
            assert_eq!(dns, vec!["kube.local".to_string()]);
            assert_eq!(ips.len(), 2);
            assert!(ips.contains(&vec![192, 168, 49, 2]));
            assert!(ips.contains(&vec![127, 0, 0, 1]));
        });
        assert!(is_signed_by(&auth.server_cert_path, &ca).unwrap());
    }

    #[test]
    fn test_server_certificate_needs_hosts() {
        let auth = AuthOptions::default();
        assert!(generate_server_certificate(&auth, &[], &settings()).is_err());
    }

    #[test]
    fn test_signing_requires_ca() {
        let dir = TempDir::new().unwrap();
        let opts = CertOptions {
            hosts: vec![],
            cert_file: dir.path().join("cert.pem"),
            key_file: dir.path().join("key.pem"),
            ca_file: dir.path().join("missing.pem"),
            ca_key_file: dir.path().join("missing-key.pem"),
        };
        let err = generate_certificate(&opts, &settings()).unwrap_err();
        assert!(matches!(err, KubeboxError::Certificate(_)));
        assert!(!opts.cert_file.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_key_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let (_, ca_key) = make_ca(dir.path());
        let mode = std::fs::metadata(ca_key).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
