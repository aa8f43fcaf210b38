//! Idempotent creation and renewal of the shared CA and client certificate.
//!
//! Callers serialize this across processes with the certificate lock; the
//! functions here do no locking of their own.

use std::path::Path;

use kubebox_shared::errors::KubeboxResult;

use super::validate::{check_certificate_date, is_signed_by, key_matches_certificate};
use super::{CertOptions, CertSettings, generate_ca_certificate, generate_certificate};
use crate::machine::AuthOptions;
use crate::util::fs::{ensure_dir, remove_if_exists};

const CERT_DIR_MODE: u32 = 0o700;

/// What a bootstrap run had to (re)create.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    pub ca_created: bool,
    pub client_created: bool,
}

impl BootstrapReport {
    /// True when nothing was written.
    pub fn is_noop(&self) -> bool {
        !self.ca_created && !self.client_created
    }
}

/// Make sure a fresh CA and a fresh CA-signed client pair exist.
///
/// Writes nothing when both are already present, unexpired and consistent.
pub fn bootstrap_certificates(
    auth: &AuthOptions,
    settings: &CertSettings,
) -> KubeboxResult<BootstrapReport> {
    ensure_dir(&auth.cert_dir, CERT_DIR_MODE)?;

    let ca_created = ensure_ca(auth, settings)?;
    let client_created = ensure_client(auth, settings, ca_created)?;

    let report = BootstrapReport {
        ca_created,
        client_created,
    };
    tracing::debug!(cert_dir = %auth.cert_dir.display(), ?report, "Certificate bootstrap finished");
    Ok(report)
}

fn ensure_ca(auth: &AuthOptions, settings: &CertSettings) -> KubeboxResult<bool> {
    let Some(reason) = stale_reason(&auth.ca_cert_path, &auth.ca_private_key_path, None)? else {
        return Ok(false);
    };

    tracing::info!(reason, cert = %auth.ca_cert_path.display(), "Creating CA");
    remove_if_exists(&auth.ca_private_key_path)?;
    generate_ca_certificate(&auth.ca_cert_path, &auth.ca_private_key_path, settings)?;
    Ok(true)
}

fn ensure_client(auth: &AuthOptions, settings: &CertSettings, ca_changed: bool) -> KubeboxResult<bool> {
    let reason = if ca_changed {
        Some("CA was regenerated")
    } else {
        stale_reason(
            &auth.client_cert_path,
            &auth.client_key_path,
            Some(&auth.ca_cert_path),
        )?
    };
    let Some(reason) = reason else {
        return Ok(false);
    };

    tracing::info!(reason, cert = %auth.client_cert_path.display(), "Creating client certificate");
    remove_if_exists(&auth.client_key_path)?;
    generate_certificate(
        &CertOptions {
            hosts: vec![String::new()],
            cert_file: auth.client_cert_path.clone(),
            key_file: auth.client_key_path.clone(),
            ca_file: auth.ca_cert_path.clone(),
            ca_key_file: auth.ca_private_key_path.clone(),
        },
        settings,
    )?;
    Ok(true)
}

/// Why the pair at `cert`/`key` must be recreated, or `None` if it is usable.
///
/// Unreadable or unparsable material counts as stale rather than an error.
fn stale_reason(
    cert: &Path,
    key: &Path,
    issuer: Option<&Path>,
) -> KubeboxResult<Option<&'static str>> {
    if !cert.exists() {
        return Ok(Some("certificate missing"));
    }
    if !key.exists() {
        return Ok(Some("private key missing"));
    }
    match check_certificate_date(cert) {
        Ok(true) => {}
        Ok(false) => return Ok(Some("certificate expired")),
        Err(e) => {
            tracing::warn!(cert = %cert.display(), error = %e, "Unreadable certificate");
            return Ok(Some("certificate unreadable"));
        }
    }
    if !key_matches_certificate(cert, key).unwrap_or(false) {
        return Ok(Some("private key does not match certificate"));
    }
    if let Some(ca) = issuer
        && !is_signed_by(cert, ca).unwrap_or(false)
    {
        return Ok(Some("certificate not signed by current CA"));
    }
    Ok(None)
}
