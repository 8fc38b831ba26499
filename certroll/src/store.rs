//! Configuration store — the on-disk document that owns every certificate
//! record and service binding.
//!
//! The document is TOML. Certificate material is kept base64-encoded on disk
//! and decoded into PEM text in memory. Opening a [`FileStore`] takes an
//! exclusive lock that is held until the handle is dropped; [`FileStore::persist`]
//! replaces the whole file atomically.

use chrono::Utc;
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::service::ServiceBinding;

/// One certificate known to the host, keyed by `refid`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub refid: String,
    #[serde(rename = "descr", default)]
    pub description: String,
    #[serde(rename = "crt", default, with = "base64_text")]
    pub certificate: String,
    #[serde(rename = "prv", default, with = "base64_text")]
    pub private_key: String,
    /// Keys this tool does not interpret (`caref`, `type`, ...).
    #[serde(flatten)]
    pub extra: toml::Table,
}

#[cfg(test)]
impl CertificateRecord {
    pub fn new(refid: &str, description: &str, certificate: &str, private_key: &str) -> Self {
        Self {
            refid: refid.to_string(),
            description: description.to_string(),
            certificate: certificate.to_string(),
            private_key: private_key.to_string(),
            extra: toml::Table::new(),
        }
    }
}

/// Replacement certificate chain and private key, both PEM text.
#[derive(Debug, Clone, PartialEq)]
pub struct CertificateMaterial {
    pub certificate: String,
    pub private_key: String,
}

/// Last change written to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    pub time: i64,
    pub description: String,
}

/// The whole configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<Revision>,
    #[serde(rename = "cert", default, skip_serializing_if = "Vec::is_empty")]
    pub certificates: Vec<CertificateRecord>,
    #[serde(rename = "service", default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ServiceBinding>,
    /// Sections owned by other subsystems, carried through rewrites untouched.
    #[serde(flatten)]
    pub other: toml::Table,
}

/// The store operations the update pipeline consumes.
pub trait ConfigStore {
    /// Live, mutable view of every certificate record in store order.
    fn certificates_mut(&mut self) -> &mut [CertificateRecord];

    /// The store's import routine: overwrite the certificate and key of the
    /// record at `index` with `material`.
    ///
    /// What counts as acceptable material is up to the store. A rejected
    /// import leaves the record untouched.
    fn import_certificate(
        &mut self,
        index: usize,
        material: &CertificateMaterial,
    ) -> Result<(), StoreError>;

    /// Durably write the entire configuration, annotated with `note`.
    fn persist(&mut self, note: &str) -> Result<(), StoreError>;
}

/// Check that `material` holds at least one PEM certificate and a PEM private
/// key. Returns the number of certificates in the chain.
fn check_pem_material(material: &CertificateMaterial) -> Result<usize, StoreError> {
    let chain = rustls_pemfile::certs(&mut material.certificate.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| StoreError::InvalidCertificate(format!("malformed PEM ({e})")))?;
    if chain.is_empty() {
        return Err(StoreError::InvalidCertificate(
            "no PEM certificate found".to_string(),
        ));
    }

    let key = rustls_pemfile::private_key(&mut material.private_key.as_bytes())
        .map_err(|e| StoreError::InvalidKey(format!("malformed PEM ({e})")))?;
    if key.is_none() {
        return Err(StoreError::InvalidKey(
            "no PEM private key found".to_string(),
        ));
    }

    Ok(chain.len())
}

/// Where and how many previous revisions to keep.
#[derive(Debug, Clone)]
pub struct BackupPolicy {
    pub dir: PathBuf,
    pub keep: usize,
}

/// A locked, loaded configuration document backed by a TOML file.
pub struct FileStore {
    path: PathBuf,
    document: ConfigDocument,
    backups: BackupPolicy,
    _lock: Flock<File>,
}

impl FileStore {
    /// Lock and load the store at `path`.
    pub fn open(path: &Path, backups: BackupPolicy) -> Result<Self, StoreError> {
        let lock = acquire_lock(path)?;

        let content = fs::read_to_string(path).map_err(|e| StoreError::io(path.display(), e))?;
        let document: ConfigDocument =
            toml::from_str(&content).map_err(|e| StoreError::Parse {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        info!(
            "Loaded configuration store {}: {} certificates, {} service bindings",
            path.display(),
            document.certificates.len(),
            document.services.len()
        );

        Ok(Self {
            path: path.to_path_buf(),
            document,
            backups,
            _lock: lock,
        })
    }

    pub fn document(&self) -> &ConfigDocument {
        &self.document
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy the current file into the backup directory and prune old copies.
    fn backup_current(&self) -> Result<(), StoreError> {
        if self.backups.keep == 0 || !self.path.exists() {
            return Ok(());
        }

        let dir = &self.backups.dir;
        fs::create_dir_all(dir).map_err(|e| StoreError::io(dir.display(), e))?;

        let target = dir.join(format!("config-{}.toml", Utc::now().timestamp_micros()));
        fs::copy(&self.path, &target).map_err(|e| StoreError::io(target.display(), e))?;
        debug!("Backed up {} to {}", self.path.display(), target.display());

        let mut existing: Vec<PathBuf> = fs::read_dir(dir)
            .map_err(|e| StoreError::io(dir.display(), e))?
            .flatten()
            .map(|entry| entry.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("config-") && n.ends_with(".toml"))
                    .unwrap_or(false)
            })
            .collect();
        existing.sort();

        let excess = existing.len().saturating_sub(self.backups.keep);
        for old in &existing[..excess] {
            if let Err(e) = fs::remove_file(old) {
                warn!("Failed to prune backup {}: {e}", old.display());
            }
        }

        Ok(())
    }
}

impl ConfigStore for FileStore {
    fn certificates_mut(&mut self) -> &mut [CertificateRecord] {
        &mut self.document.certificates
    }

    fn import_certificate(
        &mut self,
        index: usize,
        material: &CertificateMaterial,
    ) -> Result<(), StoreError> {
        let record = self
            .document
            .certificates
            .get_mut(index)
            .ok_or(StoreError::NoRecord(index))?;
        let chain = check_pem_material(material)?;

        debug!(
            "Importing {chain} certificate(s) and private key into {}",
            record.refid
        );
        record.certificate = material.certificate.clone();
        record.private_key = material.private_key.clone();
        Ok(())
    }

    fn persist(&mut self, note: &str) -> Result<(), StoreError> {
        self.document.revision = Some(Revision {
            time: Utc::now().timestamp(),
            description: note.to_string(),
        });

        let body = toml::to_string_pretty(&self.document)
            .map_err(|e| StoreError::Serialize(e.to_string()))?;

        self.backup_current()?;

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut staged = NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir.display(), e))?;
        let staged_path = staged.path().display().to_string();

        if let Ok(meta) = fs::metadata(&self.path) {
            staged
                .as_file()
                .set_permissions(meta.permissions())
                .map_err(|e| StoreError::io(&staged_path, e))?;
        }
        staged
            .write_all(body.as_bytes())
            .map_err(|e| StoreError::io(&staged_path, e))?;
        staged
            .as_file()
            .sync_all()
            .map_err(|e| StoreError::io(&staged_path, e))?;
        staged
            .persist(&self.path)
            .map_err(|e| StoreError::io(self.path.display(), e.error))?;

        info!("Configuration store {} written ({note})", self.path.display());
        Ok(())
    }
}

fn acquire_lock(path: &Path) -> Result<Flock<File>, StoreError> {
    let mut lock_name = path.as_os_str().to_owned();
    lock_name.push(".lock");
    let lock_path = PathBuf::from(lock_name);

    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)
        .map_err(|e| StoreError::io(lock_path.display(), e))?;

    debug!("Waiting for lock on {}", lock_path.display());
    Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| StoreError::Lock {
        path: lock_path.display().to_string(),
        reason: errno.to_string(),
    })
}

/// Serde adapter storing UTF-8 text as base64.
mod base64_text {
    use base64::prelude::*;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &str, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = BASE64_STANDARD
            .decode(encoded.trim())
            .map_err(|e| de::Error::custom(format!("invalid base64 ({e})")))?;
        String::from_utf8(bytes).map_err(|e| de::Error::custom(format!("not UTF-8 text ({e})")))
    }
}
