//! The full update: locate, replace and persist, then restart consumers.
//!
//! Exit codes let callers script around each terminal case.

use serde::Serialize;

use crate::error::UpdateError;
use crate::restart::{self, RestartReport};
use crate::service::ServiceManager;
use crate::store::{CertificateMaterial, ConfigStore};
use crate::updater::{self, UpdatedCertificate};

pub const EXIT_SUCCESS: u8 = 0;
/// Bad arguments, unreadable inputs, or a store/configuration that failed to load.
pub const EXIT_ERROR: u8 = 1;
pub const EXIT_NOT_FOUND: u8 = 3;
pub const EXIT_PERSIST_FAILED: u8 = 4;
pub const EXIT_RESTART_FAILED: u8 = 5;

/// One operator-requested replacement.
#[derive(Debug, Clone)]
pub struct UpdateRequest {
    pub refid: String,
    pub material: CertificateMaterial,
}

/// Result of a run whose update was persisted.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub certificate: UpdatedCertificate,
    pub restarts: RestartReport,
}

impl RunReport {
    pub fn exit_code(&self) -> u8 {
        if self.restarts.is_success() {
            EXIT_SUCCESS
        } else {
            EXIT_RESTART_FAILED
        }
    }
}

impl UpdateError {
    pub fn exit_code(&self) -> u8 {
        match self {
            UpdateError::NotFound { .. } => EXIT_NOT_FOUND,
            UpdateError::Rejected(_) | UpdateError::Persist(_) => EXIT_PERSIST_FAILED,
        }
    }
}

/// Run the whole pipeline. No service is touched unless the update persisted.
pub fn run<S, M>(store: &mut S, services: &M, request: &UpdateRequest) -> Result<RunReport, UpdateError>
where
    S: ConfigStore + ?Sized,
    M: ServiceManager + ?Sized,
{
    let certificate = updater::update(store, &request.refid, &request.material)?;
    let restarts = restart::restart_dependents(services, &certificate.refid);
    Ok(RunReport {
        certificate,
        restarts,
    })
}
