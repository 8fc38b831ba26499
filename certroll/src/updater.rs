//! Replace a record's material in place and persist the store.

use serde::Serialize;
use tracing::info;

use crate::error::UpdateError;
use crate::locator;
use crate::store::{CertificateMaterial, ConfigStore};

/// Identity of the record an update touched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdatedCertificate {
    pub refid: String,
    pub description: String,
}

impl UpdatedCertificate {
    /// Annotation recorded with the persisted revision.
    pub fn change_note(&self) -> String {
        format!(
            "Updated certificate \"{}\" ({})",
            self.description, self.refid
        )
    }
}

/// Find `refid`, import `material` into it, and persist the whole store.
///
/// Nothing is persisted when the record is missing or the import is rejected.
pub fn update<S: ConfigStore + ?Sized>(
    store: &mut S,
    refid: &str,
    material: &CertificateMaterial,
) -> Result<UpdatedCertificate, UpdateError> {
    let (index, updated) = {
        let (index, record) = locator::find(store.certificates_mut(), refid)?;
        info!(
            "Updating certificate \"{}\" ({})",
            record.description, record.refid
        );
        let updated = UpdatedCertificate {
            refid: record.refid.clone(),
            description: record.description.clone(),
        };
        (index, updated)
    };

    store
        .import_certificate(index, material)
        .map_err(UpdateError::Rejected)?;

    store
        .persist(&updated.change_note())
        .map_err(UpdateError::Persist)?;

    info!(
        "Certificate \"{}\" ({}) updated and saved",
        updated.description, updated.refid
    );
    Ok(updated)
}
