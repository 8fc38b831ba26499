//! Locate a certificate record by refid.

use tracing::warn;

use crate::error::UpdateError;
use crate::store::CertificateRecord;

/// Return the first record whose refid equals `refid`, borrowed mutably so the
/// caller's changes land in the store itself, along with its index in store
/// order.
///
/// Uniqueness is not assumed. When several records share the refid the first
/// in store order wins and the duplicates are logged.
pub fn find<'a>(
    records: &'a mut [CertificateRecord],
    refid: &str,
) -> Result<(usize, &'a mut CertificateRecord), UpdateError> {
    let matches = records.iter().filter(|r| r.refid == refid).count();
    if matches > 1 {
        warn!("{matches} certificates share refid {refid}, using the first");
    }

    records
        .iter_mut()
        .enumerate()
        .find(|(_, r)| r.refid == refid)
        .ok_or_else(|| UpdateError::NotFound {
            refid: refid.to_string(),
        })
}
