//! Ownership filtering at the ingestion boundary.
//!
//! Sensors may omit an explicit owner tag on the wire, so ownership is
//! reconstructed from the `{owner}_{kind}_{n}` naming convention before the
//! explicit check runs. Rejections are routine filtering, not faults.

use tracing::debug;

use cropwatch_core::Reading;

/// Accept or reject a reading for the current user, stamping an inferred
/// owner when the naming convention confirms it.
pub fn apply_ownership(reading: &mut Reading, current_user: Option<i64>) -> bool {
    if reading.owner_id.is_none()
        && let Some(user) = current_user
        && reading.inferred_owner() == Some(user)
    {
        reading.owner_id = Some(user);
    }

    match (reading.owner_id, current_user) {
        (Some(owner), Some(user)) if owner != user => {
            debug!(
                "dropping reading from sensor {} owned by {}",
                reading.sensor_id, owner
            );
            false
        }
        _ => true,
    }
}
