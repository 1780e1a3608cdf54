//! Classify an incoming change against local manifest state

use crate::types::ChangeRecord;

/// What to do with an incoming remote change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Local state is an ancestor of the change; apply it
    FastForward,
    /// Local state already equals the change's result
    AlreadyApplied,
    /// Both sides advanced independently from a common ancestor
    Diverged,
}

/// Compare an incoming change with the local version and checksum of the
/// same entity
pub fn classify(
    change: &ChangeRecord,
    local_version: u64,
    local_checksum: Option<&str>,
) -> Disposition {
    let Some(local_checksum) = local_checksum else {
        // Never seen locally
        return Disposition::FastForward;
    };

    if local_checksum == change.new_checksum {
        return Disposition::AlreadyApplied;
    }

    // Built on exactly our version, or on content we hold under another number
    if change.parent_version == local_version
        || change.previous_checksum.as_deref() == Some(local_checksum)
    {
        return Disposition::FastForward;
    }

    // The change descends from versions we never received; local has not
    // moved past the remote chain
    if change.parent_version > local_version {
        return Disposition::FastForward;
    }

    Disposition::Diverged
}
