//! Process exit codes. Part of the CLI contract.

use snap_core::SnapError;

pub const SUCCESS: i32 = 0;
/// Run finished but work remains: interrupted, or transient failures pending.
pub const INCOMPLETE: i32 = 1;
/// Fatal error that is not a `SnapError`.
pub const INTERNAL_ERROR: i32 = 2;

/// Exit code for a fatal error: the `SnapError` code when one is in the chain.
pub fn from_error(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<SnapError>())
        .map_or(INTERNAL_ERROR, SnapError::exit_code)
}
