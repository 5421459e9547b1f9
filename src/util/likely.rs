//! Branch hints for the ring and completion hot paths.

#[cold]
#[inline(never)]
fn cold_path() {}

/// The branch is expected to be taken.
#[inline(always)]
pub(crate) fn likely(b: bool) -> bool {
    if !b {
        cold_path();
    }
    b
}

/// The branch is expected not to be taken.
#[inline(always)]
pub(crate) fn unlikely(b: bool) -> bool {
    if b {
        cold_path();
    }
    b
}
