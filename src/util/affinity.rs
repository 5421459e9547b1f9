use std::{io, mem};

/// Pin the calling thread to `core`.
pub(crate) fn pin_to_core(core: usize) -> io::Result<()> {
    // SAFETY: FFI on a zero-initialized, locally owned cpu set.
    unsafe {
        let mut set: libc::cpu_set_t = mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        if libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &set) == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

/// Pin the current thread if a core is configured. Failing to pin only costs
/// locality, so it is logged and otherwise ignored.
pub(crate) fn pin_if_configured(who: &str, core: Option<usize>) {
    let Some(core) = core else {
        return;
    };
    match pin_to_core(core) {
        Ok(()) => log::info!("{}: pinned to core {}", who, core),
        Err(e) => log::warn!("{}: failed to pin to core {}: {}", who, core, e),
    }
}
