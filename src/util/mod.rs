pub(crate) mod affinity;
pub mod fd;
pub(crate) mod likely;
pub mod mmap;
