//! drivefs shared library.

/// Filesystem core: the node tree, open-file sessions and the FUSE adapter.
pub mod fs;
/// The remote object store seam and its implementations.
pub mod remote;
