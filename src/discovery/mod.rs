//! On-disk discovery of vendor GPU management libraries and device facts.
//!
//! - [`locator`]: glob search, symlink resolution and de-duplication
//! - [`amdgpu`]: KFD topology and amdgpu driver version from sysfs

pub mod amdgpu;
pub mod locator;
