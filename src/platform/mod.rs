//! Native backends.

#[cfg(any(target_os = "linux", target_os = "android"))]
mod linux_usbfs;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use linux_usbfs::LinuxDevice;

#[cfg(test)]
pub(crate) mod fake;
