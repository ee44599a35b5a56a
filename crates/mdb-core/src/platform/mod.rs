//! Platform backends for the [`Kernel`](crate::kernel::Kernel) seam.

#[cfg(target_os = "macos")]
pub mod macos;
