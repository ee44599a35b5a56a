//! Build script for mdb-core
//!
//! Checks the toolchain and, on macOS, the host OS version before compiling.
//!
//! ## Requirements
//!
//! - **Rust**: 1.70.0 or newer
//! - **macOS**: 10.9+ (Mavericks); `mach_vm_*` and `MACH_EXCEPTION_CODES` are
//!   both available from there on
//! - **Other platforms**: the crate builds, but only the mock kernel is usable

fn main()
{
    const MIN_RUST: &str = "1.70.0";

    match (rustc_version::version(), rustc_version::Version::parse(MIN_RUST)) {
        (Ok(found), Ok(min)) if found < min => {
            panic!("mdb-core requires Rust {min} or newer, found {found}");
        }
        (Ok(_), Ok(_)) => {}
        _ => println!("cargo:warning=could not verify Rust version"),
    }

    #[cfg(target_os = "macos")]
    check_macos_requirements();

    #[cfg(not(target_os = "macos"))]
    println!("cargo:warning=mdb-core: no Mach kernel on this target; Task::new() will return UnsupportedPlatform");
}

#[cfg(target_os = "macos")]
fn check_macos_requirements()
{
    let min = (10, 9, 0);

    match get_macos_version() {
        Some(version) if version < min => panic!(
            "mdb-core requires macOS {}.{}.{} or newer, found {}.{}.{}",
            min.0, min.1, min.2, version.0, version.1, version.2
        ),
        Some(_) => {}
        // Cross-compiling, most likely
        None => println!("cargo:warning=could not detect macOS version"),
    }
}

#[cfg(target_os = "macos")]
fn get_macos_version() -> Option<(u32, u32, u32)>
{
    use std::process::Command;

    let output = Command::new("sw_vers").arg("-productVersion").output().ok()?;
    let version = String::from_utf8(output.stdout).ok()?;

    let mut parts = version.trim().split('.').map(str::parse::<u32>);
    let major = parts.next()?.ok()?;
    let minor = parts.next()?.ok()?;
    let patch = parts.next().and_then(Result::ok).unwrap_or(0);
    Some((major, minor, patch))
}
