//! Filename sandboxing and address screening.
//!
//! Peers name the file in a `DCC SEND` offer, so the filename is attacker
//! controlled. Every destination is resolved here before a socket is opened:
//! a name that is not a single plain path component is rejected outright,
//! and the joined path must stay under the canonical download root.

use crate::error::DccError;
use std::net::IpAddr;
use std::path::{Component, Path, PathBuf};

/// Maximum accepted filename length in bytes.
const MAX_FILENAME_LEN: usize = 255;

/// Whether an address is private, loopback, or link-local.
pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            // fc00::/7 unique local, fe80::/10 link local.
            v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00 || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

/// Reject any offered filename that could name something outside the
/// download root: empty or overlong names, path separators, NUL and other
/// control bytes, and anything that does not parse as exactly one normal
/// path component (`..`, `.`, absolute paths, drive prefixes).
pub fn validate_filename(root: &Path, name: &str) -> Result<(), DccError> {
    let violation = || DccError::SandboxViolation {
        name: name.to_string(),
        root: root.to_path_buf(),
    };

    if name.is_empty() || name.len() > MAX_FILENAME_LEN {
        return Err(violation());
    }
    if name.contains('/') || name.contains('\\') || name.chars().any(|c| c.is_control()) {
        return Err(violation());
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(violation()),
    }
}

/// Resolve the destination path for an offered filename.
///
/// The root must already exist; it is canonicalized so the containment
/// check runs against real paths rather than textual ones. When the
/// destination exists, a numeric suffix is appended before the extension so
/// repeated offers of the same name land in separate files.
pub fn resolve_destination(root: &Path, name: &str) -> Result<PathBuf, DccError> {
    validate_filename(root, name)?;

    let canonical_root = root.canonicalize()?;
    let destination = canonical_root.join(name);
    if !destination.starts_with(&canonical_root) {
        return Err(DccError::SandboxViolation {
            name: name.to_string(),
            root: root.to_path_buf(),
        });
    }

    if !destination.exists() {
        return Ok(destination);
    }

    let stem = destination
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    let extension = destination
        .extension()
        .map(|e| e.to_string_lossy().into_owned());

    for i in 1..1000 {
        let candidate = match &extension {
            Some(ext) => canonical_root.join(format!("{}_{}.{}", stem, i, ext)),
            None => canonical_root.join(format!("{}_{}", stem, i)),
        };
        if !candidate.exists() {
            return Ok(candidate);
        }
    }

    Err(DccError::Io(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        format!("no free destination for \"{}\" under {}", name, canonical_root.display()),
    )))
}
