//! Filesystem check/resize subprocess wrappers (§4.F `resized`).
//!
//! Grounded on the `osutils::e2fsck`/`osutils::resize2fs` split seen in
//! other disk-provisioning tools: each external tool gets its own thin
//! wrapper function rather than one catch-all "run a command" call.

use std::path::Path;

use super::{tool, Error};

/// Runs `e2fsck -fy` on `device`. The double pre/post check around a
/// resize is mandatory, not optional, per the state machine.
pub fn check(device: &Path) -> Result<(), Error> {
    let dev = device.to_string_lossy();
    // e2fsck exits 1 for "errors corrected"; only >=4 is a hard failure.
    match tool::run("e2fsck", &["-fy", &dev]) {
        Ok(_) => Ok(()),
        Err(Error::ToolFailed { code: Some(c), .. }) if c <= 2 => Ok(()),
        Err(e) => Err(e),
    }
}

/// Grows (or, with an explicit `target_size`, shrinks) the filesystem on
/// `device`. `target_size` is in bytes; `None` grows to fill the partition.
pub fn resize(device: &Path, target_size: Option<u64>) -> Result<(), Error> {
    let dev = device.to_string_lossy();
    match target_size {
        Some(size) => {
            let size_arg = format!("{size}");
            tool::run("resize2fs", &["-f", &dev, &size_arg])?;
        }
        None => {
            tool::run("resize2fs", &["-f", &dev])?;
        }
    }
    Ok(())
}

/// Measures the filesystem's actually-used bytes via `resize2fs -P`
/// (prints the minimum size in blocks; the caller multiplies by block size).
pub fn minimum_size_blocks(device: &Path) -> Result<u64, Error> {
    let dev = device.to_string_lossy();
    let output = tool::run("resize2fs", &["-P", &dev])?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .rsplit(':')
        .next()
        .map(str::trim)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Probe(format!("unparseable resize2fs -P output: {stdout}")))
}
