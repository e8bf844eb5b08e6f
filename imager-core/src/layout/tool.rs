//! Subprocess invocation helpers shared by the layout state machine.
//!
//! Every external tool the layout manager shells out to goes through
//! [`run`], which captures stdout/stderr so failures can be reported with
//! or without detail depending on the caller's debug setting.

use std::process::Output;

use super::Error;

/// The external tools the layout manager requires on `PATH`.
///
/// `skopeo` (the OCI export tool, §1/§6) is never invoked directly by this
/// crate — OCI images arrive pre-exported as tarballs — but its presence is
/// still a precondition of the overall pipeline, so it is checked here
/// alongside the tools this crate does call itself.
pub const REQUIRED_TOOLS: &[&str] = &["parted", "e2fsck", "resize2fs", "kpartx", "skopeo"];

/// Checks that every tool in [`REQUIRED_TOOLS`] resolves on `PATH`,
/// returning the full list of absent ones in a single error rather than
/// failing on the first.
pub fn check_required() -> Result<(), Error> {
    let missing: Vec<String> = REQUIRED_TOOLS
        .iter()
        .filter(|tool| which(tool).is_none())
        .map(|t| (*t).to_owned())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::MissingTools(missing))
    }
}

fn which(tool: &str) -> Option<std::path::PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(tool))
        .find(|candidate| candidate.is_file())
}

/// Runs `program` with `args`, returning the captured output on success and
/// [`Error::ToolFailed`] (carrying stdout/stderr) on a non-zero exit.
pub fn run(program: &str, args: &[&str]) -> Result<Output, Error> {
    let output = std::process::Command::new(program)
        .args(args)
        .output()
        .map_err(|e| Error::ToolSpawn(program.to_owned(), e))?;

    if output.status.success() {
        Ok(output)
    } else {
        Err(Error::ToolFailed {
            program: program.to_owned(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
