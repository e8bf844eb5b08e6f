//! Partition table inspection and the `p3-extended` transition (§4.F).
//!
//! Partition geometry is read from the kernel's own sysfs tree, not by
//! shelling out to `lsblk`; only the final `p3-extended` edit itself goes
//! through `parted`, because sector-exact partition table edits are its
//! job, not ours.

use std::path::Path;

use super::{tool, Error};

/// One partition's geometry, in sectors.
#[derive(Debug, Clone, Copy)]
pub struct PartitionInfo {
    /// Partition number (1-based).
    pub number: u32,
    /// Start offset, in sectors.
    pub start: u64,
    /// Length, in sectors.
    pub sectors: u64,
}

/// Reads the logical sector size for `dev_name` (e.g. `"loop0"`) from
/// `/sys/class/block/<dev>/queue/hw_sector_size`, defaulting to 512.
pub fn sector_size(dev_name: &str) -> Result<u64, Error> {
    let path = format!("/sys/class/block/{dev_name}/queue/hw_sector_size");
    match std::fs::read_to_string(&path) {
        Ok(s) => s
            .trim()
            .parse()
            .map_err(|_| Error::Probe(format!("unreadable sector size at {path}"))),
        Err(_) => Ok(512),
    }
}

/// Reads partitions 1..=3's start/size from
/// `/sys/class/block/<dev>/<dev>p<n>/{start,size}`.
pub fn read_partitions(dev_name: &str) -> Result<Vec<PartitionInfo>, Error> {
    let mut out = Vec::new();
    for number in 1..=3u32 {
        let base = format!("/sys/class/block/{dev_name}/{dev_name}p{number}");
        let start = read_sysfs_u64(&format!("{base}/start"))?;
        let sectors = read_sysfs_u64(&format!("{base}/size"))?;
        out.push(PartitionInfo {
            number,
            start,
            sectors,
        });
    }
    Ok(out)
}

fn read_sysfs_u64(path: &str) -> Result<u64, Error> {
    std::fs::read_to_string(path)
        .map_err(|e| Error::Probe(format!("read {path}: {e}")))?
        .trim()
        .parse()
        .map_err(|_| Error::Probe(format!("unreadable value at {path}")))
}

/// Deletes and recreates partition 3 starting at the same sector and
/// extending to the end of the device, via `parted`. The start sector must
/// not change.
pub fn extend_partition3(device: &Path, start_sector: u64) -> Result<(), Error> {
    let dev = device.to_string_lossy();
    tool::run("parted", &["-s", &dev, "rm", "3"])?;
    let mkpart_start = format!("{start_sector}s");
    tool::run(
        "parted",
        &["-s", &dev, "unit", "s", "mkpart", "primary", "ext4", &mkpart_start, "100%"],
    )?;
    Ok(())
}
