//! Image layout manager (component F, §4.F): the state machine that turns
//! an output file into a populated, shrink-able disk image.
//!
//! ```text
//!             created ─▶ attached ─▶ probed ─▶ p3-extended ─▶ devices-ready
//!                                                                   │
//!  released ◀── detached ◀── unmounted ◀── populated ◀── resized ◀──┘
//! ```
//!
//! Detach/release are always attempted on drop, even after a failed
//! transition, in LIFO order of what was acquired.

pub mod fsops;
pub mod loopdev;
pub mod partition;
pub mod tool;

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use loopdev::LoopDevice;
use partition::PartitionInfo;

/// Errors raised by the layout state machine or its subprocess helpers.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Underlying filesystem operation failed.
    #[error("layout I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A loop device ioctl failed.
    #[error("loop device error: {0}")]
    LoopDevice(String),
    /// Reading partition geometry from sysfs failed.
    #[error("partition probe error: {0}")]
    Probe(String),
    /// A mount/unmount syscall failed.
    #[error("mount error: {0}")]
    Mount(String),
    /// The output path already exists and `overwrite` was not set.
    #[error("output path {0} already exists")]
    OutputExists(PathBuf),
    /// A required tool could not be spawned.
    #[error("failed to spawn {0}: {1}")]
    ToolSpawn(String, #[source] std::io::Error),
    /// A tool exited non-zero.
    #[error("{program} exited with {code:?}: {stderr}")]
    ToolFailed {
        /// The program name.
        program: String,
        /// Its exit code, if the process wasn't killed by a signal.
        code: Option<i32>,
        /// Captured stdout.
        stdout: String,
        /// Captured stderr.
        stderr: String,
    },
    /// One or more required tools were absent from `PATH`.
    #[error("missing required tools: {}", .0.join(", "))]
    MissingTools(Vec<String>),
    /// A transition was attempted out of order.
    #[error("invalid transition: layout is in state {0:?}, expected {1:?}")]
    WrongState(State, State),
}

/// The layout manager's current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum State {
    /// Output file allocated, not yet loop-attached.
    Created,
    /// Loop-attached with partition scanning enabled.
    Attached,
    /// Partition geometry for 1..=3 has been read.
    Probed,
    /// Partition 3 deleted and recreated to extend to the end of the device.
    P3Extended,
    /// `/dev/loopNpM` device nodes are confirmed present.
    DevicesReady,
    /// Partition 3's filesystem has been fsck'd, resized, and fsck'd again.
    Resized,
    /// Partition 3 was mounted, populated, and unmounted.
    Populated,
    /// Loop device detached.
    Detached,
    /// All resources released; the manager is inert.
    Released,
}

/// The output image file and the loop device/partition state built on it.
#[derive(Debug)]
pub struct ImageLayout {
    output: PathBuf,
    state: State,
    loopdev: Option<LoopDevice>,
    partitions: Vec<PartitionInfo>,
    sector_size: u64,
    devices_created_by_us: bool,
}

impl ImageLayout {
    /// Allocates `output` at `size` bytes. Fails with [`Error::OutputExists`]
    /// if the path already exists and `overwrite` is false.
    pub fn create(output: &Path, size: u64, overwrite: bool) -> Result<Self, Error> {
        if output.exists() && !overwrite {
            return Err(Error::OutputExists(output.to_owned()));
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(output)?;
        file.set_len(size)?;
        file.sync_all()?;

        Ok(Self {
            output: output.to_owned(),
            state: State::Created,
            loopdev: None,
            partitions: Vec::new(),
            sector_size: 512,
            devices_created_by_us: false,
        })
    }

    fn require(&self, expected: State) -> Result<(), Error> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::WrongState(self.state, expected))
        }
    }

    /// Attaches the output file to a free loop device with partition
    /// scanning enabled.
    pub fn attach(&mut self) -> Result<(), Error> {
        self.require(State::Created)?;
        self.loopdev = Some(LoopDevice::attach(&self.output)?);
        self.state = State::Attached;
        Ok(())
    }

    fn dev_name(&self) -> Result<String, Error> {
        self.loopdev
            .as_ref()
            .and_then(|d| d.path().file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::LoopDevice("no loop device attached".to_owned()))
    }

    /// Reads partitions 1..=3's start/length from sysfs.
    pub fn probe(&mut self) -> Result<(), Error> {
        self.require(State::Attached)?;
        let dev_name = self.dev_name()?;
        self.sector_size = partition::sector_size(&dev_name)?;
        self.partitions = partition::read_partitions(&dev_name)?;
        self.state = State::Probed;
        Ok(())
    }

    /// Deletes and recreates partition 3 to extend it to the end of the
    /// device, preserving its start sector.
    pub fn extend_p3(&mut self) -> Result<(), Error> {
        self.require(State::Probed)?;
        let p3 = self
            .partitions
            .iter()
            .find(|p| p.number == 3)
            .ok_or_else(|| Error::Probe("partition 3 not found".to_owned()))?;
        let device_path = self
            .loopdev
            .as_ref()
            .ok_or_else(|| Error::LoopDevice("no loop device attached".to_owned()))?
            .path()
            .to_owned();
        partition::extend_partition3(&device_path, p3.start)?;
        self.state = State::P3Extended;
        Ok(())
    }

    /// The path `/dev/loopNpM` for the given 1-based partition number.
    fn partition_device(&self, number: u32) -> Result<PathBuf, Error> {
        let dev = self
            .loopdev
            .as_ref()
            .ok_or_else(|| Error::LoopDevice("no loop device attached".to_owned()))?;
        Ok(PathBuf::from(format!("{}p{number}", dev.path().display())))
    }

    /// Ensures `/dev/loopNpM` nodes exist, creating them via `kpartx` if the
    /// kernel did not hot-add them after [`Self::extend_p3`].
    pub fn ensure_devices_ready(&mut self) -> Result<(), Error> {
        self.require(State::P3Extended)?;
        let p3_dev = self.partition_device(3)?;
        if !p3_dev.exists() {
            let dev = self
                .loopdev
                .as_ref()
                .ok_or_else(|| Error::LoopDevice("no loop device attached".to_owned()))?
                .path()
                .to_string_lossy()
                .into_owned();
            tool::run("kpartx", &["-av", &dev])?;
            self.devices_created_by_us = true;
        }
        if !p3_dev.exists() {
            return Err(Error::Probe(format!(
                "{} still missing after kpartx",
                p3_dev.display()
            )));
        }
        self.state = State::DevicesReady;
        Ok(())
    }

    /// Detaches and re-attaches the loop device, for environments where the
    /// kernel only picks up the new partition table on a fresh attach.
    pub fn reattach(&mut self) -> Result<(), Error> {
        let loopdev = self
            .loopdev
            .take()
            .ok_or_else(|| Error::LoopDevice("no loop device attached".to_owned()))?;
        loopdev.detach()?;
        self.loopdev = Some(LoopDevice::attach(&self.output)?);
        Ok(())
    }

    /// Runs `e2fsck -fy`, `resize2fs -f` to grow, then `e2fsck -fy` again
    /// on partition 3. Both checks are mandatory.
    pub fn resize_fs(&mut self) -> Result<(), Error> {
        self.require(State::DevicesReady)?;
        let p3 = self.partition_device(3)?;
        fsops::check(&p3)?;
        fsops::resize(&p3, None)?;
        fsops::check(&p3)?;
        self.state = State::Resized;
        Ok(())
    }

    /// Mounts partition 3 read-write at a fresh temp directory, calls
    /// `populate` with the mount point, then unmounts with a `sync`.
    pub fn populate(
        &mut self,
        populate: impl FnOnce(&Path) -> Result<(), Error>,
    ) -> Result<(), Error> {
        self.require(State::Resized)?;
        let p3 = self.partition_device(3)?;
        let mountpoint = tempfile::tempdir()?;

        nix::mount::mount(
            Some(p3.as_path()),
            mountpoint.path(),
            Some("ext4"),
            nix::mount::MsFlags::empty(),
            None::<&str>,
        )
        .map_err(|e| Error::Mount(format!("mount {}: {e}", p3.display())))?;

        let result = populate(mountpoint.path());

        nix::unistd::sync();
        let unmount_result = nix::mount::umount(mountpoint.path())
            .map_err(|e| Error::Mount(format!("umount {}: {e}", mountpoint.path().display())));

        result?;
        unmount_result?;
        self.state = State::Populated;
        Ok(())
    }

    /// Shrinks partition 3 to its minimum used size plus a small margin,
    /// then truncates the output file. Only valid after [`Self::populate`].
    pub fn shrink(&mut self) -> Result<(), Error> {
        self.require(State::Populated)?;
        let p3 = self.partition_device(3)?;
        let min_blocks = fsops::minimum_size_blocks(&p3)?;
        const MARGIN_BLOCKS: u64 = 128;
        let target_blocks = min_blocks + MARGIN_BLOCKS;
        const BLOCK_SIZE: u64 = 4096;
        let target_bytes = target_blocks * BLOCK_SIZE;

        fsops::check(&p3)?;
        fsops::resize(&p3, Some(target_bytes))?;
        fsops::check(&p3)?;

        let p3_info = self
            .partitions
            .iter()
            .find(|p| p.number == 3)
            .ok_or_else(|| Error::Probe("partition 3 not found".to_owned()))?;
        let new_sectors = target_bytes.div_ceil(self.sector_size);
        let device_path = self
            .loopdev
            .as_ref()
            .ok_or_else(|| Error::LoopDevice("no loop device attached".to_owned()))?
            .path()
            .to_owned();
        tool::run(
            "parted",
            &[
                "-s",
                &device_path.to_string_lossy(),
                "rm",
                "3",
            ],
        )?;
        let start_arg = format!("{}s", p3_info.start);
        let end_arg = format!("{}s", p3_info.start + new_sectors);
        tool::run(
            "parted",
            &[
                "-s",
                &device_path.to_string_lossy(),
                "unit",
                "s",
                "mkpart",
                "primary",
                "ext4",
                &start_arg,
                &end_arg,
            ],
        )?;

        let new_file_size = (p3_info.start + new_sectors) * self.sector_size;
        let file = OpenOptions::new().write(true).open(&self.output)?;
        file.set_len(new_file_size)?;
        Ok(())
    }

    /// Removes any `kpartx`-created device nodes and detaches the loop
    /// device. Always attempted, even after a failed earlier transition.
    pub fn detach(&mut self) -> Result<(), Error> {
        if let Some(dev) = &self.loopdev {
            if self.devices_created_by_us {
                let path = dev.path().to_string_lossy().into_owned();
                let _ = tool::run("kpartx", &["-d", &path]);
            }
        }
        if let Some(dev) = self.loopdev.take() {
            dev.detach()?;
        }
        self.state = State::Detached;
        Ok(())
    }

    /// Marks the layout as fully released. On failure the driver keeps the
    /// output file (`--keep`); otherwise it removes it before calling this.
    pub fn release(mut self) -> Result<(), Error> {
        if self.state != State::Detached {
            self.detach()?;
        }
        self.state = State::Released;
        Ok(())
    }

    /// The output file path.
    #[must_use]
    pub fn output_path(&self) -> &Path {
        &self.output
    }
}

impl Drop for ImageLayout {
    fn drop(&mut self) {
        if self.state != State::Detached && self.state != State::Released {
            if let Err(e) = self.detach() {
                tracing::warn!("failed to detach loop device during cleanup: {e}");
            }
        }
    }
}
