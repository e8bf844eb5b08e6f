//! Loop device attach/detach via raw ioctls (§4.F `attached`/`detached`).
//!
//! We talk to `/dev/loop-control` and `/dev/loopN` directly rather than
//! shelling out to `losetup`, the way the state machine needs precise
//! control over partition-scan flags and exact device numbering.

use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use nix::{ioctl_none, ioctl_write_int, ioctl_write_ptr};

use super::Error;

const LOOP_MAJOR: u32 = 0x4C;
/// Enables in-kernel partition scanning on attach, the way `losetup -P` does.
const LO_FLAGS_PARTSCAN: u32 = 8;

ioctl_none!(loop_ctl_get_free, LOOP_MAJOR, 0x82);
ioctl_write_int!(loop_set_fd, LOOP_MAJOR, 0x00);
ioctl_none!(loop_clr_fd, LOOP_MAJOR, 0x01);
ioctl_write_ptr!(loop_set_status64, LOOP_MAJOR, 0x04, LoopInfo64);

/// Mirrors `struct loop_info64` from `<linux/loop.h>`.
#[repr(C)]
#[allow(non_snake_case, missing_docs, clippy::missing_docs_in_private_items)]
struct LoopInfo64 {
    lo_device: u64,
    lo_inode: u64,
    lo_rdevice: u64,
    lo_offset: u64,
    lo_sizelimit: u64,
    lo_number: u32,
    lo_encrypt_type: u32,
    lo_encrypt_key_size: u32,
    lo_flags: u32,
    lo_file_name: [u8; 64],
    lo_crypt_name: [u8; 64],
    lo_encrypt_key: [u8; 32],
    lo_init: [u64; 2],
}

impl Default for LoopInfo64 {
    fn default() -> Self {
        Self {
            lo_device: 0,
            lo_inode: 0,
            lo_rdevice: 0,
            lo_offset: 0,
            lo_sizelimit: 0,
            lo_number: 0,
            lo_encrypt_type: 0,
            lo_encrypt_key_size: 0,
            lo_flags: 0,
            lo_file_name: [0; 64],
            lo_crypt_name: [0; 64],
            lo_encrypt_key: [0; 32],
            lo_init: [0; 2],
        }
    }
}

/// A loop device attached to a backing file, with partition scanning on.
#[derive(Debug)]
pub struct LoopDevice {
    path: PathBuf,
    device: File,
    backing_fd: RawFd,
}

impl LoopDevice {
    /// Attaches `backing` to the first free loop device.
    pub fn attach(backing: &Path) -> Result<Self, Error> {
        let control = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/loop-control")
            .map_err(|e| Error::LoopDevice(format!("open /dev/loop-control: {e}")))?;
        // SAFETY: loop_ctl_get_free is a no-argument ioctl on a valid fd;
        // the kernel returns the free minor number as the call's result.
        let minor = unsafe { loop_ctl_get_free(control.as_raw_fd()) }
            .map_err(|e| Error::LoopDevice(format!("LOOP_CTL_GET_FREE: {e}")))?;

        let dev_path = PathBuf::from(format!("/dev/loop{minor}"));
        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&dev_path)
            .map_err(|e| Error::LoopDevice(format!("open {}: {e}", dev_path.display())))?;

        let backing_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(backing)
            .map_err(|e| Error::LoopDevice(format!("open {}: {e}", backing.display())))?;
        let backing_fd = backing_file.as_raw_fd();
        // SAFETY: loop_set_fd takes the backing file's fd as an integer
        // argument; both fds outlive this call.
        unsafe { loop_set_fd(device.as_raw_fd(), backing_fd as _) }
            .map_err(|e| Error::LoopDevice(format!("LOOP_SET_FD: {e}")))?;
        // Leak backing_file's fd ownership into the kernel association;
        // we keep the File alive via `backing_fd` for the struct's lifetime
        // by forgetting it here rather than closing it on drop.
        std::mem::forget(backing_file);

        let mut info = LoopInfo64 {
            lo_flags: LO_FLAGS_PARTSCAN,
            ..LoopInfo64::default()
        };
        let name_bytes = dev_path.to_string_lossy();
        let name_bytes = name_bytes.as_bytes();
        let n = name_bytes.len().min(63);
        info.lo_file_name[..n].copy_from_slice(&name_bytes[..n]);

        // SAFETY: loop_set_status64 writes a `LoopInfo64` whose layout
        // matches the kernel ABI through a valid device fd.
        unsafe { loop_set_status64(device.as_raw_fd(), &info) }
            .map_err(|e| Error::LoopDevice(format!("LOOP_SET_STATUS64: {e}")))?;

        Ok(Self {
            path: dev_path,
            device,
            backing_fd,
        })
    }

    /// The attached device's path (e.g. `/dev/loop0`).
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Detaches the loop device, closing the backing file descriptor.
    pub fn detach(self) -> Result<(), Error> {
        // SAFETY: loop_clr_fd is a no-argument ioctl that tears down the
        // association previously established by LOOP_SET_FD.
        unsafe { loop_clr_fd(self.device.as_raw_fd()) }
            .map_err(|e| Error::LoopDevice(format!("LOOP_CLR_FD: {e}")))?;
        // SAFETY: backing_fd was leaked via `mem::forget` in `attach` and
        // is closed here exactly once.
        unsafe {
            libc::close(self.backing_fd);
        }
        Ok(())
    }
}
