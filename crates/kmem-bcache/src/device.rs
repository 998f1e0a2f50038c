//! Block device contract and reference implementations.
//!
//! The cache consumes a synchronous transfer primitive: a call blocks
//! the calling context until the block is fully read into or written
//! from the payload. Transfer failures carry the buffer identity and
//! are not retried here; retry policy belongs to the driver.

use kmem_error::{KmemError, Result};
use kmem_types::{BlockNumber, DeviceId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// Block-addressed synchronous I/O interface.
pub trait BlockDevice: Send + Sync {
    /// Read one block into `buf`. `buf.len()` MUST equal `block_size()`.
    fn read_block(&self, device: DeviceId, block: BlockNumber, buf: &mut [u8]) -> Result<()>;

    /// Write one block from `buf`. `buf.len()` MUST equal `block_size()`.
    fn write_block(&self, device: DeviceId, block: BlockNumber, buf: &[u8]) -> Result<()>;

    /// Block size in bytes.
    fn block_size(&self) -> u32;

    /// Number of addressable blocks per device.
    fn block_count(&self) -> u64;
}

fn check_transfer(
    device: DeviceId,
    block: BlockNumber,
    len: usize,
    block_size: u32,
    block_count: u64,
) -> Result<()> {
    let expected = usize::try_from(block_size).expect("block size fits in usize");
    if len != expected {
        return Err(KmemError::Device {
            device: device.0,
            block: block.0,
            detail: format!("payload size mismatch: got={len} expected={expected}"),
        });
    }
    if block.0 >= block_count {
        return Err(KmemError::Device {
            device: device.0,
            block: block.0,
            detail: format!("block out of range: block_count={block_count}"),
        });
    }
    Ok(())
}

// ── In-memory device ────────────────────────────────────────────────────────

/// Sparse in-memory block store serving any number of device ids.
///
/// Unwritten blocks read as zeros. Transfer counters make cache
/// hit/miss behavior observable from tests.
#[derive(Debug)]
pub struct MemBlockDevice {
    block_size: u32,
    block_count: u64,
    blocks: Mutex<HashMap<(DeviceId, BlockNumber), Vec<u8>>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemBlockDevice {
    pub fn new(block_size: u32, block_count: u64) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(KmemError::Config(format!(
                "invalid block_size={block_size} (must be a power of two)"
            )));
        }
        Ok(Self {
            block_size,
            block_count,
            blocks: Mutex::new(HashMap::new()),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        })
    }

    /// Blocks transferred device→memory so far.
    #[must_use]
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Blocks transferred memory→device so far.
    #[must_use]
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_block(&self, device: DeviceId, block: BlockNumber, buf: &mut [u8]) -> Result<()> {
        check_transfer(device, block, buf.len(), self.block_size, self.block_count)?;
        let blocks = self.blocks.lock();
        match blocks.get(&(device, block)) {
            Some(stored) => buf.copy_from_slice(stored),
            None => buf.fill(0),
        }
        drop(blocks);
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn write_block(&self, device: DeviceId, block: BlockNumber, buf: &[u8]) -> Result<()> {
        check_transfer(device, block, buf.len(), self.block_size, self.block_count)?;
        self.blocks.lock().insert((device, block), buf.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }
}

// ── File-backed device ──────────────────────────────────────────────────────

/// Single-device image file using positional I/O.
///
/// `std::os::unix::fs::FileExt` is thread-safe and needs no shared seek
/// position, so concurrent transfers do not serialize on the file handle.
#[derive(Debug)]
pub struct FileBlockDevice {
    id: DeviceId,
    file: File,
    block_size: u32,
    block_count: u64,
}

impl FileBlockDevice {
    /// Open `path` as the image for device `id`.
    pub fn open(path: impl AsRef<Path>, id: DeviceId, block_size: u32) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(KmemError::Config(format!(
                "invalid block_size={block_size} (must be a power of two)"
            )));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        let remainder = len % u64::from(block_size);
        if remainder != 0 {
            return Err(KmemError::Config(format!(
                "image length is not block-aligned: len={len} block_size={block_size} remainder={remainder}"
            )));
        }
        Ok(Self {
            id,
            file,
            block_size,
            block_count: len / u64::from(block_size),
        })
    }

    fn check_id(&self, device: DeviceId, block: BlockNumber) -> Result<()> {
        if device != self.id {
            return Err(KmemError::Device {
                device: device.0,
                block: block.0,
                detail: format!("unknown device (image serves device {})", self.id.0),
            });
        }
        Ok(())
    }

    fn offset_of(&self, block: BlockNumber) -> u64 {
        block.0 * u64::from(self.block_size)
    }
}

impl BlockDevice for FileBlockDevice {
    fn read_block(&self, device: DeviceId, block: BlockNumber, buf: &mut [u8]) -> Result<()> {
        self.check_id(device, block)?;
        check_transfer(device, block, buf.len(), self.block_size, self.block_count)?;
        self.file.read_exact_at(buf, self.offset_of(block))?;
        Ok(())
    }

    fn write_block(&self, device: DeviceId, block: BlockNumber, buf: &[u8]) -> Result<()> {
        self.check_id(device, block)?;
        check_transfer(device, block, buf.len(), self.block_size, self.block_count)?;
        self.file.write_all_at(buf, self.offset_of(block))?;
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn mem_device_round_trips() {
        let dev = MemBlockDevice::new(512, 8).expect("device");
        let payload = vec![0xA5_u8; 512];
        dev.write_block(DeviceId(1), BlockNumber(3), &payload)
            .expect("write");

        let mut out = vec![0_u8; 512];
        dev.read_block(DeviceId(1), BlockNumber(3), &mut out)
            .expect("read");
        assert_eq!(out, payload);

        // A different device id is a different namespace.
        dev.read_block(DeviceId(2), BlockNumber(3), &mut out)
            .expect("read");
        assert_eq!(out, vec![0_u8; 512]);

        assert_eq!(dev.reads(), 2);
        assert_eq!(dev.writes(), 1);
    }

    #[test]
    fn mem_device_rejects_bad_transfers() {
        let dev = MemBlockDevice::new(512, 4).expect("device");
        let mut out = vec![0_u8; 512];
        assert!(
            dev.read_block(DeviceId(0), BlockNumber(4), &mut out)
                .is_err()
        );
        let mut short = vec![0_u8; 256];
        assert!(
            dev.read_block(DeviceId(0), BlockNumber(0), &mut short)
                .is_err()
        );
        assert!(MemBlockDevice::new(1000, 4).is_err());
    }

    #[test]
    fn file_device_round_trips() {
        let mut image = tempfile::NamedTempFile::new().expect("tempfile");
        image
            .write_all(&vec![0_u8; 1024 * 4])
            .expect("fill image");

        let dev = FileBlockDevice::open(image.path(), DeviceId(1), 1024).expect("open");
        assert_eq!(dev.block_count(), 4);

        let payload = vec![0x5A_u8; 1024];
        dev.write_block(DeviceId(1), BlockNumber(2), &payload)
            .expect("write");
        let mut out = vec![0_u8; 1024];
        dev.read_block(DeviceId(1), BlockNumber(2), &mut out)
            .expect("read");
        assert_eq!(out, payload);

        // Wrong device id is a caller error, not a silent remap.
        assert!(
            dev.read_block(DeviceId(9), BlockNumber(2), &mut out)
                .is_err()
        );
    }

    #[test]
    fn file_device_rejects_unaligned_image() {
        let mut image = tempfile::NamedTempFile::new().expect("tempfile");
        image.write_all(&vec![0_u8; 1500]).expect("fill image");
        assert!(FileBlockDevice::open(image.path(), DeviceId(0), 1024).is_err());
    }
}
