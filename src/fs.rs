//! Filesystem collaborator interface
//!
//! The core does not implement a filesystem; it consumes file-descriptor
//! style primitives keyed by path and flag bitmask from an external
//! collaborator behind the [`Filesystem`] trait. A small RAM-backed
//! implementation is provided for boot images and tests.

use spin::Mutex;

use crate::types::{KernError, KernResult};

/// Open flag bitmask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags(pub u32);

impl OpenFlags {
    pub const RDONLY: Self = Self(0x0001);
    pub const WRONLY: Self = Self(0x0002);
    pub const RDWR: Self = Self(0x0003);
    pub const CREAT: Self = Self(0x0100);

    pub fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn readable(self) -> bool {
        self.contains(Self::RDONLY)
    }

    pub fn writable(self) -> bool {
        self.contains(Self::WRONLY)
    }
}

impl core::ops::BitOr for OpenFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Seek origin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

impl Whence {
    /// Decode the syscall-encoded origin (0/1/2)
    pub fn from_raw(raw: usize) -> KernResult<Self> {
        match raw {
            0 => Ok(Whence::Set),
            1 => Ok(Whence::Cur),
            2 => Ok(Whence::End),
            _ => Err(KernError::BadFileDescriptor),
        }
    }
}

/// File metadata returned by `open`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: heapless::String<64>,
    pub size: usize,
    /// Location cookie owned by the collaborator (cluster, inode, slot)
    pub cluster: u32,
}

/// An open file: collaborator metadata plus the cursor the kernel owns
#[derive(Debug, Clone)]
pub struct OpenFile {
    pub info: FileInfo,
    pub pos: usize,
    pub flags: OpenFlags,
}

impl OpenFile {
    /// Apply a seek against the current size; the cursor may not move
    /// before the start of the file.
    pub fn seek(&mut self, offset: isize, whence: Whence) -> KernResult<usize> {
        let base = match whence {
            Whence::Set => 0isize,
            Whence::Cur => self.pos as isize,
            Whence::End => self.info.size as isize,
        };
        let target = base + offset;
        if target < 0 {
            return Err(KernError::BadFileDescriptor);
        }
        self.pos = target as usize;
        Ok(self.pos)
    }
}

/// One slot of a task's file descriptor table
#[derive(Debug, Clone)]
pub enum FileHandle {
    /// Standard input (keyboard collaborator; empty in this core)
    Stdin,
    /// Standard output, backed by the console
    Stdout,
    /// Standard error, backed by the console
    Stderr,
    /// A file opened through the filesystem collaborator
    File(OpenFile),
}

/// The interface the core requires from the filesystem collaborator
pub trait Filesystem: Send + Sync {
    /// Resolve a path into a file-info record, creating when asked
    fn open(&self, path: &str, flags: OpenFlags) -> KernResult<FileInfo>;
    /// Read at an explicit position; short reads at end of file
    fn read(&self, info: &FileInfo, pos: usize, buf: &mut [u8]) -> KernResult<usize>;
    /// Write at an explicit position, extending the file as needed
    fn write(&self, info: &mut FileInfo, pos: usize, buf: &[u8]) -> KernResult<usize>;
    /// Remove a file by path
    fn unlink(&self, path: &str) -> KernResult<()>;
}

// ============================================================================
// RAM-backed filesystem
// ============================================================================

/// Capacity of the RAM filesystem
pub const MEMFS_MAX_FILES: usize = 16;
/// Largest file the RAM filesystem can hold
///
/// Kept small: the file array is inline, so this bounds the size of every
/// `MemFs` value, including the fixtures tests build on their own stacks.
pub const MEMFS_MAX_FILE_SIZE: usize = 8 * 1024;

struct MemFile {
    name: heapless::String<64>,
    data: heapless::Vec<u8, MEMFS_MAX_FILE_SIZE>,
}

/// Fixed-capacity in-memory filesystem
///
/// Serves as the boot ramdisk and as the collaborator double in tests.
pub struct MemFs {
    files: Mutex<heapless::Vec<MemFile, MEMFS_MAX_FILES>>,
}

impl MemFs {
    pub const fn new() -> Self {
        MemFs {
            files: Mutex::new(heapless::Vec::new()),
        }
    }

    /// Install a file image, replacing any existing file of the same name
    pub fn insert(&self, name: &str, contents: &[u8]) -> KernResult<()> {
        let mut files = self.files.lock();
        if let Some(file) = files.iter_mut().find(|f| f.name.as_str() == name) {
            file.data.clear();
            file.data
                .extend_from_slice(contents)
                .map_err(|_| KernError::OutOfMemory)?;
            return Ok(());
        }
        let mut file = MemFile {
            name: heapless::String::new(),
            data: heapless::Vec::new(),
        };
        file.name
            .push_str(name)
            .map_err(|_| KernError::OutOfMemory)?;
        file.data
            .extend_from_slice(contents)
            .map_err(|_| KernError::OutOfMemory)?;
        files.push(file).map_err(|_| KernError::OutOfMemory)?;
        Ok(())
    }
}

impl Filesystem for MemFs {
    fn open(&self, path: &str, flags: OpenFlags) -> KernResult<FileInfo> {
        let mut files = self.files.lock();
        if let Some((slot, file)) = files
            .iter()
            .enumerate()
            .find(|(_, f)| f.name.as_str() == path)
        {
            let mut name = heapless::String::new();
            let _ = name.push_str(file.name.as_str());
            return Ok(FileInfo {
                name,
                size: file.data.len(),
                cluster: slot as u32,
            });
        }
        if !flags.contains(OpenFlags::CREAT) {
            return Err(KernError::NotFound);
        }
        let mut file = MemFile {
            name: heapless::String::new(),
            data: heapless::Vec::new(),
        };
        file.name
            .push_str(path)
            .map_err(|_| KernError::OutOfMemory)?;
        files.push(file).map_err(|_| KernError::OutOfMemory)?;
        let mut name = heapless::String::new();
        let _ = name.push_str(path);
        Ok(FileInfo {
            name,
            size: 0,
            cluster: (files.len() - 1) as u32,
        })
    }

    fn read(&self, info: &FileInfo, pos: usize, buf: &mut [u8]) -> KernResult<usize> {
        let files = self.files.lock();
        let file = files
            .iter()
            .find(|f| f.name.as_str() == info.name.as_str())
            .ok_or(KernError::NotFound)?;
        if pos >= file.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(file.data.len() - pos);
        buf[..n].copy_from_slice(&file.data[pos..pos + n]);
        Ok(n)
    }

    fn write(&self, info: &mut FileInfo, pos: usize, buf: &[u8]) -> KernResult<usize> {
        let mut files = self.files.lock();
        let file = files
            .iter_mut()
            .find(|f| f.name.as_str() == info.name.as_str())
            .ok_or(KernError::NotFound)?;
        let end = pos + buf.len();
        if end > MEMFS_MAX_FILE_SIZE {
            return Err(KernError::OutOfMemory);
        }
        while file.data.len() < end {
            file.data.push(0).map_err(|_| KernError::OutOfMemory)?;
        }
        file.data[pos..end].copy_from_slice(buf);
        info.size = file.data.len();
        Ok(buf.len())
    }

    fn unlink(&self, path: &str) -> KernResult<()> {
        let mut files = self.files.lock();
        let slot = files
            .iter()
            .position(|f| f.name.as_str() == path)
            .ok_or(KernError::NotFound)?;
        files.remove(slot);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_missing_without_create_fails() {
        let fs = MemFs::new();
        assert_eq!(
            fs.open("nope.bin", OpenFlags::RDONLY),
            Err(KernError::NotFound)
        );
    }

    #[test]
    fn create_write_read_round() {
        let fs = MemFs::new();
        let mut info = fs
            .open("hello.txt", OpenFlags::RDWR | OpenFlags::CREAT)
            .unwrap();
        assert_eq!(info.size, 0);
        assert_eq!(fs.write(&mut info, 0, b"hello world").unwrap(), 11);
        assert_eq!(info.size, 11);

        let mut buf = [0u8; 5];
        assert_eq!(fs.read(&info, 6, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"world");
        // Reads past the end are short
        assert_eq!(fs.read(&info, 100, &mut buf).unwrap(), 0);
    }

    #[test]
    fn unlink_removes_the_file() {
        let fs = MemFs::new();
        fs.insert("gone.bin", b"x").unwrap();
        fs.unlink("gone.bin").unwrap();
        assert_eq!(
            fs.open("gone.bin", OpenFlags::RDONLY),
            Err(KernError::NotFound)
        );
        assert_eq!(fs.unlink("gone.bin"), Err(KernError::NotFound));
    }

    #[test]
    fn seek_moves_the_cursor_within_bounds() {
        let fs = MemFs::new();
        fs.insert("f", b"0123456789").unwrap();
        let info = fs.open("f", OpenFlags::RDONLY).unwrap();
        let mut open = OpenFile {
            info,
            pos: 0,
            flags: OpenFlags::RDONLY,
        };
        assert_eq!(open.seek(4, Whence::Set).unwrap(), 4);
        assert_eq!(open.seek(2, Whence::Cur).unwrap(), 6);
        assert_eq!(open.seek(-1, Whence::End).unwrap(), 9);
        assert!(open.seek(-20, Whence::Cur).is_err());
    }

    #[test]
    fn insert_replaces_existing_contents() {
        let fs = MemFs::new();
        fs.insert("f", b"old").unwrap();
        fs.insert("f", b"newer").unwrap();
        let info = fs.open("f", OpenFlags::RDONLY).unwrap();
        assert_eq!(info.size, 5);
    }
}
