//! An append-only overflow file for allocation payloads.
//!
//! The file is not self-describing. Offsets are only tracked in memory by the
//! owning allocator, so reloading requires replaying the same sequence of
//! definitions.

use {
    crate::{pretty_wrappers::PrettySize, CacheError},
    anyhow::Context,
    std::{
        fs::{File, OpenOptions},
        io::{Read, Seek, SeekFrom, Write},
        path::{Path, PathBuf},
    },
};

pub struct DiskStore {
    path: PathBuf,
    file: Option<File>,
    size_in_bytes: u64,
}

impl DiskStore {
    /// Create a store backed by the file at path.
    ///
    /// The file is not touched until the first call to
    /// [DiskStore::open_for_append].
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
            size_in_bytes: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// The number of payload bytes appended so far.
    pub fn size_in_bytes(&self) -> u64 {
        self.size_in_bytes
    }

    /// Create (or truncate) the backing file. Does nothing when the file is
    /// already open.
    pub fn open_for_append(&mut self) -> Result<(), CacheError> {
        if self.file.is_some() {
            return Ok(());
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)
            .with_context(|| {
                format!("Unable to open disk store {:?}", self.path)
            })?;
        log::trace!("Opened disk store {:?}", self.path);
        self.file = Some(file);
        self.size_in_bytes = 0;
        Ok(())
    }

    /// Append bytes to the end of the store.
    ///
    /// # Returns
    ///
    /// The offset in the store where the bytes begin.
    pub fn append(&mut self, bytes: &[u8]) -> Result<u64, CacheError> {
        let offset = self.size_in_bytes;
        let file = self.open_file()?;
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.write_all(bytes))
            .with_context(|| {
                format!(
                    "Unable to append {} to the disk store",
                    PrettySize(bytes.len() as u64)
                )
            })?;
        self.size_in_bytes += bytes.len() as u64;
        Ok(offset)
    }

    /// Fill buffer with the bytes stored at offset.
    pub fn read_into(
        &mut self,
        offset: u64,
        buffer: &mut [u8],
    ) -> Result<(), CacheError> {
        let end = offset + buffer.len() as u64;
        if end > self.size_in_bytes {
            return Err(CacheError::RuntimeError(anyhow::anyhow!(
                "Read of {}..{} is past the end of the disk store ({})",
                offset,
                end,
                self.size_in_bytes
            )));
        }
        let file = self.open_file()?;
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.read_exact(buffer))
            .with_context(|| {
                format!(
                    "Unable to read {}..{} from the disk store",
                    offset, end
                )
            })?;
        Ok(())
    }

    /// Close the file and delete it from disk.
    pub fn remove(&mut self) -> Result<(), CacheError> {
        if self.file.take().is_some() {
            std::fs::remove_file(&self.path).with_context(|| {
                format!("Unable to remove disk store {:?}", self.path)
            })?;
        }
        self.size_in_bytes = 0;
        Ok(())
    }
}

impl std::fmt::Debug for DiskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskStore")
            .field("path", &self.path)
            .field("is_open", &self.is_open())
            .field("size_in_bytes", &PrettySize(self.size_in_bytes))
            .finish()
    }
}

// Private API
// -----------

impl DiskStore {
    fn open_file(&mut self) -> Result<&mut File, CacheError> {
        let path = &self.path;
        self.file.as_mut().ok_or_else(|| {
            CacheError::RuntimeError(anyhow::anyhow!(
                "Disk store {:?} has not been opened",
                path
            ))
        })
    }
}

#[cfg(test)]
mod test {
    use {super::*, pretty_assertions::assert_eq, scopeguard::defer};

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "ccthw_disk_store_{}_{}.bin",
            name,
            std::process::id()
        ))
    }

    #[test]
    fn append_then_read() -> anyhow::Result<()> {
        let path = temp_path("append_then_read");
        defer! { let _ = std::fs::remove_file(&path); }
        let mut store = DiskStore::new(path.clone());
        store.open_for_append()?;

        assert_eq!(store.append(&[1, 2, 3])?, 0);
        assert_eq!(store.append(&[4, 5])?, 3);
        assert_eq!(store.size_in_bytes(), 5);

        let mut buffer = [0; 3];
        store.read_into(2, &mut buffer)?;
        assert_eq!(buffer, [3, 4, 5]);
        Ok(())
    }

    #[test]
    fn read_past_the_end_is_an_error() -> anyhow::Result<()> {
        let path = temp_path("read_past_end");
        defer! { let _ = std::fs::remove_file(&path); }
        let mut store = DiskStore::new(path.clone());
        store.open_for_append()?;

        store.append(&[1, 2])?;
        let mut buffer = [0; 4];
        assert!(store.read_into(0, &mut buffer).is_err());
        Ok(())
    }

    #[test]
    fn remove_deletes_the_backing_file() -> anyhow::Result<()> {
        let path = temp_path("remove");
        defer! { let _ = std::fs::remove_file(&path); }
        let mut store = DiskStore::new(path.clone());
        assert!(!store.path().exists());

        store.open_for_append()?;
        store.append(&[1])?;
        assert_eq!(store.path(), path.as_path());
        assert!(store.path().exists());

        store.remove()?;
        assert!(!store.path().exists());
        assert!(!store.is_open());
        Ok(())
    }

    #[test]
    fn append_requires_open_store() {
        let mut store = DiskStore::new(temp_path("never_opened"));
        assert!(store.append(&[1]).is_err());
        assert!(!store.is_open());
    }
}
