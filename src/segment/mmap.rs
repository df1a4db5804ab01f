//! Segments backed by memory mapped files.
//!
//! Every process opening the same directory and name shares the region. The
//! files persist after all processes detach, so a region survives restarts
//! until [MmapSegments::remove_files] is called.

use super::{SegmentMapping, SegmentProvider};
use crate::error::{CacheError, Result};
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::{Mutex, PoisonError};

#[derive(Default)]
struct MmapInner {
    metadata: Option<MmapMut>,
    values: Vec<Option<MmapMut>>,
}

/// A region stored in `<dir>/<name>.meta` and `<dir>/<name>.<index>.seg`.
pub struct MmapSegments {
    dir: PathBuf,
    name: String,
    inner: Mutex<MmapInner>,
}

impl MmapSegments {
    /// Use region `name` in `dir`, creating the directory if needed.
    pub fn new(dir: impl Into<PathBuf>, name: impl Into<String>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(MmapSegments {
            dir,
            name: name.into(),
            inner: Mutex::new(MmapInner::default()),
        })
    }

    /// Path of the metadata file.
    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join(format!("{}.meta", self.name))
    }

    /// Path of value segment `index`.
    pub fn value_segment_path(&self, index: u16) -> PathBuf {
        self.dir.join(format!("{}.{:05}.seg", self.name, index))
    }

    /// Delete every file of region `name` in `dir`. Processes still attached
    /// keep their mappings until they detach.
    pub fn remove_files(dir: impl AsRef<Path>, name: &str) -> Result<()> {
        let prefix = format!("{}.", name);
        for dent in std::fs::read_dir(dir.as_ref())? {
            let dent = dent?;
            let file_name = dent.file_name();
            let file_name = file_name.to_string_lossy();
            if file_name.starts_with(&prefix)
                && (file_name.ends_with(".meta") || file_name.ends_with(".seg"))
            {
                std::fs::remove_file(dent.path())?;
            }
        }
        Ok(())
    }

    fn open(path: &Path, create: bool) -> Result<File> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(false)
            .open(path)?;
        Ok(file)
    }

    fn map(index: Option<u16>, file: &File, len: usize) -> Result<MmapMut> {
        let mmap = unsafe { MmapOptions::new().len(len).map_mut(file) }.map_err(|e| {
            CacheError::Segment {
                index,
                cause: format!("mmap failed: {}", e),
            }
        })?;
        Ok(mmap)
    }

    fn mapping(mmap: &mut MmapMut) -> Result<SegmentMapping> {
        let len = mmap.len();
        let base = NonNull::new(mmap.as_mut_ptr()).ok_or(CacheError::Segment {
            index: None,
            cause: "mmap returned null".into(),
        })?;
        Ok(unsafe { SegmentMapping::new(base, len) })
    }
}

impl SegmentProvider for MmapSegments {
    fn metadata(&self, size: usize) -> Result<SegmentMapping> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.metadata.is_none() {
            let path = self.metadata_path();
            let file = Self::open(&path, true)?;
            let mut len = file.metadata()?.len() as usize;
            if len == 0 {
                file.set_len(size as u64)?;
                len = size;
                tracing::info!(path = %path.display(), size, "created metadata segment");
            }
            inner.metadata = Some(Self::map(None, &file, len)?);
        }
        match inner.metadata.as_mut() {
            Some(mmap) => Self::mapping(mmap),
            None => Err(CacheError::Segment {
                index: None,
                cause: "metadata segment missing".into(),
            }),
        }
    }

    fn create_value_segment(&self, index: u16, size: usize) -> Result<SegmentMapping> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let path = self.value_segment_path(index);
        let file = Self::open(&path, true)?;
        // Zero any leftover of a segment that was never published.
        file.set_len(0)?;
        file.set_len(size as u64)?;
        let mut mmap = Self::map(Some(index), &file, size)?;
        let mapping = Self::mapping(&mut mmap)?;
        let slot = index as usize;
        if inner.values.len() <= slot {
            inner.values.resize_with(slot + 1, || None);
        }
        inner.values[slot] = Some(mmap);
        tracing::info!(path = %path.display(), size, "created value segment");
        Ok(mapping)
    }

    fn attach_value_segment(&self, index: u16) -> Result<SegmentMapping> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = index as usize;
        if inner.values.len() <= slot {
            inner.values.resize_with(slot + 1, || None);
        }
        if inner.values[slot].is_none() {
            let path = self.value_segment_path(index);
            let file = Self::open(&path, false)?;
            let len = file.metadata()?.len() as usize;
            inner.values[slot] = Some(Self::map(Some(index), &file, len)?);
            tracing::debug!(path = %path.display(), len, "attached value segment");
        }
        match inner.values[slot].as_mut() {
            Some(mmap) => Self::mapping(mmap),
            None => Err(CacheError::Segment {
                index: Some(index),
                cause: "segment does not exist".into(),
            }),
        }
    }
}
