use std::fs::{self, File};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::protocol::HttpCode;

/// A resolved file, mapped read-only for the lifetime of one response.
///
/// The mapping is released when this value drops, whichever path the
/// response takes.
#[derive(Debug)]
pub struct MappedFile {
    path: PathBuf,
    map: Option<Mmap>,
}

impl MappedFile {
    /// Resolve `url` under `doc_root` and map it.
    ///
    /// Missing files are `NoResource`; directories and files without the
    /// world-read bit are `ForbiddenRequest`.
    pub fn open(doc_root: &Path, url: &str) -> Result<Self, HttpCode> {
        let path = doc_root.join(url.trim_start_matches('/'));

        let meta = fs::metadata(&path).map_err(|_| HttpCode::NoResource)?;
        if meta.is_dir() || meta.permissions().mode() & 0o004 == 0 {
            return Err(HttpCode::ForbiddenRequest);
        }

        let file = File::open(&path).map_err(|e| {
            tracing::debug!(path = %path.display(), error = %e, "open failed");
            HttpCode::ForbiddenRequest
        })?;

        // zero-length files cannot be mapped
        if meta.len() == 0 {
            return Ok(Self { path, map: None });
        }

        let map = unsafe { Mmap::map(&file) }.map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "mmap failed");
            HttpCode::InternalError
        })?;
        Ok(Self {
            path,
            map: Some(map),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
