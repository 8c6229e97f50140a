//! A single byte-stream image with a streaming read cursor: either
//! backed by a file on disk or held entirely in memory (a synthetic
//! image, see `device_driver`).

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("failed to open or read image {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

enum Source {
    File { path: PathBuf, handle: Option<File> },
    Bytes { data: Vec<u8> },
}

/// A byte-stream image: a firmware/flash blob read from disk, or a small
/// synthetic payload (`06_IMAGE`, `07_IMAGE`, `uEnv.txt`) held in memory.
/// `load()` must be called before `read_block()`.
pub struct Image {
    name: String,
    source: Source,
    size: u64,
    cursor: u64,
}

impl Image {
    /// Record a file-backed image without opening it yet.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Image {
            name,
            source: Source::File { path, handle: None },
            size: 0,
            cursor: 0,
        }
    }

    /// Wrap an in-memory synthetic image under `name`; already "loaded".
    pub fn from_bytes(name: impl Into<String>, data: Vec<u8>) -> Self {
        let size = data.len() as u64;
        Image {
            name: name.into(),
            source: Source::Bytes { data },
            size,
            cursor: 0,
        }
    }

    /// Open the underlying source (no-op for in-memory images) and learn
    /// its size.
    pub fn load(&mut self) -> Result<(), ImageError> {
        match &mut self.source {
            Source::File { path, handle } => {
                let file = File::open(path.as_path()).map_err(|source| ImageError::Io {
                    path: path.clone(),
                    source,
                })?;
                let metadata = file.metadata().map_err(|source| ImageError::Io {
                    path: path.clone(),
                    source,
                })?;
                self.size = metadata.len();
                self.cursor = 0;
                *handle = Some(file);
                Ok(())
            }
            Source::Bytes { .. } => {
                self.cursor = 0;
                Ok(())
            }
        }
    }

    /// Read up to `buf.len()` bytes starting at the current cursor,
    /// advancing it by the number returned. Returns 0 at EOF.
    pub fn read_block(&mut self, buf: &mut [u8]) -> Result<usize, ImageError> {
        let remaining = self.size.saturating_sub(self.cursor);
        if remaining == 0 {
            return Ok(0);
        }

        match &mut self.source {
            Source::File { path, handle } => {
                let file = handle.as_mut().expect("Image::load must be called before read_block");
                let n = file.read(buf).map_err(|source| ImageError::Io {
                    path: path.clone(),
                    source,
                })?;
                self.cursor += n as u64;
                Ok(n)
            }
            Source::Bytes { data } => {
                let start = self.cursor as usize;
                let want = buf.len().min(remaining as usize);
                buf[..want].copy_from_slice(&data[start..start + want]);
                self.cursor += want as u64;
                Ok(want)
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.source {
            Source::File { path, .. } => Some(path.as_path()),
            Source::Bytes { .. } => None,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn bytes_image_round_trips_in_one_block() {
        let mut image = Image::from_bytes("06_IMAGE", b"3-1.2".to_vec());
        image.load().unwrap();
        let mut buf = [0u8; 16];
        let n = image.read_block(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"3-1.2");
        assert_eq!(image.read_block(&mut buf).unwrap(), 0);
    }

    #[test]
    fn file_image_reads_across_multiple_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        let mut f = File::create(&path).unwrap();
        let data = vec![0xABu8; 10];
        f.write_all(&data).unwrap();
        drop(f);

        let mut image = Image::from_path(&path);
        image.load().unwrap();
        assert_eq!(image.size(), 10);

        let mut total = Vec::new();
        let mut buf = [0u8; 4];
        loop {
            let n = image.read_block(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            total.extend_from_slice(&buf[..n]);
        }
        assert_eq!(total, data);
        assert_eq!(image.cursor(), 10);
    }

    #[test]
    fn name_is_derived_from_file_component() {
        let image = Image::from_path("/tmp/firmware/minildr.img");
        assert_eq!(image.name(), "minildr.img");
    }
}
