//-
// Copyright (c) 2020, 2026, Jason Lingle
//
// This file is part of Rookery.
//
// Rookery is free software: you can redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Rookery is distributed in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Rookery. If not, see <http://www.gnu.org/licenses/>.

//! The tree of compressed message bodies.
//!
//! Each body lives at `YYYY/MM/DD/<id>.eml.gz` under the blob root, keyed by
//! the day it was written. Files are only ever created whole: the compressed
//! data is staged in a `.tmp` sibling, fsynced, then renamed into place, so a
//! reader never observes a partial blob.

use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Component, Path, PathBuf};

use chrono::prelude::*;
use flate2::{read::GzDecoder, write::GzEncoder, Compression};

use crate::support::{
    error::Error,
    file_ops::{self, IgnoreKinds},
    metrics::{self, Counter},
};

const FILE_MODE: u32 = 0o640;
const DIR_MODE: u32 = 0o750;

#[derive(Clone, Debug)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();
        file_ops::mkdirs(&root, DIR_MODE).map_err(storage_failure)?;
        Ok(Self { root })
    }

    /// Durably write `data` as the blob for `id`, returning the path of the
    /// blob relative to the root.
    ///
    /// On failure, nothing is left behind except possibly the date
    /// directories.
    pub fn write_blob(&self, id: &str, data: &[u8]) -> Result<String, Error> {
        tally(
            self.write_blob_at("", id, data, Utc::now()),
            Counter::StorageWrites,
        )
    }

    /// Like `write_blob`, but places the blob in the `outbound/` subtree used
    /// by the delivery queue.
    pub fn write_outbound_blob(
        &self,
        id: &str,
        data: &[u8],
    ) -> Result<String, Error> {
        tally(
            self.write_blob_at("outbound/", id, data, Utc::now()),
            Counter::StorageWrites,
        )
    }

    fn write_blob_at(
        &self,
        prefix: &str,
        id: &str,
        data: &[u8],
        now: DateTime<Utc>,
    ) -> Result<String, Error> {
        if id.is_empty()
            || id.contains(|c: char| !c.is_ascii_alphanumeric() && c != '-')
        {
            return Err(Error::StorageFailure(format!("unsafe blob id {id:?}")));
        }

        let relative =
            format!("{prefix}{}/{id}.eml.gz", now.format("%Y/%m/%d"));
        let path = self.root.join(&relative);
        if let Some(parent) = path.parent() {
            file_ops::mkdirs(parent, DIR_MODE).map_err(storage_failure)?;
        }

        let mut encoder = GzEncoder::new(
            Vec::with_capacity(data.len() / 2),
            Compression::default(),
        );
        encoder.write_all(data).map_err(storage_failure)?;
        let compressed = encoder.finish().map_err(storage_failure)?;

        file_ops::spit(&path, false, FILE_MODE, &compressed).map_err(|e| {
            if io::ErrorKind::AlreadyExists == e.kind() {
                Error::AlreadyExists
            } else {
                storage_failure(e)
            }
        })?;

        Ok(relative)
    }

    /// Read and decompress the blob at `relative`.
    pub fn read_blob(&self, relative: &str) -> Result<Vec<u8>, Error> {
        tally(self.read_blob_at(relative), Counter::StorageReads)
    }

    fn read_blob_at(&self, relative: &str) -> Result<Vec<u8>, Error> {
        let path = self.resolve(relative)?;
        let file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if io::ErrorKind::NotFound == e.kind() => {
                return Err(Error::NotFound)
            },
            Err(e) => return Err(storage_failure(e)),
        };

        let mut data = Vec::new();
        GzDecoder::new(io::BufReader::new(file))
            .read_to_end(&mut data)
            .map_err(storage_failure)?;
        Ok(data)
    }

    /// Remove the blob at `relative`. Removing a blob which does not exist
    /// succeeds.
    pub fn delete_blob(&self, relative: &str) -> Result<(), Error> {
        let path = self.resolve(relative)?;
        fs::remove_file(path)
            .ignore_not_found()
            .map_err(storage_failure)
    }

    /// Copy the whole tree into `dst`, which must not exist yet, skipping
    /// blobs still being staged. Returns the number of blobs copied.
    pub fn copy_tree(&self, dst: &Path) -> Result<usize, Error> {
        fs::DirBuilder::new()
            .mode(PRIVATE_DIR_MODE)
            .create(dst)
            .map_err(storage_failure)?;
        copy_dir(&self.root, dst).map_err(storage_failure)
    }

    pub fn exists(&self, relative: &str) -> bool {
        self.resolve(relative).map_or(false, |p| p.is_file())
    }

    fn resolve(&self, relative: &str) -> Result<PathBuf, Error> {
        let rel = Path::new(relative);
        if relative.is_empty()
            || !rel.components().all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(Error::NotFound);
        }

        Ok(self.root.join(rel))
    }
}

const PRIVATE_DIR_MODE: u32 = 0o700;
const PRIVATE_FILE_MODE: u32 = 0o600;

fn copy_dir(src: &Path, dst: &Path) -> io::Result<usize> {
    let mut copied = 0;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            fs::DirBuilder::new().mode(PRIVATE_DIR_MODE).create(&to)?;
            copied += copy_dir(&from, &to)?;
        } else if file_type.is_file()
            && from.extension().map_or(true, |ext| "tmp" != ext)
        {
            fs::copy(&from, &to)?;
            file_ops::chmod(&to, PRIVATE_FILE_MODE)?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Count the outcome of a blob operation. Missing and duplicate blobs are
/// the caller's concern, not storage failures.
fn tally<T>(result: Result<T, Error>, done: Counter) -> Result<T, Error> {
    match result {
        Ok(_) => metrics::incr(done),
        Err(Error::NotFound) | Err(Error::AlreadyExists) => {},
        Err(_) => metrics::incr(Counter::StorageErrors),
    }
    result
}

fn storage_failure(e: io::Error) -> Error {
    Error::StorageFailure(e.to_string())
}
