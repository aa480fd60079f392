//! Filesystem tree blob storage.
//!
//! Each object is stored in its own file. The encoded address is split into
//! `depth` leading segments of `dir_name_len` characters that name nested
//! directories; the remainder is the file name. Writes go to a sibling
//! `#`-suffixed temporary file that is renamed into place, so a reader never
//! observes a partially written object.

use crate::compression::Compressor;
use nodestore_common::config::FsTreeConfig;
use nodestore_common::{Address, Error, Object, Result};
use std::borrow::Cow;
use std::fs::{self, DirBuilder, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Storage type reported in logs and audit records
pub const TYPE: &str = "fstree";

/// Suffix of in-flight temporary files
const TEMP_SUFFIX: &str = "#";

/// Object read by an eager iteration
#[derive(Debug)]
pub struct IterationElement {
    pub address: Address,
    /// Decompressed raw object
    pub data: Vec<u8>,
    /// Always empty for the filesystem tree
    pub storage_id: Vec<u8>,
}

/// Loader passed to lazy handlers; returns the stored (possibly compressed) bytes
pub type Loader<'l> = &'l dyn Fn() -> Result<Vec<u8>>;

/// Per-object callback of an iteration
pub enum IterHandler<'a> {
    /// Called with the address and a loader; nothing is read unless asked
    Lazy(Box<dyn FnMut(&Address, Loader<'_>) -> Result<()> + 'a>),
    /// Called with the decompressed object data
    Eager(Box<dyn FnMut(IterationElement) -> Result<()> + 'a>),
}

/// Parameters of [`FsTree::iterate`]
pub struct IteratePrm<'a> {
    handler: IterHandler<'a>,
    ignore_errors: bool,
    error_handler: Option<Box<dyn FnMut(&Address, Error) -> Result<()> + 'a>>,
}

impl<'a> IteratePrm<'a> {
    pub fn lazy(f: impl FnMut(&Address, Loader<'_>) -> Result<()> + 'a) -> Self {
        Self {
            handler: IterHandler::Lazy(Box::new(f)),
            ignore_errors: false,
            error_handler: None,
        }
    }

    pub fn eager(f: impl FnMut(IterationElement) -> Result<()> + 'a) -> Self {
        Self {
            handler: IterHandler::Eager(Box::new(f)),
            ignore_errors: false,
            error_handler: None,
        }
    }

    /// Continue past unreadable directories and objects
    #[must_use]
    pub const fn ignore_errors(mut self, ignore: bool) -> Self {
        self.ignore_errors = ignore;
        self
    }

    /// Hook called for every skipped object; its own error aborts the walk
    #[must_use]
    pub fn on_error(mut self, f: impl FnMut(&Address, Error) -> Result<()> + 'a) -> Self {
        self.error_handler = Some(Box::new(f));
        self
    }
}

/// One-file-per-object storage rooted at a directory
#[derive(Debug)]
pub struct FsTree {
    root: PathBuf,
    depth: u64,
    dir_name_len: usize,
    permissions: u32,
    no_sync: bool,
    compressor: Compressor,
    read_only: AtomicBool,
}

fn map_write_error(e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::StorageFull {
        Error::DeviceFull
    } else {
        Error::Io(e)
    }
}

impl FsTree {
    /// Create a tree from configuration. Call [`FsTree::init`] before use.
    pub fn new(config: &FsTreeConfig, compressor: Compressor) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            root: config.path.clone(),
            depth: config.depth,
            dir_name_len: config.dir_name_len,
            permissions: config.permissions,
            no_sync: config.no_sync,
            compressor,
            read_only: AtomicBool::new(false),
        })
    }

    /// Create the root directory
    pub fn init(&self) -> Result<()> {
        DirBuilder::new()
            .recursive(true)
            .mode(self.permissions)
            .create(&self.root)?;
        info!("Initialized fstree at {}", self.root.display());
        Ok(())
    }

    /// Root directory
    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Relaxed);
    }

    pub fn read_only(&self) -> bool {
        self.read_only.load(Ordering::Relaxed)
    }

    /// Error reporting hook of the storage interface. The tree reports its
    /// only error through return values, so the hook is ignored.
    pub fn set_report_error_func(&self, _f: impl Fn(&str, &Error)) {}

    fn tree_path(&self, addr: &Address) -> PathBuf {
        let encoded = addr.encode_to_string();
        let mut rest = encoded.as_str();
        let mut path = self.root.clone();
        for _ in 0..self.depth {
            let (dir, tail) = rest.split_at(self.dir_name_len);
            path.push(dir);
            rest = tail;
        }
        path.push(rest);
        path
    }

    /// Store raw object data, compressing it unless `dont_compress` is set.
    pub fn put(&self, addr: &Address, data: &[u8], dont_compress: bool) -> Result<()> {
        if self.read_only() {
            return Err(Error::ReadOnly);
        }

        let path = self.tree_path(addr);
        if let Some(dir) = path.parent() {
            DirBuilder::new()
                .recursive(true)
                .mode(self.permissions)
                .create(dir)
                .map_err(map_write_error)?;
        }

        let data = if dont_compress {
            Cow::Borrowed(data)
        } else {
            self.compressor.compress(data)?
        };

        let mut tmp = path.clone().into_os_string();
        tmp.push(TEMP_SUFFIX);
        let tmp = PathBuf::from(tmp);

        let written = self
            .write_file(&tmp, &data)
            .and_then(|()| fs::rename(&tmp, &path).map_err(map_write_error));
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        Ok(())
    }

    fn write_file(&self, path: &Path, data: &[u8]) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(self.permissions)
            .open(path)
            .map_err(map_write_error)?;
        file.write_all(data).map_err(map_write_error)?;
        if !self.no_sync {
            file.sync_all().map_err(map_write_error)?;
        }
        Ok(())
    }

    /// Read and decompress the raw object data
    pub fn get_raw(&self, addr: &Address) -> Result<Vec<u8>> {
        let data = match fs::read(self.tree_path(addr)) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(Error::NotFound(*addr)),
            Err(e) => return Err(e.into()),
        };
        Ok(self.compressor.decompress(&data)?.into_owned())
    }

    pub fn get(&self, addr: &Address) -> Result<Object> {
        Object::unmarshal(&self.get_raw(addr)?)
    }

    /// Payload bytes `[offset, offset + length)`
    pub fn get_range(&self, addr: &Address, offset: u64, length: u64) -> Result<Vec<u8>> {
        let object = self.get(addr)?;
        Ok(object.payload_range(offset, length)?.to_vec())
    }

    pub fn delete(&self, addr: &Address) -> Result<()> {
        if self.read_only() {
            return Err(Error::ReadOnly);
        }
        match fs::remove_file(self.tree_path(addr)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::NotFound(*addr)),
            Err(e) => Err(e.into()),
        }
    }

    /// Check presence without reading the object
    pub fn exists(&self, addr: &Address) -> Result<bool> {
        Ok(self.tree_path(addr).try_exists()?)
    }

    /// Walk the tree calling the handler for every stored object.
    ///
    /// Entries that do not decode as addresses, including temporary files,
    /// are skipped. Handler errors always abort the walk.
    pub fn iterate(&self, mut prm: IteratePrm<'_>) -> Result<()> {
        self.iterate_dir(0, &self.root, "", &mut prm)
    }

    fn iterate_dir(
        &self,
        depth: u64,
        dir: &Path,
        prefix: &str,
        prm: &mut IteratePrm<'_>,
    ) -> Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(_) if prm.ignore_errors => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let is_last = depth >= self.depth;

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(_) if prm.ignore_errors => continue,
                Err(e) => return Err(e.into()),
            };
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let is_dir = entry.file_type().is_ok_and(|t| t.is_dir());
            let path = entry.path();

            if !is_last {
                if is_dir {
                    self.iterate_dir(depth + 1, &path, &format!("{prefix}{name}"), prm)?;
                }
                continue;
            }
            if is_dir {
                continue;
            }

            let Ok(addr) = Address::decode_str(&format!("{prefix}{name}")) else {
                debug!("Skipping foreign fstree entry {}", path.display());
                continue;
            };

            match &mut prm.handler {
                IterHandler::Lazy(handler) => {
                    let load = || -> Result<Vec<u8>> { Ok(fs::read(&path)?) };
                    handler(&addr, &load)?;
                }
                IterHandler::Eager(handler) => {
                    let data = fs::read(&path)
                        .map_err(Error::from)
                        .and_then(|raw| Ok(self.compressor.decompress(&raw)?.into_owned()));
                    match data {
                        Ok(data) => handler(IterationElement {
                            address: addr,
                            data,
                            storage_id: Vec::new(),
                        })?,
                        Err(e) if prm.ignore_errors => {
                            if let Some(on_error) = &mut prm.error_handler {
                                on_error(&addr, e)?;
                            }
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        Ok(())
    }

    /// Count every non-directory entry of the tree
    pub fn number_of_objects(&self) -> Result<u64> {
        let mut count = 0;
        for entry in WalkDir::new(&self.root) {
            let entry = entry.map_err(io::Error::from)?;
            if !entry.file_type().is_dir() {
                count += 1;
            }
        }
        Ok(count)
    }
}
