// src/resource.rs
//! Mapping request targets onto files under the document root.

use std::ffi::OsString;
use std::fs::{self, File};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::error::{SkiffError, SkiffResult};

/// World-readable permission bit.
const S_IROTH: u32 = 0o004;

/// A read-only view of a file's bytes.
///
/// The mapping is released when the value is dropped, so a connection that
/// leaves the file-serving state (by finishing, failing, or closing) unmaps
/// exactly once. Empty files carry no mapping at all.
pub struct MappedFile {
    map: Option<Mmap>,
}

impl MappedFile {
    fn open(path: &Path) -> SkiffResult<Self> {
        let map_err = |source| SkiffError::Map {
            path: path.to_path_buf(),
            source,
        };

        let file = File::open(path).map_err(map_err)?;
        let len = file.metadata().map_err(map_err)?.len();
        if len == 0 {
            return Ok(Self { map: None });
        }

        // SAFETY: the mapping is read-only. Truncation by another process
        // while we serve it is outside what a static file server guards against.
        let map = unsafe { Mmap::map(&file) }.map_err(map_err)?;
        Ok(Self { map: Some(map) })
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for MappedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedFile").field("len", &self.len()).finish()
    }
}

/// What a request target resolved to.
#[derive(Debug)]
pub enum Lookup {
    Missing,
    Forbidden,
    Directory,
    File(MappedFile),
}

/// Fixed filesystem prefix that every target is resolved under.
#[derive(Debug, Clone)]
pub struct DocumentRoot {
    root: PathBuf,
}

impl DocumentRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Plain concatenation: targets always start with `/`, so `Path::join`
    /// would discard the root.
    pub fn resolve(&self, target: &str) -> PathBuf {
        let mut full = OsString::from(self.root.as_os_str());
        full.push(target);
        PathBuf::from(full)
    }

    /// `stat` the target, check it may be served, then map it. Only regular
    /// files are mapped.
    ///
    /// Only the mapping step can fail; everything else is a [`Lookup`] the
    /// caller turns into a status code.
    pub fn lookup(&self, target: &str) -> SkiffResult<Lookup> {
        let path = self.resolve(target);
        let Ok(meta) = fs::metadata(&path) else {
            return Ok(Lookup::Missing);
        };

        if meta.permissions().mode() & S_IROTH == 0 {
            return Ok(Lookup::Forbidden);
        }
        if meta.is_dir() {
            return Ok(Lookup::Directory);
        }
        // FIFOs and device nodes would block `open` on the worker thread.
        if !meta.is_file() {
            return Ok(Lookup::Forbidden);
        }

        Ok(Lookup::File(MappedFile::open(&path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::Permissions;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, body: &[u8], mode: u32) {
        let path = dir.join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(body).unwrap();
        fs::set_permissions(&path, Permissions::from_mode(mode)).unwrap();
    }

    #[test]
    fn resolve_concatenates() {
        let root = DocumentRoot::new("/srv/www");
        assert_eq!(root.resolve("/index.html"), PathBuf::from("/srv/www/index.html"));
        assert_eq!(root.resolve("/"), PathBuf::from("/srv/www/"));
    }

    #[test]
    fn serves_world_readable_file() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "hello.txt", b"hello, world", 0o644);

        let root = DocumentRoot::new(dir.path());
        match root.lookup("/hello.txt").unwrap() {
            Lookup::File(file) => {
                assert_eq!(file.len(), 12);
                assert_eq!(file.as_bytes(), b"hello, world");
            }
            other => panic!("unexpected lookup {other:?}"),
        }
    }

    #[test]
    fn empty_file_has_no_mapping() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "empty", b"", 0o644);

        let root = DocumentRoot::new(dir.path());
        match root.lookup("/empty").unwrap() {
            Lookup::File(file) => {
                assert!(file.is_empty());
                assert_eq!(file.as_bytes(), b"");
            }
            other => panic!("unexpected lookup {other:?}"),
        }
    }

    #[test]
    fn missing_forbidden_and_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "secret", b"x", 0o600);
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::set_permissions(dir.path().join("sub"), Permissions::from_mode(0o755)).unwrap();

        let root = DocumentRoot::new(dir.path());
        assert!(matches!(root.lookup("/nope.html").unwrap(), Lookup::Missing));
        assert!(matches!(root.lookup("/secret").unwrap(), Lookup::Forbidden));
        assert!(matches!(root.lookup("/sub").unwrap(), Lookup::Directory));
    }

    #[test]
    fn fifo_is_forbidden_without_opening_it() {
        let dir = tempfile::tempdir().unwrap();
        let fifo = dir.path().join("pipe.html");
        let c_path = std::ffi::CString::new(fifo.as_os_str().as_encoded_bytes()).unwrap();
        assert_eq!(unsafe { libc::mkfifo(c_path.as_ptr(), 0o644) }, 0);
        fs::set_permissions(&fifo, Permissions::from_mode(0o644)).unwrap();

        // No writer ever opens the FIFO; reaching `open` would hang here.
        let root = DocumentRoot::new(dir.path());
        assert!(matches!(root.lookup("/pipe.html").unwrap(), Lookup::Forbidden));
    }
}
