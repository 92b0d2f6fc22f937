//! On-disk layout for downloaded map files.
//!
//! A region's bytes live under a single maps directory. While a download
//! is in flight the bytes accumulate in `<region>.mwm.downloading`; only
//! after the final byte is confirmed is the file atomically renamed to
//! `<region>.mwm`. The partial file is the resume anchor across process
//! restarts and is never deleted on cancel or failure; only an explicit
//! region delete removes it.
//!
//! A small `<region>.version` sidecar records the data version that was
//! downloaded, so the model can flag regions as updatable when the region
//! list advertises a newer one.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Extension of a finished map file.
const MAP_FILE_EXT: &str = "mwm";

/// Suffix appended to a map file name while it is being downloaded.
const DOWNLOADING_SUFFIX: &str = "downloading";

/// Extension of the sidecar recording the downloaded data version.
const VERSION_FILE_EXT: &str = "version";

/// Filesystem view of the map set for one maps directory.
#[derive(Debug, Clone)]
pub struct MapFilesStore {
    root: PathBuf,
}

impl MapFilesStore {
    /// Opens (creating if needed) the maps directory.
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Directory all map files live under.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the finished map file for a region.
    pub fn map_path(&self, region_id: &str) -> PathBuf {
        self.root.join(format!("{region_id}.{MAP_FILE_EXT}"))
    }

    /// Path of the in-flight partial file for a region.
    pub fn partial_path(&self, region_id: &str) -> PathBuf {
        self.root
            .join(format!("{region_id}.{MAP_FILE_EXT}.{DOWNLOADING_SUFFIX}"))
    }

    fn version_path(&self, region_id: &str) -> PathBuf {
        self.root.join(format!("{region_id}.{VERSION_FILE_EXT}"))
    }

    /// Whether the finished map file exists.
    pub fn has_map(&self, region_id: &str) -> bool {
        self.map_path(region_id).is_file()
    }

    /// Size of the partial file, or 0 when none exists. This is the
    /// resume offset for the next download attempt.
    pub fn partial_size(&self, region_id: &str) -> u64 {
        fs::metadata(self.partial_path(region_id))
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Data version recorded when the region was last downloaded, if any.
    pub fn local_version(&self, region_id: &str) -> Option<u64> {
        let raw = fs::read_to_string(self.version_path(region_id)).ok()?;
        raw.trim().parse().ok()
    }

    /// Promotes the partial file to the finished name and records the
    /// downloaded data version. The rename is atomic on the filesystems
    /// we care about; a finished file either exists completely or not at
    /// all.
    pub fn promote(&self, region_id: &str, version: u64) -> io::Result<()> {
        let partial = self.partial_path(region_id);
        let target = self.map_path(region_id);
        fs::rename(&partial, &target)?;
        fs::write(self.version_path(region_id), format!("{version}\n"))?;
        debug!(region = region_id, version, "promoted partial map file");
        Ok(())
    }

    /// Removes the finished file, any partial file and the version
    /// sidecar. Missing files are not an error; the caller only cares
    /// that nothing is left afterwards.
    pub fn delete_region(&self, region_id: &str) -> io::Result<()> {
        for path in [
            self.map_path(region_id),
            self.partial_path(region_id),
            self.version_path(region_id),
        ] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to remove map file");
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

/// Free-space probe, behind a trait so tests and the migration
/// controller can inject fixed answers.
pub trait FreeSpace: Send + Sync {
    /// Free bytes available to unprivileged writes at `path`.
    fn free_bytes(&self, path: &Path) -> io::Result<u64>;
}

/// `statvfs`-backed probe used in production.
#[derive(Debug, Default)]
pub struct StatvfsFreeSpace;

impl FreeSpace for StatvfsFreeSpace {
    fn free_bytes(&self, path: &Path) -> io::Result<u64> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn store() -> (TempDir, MapFilesStore) {
        let dir = TempDir::new().unwrap();
        let store = MapFilesStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_partial_size_zero_without_file() {
        let (_dir, store) = store();
        assert_eq!(store.partial_size("France"), 0);
        assert!(!store.has_map("France"));
    }

    #[test]
    fn test_promote_renames_partial_and_records_version() {
        let (_dir, store) = store();
        let mut f = fs::File::create(store.partial_path("France")).unwrap();
        f.write_all(b"map bytes").unwrap();
        drop(f);

        store.promote("France", 170101).unwrap();

        assert!(store.has_map("France"));
        assert_eq!(store.partial_size("France"), 0);
        assert_eq!(store.local_version("France"), Some(170101));
        assert_eq!(fs::read(store.map_path("France")).unwrap(), b"map bytes");
    }

    #[test]
    fn test_delete_region_removes_everything_and_tolerates_missing() {
        let (_dir, store) = store();
        fs::write(store.map_path("Spain"), b"x").unwrap();
        fs::write(store.partial_path("Spain"), b"y").unwrap();

        store.delete_region("Spain").unwrap();
        assert!(!store.has_map("Spain"));
        assert_eq!(store.partial_size("Spain"), 0);

        // Second delete is a no-op, not an error.
        store.delete_region("Spain").unwrap();
    }

    #[test]
    fn test_statvfs_reports_nonzero_for_tempdir() {
        let (dir, _store) = store();
        let free = StatvfsFreeSpace.free_bytes(dir.path()).unwrap();
        assert!(free > 0);
    }
}
