//! Lazily allocated temporary files for one variable combination.
//!
//! `{TempFile.<attr>}` references allocate a uniquely named file the first
//! time `<attr>` is rendered and reuse that path for repeated references in
//! the same combination. Each combination gets a fresh allocator, so no
//! path crosses combinations. Names embed a uuid, which keeps allocation
//! collision-free across concurrently generating processes.

use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::path::PathBuf;

use tracing::debug;
use uuid::Uuid;

/// Where and how temporary files are named
#[derive(Debug, Clone, Default)]
pub struct TempSpec {
    /// Directory for allocated files; the system temp dir when unset
    pub dir: Option<PathBuf>,
    /// Filename prefix; the accessed attribute name when unset
    pub prefix: Option<String>,
    /// Filename suffix, e.g. `.log`
    pub suffix: Option<String>,
}

/// The allocator handed to one variable combination.
///
/// The populated map is snapshotted into the instance assignment once the
/// script is rendered; ownership of the files transfers to the instance.
#[derive(Debug)]
pub struct TempFiles {
    spec: TempSpec,
    files: BTreeMap<String, PathBuf>,
}

impl TempFiles {
    /// Create an empty allocator
    pub fn new(spec: &TempSpec) -> Self {
        Self {
            spec: spec.clone(),
            files: BTreeMap::new(),
        }
    }

    /// The path for `attr`, allocating (and creating) the file on first access
    pub fn path(&mut self, attr: &str) -> io::Result<PathBuf> {
        if let Some(path) = self.files.get(attr) {
            return Ok(path.clone());
        }
        let dir = self
            .spec
            .dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        let prefix = self.spec.prefix.as_deref().unwrap_or(attr);
        let suffix = self.spec.suffix.as_deref().unwrap_or("");
        let path = dir.join(format!("{prefix}-{}{suffix}", Uuid::new_v4()));
        File::create(&path)?;
        debug!(attr, path = %path.display(), "allocated temporary file");
        self.files.insert(attr.to_string(), path.clone());
        Ok(path)
    }

    /// Snapshot of every allocated path, keyed by attribute
    pub fn into_files(self) -> BTreeMap<String, PathBuf> {
        self.files
    }

    /// True if nothing was allocated
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_access_returns_same_path() {
        let mut tf = TempFiles::new(&TempSpec::default());
        let a = tf.path("log").unwrap();
        let b = tf.path("log").unwrap();
        assert_eq!(a, b);
        assert!(a.exists());
        std::fs::remove_file(a).unwrap();
    }

    #[test]
    fn distinct_attrs_get_distinct_paths() {
        let mut tf = TempFiles::new(&TempSpec::default());
        let a = tf.path("log").unwrap();
        let b = tf.path("out").unwrap();
        assert_ne!(a, b);
        std::fs::remove_file(a).unwrap();
        std::fs::remove_file(b).unwrap();
    }

    #[test]
    fn fresh_allocators_never_share_paths() {
        let mut one = TempFiles::new(&TempSpec::default());
        let mut two = TempFiles::new(&TempSpec::default());
        let a = one.path("log").unwrap();
        let b = two.path("log").unwrap();
        assert_ne!(a, b);
        std::fs::remove_file(a).unwrap();
        std::fs::remove_file(b).unwrap();
    }

    #[test]
    fn spec_controls_dir_and_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let spec = TempSpec {
            dir: Some(dir.path().to_path_buf()),
            prefix: Some("bench".to_string()),
            suffix: Some(".log".to_string()),
        };
        let mut tf = TempFiles::new(&spec);
        let path = tf.path("ignored_attr").unwrap();
        assert!(path.starts_with(dir.path()));
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("bench-"));
        assert!(name.ends_with(".log"));
    }
}
