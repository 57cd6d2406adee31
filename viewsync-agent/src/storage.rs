use std::{
    collections::{BTreeMap, BTreeSet},
    fs, io,
    path::{Component, Path, PathBuf},
};

use thiserror::Error;
use viewsync_core::{MAX_RECORD_BYTES, normalize_path, parent_folder};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no file at {0}")]
    NotFound(String),
    #[error("{path} is {size} bytes (max {max})")]
    TooLarge { path: String, size: u64, max: u64 },
    #[error("invalid storage path {0:?}")]
    InvalidPath(String),
    #[error("{op} {path} failed: {source}")]
    Io {
        op: &'static str,
        path: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageEvent {
    Modified(String),
    Renamed { from: String, to: String },
}

pub trait Storage {
    fn read(&self, path: &str) -> Result<String, StorageError>;

    fn is_file(&self, path: &str) -> bool;

    fn exists(&self, path: &str) -> bool;

    /// Create a new file. The parent folder must already exist.
    fn create(&mut self, path: &str, text: &str) -> Result<(), StorageError>;

    fn modify(&mut self, path: &str, text: &str) -> Result<(), StorageError>;

    fn create_folder(&mut self, path: &str) -> Result<(), StorageError>;

    fn rename(&mut self, from: &str, to: &str) -> Result<(), StorageError>;
}

pub fn write_file<S: Storage + ?Sized>(
    storage: &mut S,
    path: &str,
    text: &str,
) -> Result<(), StorageError> {
    if path.is_empty() {
        return Err(StorageError::InvalidPath(path.to_owned()));
    }

    if storage.is_file(path) {
        return storage.modify(path, text);
    }

    if let Some(folder) = parent_folder(path)
        && !storage.exists(folder)
    {
        storage.create_folder(folder)?;
    }

    storage.create(path, text)
}

pub fn move_file<S: Storage + ?Sized>(
    storage: &mut S,
    from: &str,
    to: &str,
) -> Result<(), StorageError> {
    if let Some(folder) = parent_folder(to)
        && !storage.exists(folder)
    {
        storage.create_folder(folder)?;
    }
    storage.rename(from, to)
}

#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref();
        let display = root.display().to_string();
        fs::create_dir_all(root).map_err(|source| StorageError::Io {
            op: "create root",
            path: display.clone(),
            source,
        })?;
        let root = fs::canonicalize(root).map_err(|source| StorageError::Io {
            op: "canonicalize root",
            path: display,
            source,
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn relative(&self, absolute: &Path) -> Option<String> {
        relative_path(&self.root, absolute)
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let normalized = normalize_path(path);
        if normalized.is_empty() || normalized.split('/').any(|segment| segment == "..") {
            return Err(StorageError::InvalidPath(path.to_owned()));
        }
        Ok(normalized
            .split('/')
            .fold(self.root.clone(), |acc, segment| acc.join(segment)))
    }

    fn write_atomic(&self, path: &str, text: &str) -> Result<(), StorageError> {
        let target = self.resolve(path)?;
        let mut tmp_name = target.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp");
        let tmp = target.with_file_name(tmp_name);

        fs::write(&tmp, text.as_bytes()).map_err(|source| StorageError::Io {
            op: "write",
            path: tmp.display().to_string(),
            source,
        })?;
        fs::rename(&tmp, &target).map_err(|source| {
            let _ = fs::remove_file(&tmp);
            StorageError::Io {
                op: "rename",
                path: path.to_owned(),
                source,
            }
        })
    }
}

pub fn relative_path(root: &Path, absolute: &Path) -> Option<String> {
    let rest = absolute.strip_prefix(root).ok()?;
    let segments: Vec<String> = rest
        .components()
        .map(|component| match component {
            Component::Normal(segment) => Some(segment.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Option<_>>()?;
    let path = normalize_path(&segments.join("/"));
    (!path.is_empty()).then_some(path)
}

impl Storage for FsStorage {
    fn read(&self, path: &str) -> Result<String, StorageError> {
        let full = self.resolve(path)?;
        let io_error = |op, source: io::Error| match source.kind() {
            io::ErrorKind::NotFound => StorageError::NotFound(path.to_owned()),
            _ => StorageError::Io {
                op,
                path: path.to_owned(),
                source,
            },
        };

        let size = fs::metadata(&full)
            .map_err(|source| io_error("stat", source))?
            .len();
        if size > MAX_RECORD_BYTES as u64 {
            return Err(StorageError::TooLarge {
                path: path.to_owned(),
                size,
                max: MAX_RECORD_BYTES as u64,
            });
        }
        fs::read_to_string(&full).map_err(|source| io_error("read", source))
    }

    fn is_file(&self, path: &str) -> bool {
        self.resolve(path).is_ok_and(|full| full.is_file())
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).is_ok_and(|full| full.exists())
    }

    fn create(&mut self, path: &str, text: &str) -> Result<(), StorageError> {
        let normalized = normalize_path(path);
        if let Some(folder) = parent_folder(&normalized)
            && !self.exists(folder)
        {
            return Err(StorageError::NotFound(folder.to_owned()));
        }
        self.write_atomic(path, text)
    }

    fn modify(&mut self, path: &str, text: &str) -> Result<(), StorageError> {
        if !self.is_file(path) {
            return Err(StorageError::NotFound(path.to_owned()));
        }
        self.write_atomic(path, text)
    }

    fn create_folder(&mut self, path: &str) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        fs::create_dir_all(&full).map_err(|source| StorageError::Io {
            op: "create folder",
            path: path.to_owned(),
            source,
        })
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), StorageError> {
        let source_path = self.resolve(from)?;
        let target_path = self.resolve(to)?;
        if !source_path.exists() {
            return Err(StorageError::NotFound(from.to_owned()));
        }
        fs::rename(&source_path, &target_path).map_err(|source| StorageError::Io {
            op: "rename",
            path: from.to_owned(),
            source,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    files: BTreeMap<String, String>,
    folders: BTreeSet<String>,
    writes: usize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_count(&self) -> usize {
        self.writes
    }

    pub fn put(&mut self, path: &str, text: &str) {
        let path = normalize_path(path);
        if let Some(folder) = parent_folder(&path) {
            self.insert_folder(folder);
        }
        self.files.insert(path, text.to_owned());
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.files.get(&normalize_path(path)).map(String::as_str)
    }

    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    fn insert_folder(&mut self, folder: &str) {
        let mut prefix = String::new();
        for segment in folder.split('/') {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(segment);
            self.folders.insert(prefix.clone());
        }
    }
}

impl Storage for MemoryStorage {
    fn read(&self, path: &str) -> Result<String, StorageError> {
        self.get(path)
            .map(str::to_owned)
            .ok_or_else(|| StorageError::NotFound(path.to_owned()))
    }

    fn is_file(&self, path: &str) -> bool {
        self.files.contains_key(&normalize_path(path))
    }

    fn exists(&self, path: &str) -> bool {
        let path = normalize_path(path);
        self.files.contains_key(&path) || self.folders.contains(&path)
    }

    fn create(&mut self, path: &str, text: &str) -> Result<(), StorageError> {
        let path = normalize_path(path);
        if path.is_empty() {
            return Err(StorageError::InvalidPath(path));
        }
        if let Some(folder) = parent_folder(&path)
            && !self.folders.contains(folder)
        {
            return Err(StorageError::NotFound(folder.to_owned()));
        }
        self.files.insert(path, text.to_owned());
        self.writes += 1;
        Ok(())
    }

    fn modify(&mut self, path: &str, text: &str) -> Result<(), StorageError> {
        let path = normalize_path(path);
        let Some(content) = self.files.get_mut(&path) else {
            return Err(StorageError::NotFound(path));
        };
        *content = text.to_owned();
        self.writes += 1;
        Ok(())
    }

    fn create_folder(&mut self, path: &str) -> Result<(), StorageError> {
        let path = normalize_path(path);
        if path.is_empty() {
            return Err(StorageError::InvalidPath(path));
        }
        self.insert_folder(&path);
        Ok(())
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), StorageError> {
        let from = normalize_path(from);
        let to = normalize_path(to);
        if to.is_empty() {
            return Err(StorageError::InvalidPath(to));
        }
        let content = self
            .files
            .remove(&from)
            .ok_or_else(|| StorageError::NotFound(from.clone()))?;
        self.files.insert(to, content);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_file_creates_missing_folders() {
        let mut storage = MemoryStorage::new();
        write_file(&mut storage, "sync/devices/a.json", "{}").unwrap();
        assert!(storage.exists("sync"));
        assert!(storage.exists("sync/devices"));
        assert_eq!(storage.get("sync/devices/a.json"), Some("{}"));
        assert_eq!(storage.write_count(), 1);
    }

    #[test]
    fn write_file_overwrites_existing() {
        let mut storage = MemoryStorage::new();
        write_file(&mut storage, "a.json", "1").unwrap();
        write_file(&mut storage, "a.json", "2").unwrap();
        assert_eq!(storage.get("a.json"), Some("2"));
        assert_eq!(storage.write_count(), 2);
    }

    #[test]
    fn write_file_rejects_empty_path() {
        let mut storage = MemoryStorage::new();
        assert!(matches!(
            write_file(&mut storage, "", "x"),
            Err(StorageError::InvalidPath(_))
        ));
        assert_eq!(storage.write_count(), 0);
    }

    #[test]
    fn create_without_folder_fails() {
        let mut storage = MemoryStorage::new();
        assert!(matches!(
            storage.create("missing/a.json", "x"),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn move_file_creates_destination_folder() {
        let mut storage = MemoryStorage::new();
        storage.put("a.json", "x");
        move_file(&mut storage, "a.json", "archive/b.json").unwrap();
        assert_eq!(storage.get("archive/b.json"), Some("x"));
        assert!(!storage.is_file("a.json"));
    }

    #[test]
    fn relative_path_strips_root() {
        let root = Path::new("/vault");
        assert_eq!(
            relative_path(root, Path::new("/vault/sync/a.json")),
            Some("sync/a.json".to_owned())
        );
        assert_eq!(relative_path(root, Path::new("/elsewhere/a.json")), None);
        assert_eq!(relative_path(root, Path::new("/vault")), None);
    }
}
