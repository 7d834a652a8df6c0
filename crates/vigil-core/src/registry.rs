//! On-disk identity registry.
//!
//! One NumPy `.npy` file per identity (`<name>.npy`, 1-D little-endian f32),
//! so templates written by the insightface tooling load unchanged.

use crate::types::{Embedding, IdentityTemplate};
use ndarray::Array1;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

const TEMPLATE_EXTENSION: &str = "npy";
const MAX_NAME_LEN: usize = 128;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("invalid identity name {0:?}: use letters, digits, space, '_', '-' or '.', not starting with '.'")]
    InvalidName(String),
    #[error("refusing to enroll {0:?}: embedding has zero magnitude")]
    DegenerateEmbedding(String),
    #[error("corrupt template {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("failed to write template {path}: {reason}")]
    Write { path: PathBuf, reason: String },
    #[error("registry I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RegistryError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Names become file names, so keep them to a conservative character set.
pub fn validate_name(name: &str) -> Result<(), RegistryError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && !name.starts_with('.')
        && name.trim() == name
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ' '));

    if valid {
        Ok(())
    } else {
        Err(RegistryError::InvalidName(name.to_string()))
    }
}

/// Enrolled identities loaded for one verification session.
///
/// Iteration is in lexicographic name order.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    templates: BTreeMap<String, Embedding>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, embedding: Embedding) {
        self.templates.insert(name.into(), embedding);
    }

    pub fn get(&self, name: &str) -> Option<&Embedding> {
        self.templates.get(name)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Embedding)> {
        self.templates.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl FromIterator<(String, Embedding)> for Registry {
    fn from_iter<I: IntoIterator<Item = (String, Embedding)>>(iter: I) -> Self {
        Self {
            templates: iter.into_iter().collect(),
        }
    }
}

/// Filesystem-backed template store rooted at one directory.
#[derive(Debug, Clone)]
pub struct RegistryStore {
    dir: PathBuf,
}

impl RegistryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn template_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.{TEMPLATE_EXTENSION}"))
    }

    /// Write (or overwrite) the template for `name`.
    ///
    /// The file is written beside its final location and renamed into place,
    /// so a reader never sees a half-written template.
    pub fn enroll(
        &self,
        name: &str,
        embedding: &Embedding,
    ) -> Result<IdentityTemplate, RegistryError> {
        validate_name(name)?;
        if embedding.is_degenerate() {
            return Err(RegistryError::DegenerateEmbedding(name.to_string()));
        }

        std::fs::create_dir_all(&self.dir).map_err(|e| RegistryError::io(&self.dir, e))?;

        let path = self.template_path(name);
        let tmp = path.with_extension(format!("{TEMPLATE_EXTENSION}.tmp"));
        let array = Array1::from_vec(embedding.values.clone());

        let written = ndarray_npy::write_npy(&tmp, &array)
            .map_err(|e| RegistryError::Write {
                path: tmp.clone(),
                reason: e.to_string(),
            })
            .and_then(|()| std::fs::rename(&tmp, &path).map_err(|e| RegistryError::io(&path, e)));
        if let Err(e) = written {
            let _ = std::fs::remove_file(&tmp);
            return Err(e);
        }

        tracing::info!(
            name,
            path = %path.display(),
            dims = embedding.len(),
            "identity enrolled"
        );

        Ok(IdentityTemplate {
            name: name.to_string(),
            embedding: embedding.clone(),
        })
    }

    /// Load every template in the store.
    ///
    /// A missing directory is a fresh install and yields an empty registry.
    /// Any unreadable template aborts the load.
    pub fn load_all(&self) -> Result<Registry, RegistryError> {
        if !self.dir.exists() {
            tracing::warn!(dir = %self.dir.display(), "no registry directory; starting empty");
            return Ok(Registry::new());
        }

        let mut registry = Registry::new();
        for path in self.template_files()? {
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let array: Array1<f32> =
                ndarray_npy::read_npy(&path).map_err(|e| RegistryError::Corrupt {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
            registry.insert(name, Embedding::new(array.to_vec()));
        }

        tracing::info!(
            count = registry.len(),
            names = ?registry.names().collect::<Vec<_>>(),
            "loaded registry"
        );
        Ok(registry)
    }

    /// Names of all enrolled identities, sorted.
    pub fn list(&self) -> Result<Vec<String>, RegistryError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut names: Vec<String> = self
            .template_files()?
            .iter()
            .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(str::to_string))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Delete the template for `name`. Returns false if it was not enrolled.
    pub fn remove(&self, name: &str) -> Result<bool, RegistryError> {
        validate_name(name)?;
        let path = self.template_path(name);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!(name, "identity removed");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(RegistryError::io(&path, e)),
        }
    }

    fn template_files(&self) -> Result<Vec<PathBuf>, RegistryError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| RegistryError::io(&self.dir, e))?;
        let mut files = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| RegistryError::io(&self.dir, e))?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == TEMPLATE_EXTENSION) {
                files.push(path);
            }
        }
        Ok(files)
    }
}
