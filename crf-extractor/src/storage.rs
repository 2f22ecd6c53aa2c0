//! Persistência de artefatos treinados.
//!
//! Um [`Resource`] identifica um componente treinado; cada recurso guarda
//! vários blobs nomeados (metadados e um modelo por canal). A interface
//! [`ModelStorage`] isola o extrator do meio de armazenamento;
//! [`FileModelStorage`] grava cada recurso em um diretório.

use std::fmt;
use std::fs;
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Nome de um componente treinado dentro do armazenamento.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resource(String);

impl Resource {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Armazenamento de blobs por recurso.
pub trait ModelStorage: Send + Sync {
    fn write_blob(&self, resource: &Resource, blob: &str, data: &[u8]) -> Result<()>;

    /// Falha com [`Error::Storage`] se o blob não existe.
    fn read_blob(&self, resource: &Resource, blob: &str) -> Result<Vec<u8>>;
}

/// Serializa `value` em JSON e grava como blob.
pub fn write_json<T: Serialize>(
    storage: &dyn ModelStorage,
    resource: &Resource,
    blob: &str,
    value: &T,
) -> Result<()> {
    let data = serde_json::to_vec(value).map_err(|e| Error::storage(resource.name(), e))?;
    storage.write_blob(resource, blob, &data)
}

/// Lê um blob e o desserializa de JSON.
pub fn read_json<T: DeserializeOwned>(
    storage: &dyn ModelStorage,
    resource: &Resource,
    blob: &str,
) -> Result<T> {
    let data = storage.read_blob(resource, blob)?;
    serde_json::from_slice(&data)
        .map_err(|e| Error::storage(resource.name(), format!("blob '{blob}' corrompido: {e}")))
}

/// Um diretório por recurso, um arquivo por blob.
#[derive(Debug, Clone)]
pub struct FileModelStorage {
    root: PathBuf,
}

impl FileModelStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn blob_path(&self, resource: &Resource, blob: &str) -> PathBuf {
        self.root.join(resource.name()).join(blob)
    }
}

impl ModelStorage for FileModelStorage {
    fn write_blob(&self, resource: &Resource, blob: &str, data: &[u8]) -> Result<()> {
        let path = self.blob_path(resource, blob);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::storage(resource.name(), e))?;
        }
        fs::write(&path, data).map_err(|e| Error::storage(resource.name(), e))?;
        debug!(path = %path.display(), bytes = data.len(), "blob gravado");
        Ok(())
    }

    fn read_blob(&self, resource: &Resource, blob: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(resource, blob);
        fs::read(&path).map_err(|e| {
            Error::storage(resource.name(), format!("'{}': {e}", path.display()))
        })
    }
}
