use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

pub const CREDENTIALS_FILE: &str = "credentials.json";

/// Opaque authentication material produced by a successful pairing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credentials(pub Value);

/// Shared credential store handle used by session providers.
pub type SharedCredentialStore = Arc<dyn CredentialStore>;

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self) -> Result<Option<Credentials>>;
    async fn save(&self, credentials: &Credentials) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}

/// Stores credentials as a JSON file inside a session directory.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(CREDENTIALS_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self) -> Result<Option<Credentials>> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<Credentials>> {
            if !path.exists() {
                return Ok(None);
            }
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("read credentials from {}", path.display()))?;
            if raw.trim().is_empty() {
                return Ok(None);
            }
            let credentials = serde_json::from_str(&raw)
                .with_context(|| format!("parse credentials in {}", path.display()))?;
            Ok(Some(credentials))
        })
        .await
        .context("credential load task failed")?
    }

    async fn save(&self, credentials: &Credentials) -> Result<()> {
        let path = self.path.clone();
        let payload =
            serde_json::to_vec_pretty(credentials).context("serialize credentials")?;
        tokio::task::spawn_blocking(move || -> Result<()> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create session dir {}", parent.display()))?;
            }
            // write-then-rename so a crash never leaves a half-written file
            let tmp = path.with_extension("json.tmp");
            fs::write(&tmp, &payload)
                .with_context(|| format!("write credentials to {}", tmp.display()))?;
            fs::rename(&tmp, &path)
                .with_context(|| format!("move credentials into {}", path.display()))?;
            Ok(())
        })
        .await
        .context("credential save task failed")?
    }

    async fn clear(&self) -> Result<()> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(err) => {
                    Err(err).with_context(|| format!("remove credentials at {}", path.display()))
                }
            }
        })
        .await
        .context("credential clear task failed")?
    }
}

#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    inner: RwLock<Option<Credentials>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credentials(credentials: Credentials) -> Self {
        Self {
            inner: RwLock::new(Some(credentials)),
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self) -> Result<Option<Credentials>> {
        Ok(self.inner.read().await.clone())
    }

    async fn save(&self, credentials: &Credentials) -> Result<()> {
        *self.inner.write().await = Some(credentials.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.inner.write().await.take();
        Ok(())
    }
}
