//! Descriptors telling a [`Session`][crate::Session] how to obtain its [`Client`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::{Backend, Client, ClientParams, LlmError, LoadError};

/// Loads a backend from a model file.
pub type Loader<B> = Arc<dyn Fn(&Path, &ClientParams) -> Result<B, LoadError> + Send + Sync>;

/// Knows how to acquire a model and build a [`Client`] for it.
#[async_trait]
pub trait ModelProvider: Send + Sync + 'static {
    /// The backend the clients are built on.
    type Backend: Backend;

    /// Makes the model available locally (downloading it, for example). Idempotent.
    async fn prewarm(&self) -> Result<(), LlmError>;

    /// Builds a new client. Called at most once per session.
    async fn make_client(&self) -> Result<Client<Self::Backend>, LlmError>;
}

/// A model file already on disk.
pub struct LocalModel<B> {
    path: PathBuf,
    params: ClientParams,
    loader: Loader<B>,
}

impl<B: Backend> LocalModel<B> {
    /// Describes the model at `path`, loaded by `loader` with `params`.
    pub fn new<F>(path: impl Into<PathBuf>, params: ClientParams, loader: F) -> Self
    where
        F: Fn(&Path, &ClientParams) -> Result<B, LoadError> + Send + Sync + 'static,
    {
        Self {
            path: path.into(),
            params,
            loader: Arc::new(loader),
        }
    }
}

#[async_trait]
impl<B: Backend> ModelProvider for LocalModel<B> {
    type Backend = B;

    async fn prewarm(&self) -> Result<(), LlmError> {
        if self.path.exists() {
            Ok(())
        } else {
            Err(LoadError::DoesNotExist(self.path.clone()).into())
        }
    }

    async fn make_client(&self) -> Result<Client<B>, LlmError> {
        let loader = self.loader.clone();
        Client::load_from_file_async(&self.path, self.params.clone(), move |path, params| {
            loader(path, params)
        })
        .await
    }
}

/// A model whose clients are built by a closure, e.g. around an already loaded client.
pub struct FactoryModel<B: Backend> {
    factory: Arc<dyn Fn() -> Result<Client<B>, LlmError> + Send + Sync>,
}

impl<B: Backend> FactoryModel<B> {
    /// Builds clients with `factory`.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Result<Client<B>, LlmError> + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(factory),
        }
    }
}

#[async_trait]
impl<B: Backend> ModelProvider for FactoryModel<B> {
    type Backend = B;

    async fn prewarm(&self) -> Result<(), LlmError> {
        Ok(())
    }

    async fn make_client(&self) -> Result<Client<B>, LlmError> {
        let factory = self.factory.clone();
        tokio::task::spawn_blocking(move || factory())
            .await
            .map_err(|e| LoadError::Backend(format!("client factory failed: {e}")))?
    }
}

/// A model fetched from a remote source on first use.
#[cfg(feature = "download")]
pub struct DownloadModel<B> {
    downloader: crate::download::FileDownloader,
    model_file: String,
    projector_file: Option<String>,
    params: ClientParams,
    loader: Loader<B>,
}

#[cfg(feature = "download")]
impl<B: Backend> DownloadModel<B> {
    /// Describes `model_file` (and optionally a vision projector) within the downloader's
    /// destination, loaded by `loader` with `params`.
    pub fn new<F>(
        downloader: crate::download::FileDownloader,
        model_file: impl Into<String>,
        projector_file: Option<String>,
        params: ClientParams,
        loader: F,
    ) -> Self
    where
        F: Fn(&Path, &ClientParams) -> Result<B, LoadError> + Send + Sync + 'static,
    {
        Self {
            downloader,
            model_file: model_file.into(),
            projector_file,
            params,
            loader: Arc::new(loader),
        }
    }

    fn resolve(&self, destination: &Path, file: &str) -> PathBuf {
        if destination.is_dir() {
            destination.join(file)
        } else {
            destination.to_path_buf()
        }
    }
}

#[cfg(feature = "download")]
#[async_trait]
impl<B: Backend> ModelProvider for DownloadModel<B> {
    type Backend = B;

    async fn prewarm(&self) -> Result<(), LlmError> {
        self.downloader
            .ensure_available(|progress| debug!("Download progress: {:.1}%", progress * 100.0))
            .await?;
        Ok(())
    }

    async fn make_client(&self) -> Result<Client<B>, LlmError> {
        let destination = self.downloader.ensure_available(|_| {}).await?;

        let mut params = self.params.clone();
        if let Some(projector) = &self.projector_file {
            params.vision_projector = Some(self.resolve(&destination, projector));
        }

        let loader = self.loader.clone();
        Client::load_from_file_async(
            self.resolve(&destination, &self.model_file),
            params,
            move |path, params| loader(path, params),
        )
        .await
    }
}
