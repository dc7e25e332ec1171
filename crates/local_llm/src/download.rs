//! Fetches model files into a local cache before they are loaded.
//!
//! Files are streamed into a `.part` sibling and renamed once complete, so an interrupted
//! download is never mistaken for a finished one.

use std::path::{Path, PathBuf};

use data_encoding::HEXLOWER;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::LoadError;

/// Where model files come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModelSource {
    /// Files of a Hugging Face repository.
    HuggingFace {
        /// The repository, e.g. `org/model-GGUF`.
        repo: String,
        /// The branch, tag or commit to fetch from.
        revision: String,
        /// The file names within the repository.
        files: Vec<String>,
    },

    /// A single file at a URL.
    Url(String),
}

impl ModelSource {
    /// Files of the `main` revision of `repo`.
    pub fn hugging_face(repo: impl Into<String>, files: Vec<String>) -> Self {
        Self::HuggingFace {
            repo: repo.into(),
            revision: "main".to_string(),
            files,
        }
    }

    /// The `(url, file name)` pairs to fetch.
    fn remote_files(&self) -> Vec<(String, String)> {
        match self {
            ModelSource::HuggingFace {
                repo,
                revision,
                files,
            } => files
                .iter()
                .map(|file| {
                    (
                        format!("https://huggingface.co/{repo}/resolve/{revision}/{file}"),
                        file.clone(),
                    )
                })
                .collect(),
            ModelSource::Url(url) => vec![(url.clone(), url_file_name(url))],
        }
    }
}

/// The last path segment of `url`, without query or fragment.
fn url_file_name(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    match path.rsplit('/').next() {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => "model".to_string(),
    }
}

/// Downloads a [`ModelSource`] into a cache directory.
#[derive(Clone, Debug)]
pub struct FileDownloader {
    source: ModelSource,
    root: PathBuf,
    client: reqwest::Client,
}

impl FileDownloader {
    /// A downloader caching into the user's cache directory, or the temporary directory if
    /// there is none.
    pub fn new(source: ModelSource) -> Self {
        let root = directories::ProjectDirs::from("", "", "local_llm")
            .map(|dirs| dirs.cache_dir().join("models"))
            .unwrap_or_else(|| std::env::temp_dir().join("local_llm").join("models"));

        Self::with_root(source, root)
    }

    /// A downloader caching into `root`.
    pub fn with_root(source: ModelSource, root: impl Into<PathBuf>) -> Self {
        Self {
            source,
            root: root.into(),
            client: reqwest::Client::new(),
        }
    }

    /// The source being downloaded.
    pub fn source(&self) -> &ModelSource {
        &self.source
    }

    /// The local path of the source: a directory for a repository, a file for a URL.
    pub fn destination(&self) -> PathBuf {
        match &self.source {
            ModelSource::HuggingFace { repo, .. } => self.root.join("huggingface").join(repo),
            ModelSource::Url(url) => {
                let hash = blake3::hash(url.as_bytes());
                self.root
                    .join("urls")
                    .join(HEXLOWER.encode(hash.as_bytes()))
                    .join(url_file_name(url))
            }
        }
    }

    fn local_path(&self, file: &str) -> PathBuf {
        match &self.source {
            ModelSource::HuggingFace { .. } => self.destination().join(file),
            ModelSource::Url(_) => self.destination(),
        }
    }

    /// Whether every file of the source is already in the cache.
    pub fn is_downloaded(&self) -> bool {
        self.source
            .remote_files()
            .iter()
            .all(|(_, file)| self.local_path(file).is_file())
    }

    /// Downloads whatever is missing and returns [`FileDownloader::destination`].
    ///
    /// `progress` receives the overall fraction done, in `[0, 1]`. Does nothing (besides
    /// reporting completion) if everything is already cached.
    pub async fn ensure_available<F>(&self, progress: F) -> Result<PathBuf, LoadError>
    where
        F: Fn(f64) + Send + Sync,
    {
        let destination = self.destination();
        let files = self.source.remote_files();
        let missing: Vec<_> = files
            .iter()
            .filter(|(_, file)| !self.local_path(file).is_file())
            .collect();

        if missing.is_empty() {
            debug!("Model already cached at {}", destination.display());
            progress(1.0);
            return Ok(destination);
        }

        let total = missing.len() as f64;
        for (index, (url, file)) in missing.into_iter().enumerate() {
            let done = index as f64;
            self.fetch(url, &self.local_path(file), |fraction| {
                progress((done + fraction) / total)
            })
            .await?;
        }

        progress(1.0);
        Ok(destination)
    }

    async fn fetch<F>(&self, url: &str, path: &Path, progress: F) -> Result<(), LoadError>
    where
        F: Fn(f64),
    {
        info!("Downloading {url} to {}", path.display());

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| download_error(url, e))?;
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| download_error(url, e))?;
        let length = response.content_length();

        let mut part = path.as_os_str().to_owned();
        part.push(".part");
        let part = PathBuf::from(part);

        let mut file = tokio::fs::File::create(&part)
            .await
            .map_err(|e| download_error(url, e))?;
        let mut received = 0u64;
        let mut body = response.bytes_stream();

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| download_error(url, e))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| download_error(url, e))?;

            received += chunk.len() as u64;
            if let Some(length) = length.filter(|length| *length > 0) {
                progress((received as f64 / length as f64).min(1.0));
            }
        }

        file.flush().await.map_err(|e| download_error(url, e))?;
        drop(file);

        tokio::fs::rename(&part, path)
            .await
            .map_err(|e| download_error(url, e))?;
        debug!("Downloaded {received} bytes from {url}");

        Ok(())
    }
}

fn download_error(url: &str, error: impl std::fmt::Display) -> LoadError {
    LoadError::Download(format!("{url}: {error}"))
}
