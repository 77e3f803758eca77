//! Configuration loading and validation.
//!
//! Configuration is entirely environment-driven; parsing happens once at
//! startup and the resulting [`Config`] is handed to every component through
//! the application context.

use crate::error::{ConfigError, Result};
use std::path::{Path, PathBuf};

/// Top-level service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Document store endpoint, e.g. `mongodb://localhost:27017`.
    pub mongo_url: String,
    /// Document store database name.
    pub mongo_db: String,
    /// Vector store host.
    pub chroma_host: String,
    /// Vector store port.
    pub chroma_port: u16,
    /// Embedding service base URL, e.g. `http://localhost:11434`.
    pub ollama_url: String,
    /// Embedding model served by the endpoint.
    pub embedding_model: String,
    /// Root for `uploads/` (staged archives) and `extracts/<job_id>/`.
    pub data_dir: PathBuf,
    /// Root for uploaded-file attachments surfaced by the export.
    pub file_storage: PathBuf,
    /// HTTP listener bind address.
    pub bind: String,
    /// HTTP listener port.
    pub port: u16,
    /// Maximum number of concurrently advancing jobs.
    pub worker_pool_size: usize,
}

impl Config {
    /// Load configuration from environment variables, applying defaults for
    /// anything unset.
    pub fn from_env() -> Result<Self> {
        let chroma_port = match env_var("CHROMA_PORT")? {
            Some(raw) => raw.parse::<u16>().map_err(|_| {
                ConfigError::Invalid(format!("CHROMA_PORT is not a valid port: {raw}"))
            })?,
            None => 8000,
        };

        let port = match env_var("PORT")? {
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|_| ConfigError::Invalid(format!("PORT is not a valid port: {raw}")))?,
            None => 8080,
        };

        let data_dir = env_var("DATA_DIR")?
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data"));

        let file_storage = env_var("FILE_STORAGE")?
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("files"));

        let worker_pool_size = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Ok(Self {
            mongo_url: env_var("MONGO_URL")?
                .unwrap_or_else(|| "mongodb://localhost:27017".into()),
            mongo_db: env_var("MONGO_DB")?.unwrap_or_else(|| "slack_data".into()),
            chroma_host: env_var("CHROMA_HOST")?.unwrap_or_else(|| "localhost".into()),
            chroma_port,
            ollama_url: env_var("OLLAMA_URL")?
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_else(|| "http://localhost:11434".into()),
            embedding_model: env_var("EMBEDDING_MODEL")?
                .unwrap_or_else(|| "nomic-embed-text".into()),
            data_dir,
            file_storage,
            bind: env_var("BIND_ADDR")?.unwrap_or_else(|| "0.0.0.0".into()),
            port,
            worker_pool_size,
        })
    }

    /// Base URL of the vector store REST API.
    pub fn chroma_url(&self) -> String {
        format!("http://{}:{}", self.chroma_host, self.chroma_port)
    }

    /// Directory staged archives are written to.
    pub fn uploads_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }

    /// Extraction root for a job.
    pub fn extract_dir(&self, job_id: &str) -> PathBuf {
        self.data_dir.join("extracts").join(job_id)
    }

    /// Create the directories the service writes into.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.uploads_dir())?;
        std::fs::create_dir_all(self.data_dir.join("extracts"))?;
        std::fs::create_dir_all(&self.file_storage)?;
        Ok(())
    }
}

/// Read an environment variable, distinguishing unset from non-unicode.
fn env_var(name: &str) -> Result<Option<String>> {
    match std::env::var(name) {
        Ok(value) if value.is_empty() => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => {
            Err(ConfigError::NotUnicode(name.to_string()).into())
        }
    }
}

/// True when `candidate` is lexically inside `root`.
pub fn is_within(root: &Path, candidate: &Path) -> bool {
    candidate.starts_with(root)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            mongo_url: "mongodb://localhost:27017".into(),
            mongo_db: "slack_data".into(),
            chroma_host: "localhost".into(),
            chroma_port: 8000,
            ollama_url: "http://localhost:11434".into(),
            embedding_model: "nomic-embed-text".into(),
            data_dir: PathBuf::from("/tmp/slackvault-test"),
            file_storage: PathBuf::from("/tmp/slackvault-test/files"),
            bind: "127.0.0.1".into(),
            port: 8080,
            worker_pool_size: 4,
        }
    }

    #[test]
    fn chroma_url_joins_host_and_port() {
        let config = base_config();
        assert_eq!(config.chroma_url(), "http://localhost:8000");
    }

    #[test]
    fn extract_dir_is_per_job() {
        let config = base_config();
        assert_eq!(
            config.extract_dir("job-1"),
            PathBuf::from("/tmp/slackvault-test/extracts/job-1")
        );
        assert!(is_within(
            &config.data_dir.join("extracts"),
            &config.extract_dir("job-1")
        ));
    }
}
