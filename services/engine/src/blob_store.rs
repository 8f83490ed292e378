//! The blob store interface: reading dataset files off disk and
//! decoding them into ordered row maps. CSV/TSV use the `csv` crate
//! (matching the pack's own choice for tabular parsing); JSON uses
//! `serde_json`, wrapping a singleton object into a 1-element list.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use engine_proto::indexmap_compat::IndexMap;
use engine_proto::DatasetFormat;

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("reading dataset file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing dataset file '{path}': {message}")]
    Parse { path: String, message: String },
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Read and parse a dataset file into its ordered rows. Relative
    /// paths are resolved under the configured base directory; absolute
    /// paths are used as-is.
    async fn read_dataset(&self, file_path: &str, format: DatasetFormat) -> Result<Vec<IndexMap>, BlobError>;

    /// An mtime+size fingerprint for change detection.
    async fn file_hash(&self, file_path: &str) -> Result<String, BlobError>;
}

pub struct FsBlobStore {
    base_dir: PathBuf,
    /// Legacy workspace prefixes rewritten to `base_dir`.
    legacy_prefixes: Vec<String>,
    delimiter: u8,
}

impl FsBlobStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            legacy_prefixes: vec!["/workspace/datasets/".to_owned(), "workspace/datasets/".to_owned()],
            delimiter: b',',
        }
    }

    fn resolve(&self, file_path: &str) -> PathBuf {
        let mut rewritten = file_path.to_owned();
        for prefix in &self.legacy_prefixes {
            if let Some(stripped) = rewritten.strip_prefix(prefix.as_str()) {
                rewritten = stripped.to_owned();
                break;
            }
        }
        let path = Path::new(&rewritten);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    fn parse_delimited(bytes: &[u8], delimiter: u8, path: &str) -> Result<Vec<IndexMap>, BlobError> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .from_reader(bytes);
        let headers = reader
            .headers()
            .map_err(|e| BlobError::Parse {
                path: path.to_owned(),
                message: e.to_string(),
            })?
            .clone();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| BlobError::Parse {
                path: path.to_owned(),
                message: e.to_string(),
            })?;
            let mut row = IndexMap::new();
            for (header, value) in headers.iter().zip(record.iter()) {
                row.insert(header, serde_json::Value::String(value.to_owned()));
            }
            rows.push(row);
        }
        Ok(rows)
    }

    fn parse_json(bytes: &[u8], path: &str) -> Result<Vec<IndexMap>, BlobError> {
        let value: serde_json::Value = serde_json::from_slice(bytes).map_err(|e| BlobError::Parse {
            path: path.to_owned(),
            message: e.to_string(),
        })?;
        let objects = match value {
            serde_json::Value::Array(items) => items,
            obj @ serde_json::Value::Object(_) => vec![obj],
            other => {
                return Err(BlobError::Parse {
                    path: path.to_owned(),
                    message: format!("expected array or object, got {other}"),
                })
            }
        };

        objects
            .into_iter()
            .map(|item| match item {
                serde_json::Value::Object(map) => Ok(map.into_iter().collect::<IndexMap>()),
                other => Err(BlobError::Parse {
                    path: path.to_owned(),
                    message: format!("expected object row, got {other}"),
                }),
            })
            .collect()
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn read_dataset(&self, file_path: &str, format: DatasetFormat) -> Result<Vec<IndexMap>, BlobError> {
        let path = self.resolve(file_path);
        let bytes = tokio::fs::read(&path).await.map_err(|source| BlobError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let display = path.display().to_string();
        match format {
            DatasetFormat::Csv => Self::parse_delimited(&bytes, self.delimiter, &display),
            DatasetFormat::Tsv => Self::parse_delimited(&bytes, b'\t', &display),
            DatasetFormat::Json => Self::parse_json(&bytes, &display),
        }
    }

    async fn file_hash(&self, file_path: &str) -> Result<String, BlobError> {
        let path = self.resolve(file_path);
        let meta = tokio::fs::metadata(&path).await.map_err(|source| BlobError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Ok(format!("{mtime}:{}", meta.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn csv_rows_preserve_column_order() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("rows.csv");
        tokio::fs::write(&file, "v,label\n10,a\n20,b\n").await.unwrap();
        let store = FsBlobStore::new(dir.path());
        let rows = store
            .read_dataset(file.to_str().unwrap(), DatasetFormat::Csv)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("v").unwrap(), "10");
        assert_eq!(rows[0].get("label").unwrap(), "a");
    }

    #[tokio::test]
    async fn tsv_uses_tab_delimiter() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("rows.tsv");
        tokio::fs::write(&file, "v\tlabel\n10\ta\n").await.unwrap();
        let store = FsBlobStore::new(dir.path());
        let rows = store
            .read_dataset(file.to_str().unwrap(), DatasetFormat::Tsv)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("v").unwrap(), "10");
    }

    #[tokio::test]
    async fn json_singleton_object_wraps_to_one_row() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("row.json");
        tokio::fs::write(&file, r#"{"v": 10}"#).await.unwrap();
        let store = FsBlobStore::new(dir.path());
        let rows = store
            .read_dataset(file.to_str().unwrap(), DatasetFormat::Json)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn json_array_of_objects_is_one_row_each() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("rows.json");
        tokio::fs::write(&file, r#"[{"v": 1}, {"v": 2}, {"v": 3}]"#).await.unwrap();
        let store = FsBlobStore::new(dir.path());
        let rows = store
            .read_dataset(file.to_str().unwrap(), DatasetFormat::Json)
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
    }

    #[tokio::test]
    async fn relative_paths_resolve_under_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("rows.csv"), "v\n1\n").await.unwrap();
        let store = FsBlobStore::new(dir.path());
        let rows = store.read_dataset("rows.csv", DatasetFormat::Csv).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn file_hash_changes_when_content_changes() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("rows.csv");
        tokio::fs::write(&file, "v\n1\n").await.unwrap();
        let store = FsBlobStore::new(dir.path());
        let hash1 = store.file_hash(file.to_str().unwrap()).await.unwrap();
        tokio::fs::write(&file, "v\n1\n2\n").await.unwrap();
        let hash2 = store.file_hash(file.to_str().unwrap()).await.unwrap();
        assert_ne!(hash1, hash2);
    }
}
