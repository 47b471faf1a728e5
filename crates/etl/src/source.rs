//! Scoped access to a dataset source.

use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::NamedTempFile;
use tracing::{debug, info};
use url::Url;

use crate::error::EtlError;

/// A readable local copy of a source.
///
/// Remote sources are downloaded into a temp file that is removed when this
/// value drops, whether or not the sync that used it succeeded.
#[derive(Debug)]
pub struct SourceFile {
    path: PathBuf,
    download: Option<NamedTempFile>,
}

impl SourceFile {
    /// `http(s)://` URLs are fetched; anything else is a local path, with an
    /// optional `file://` prefix.
    pub async fn open(location: &str, download_timeout: Duration) -> Result<Self, EtlError> {
        match Url::parse(location) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {
                Self::download(url, download_timeout).await
            }
            Ok(url) if url.scheme() == "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|_| EtlError::Io(std::io::Error::other(format!("bad file URL {location}"))))?;
                Self::local(path)
            }
            _ => Self::local(PathBuf::from(location)),
        }
    }

    fn local(path: PathBuf) -> Result<Self, EtlError> {
        // Surface a missing file here rather than deep inside staging.
        std::fs::metadata(&path)?;
        Ok(Self { path, download: None })
    }

    async fn download(url: Url, timeout: Duration) -> Result<Self, EtlError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let mut response = client.get(url.clone()).send().await.map_err(|e| {
            if e.is_timeout() {
                EtlError::DownloadTimeout(url.to_string())
            } else {
                EtlError::Http(e)
            }
        })?;
        if !response.status().is_success() {
            return Err(EtlError::Download {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let mut temp = tempfile::Builder::new()
            .prefix("plenum-source-")
            .suffix(".csv")
            .tempfile()?;
        let mut bytes = 0usize;
        while let Some(chunk) = response.chunk().await? {
            temp.write_all(&chunk)?;
            bytes += chunk.len();
        }
        temp.flush()?;

        info!(url = %url, bytes, path = %temp.path().display(), "Source downloaded");
        Ok(Self {
            path: temp.path().to_path_buf(),
            download: Some(temp),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_download(&self) -> bool {
        self.download.is_some()
    }

    pub fn reader(&self) -> Result<BufReader<File>, EtlError> {
        debug!(path = %self.path.display(), "Opening source");
        Ok(BufReader::new(File::open(&self.path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answers a single request with `status` and `body`.
    async fn serve_once(status: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = vec![0u8; 4096];
            let _ = stream.read(&mut request).await.unwrap();
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: text/csv\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();
        });
        format!("http://{addr}/crimes.csv")
    }

    #[tokio::test]
    async fn opens_local_paths_and_file_urls() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "a,b").unwrap();

        let plain = SourceFile::open(file.path().to_str().unwrap(), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!plain.is_download());

        let url = Url::from_file_path(file.path()).unwrap();
        let via_url = SourceFile::open(url.as_str(), Duration::from_secs(5)).await.unwrap();
        let mut contents = String::new();
        via_url.reader().unwrap().read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "a,b\n");
    }

    #[tokio::test]
    async fn missing_local_file_fails_fast() {
        let err = SourceFile::open("/nonexistent/plenum/source.csv", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, EtlError::Io(_)));
    }

    #[test]
    fn temp_copy_is_removed_on_drop() {
        let temp = NamedTempFile::new().unwrap();
        let path = temp.path().to_path_buf();
        let source = SourceFile {
            path: path.clone(),
            download: Some(temp),
        };
        assert!(path.exists());
        drop(source);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn download_lives_until_the_source_drops() {
        let url = serve_once("200 OK", "a,b\n1,2\n").await;
        let source = SourceFile::open(&url, Duration::from_secs(5)).await.unwrap();
        assert!(source.is_download());
        let path = source.path().to_path_buf();
        let mut contents = String::new();
        source.reader().unwrap().read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "a,b\n1,2\n");

        drop(source);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn error_status_is_reported_without_a_temp_file() {
        let url = serve_once("404 Not Found", "").await;
        let err = SourceFile::open(&url, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, EtlError::Download { status: 404, .. }));
    }
}
