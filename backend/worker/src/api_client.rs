//! HTTP client for the coordinator's worker API
//!
//! Every response is checked before deserialization: 409 maps to
//! `WorkerError::ClaimExpired` so callers can short-circuit, other non-2xx
//! statuses carry the coordinator's message.

use crate::error::{Result, WorkerError};
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::StreamExt;
use reqwest::multipart;
use reqwest::{Response, StatusCode};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use worker_protocol::{
    ClaimRequest, ClaimResponse, CompleteRequest, CompleteResponse, FailRequest, FailResponse,
    HeartbeatRequest, HeartbeatResponse, ProgressRequest, ProgressResponse, QualityInfo,
    API_KEY_HEADER,
};

pub struct WorkerApiClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl WorkerApiClient {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/worker{path}", self.base_url)
    }

    async fn check(&self, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::CONFLICT {
            return Err(WorkerError::ClaimExpired);
        }
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        Err(WorkerError::Api {
            status: status.as_u16(),
            message,
        })
    }

    pub async fn heartbeat(
        &self,
        status: &str,
        capabilities: Option<serde_json::Value>,
    ) -> Result<HeartbeatResponse> {
        let response = self
            .client
            .post(self.url("/heartbeat"))
            .header(API_KEY_HEADER, &self.api_key)
            .timeout(Duration::from_secs(15))
            .json(&HeartbeatRequest {
                status: status.to_string(),
                capabilities,
            })
            .send()
            .await?;
        Ok(self.check(response).await?.json().await?)
    }

    /// Claim a job; `job_id` confirms a queue dispatch. An envelope without
    /// a job id means no work is available.
    pub async fn claim(&self, job_id: Option<i64>) -> Result<ClaimResponse> {
        let response = self
            .client
            .post(self.url("/claim"))
            .header(API_KEY_HEADER, &self.api_key)
            .timeout(Duration::from_secs(30))
            .json(&ClaimRequest { job_id })
            .send()
            .await?;
        Ok(self.check(response).await?.json().await?)
    }

    pub async fn progress(
        &self,
        job_id: i64,
        request: &ProgressRequest,
    ) -> Result<ProgressResponse> {
        let response = self
            .client
            .post(self.url(&format!("/jobs/{job_id}/progress")))
            .header(API_KEY_HEADER, &self.api_key)
            .timeout(Duration::from_secs(15))
            .json(request)
            .send()
            .await?;
        Ok(self.check(response).await?.json().await?)
    }

    pub async fn complete(
        &self,
        job_id: i64,
        qualities: Vec<QualityInfo>,
        duration: Option<f64>,
        source_width: Option<i32>,
        source_height: Option<i32>,
    ) -> Result<CompleteResponse> {
        let response = self
            .client
            .post(self.url(&format!("/jobs/{job_id}/complete")))
            .header(API_KEY_HEADER, &self.api_key)
            .timeout(Duration::from_secs(60))
            .json(&CompleteRequest {
                qualities,
                duration,
                source_width,
                source_height,
            })
            .send()
            .await?;
        Ok(self.check(response).await?.json().await?)
    }

    pub async fn fail(&self, job_id: i64, error: &str, retry: bool) -> Result<FailResponse> {
        let response = self
            .client
            .post(self.url(&format!("/jobs/{job_id}/fail")))
            .header(API_KEY_HEADER, &self.api_key)
            .timeout(Duration::from_secs(30))
            .json(&FailRequest {
                error_message: worker_protocol::truncate_error(error),
                retry,
            })
            .send()
            .await?;
        Ok(self.check(response).await?.json().await?)
    }

    /// Download the source file to `dest`, streaming chunk by chunk.
    pub async fn download_source(&self, video_id: i64, dest: &Path) -> Result<u64> {
        let response = self
            .client
            .get(self.url(&format!("/source/{video_id}")))
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await?;
        let response = self.check(response).await?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            written += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(written)
    }

    /// Upload one quality's artifacts as a gzipped tar archive.
    pub async fn upload_quality(
        &self,
        video_id: i64,
        quality: &str,
        files: Vec<PathBuf>,
    ) -> Result<()> {
        let archive = build_archive(files).await?;
        self.upload_archive(
            &format!("/upload/{video_id}/quality/{quality}"),
            archive,
            &format!("{quality}.tar.gz"),
        )
        .await
    }

    /// Upload the finalize artifacts (master playlist and/or thumbnail).
    pub async fn upload_finalize(&self, video_id: i64, files: Vec<PathBuf>) -> Result<()> {
        let archive = build_archive(files).await?;
        self.upload_archive(
            &format!("/upload/{video_id}/finalize"),
            archive,
            "finalize.tar.gz",
        )
        .await
    }

    async fn upload_archive(
        &self,
        path: &str,
        archive: tempfile::NamedTempFile,
        filename: &str,
    ) -> Result<()> {
        // Stream the archive off disk; artifacts can be far larger than
        // anything worth holding in memory
        let file = tokio::fs::File::open(archive.path()).await?;
        let stream = futures::stream::unfold(file, |mut file| async move {
            use tokio::io::AsyncReadExt;
            let mut buf = vec![0u8; 64 * 1024];
            match file.read(&mut buf).await {
                Ok(0) => None,
                Ok(n) => {
                    buf.truncate(n);
                    Some((Ok::<_, std::io::Error>(bytes::Bytes::from(buf)), file))
                }
                Err(e) => Some((Err(e), file)),
            }
        });
        let part = multipart::Part::stream(reqwest::Body::wrap_stream(stream))
            .file_name(filename.to_string())
            .mime_str("application/gzip")
            .map_err(WorkerError::Http)?;
        let form = multipart::Form::new().part("archive", part);

        let response = self
            .client
            .post(self.url(path))
            .header(API_KEY_HEADER, &self.api_key)
            .timeout(Duration::from_secs(600))
            .multipart(form)
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }
}

/// Pack files into a gzipped tar archive with flat member names.
async fn build_archive(files: Vec<PathBuf>) -> Result<tempfile::NamedTempFile> {
    tokio::task::spawn_blocking(move || -> Result<tempfile::NamedTempFile> {
        let spill = tempfile::NamedTempFile::new()?;
        let encoder = GzEncoder::new(spill.reopen()?, Compression::fast());
        let mut builder = tar::Builder::new(encoder);

        for path in &files {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| {
                    WorkerError::Io(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        format!("unusable artifact path: {}", path.display()),
                    ))
                })?;
            let mut file = std::fs::File::open(path)?;
            builder.append_file(name, &mut file)?;
        }

        builder.into_inner()?.finish()?;
        Ok(spill)
    })
    .await
    .map_err(|e| {
        WorkerError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("archive build task failed: {e}"),
        ))
    })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Write;

    #[tokio::test]
    async fn test_build_archive_flat_names() {
        let dir = tempfile::tempdir().unwrap();
        let playlist = dir.path().join("720p.m3u8");
        let segment = dir.path().join("720p_0000.ts");
        std::fs::File::create(&playlist)
            .unwrap()
            .write_all(b"#EXTM3U\n")
            .unwrap();
        std::fs::File::create(&segment)
            .unwrap()
            .write_all(b"segment")
            .unwrap();

        let archive = build_archive(vec![playlist, segment]).await.unwrap();

        let reader = GzDecoder::new(std::fs::File::open(archive.path()).unwrap());
        let mut tar = tar::Archive::new(reader);
        let names: Vec<String> = tar
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["720p.m3u8", "720p_0000.ts"]);
    }

    #[test]
    fn test_url_building() {
        let client = WorkerApiClient::new("http://coordinator:9002/", "whk_secret").unwrap();
        assert_eq!(
            client.url("/jobs/7/progress"),
            "http://coordinator:9002/api/worker/jobs/7/progress"
        );
    }
}
