//! Direct-link media fetcher using Reqwest

use async_trait::async_trait;
use bridge_traits::{
    fetch::{EgressRoute, FetchFailure, FetchRequest, FetchedMedia, MediaFetcher},
    resolver::MediaKind,
};
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use url::Url;

/// Downloads plain HTTP(S) media links.
///
/// Each [`EgressRoute`] gets its own pooled client so proxied and direct
/// attempts never share connections. Provider-specific extraction (page
/// scraping, signature deciphering) belongs to the resolver; by the time a
/// request gets here the locator must point at the media bytes.
pub struct HttpFetcher {
    timeout: Duration,
    clients: Mutex<HashMap<EgressRoute, Client>>,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(300))
    }

    /// `timeout` bounds a whole download, connection setup included.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client_for(&self, route: &EgressRoute) -> Result<Client, FetchFailure> {
        if let Some(client) = self.clients.lock().get(route) {
            return Ok(client.clone());
        }

        let mut builder = Client::builder()
            .timeout(self.timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(4)
            .user_agent(concat!("voicecast/", env!("CARGO_PKG_VERSION")));

        if let Some(proxy_url) = route.proxy_url() {
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|e| FetchFailure::NetworkError(format!("invalid proxy: {}", e)))?;
            builder = builder.proxy(proxy);
        } else {
            builder = builder.no_proxy();
        }

        let client = builder
            .build()
            .map_err(|e| FetchFailure::NetworkError(format!("client setup failed: {}", e)))?;
        self.clients.lock().insert(route.clone(), client.clone());
        Ok(client)
    }

    async fn download(
        &self,
        client: &Client,
        url: Url,
        partial: &Path,
    ) -> Result<(), FetchFailure> {
        let response = client.get(url).send().await.map_err(classify_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status));
        }

        let mut file = tokio::fs::File::create(partial)
            .await
            .map_err(storage_error)?;

        let mut written: u64 = 0;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(classify_error)?;
            file.write_all(&chunk).await.map_err(storage_error)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(storage_error)?;

        if written == 0 {
            return Err(FetchFailure::Unavailable("empty response body".to_string()));
        }
        debug!(bytes = written, "Download complete");
        Ok(())
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaFetcher for HttpFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchedMedia, FetchFailure> {
        let source = &request.source;
        if source.is_live {
            return Err(FetchFailure::Unavailable(
                "live streams cannot be downloaded over plain HTTP".to_string(),
            ));
        }

        let url = Url::parse(&source.locator)
            .map_err(|_| FetchFailure::Unavailable(format!("not a URL: {}", source.locator)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(FetchFailure::Unavailable(format!(
                "unsupported scheme: {}",
                url.scheme()
            )));
        }

        let output = append_extension(&request.destination, &extension_for(&url, request.media));
        let partial = append_extension(&output, "part");
        let client = self.client_for(&request.route)?;

        debug!(
            attempt = request.attempt,
            route = %request.route,
            output = %output.display(),
            "Downloading media"
        );

        if let Err(failure) = self.download(&client, url, &partial).await {
            remove_quietly(&partial).await;
            return Err(failure);
        }
        if let Err(e) = tokio::fs::rename(&partial, &output).await {
            remove_quietly(&partial).await;
            return Err(FetchFailure::Storage(format!("cannot finalize download: {}", e)));
        }

        Ok(FetchedMedia {
            path: output,
            duration_seconds: (source.duration_seconds > 0).then_some(source.duration_seconds),
        })
    }
}

fn classify_error(e: reqwest::Error) -> FetchFailure {
    if e.is_timeout() {
        FetchFailure::Timeout
    } else if let Some(status) = e.status() {
        classify_status(status)
    } else if e.is_connect() {
        FetchFailure::NetworkError(format!("connection failed: {}", e))
    } else {
        FetchFailure::NetworkError(e.to_string())
    }
}

fn storage_error(e: std::io::Error) -> FetchFailure {
    FetchFailure::Storage(format!("cannot write download: {}", e))
}

fn classify_status(status: StatusCode) -> FetchFailure {
    match status {
        StatusCode::TOO_MANY_REQUESTS => FetchFailure::RateLimited(status.to_string()),
        StatusCode::NOT_FOUND | StatusCode::FORBIDDEN | StatusCode::GONE => {
            FetchFailure::Unavailable(status.to_string())
        }
        s if s.is_server_error() => FetchFailure::NetworkError(format!("HTTP {}", s)),
        s => FetchFailure::Unavailable(format!("HTTP {}", s)),
    }
}

/// Extension from the URL path, or a default for the media kind.
fn extension_for(url: &Url, media: MediaKind) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_else(|| match media {
            MediaKind::Audio => "m4a".to_string(),
            MediaKind::Video => "mp4".to_string(),
        })
}

fn append_extension(path: &Path, extension: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(file = %path.display(), error = %e, "Failed to remove partial download"),
    }
}
