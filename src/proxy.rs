use anyhow::{Context, Result};
use std::{
    io::{BufRead, BufReader, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering as AtomicOrdering},
    },
    thread,
    time::Duration,
};
use tokio::runtime::Handle;
use url::Url;

use crate::cache::OfflineCache;
use crate::downloads::{Progress, Transport};

pub const DEFAULT_SHELL_PATHS: [&str; 3] = ["/", "/index.html", "/anime-data.json"];
pub const PROXY_CACHE_NAME: &str = "aniverse-proxy-v1";

#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// Site that relative paths are resolved against.
    pub origin: Option<Url>,
    pub shell_paths: Vec<String>,
    /// `0` picks a free port.
    pub port: u16,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            origin: None,
            shell_paths: DEFAULT_SHELL_PATHS.iter().map(|p| p.to_string()).collect(),
            port: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Body {
        data: Vec<u8>,
        content_type: String,
        from_cache: bool,
    },
    Error(u16, &'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    NetworkFirst,
    CacheFirst,
}

/// Request routing for the offline proxy: app-shell paths go to the
/// network first, everything else is served from the cache first.
pub struct MediaRoutes<T> {
    options: ProxyOptions,
    cache: OfflineCache,
    downloads: Option<OfflineCache>,
    transport: T,
    runtime: Handle,
}

impl<T: Transport> MediaRoutes<T> {
    pub fn new(options: ProxyOptions, cache: OfflineCache, transport: T, runtime: Handle) -> Self {
        Self {
            options,
            cache,
            downloads: None,
            transport,
            runtime,
        }
    }

    /// Also answer from the offline downloads cache, which is never written.
    pub fn with_downloads(mut self, downloads: OfflineCache) -> Self {
        self.downloads = Some(downloads);
        self
    }

    fn resolve_target(&self, target: &str) -> Option<(String, Strategy)> {
        let parsed = Url::parse("http://127.0.0.1").ok()?.join(target).ok()?;
        if let Some((_, src)) = parsed.query_pairs().find(|(key, _)| key == "src") {
            let src = Url::parse(&src).ok()?;
            return matches!(src.scheme(), "http" | "https")
                .then(|| (src.to_string(), Strategy::CacheFirst));
        }
        let origin = self.options.origin.as_ref()?;
        let path = parsed.path();
        let strategy = if self.options.shell_paths.iter().any(|p| p == path) {
            Strategy::NetworkFirst
        } else {
            Strategy::CacheFirst
        };
        let relative = target.trim_start_matches('/');
        Some((origin.join(relative).ok()?.to_string(), strategy))
    }

    pub fn handle(&self, method: &str, target: &str) -> Reply {
        if method != "GET" && method != "HEAD" {
            return Reply::Error(405, "method not allowed");
        }
        let Some((url, strategy)) = self.resolve_target(target) else {
            return Reply::Error(404, "not found");
        };
        match strategy {
            Strategy::NetworkFirst => self
                .from_network(&url)
                .or_else(|| self.from_cache(&url))
                .unwrap_or(Reply::Error(502, "upstream fetch failed")),
            Strategy::CacheFirst => self
                .from_cache(&url)
                .or_else(|| self.from_network(&url))
                .unwrap_or(Reply::Error(502, "upstream fetch failed")),
        }
    }

    fn from_cache(&self, url: &str) -> Option<Reply> {
        let cached = self
            .downloads
            .iter()
            .chain(std::iter::once(&self.cache))
            .find_map(|cache| match cache.read(url) {
                Ok(cached) => cached,
                Err(err) => {
                    tracing::warn!(url, error = %err, "offline cache read failed");
                    None
                }
            })?;
        let content_type = cached
            .meta
            .content_type
            .unwrap_or_else(|| mime_type_for_url(url).to_string());
        Some(Reply::Body {
            data: cached.body,
            content_type,
            from_cache: true,
        })
    }

    fn from_network(&self, url: &str) -> Option<Reply> {
        let fetched = self
            .runtime
            .block_on(self.transport.fetch(url, &mut |_: Progress| {}));
        let fetched = match fetched {
            Ok(fetched) => fetched,
            Err(err) => {
                tracing::debug!(url, error = %err, "proxy network fetch failed");
                return None;
            }
        };
        if let Err(err) = self
            .cache
            .put(url, &fetched.body, fetched.content_type.as_deref())
        {
            tracing::warn!(url, error = %err, "failed to store proxied response");
        }
        let content_type = fetched
            .content_type
            .unwrap_or_else(|| mime_type_for_url(url).to_string());
        Some(Reply::Body {
            data: fetched.body,
            content_type,
            from_cache: false,
        })
    }
}

pub struct LocalMediaProxy {
    pub base_url: String,
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl LocalMediaProxy {
    pub fn start<T>(routes: MediaRoutes<T>) -> Result<Self>
    where
        T: Transport + Send + Sync + 'static,
    {
        let port = routes.options.port;
        let listener = TcpListener::bind(("127.0.0.1", port))
            .with_context(|| format!("failed to bind offline media proxy on port {port}"))?;
        let addr = listener
            .local_addr()
            .context("failed to read local proxy address")?;
        listener
            .set_nonblocking(true)
            .context("failed to configure local proxy socket")?;

        let stop = Arc::new(AtomicBool::new(false));
        let stop_signal = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            while !stop_signal.load(AtomicOrdering::Relaxed) {
                match listener.accept() {
                    Ok((mut stream, peer)) => {
                        if let Err(err) = serve_connection(&mut stream, peer, &routes) {
                            if is_benign_proxy_error(&err) {
                                continue;
                            }
                            if let Err(write_err) =
                                write_reply(&mut stream, &Reply::Error(500, "proxy error"), false)
                                && !is_benign_proxy_error(&write_err)
                            {
                                tracing::warn!(error = %write_err, "failed to write proxy error response");
                            }
                            tracing::warn!(error = %err, "offline proxy request failed");
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(25));
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "offline proxy accept failed");
                        thread::sleep(Duration::from_millis(50));
                    }
                }
            }
        });

        let base_url = format!("http://127.0.0.1:{}", addr.port());
        tracing::info!(%base_url, "offline media proxy listening");
        Ok(Self {
            base_url,
            stop,
            handle: Some(handle),
        })
    }

    /// Proxy URL serving `url` through the offline cache.
    pub fn media_url(&self, url: &str) -> String {
        let query: String = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("src", url)
            .finish();
        format!("{}/media?{query}", self.base_url)
    }

    pub fn shutdown(&mut self) {
        self.stop.store(true, AtomicOrdering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for LocalMediaProxy {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn serve_connection<T: Transport>(
    stream: &mut TcpStream,
    peer: SocketAddr,
    routes: &MediaRoutes<T>,
) -> Result<()> {
    stream
        .set_nonblocking(false)
        .context("failed to configure proxy stream")?;
    let mut reader = BufReader::new(stream.try_clone().context("failed to clone proxy stream")?);
    let mut request_line = String::new();
    let bytes_read = reader
        .read_line(&mut request_line)
        .context("failed to read proxy request")?;
    if bytes_read == 0 {
        return Ok(());
    }
    // Drain headers; nothing in them changes the response.
    let mut header = String::new();
    while reader.read_line(&mut header).context("failed to read proxy headers")? > 2 {
        header.clear();
    }

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let target = parts.next().unwrap_or_default();
    let reply = routes.handle(method, target);
    tracing::debug!(%peer, method, target, status = reply_status(&reply), "proxy request");
    write_reply(stream, &reply, method == "HEAD")
}

fn reply_status(reply: &Reply) -> u16 {
    match reply {
        Reply::Body { .. } => 200,
        Reply::Error(status, _) => *status,
    }
}

pub fn write_reply(stream: &mut impl Write, reply: &Reply, head_only: bool) -> Result<()> {
    let (status, reason, content_type, body): (u16, &str, &str, &[u8]) = match reply {
        Reply::Body {
            data, content_type, ..
        } => (200, "OK", content_type.as_str(), data.as_slice()),
        Reply::Error(status, message) => (
            *status,
            match status {
                404 => "Not Found",
                405 => "Method Not Allowed",
                502 => "Bad Gateway",
                _ => "Internal Server Error",
            },
            "text/plain; charset=utf-8",
            message.as_bytes(),
        ),
    };
    if let Err(err) = write!(
        stream,
        "HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\nContent-Type: {content_type}\r\nConnection: close\r\n\r\n",
        body.len()
    ) {
        if is_benign_disconnect(&err) {
            return Ok(());
        }
        return Err(err).context("failed to write proxy headers");
    }
    if head_only {
        return Ok(());
    }
    if let Err(err) = stream.write_all(body) {
        if is_benign_disconnect(&err) {
            return Ok(());
        }
        return Err(err).context("failed to write proxy response body");
    }
    Ok(())
}

pub fn is_benign_disconnect(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::UnexpectedEof
    )
}

pub fn is_benign_proxy_error(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<std::io::Error>())
        .any(is_benign_disconnect)
}

fn mime_type_for_url(url: &str) -> &'static str {
    let path = Url::parse(url).map(|u| u.path().to_string()).unwrap_or_default();
    let path = if path.ends_with('/') {
        format!("{path}index.html")
    } else {
        path
    };
    mime_type_for_path(Path::new(&path))
}

pub fn mime_type_for_path(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("html") => "text/html; charset=utf-8",
        Some("json") => "application/json",
        Some("js") => "text/javascript",
        Some("css") => "text/css",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("mkv") => "video/x-matroska",
        Some("m3u8") => "application/vnd.apple.mpegurl",
        Some("ts") => "video/mp2t",
        Some("mp3") => "audio/mpeg",
        Some("m4a") => "audio/mp4",
        Some("ogg") | Some("opus") => "audio/ogg",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("avif") => "image/avif",
        Some("gif") => "image/gif",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloads::{DownloadError, Fetched};
    use std::io::Read;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct FakeNetwork {
        calls: AtomicUsize,
        offline: AtomicBool,
    }

    impl Transport for Arc<FakeNetwork> {
        async fn fetch(
            &self,
            url: &str,
            _on_progress: &mut (dyn FnMut(Progress) + Send),
        ) -> Result<Fetched, DownloadError> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            if self.offline.load(AtomicOrdering::SeqCst) {
                return Err(DownloadError::Status {
                    url: url.to_string(),
                    status: 503,
                });
            }
            Ok(Fetched {
                body: format!("net:{url}").into_bytes(),
                content_type: None,
            })
        }
    }

    fn routes(
        dir: &Path,
        runtime: &tokio::runtime::Runtime,
    ) -> (MediaRoutes<Arc<FakeNetwork>>, Arc<FakeNetwork>) {
        let network = Arc::new(FakeNetwork::default());
        let options = ProxyOptions {
            origin: Some(Url::parse("https://aniverse.example/app/").unwrap()),
            ..Default::default()
        };
        let routes = MediaRoutes::new(
            options,
            OfflineCache::open(dir, "offline"),
            Arc::clone(&network),
            runtime.handle().clone(),
        );
        (routes, network)
    }

    fn body(reply: &Reply) -> (String, bool) {
        match reply {
            Reply::Body {
                data, from_cache, ..
            } => (String::from_utf8_lossy(data).into_owned(), *from_cache),
            Reply::Error(status, _) => panic!("unexpected status {status}"),
        }
    }

    #[test]
    fn media_is_cache_first() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let (routes, network) = routes(dir.path(), &runtime);

        let first = routes.handle("GET", "/videos/ep1.mp4");
        assert_eq!(
            body(&first),
            ("net:https://aniverse.example/app/videos/ep1.mp4".to_string(), false)
        );
        let second = routes.handle("GET", "/videos/ep1.mp4");
        assert!(body(&second).1);
        assert_eq!(network.calls.load(AtomicOrdering::SeqCst), 1);
        if let Reply::Body { content_type, .. } = second {
            assert_eq!(content_type, "video/mp4");
        }
    }

    #[test]
    fn downloaded_media_is_served_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let downloads = OfflineCache::open(dir.path(), "downloads");
        downloads
            .put("https://cdn.example/ep2.mp4", b"offline", Some("video/mp4"))
            .unwrap();
        let (routes, network) = routes(dir.path(), &runtime);
        let routes = routes.with_downloads(downloads.clone());

        let reply = routes.handle("GET", "/media?src=https%3A%2F%2Fcdn.example%2Fep2.mp4");
        assert_eq!(body(&reply), ("offline".to_string(), true));
        assert_eq!(network.calls.load(AtomicOrdering::SeqCst), 0);
        assert_eq!(downloads.urls().len(), 1);
    }

    #[test]
    fn shell_is_network_first_with_cache_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let (routes, network) = routes(dir.path(), &runtime);

        assert!(!body(&routes.handle("GET", "/anime-data.json")).1);
        assert!(!body(&routes.handle("GET", "/anime-data.json")).1);
        assert_eq!(network.calls.load(AtomicOrdering::SeqCst), 2);

        network.offline.store(true, AtomicOrdering::SeqCst);
        assert!(body(&routes.handle("GET", "/anime-data.json")).1);
        assert_eq!(
            routes.handle("GET", "/index.html"),
            Reply::Error(502, "upstream fetch failed")
        );
    }

    #[test]
    fn src_query_and_rejections() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let (routes, _) = routes(dir.path(), &runtime);

        let reply = routes.handle("GET", "/media?src=https%3A%2F%2Fcdn.example%2Fa.mp3");
        assert_eq!(body(&reply).0, "net:https://cdn.example/a.mp3");
        assert_eq!(
            routes.handle("GET", "/media?src=file%3A%2F%2F%2Fetc%2Fpasswd"),
            Reply::Error(404, "not found")
        );
        assert_eq!(
            routes.handle("POST", "/index.html"),
            Reply::Error(405, "method not allowed")
        );
    }

    #[test]
    fn serves_over_tcp() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let (routes, _) = routes(dir.path(), &runtime);
        let mut proxy = LocalMediaProxy::start(routes).unwrap();

        let addr = proxy.base_url.trim_start_matches("http://").to_string();
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .write_all(b"GET /poster.jpg HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("Content-Type: image/jpeg"));
        assert!(response.ends_with("net:https://aniverse.example/app/poster.jpg"));

        assert!(
            proxy
                .media_url("https://cdn.example/a b.mp4")
                .ends_with("/media?src=https%3A%2F%2Fcdn.example%2Fa+b.mp4")
        );
        proxy.shutdown();
    }

    #[test]
    fn head_omits_body() {
        let mut out = Vec::new();
        let reply = Reply::Body {
            data: b"abc".to_vec(),
            content_type: "video/mp4".into(),
            from_cache: true,
        };
        write_reply(&mut out, &reply, true).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Content-Length: 3"));
        assert!(text.ends_with("\r\n\r\n"));
    }
}
