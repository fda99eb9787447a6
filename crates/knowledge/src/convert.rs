//! Document-to-markdown conversion.
//!
//! OCR and office formats live behind the `DocumentConverter` trait; the
//! bundled `BasicConverter` handles text formats, HTML and web pages.
//!
//! Web pages are only fetched from whitelisted hosts. Every hop of a
//! redirect chain is checked again, hosts resolving to private addresses are
//! refused unless allowed, and only HTML responses are accepted.

use crate::types::{ContentKind, ProcessingParams};
use async_trait::async_trait;
use futures::StreamExt;
use knowbase_core::config::UrlFetchSettings;
use knowbase_core::{AppError, AppResult};
use reqwest::header::{CONTENT_TYPE, LOCATION};
use scraper::{Html, Selector};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, instrument};
use url::{Host, Url};

/// Largest web page the converter will download.
pub const MAX_DOWNLOAD_SIZE: usize = 10 * 1024 * 1024;

/// Content types accepted from web pages.
const HTML_CONTENT_TYPES: [&str; 2] = ["text/html", "application/xhtml+xml"];

/// Line width handed to the HTML renderer.
const TEXT_WIDTH: usize = 120;

/// Turns an ingested item into markdown text.
#[async_trait]
pub trait DocumentConverter: Send + Sync {
    async fn convert(
        &self,
        item: &str,
        kind: ContentKind,
        params: &ProcessingParams,
    ) -> AppResult<String>;
}

/// Source format, detected from the extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Markdown,
    Html,
    PlainText,
    Data,
}

impl SourceFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "md" | "markdown" => Some(Self::Markdown),
            "html" | "htm" => Some(Self::Html),
            "txt" => Some(Self::PlainText),
            "json" | "csv" => Some(Self::Data),
            _ => None,
        }
    }
}

/// Which web pages may be ingested.
#[derive(Debug, Clone, PartialEq)]
pub struct UrlPolicy {
    /// `example.com` admits the host and its subdomains; `*.example.com` too
    pub whitelist: Vec<String>,
    pub allow_private_hosts: bool,
    pub max_download_size: usize,
    pub max_redirects: usize,
}

impl Default for UrlPolicy {
    fn default() -> Self {
        Self {
            whitelist: Vec::new(),
            allow_private_hosts: false,
            max_download_size: MAX_DOWNLOAD_SIZE,
            max_redirects: 5,
        }
    }
}

impl UrlPolicy {
    pub fn from_settings(settings: &UrlFetchSettings) -> Self {
        Self {
            whitelist: settings.whitelist.clone(),
            allow_private_hosts: settings.allow_private_hosts,
            max_download_size: settings.max_download_size,
            max_redirects: settings.max_redirects,
        }
    }

    /// Allow exactly these hosts.
    pub fn allowing<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            whitelist: hosts.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_private_hosts(mut self, allow: bool) -> Self {
        self.allow_private_hosts = allow;
        self
    }

    pub fn with_max_download_size(mut self, bytes: usize) -> Self {
        self.max_download_size = bytes;
        self
    }

    /// URL ingestion is off until at least one host is whitelisted.
    pub fn enabled(&self) -> bool {
        !self.whitelist.is_empty()
    }

    pub fn host_allowed(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.whitelist.iter().any(|allowed| {
            let allowed = allowed.trim().to_ascii_lowercase();
            let domain = allowed.strip_prefix("*.").unwrap_or(&allowed);
            host == domain || host.ends_with(&format!(".{}", domain))
        })
    }

    /// Scheme and whitelist checks for one hop.
    fn check(&self, url: &Url) -> AppResult<()> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(AppError::Conversion(format!(
                "Only http and https URLs are supported, got '{}'",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| AppError::Conversion(format!("URL has no host: {}", url)))?;
        if !self.host_allowed(host) {
            return Err(AppError::Conversion(format!(
                "Host '{}' is not in the URL whitelist",
                host
            )));
        }
        Ok(())
    }
}

/// Private, loopback, link-local and unspecified addresses.
pub fn is_internal_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_internal_address(IpAddr::V4(v4));
            }
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80
        }
    }
}

/// Refuse URLs whose host is, or resolves to, an internal address.
///
/// A failed lookup is let through; the request then fails on its own.
async fn ensure_public_host(url: &Url) -> AppResult<()> {
    let port = url.port_or_known_default().unwrap_or(80);
    let addrs: Vec<IpAddr> = match url.host() {
        Some(Host::Ipv4(ip)) => vec![IpAddr::V4(ip)],
        Some(Host::Ipv6(ip)) => vec![IpAddr::V6(ip)],
        Some(Host::Domain(domain)) => match tokio::net::lookup_host((domain, port)).await {
            Ok(resolved) => resolved.map(|addr| addr.ip()).collect(),
            Err(e) => {
                debug!("Could not resolve {}: {}", domain, e);
                Vec::new()
            }
        },
        None => Vec::new(),
    };

    match addrs.into_iter().find(|ip| is_internal_address(*ip)) {
        Some(ip) => Err(AppError::Conversion(format!(
            "Access to private address {} ({}) is forbidden",
            ip,
            url.host_str().unwrap_or_default()
        ))),
        None => Ok(()),
    }
}

/// Converter for text formats, HTML files and http(s) pages.
pub struct BasicConverter {
    client: reqwest::Client,
    url_policy: UrlPolicy,
}

impl BasicConverter {
    pub fn new(timeout_secs: u64) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("knowbase/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AppError::Conversion(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url_policy: UrlPolicy::default(),
        })
    }

    pub fn with_url_policy(mut self, policy: UrlPolicy) -> Self {
        self.url_policy = policy;
        self
    }

    async fn convert_file(&self, item: &str) -> AppResult<String> {
        let path = Path::new(item);
        let format = SourceFormat::from_path(path).ok_or_else(|| {
            AppError::Conversion(format!("Unsupported file type: {:?}", path))
        })?;

        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| AppError::Conversion(format!("Failed to read {:?}: {}", path, e)))?;

        if raw.contains('\0') {
            return Err(AppError::Conversion(format!(
                "Binary content in {:?} is not supported",
                path
            )));
        }

        Ok(match format {
            SourceFormat::Html => html_to_markdown(&raw),
            SourceFormat::Markdown | SourceFormat::PlainText | SourceFormat::Data => raw,
        })
    }

    /// Check a hop against the whitelist and, unless allowed, the address ranges.
    async fn check_target(&self, url: &Url) -> AppResult<()> {
        self.url_policy.check(url)?;
        if !self.url_policy.allow_private_hosts {
            ensure_public_host(url).await?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn convert_url(&self, item: &str) -> AppResult<String> {
        let policy = &self.url_policy;
        if !policy.enabled() {
            return Err(AppError::Conversion(
                "URL ingestion is disabled: no hosts are whitelisted".to_string(),
            ));
        }

        let mut current = Url::parse(item)
            .map_err(|e| AppError::Conversion(format!("Invalid URL '{}': {}", item, e)))?;
        let mut redirects = 0;

        let response = loop {
            self.check_target(&current).await?;

            let response = self
                .client
                .get(current.clone())
                .send()
                .await
                .map_err(|e| AppError::Conversion(format!("Failed to fetch {}: {}", current, e)))?;

            if !matches!(response.status().as_u16(), 301 | 302 | 303 | 307 | 308) {
                break response;
            }
            if redirects >= policy.max_redirects {
                return Err(AppError::Conversion(format!(
                    "Too many redirects fetching {}",
                    item
                )));
            }
            redirects += 1;

            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| {
                    AppError::Conversion(format!("Redirect from {} has no Location", current))
                })?;
            current = current.join(location).map_err(|e| {
                AppError::Conversion(format!("Bad redirect target '{}': {}", location, e))
            })?;
            debug!("Following redirect to {}", current);
        };

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Conversion(format!(
                "Fetching {} returned {}",
                current, status
            )));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();
        if !HTML_CONTENT_TYPES.iter().any(|t| content_type.contains(t)) {
            return Err(AppError::Conversion(format!(
                "Unsupported content type '{}' at {}; only HTML pages are ingested",
                content_type, current
            )));
        }

        let limit = policy.max_download_size;
        if response.content_length().is_some_and(|len| len as usize > limit) {
            return Err(AppError::Conversion(format!(
                "Content size exceeds limit of {} bytes",
                limit
            )));
        }

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                AppError::Conversion(format!("Failed to read body of {}: {}", current, e))
            })?;
            if body.len() + chunk.len() > limit {
                return Err(AppError::Conversion(format!(
                    "Content size exceeds limit of {} bytes",
                    limit
                )));
            }
            body.extend_from_slice(&chunk);
        }
        debug!("Fetched {} bytes from {}", body.len(), current);

        Ok(html_to_markdown(&String::from_utf8_lossy(&body)))
    }
}

#[async_trait]
impl DocumentConverter for BasicConverter {
    async fn convert(
        &self,
        item: &str,
        kind: ContentKind,
        _params: &ProcessingParams,
    ) -> AppResult<String> {
        match kind {
            ContentKind::File => self.convert_file(item).await,
            ContentKind::Url => self.convert_url(item).await,
        }
    }
}

/// Render the page body as text, keeping headings and paragraph breaks.
pub fn html_to_markdown(html: &str) -> String {
    let document = Html::parse_document(html);
    let root = Selector::parse("body")
        .ok()
        .and_then(|body| document.select(&body).next().map(|e| e.html()))
        .unwrap_or_else(|| html.to_string());

    let text = html2text::from_read(root.as_bytes(), TEXT_WIDTH).unwrap_or_else(|_| {
        document.root_element().text().collect::<Vec<_>>().join(" ")
    });

    let mut out = String::with_capacity(text.len());
    let mut blank = true;
    for line in text.lines() {
        let line = line.trim_end();
        if line.trim().is_empty() {
            if !blank {
                out.push('\n');
                blank = true;
            }
            continue;
        }
        out.push_str(line);
        out.push('\n');
        blank = false;
    }

    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Policy admitting the local mock server.
    fn local_policy() -> UrlPolicy {
        UrlPolicy::allowing(["127.0.0.1"]).with_private_hosts(true)
    }

    fn local_converter() -> BasicConverter {
        BasicConverter::new(5).unwrap().with_url_policy(local_policy())
    }

    fn html(body: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_raw(body.as_bytes().to_vec(), "text/html; charset=utf-8")
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(
            SourceFormat::from_path(Path::new("a.MD")),
            Some(SourceFormat::Markdown)
        );
        assert_eq!(
            SourceFormat::from_path(Path::new("a.htm")),
            Some(SourceFormat::Html)
        );
        assert_eq!(SourceFormat::from_path(Path::new("a.pdf")), None);
        assert_eq!(SourceFormat::from_path(Path::new("README")), None);
    }

    #[test]
    fn test_html_to_markdown() {
        let html = r#"<html><head><title>x</title></head><body>
            <script>var a = 1;</script>
            <h2>Capitals</h2><p>Paris is in <b>France</b> &amp; Europe.</p>
            <p>Second&nbsp;paragraph</p></body></html>"#;

        let md = html_to_markdown(html);
        assert!(md.starts_with("## Capitals"));
        assert!(md.contains("France"));
        assert!(md.contains(" & Europe."));
        assert!(md.contains("Second"));
        assert!(md.contains("paragraph"));
        assert!(!md.contains("var a"));
        assert!(!md.contains('<'));
    }

    #[test]
    fn test_html_entities_and_attributes() {
        let md = html_to_markdown(
            r#"<p>caf&eacute; &#233; &#x41; &copy;</p><p><img alt="a > b" src="x.png">tail</p>"#,
        );
        assert!(md.contains("café é A ©"));
        assert!(md.contains("tail"));
        assert!(!md.contains("\">"));
        assert!(!md.contains("&eacute;"));
    }

    #[test]
    fn test_whitelist_patterns() {
        let policy = UrlPolicy::allowing(["docs.rs", "*.example.com"]);
        assert!(policy.enabled());
        assert!(policy.host_allowed("docs.rs"));
        assert!(policy.host_allowed("api.docs.rs"));
        assert!(policy.host_allowed("example.com"));
        assert!(policy.host_allowed("WWW.Example.com"));
        assert!(!policy.host_allowed("notdocs.rs"));
        assert!(!policy.host_allowed("example.com.evil.org"));
        assert!(!UrlPolicy::default().enabled());
    }

    #[test]
    fn test_internal_addresses() {
        assert!(is_internal_address(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert!(is_internal_address(IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3))));
        assert!(is_internal_address(IpAddr::V4(Ipv4Addr::new(192, 168, 0, 1))));
        assert!(is_internal_address(IpAddr::V4(Ipv4Addr::new(169, 254, 169, 254))));
        assert!(is_internal_address(IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert!(is_internal_address("fd00::1".parse().unwrap()));
        assert!(is_internal_address("fe80::1".parse().unwrap()));
        assert!(is_internal_address("::ffff:127.0.0.1".parse().unwrap()));
        assert!(!is_internal_address(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))));
        assert!(!is_internal_address("2606:4700::1111".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_convert_text_and_unsupported() {
        let temp = TempDir::new().unwrap();
        let txt = temp.path().join("notes.txt");
        let pdf = temp.path().join("scan.pdf");
        std::fs::write(&txt, "The capital of France is Paris.").unwrap();
        std::fs::write(&pdf, b"%PDF-1.4").unwrap();

        let converter = BasicConverter::new(5).unwrap();
        let params = ProcessingParams::default();

        let text = converter
            .convert(txt.to_str().unwrap(), ContentKind::File, &params)
            .await
            .unwrap();
        assert_eq!(text, "The capital of France is Paris.");

        let err = converter
            .convert(pdf.to_str().unwrap(), ContentKind::File, &params)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conversion(_)));
    }

    #[tokio::test]
    async fn test_convert_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page.html"))
            .respond_with(html("<h1>Title</h1><p>Body text</p>"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let converter = local_converter();
        let params = ProcessingParams::default();

        let md = converter
            .convert(&format!("{}/page.html", server.uri()), ContentKind::Url, &params)
            .await
            .unwrap();
        assert!(md.starts_with("# Title"));
        assert!(md.contains("Body text"));
        assert!(!md.contains('<'));

        let err = converter
            .convert(&format!("{}/missing", server.uri()), ContentKind::Url, &params)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conversion(_)));
    }

    #[tokio::test]
    async fn test_url_rejects_non_html() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<h1>plain</h1>"))
            .mount(&server)
            .await;

        let err = local_converter()
            .convert(&server.uri(), ContentKind::Url, &ProcessingParams::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("only HTML"));
    }

    #[tokio::test]
    async fn test_convert_url_size_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(html(&format!("<p>{}</p>", "x".repeat(2048))))
            .mount(&server)
            .await;

        let converter = BasicConverter::new(5)
            .unwrap()
            .with_url_policy(local_policy().with_max_download_size(1024));
        let err = converter
            .convert(&server.uri(), ContentKind::Url, &ProcessingParams::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exceeds limit"));
    }

    #[tokio::test]
    async fn test_url_ingestion_disabled_without_whitelist() {
        let err = BasicConverter::new(5)
            .unwrap()
            .convert("https://docs.rs/", ContentKind::Url, &ProcessingParams::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("disabled"));
    }

    #[tokio::test]
    async fn test_url_blocks_private_hosts() {
        let converter = BasicConverter::new(5)
            .unwrap()
            .with_url_policy(UrlPolicy::allowing(["127.0.0.1", "localhost"]));
        let params = ProcessingParams::default();

        for url in ["http://127.0.0.1:9/admin", "http://localhost:9/admin"] {
            let err = converter.convert(url, ContentKind::Url, &params).await.unwrap_err();
            assert!(err.to_string().contains("private address"), "{}: {}", url, err);
        }

        let err = converter
            .convert("http://other.internal/", ContentKind::Url, &params)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not in the URL whitelist"));
    }

    #[tokio::test]
    async fn test_redirects_are_checked_per_hop() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/old"))
            .respond_with(ResponseTemplate::new(301).insert_header("location", "/page.html"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/page.html"))
            .respond_with(html("<p>Moved here</p>"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/escape"))
            .respond_with(
                ResponseTemplate::new(302)
                    .insert_header("location", "http://169.254.169.254/latest/meta-data"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/loop"))
            .respond_with(ResponseTemplate::new(307).insert_header("location", "/loop"))
            .mount(&server)
            .await;

        let converter = local_converter();
        let params = ProcessingParams::default();

        let md = converter
            .convert(&format!("{}/old", server.uri()), ContentKind::Url, &params)
            .await
            .unwrap();
        assert_eq!(md, "Moved here");

        let err = converter
            .convert(&format!("{}/escape", server.uri()), ContentKind::Url, &params)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("169.254.169.254"));

        let err = converter
            .convert(&format!("{}/loop", server.uri()), ContentKind::Url, &params)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Too many redirects"));
    }
}
