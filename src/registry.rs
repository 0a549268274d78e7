//! Read-only package registry client: version resolution and content download.

use serde::{Deserialize, Serialize};

use std::io::{Read, Write};
use std::path::Path;

use crate::{CancelToken, Progress, SelfprofError, SelfprofResult, SemanticVersion, semver};

/// Registry resolution flow. Both reduce to "latest version matching a
/// major.minor pin, then fetch the package content bytes".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryApi {
    V2,
    V3,
}

impl RegistryApi {
    pub fn default_url(self) -> &'static str {
        match self {
            RegistryApi::V2 => "https://www.nuget.org/api/v2",
            RegistryApi::V3 => "https://api.nuget.org/v3/index.json",
        }
    }
}

/// Outcome of version resolution: the exact version string the registry
/// advertises (prerelease/build tags preserved) and the content URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPackage {
    pub version: String,
    pub content_url: String,
}

pub fn resolve(
    registry_url: &str,
    api: RegistryApi,
    package_id: &str,
    pin: &SemanticVersion,
) -> SelfprofResult<ResolvedPackage> {
    match api {
        RegistryApi::V2 => resolve_v2(registry_url, package_id, pin),
        RegistryApi::V3 => resolve_v3(registry_url, package_id, pin),
    }
}

/// Streams package content into `dest`, reporting percent deltas and
/// honoring cancellation between chunks. A transfer failure observed after
/// cancellation was requested is reported as `Cancelled`, not as a generic
/// download error.
pub fn download_to_file(
    content_url: &str,
    dest: &Path,
    estimated_size: u64,
    progress: &dyn Progress,
    cancel: &CancelToken,
) -> SelfprofResult<()> {
    if cancel.is_cancelled() {
        return Err(SelfprofError::Cancelled);
    }

    let response = http_get(content_url)?;
    let total = response
        .header("Content-Length")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(estimated_size)
        .max(1);

    let mut reader = response.into_reader();
    let mut out = std::fs::File::create(dest)?;
    let mut buffer = [0u8; 64 * 1024];
    let mut copied = 0u64;
    let mut reported = 0.0f64;

    loop {
        if cancel.is_cancelled() {
            return Err(SelfprofError::Cancelled);
        }
        let n = reader
            .read(&mut buffer)
            .map_err(|e| classify_transfer_error(content_url, cancel, e))?;
        if n == 0 {
            break;
        }
        out.write_all(&buffer[..n])?;
        copied += n as u64;

        let percent = if copied < total {
            copied as f64 * 100.0 / total as f64
        } else {
            100.0
        };
        progress.advance(percent - reported);
        reported = percent;
    }

    Ok(())
}

fn classify_transfer_error(url: &str, cancel: &CancelToken, err: std::io::Error) -> SelfprofError {
    if cancel.is_cancelled() {
        SelfprofError::Cancelled
    } else {
        SelfprofError::DownloadFailed {
            url: url.to_string(),
            source: Box::new(err),
        }
    }
}

fn http_get(url: &str) -> SelfprofResult<ureq::Response> {
    tracing::debug!(url, "registry request");
    ureq::get(url)
        .call()
        .map_err(|e| SelfprofError::DownloadFailed {
            url: url.to_string(),
            source: Box::new(e),
        })
}

fn get_text(url: &str) -> SelfprofResult<String> {
    http_get(url)?
        .into_string()
        .map_err(|e| SelfprofError::DownloadFailed {
            url: url.to_string(),
            source: Box::new(e),
        })
}

fn registry_error(url: &str, message: String) -> SelfprofError {
    SelfprofError::DownloadFailed {
        url: url.to_string(),
        source: message.into(),
    }
}

// ---------------------------------------------------------------------------
// v3: service index -> package base address -> version list -> content URL

#[derive(Debug, Deserialize)]
struct ServiceIndex {
    resources: Vec<ServiceResource>,
}

#[derive(Debug, Deserialize)]
struct ServiceResource {
    #[serde(rename = "@id")]
    id: String,
    #[serde(rename = "@type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct PackageIndex {
    versions: Vec<String>,
}

const PACKAGE_BASE_ADDRESS: &str = "PackageBaseAddress/3.0.0";

fn resolve_v3(
    registry_url: &str,
    package_id: &str,
    pin: &SemanticVersion,
) -> SelfprofResult<ResolvedPackage> {
    let package_id = package_id.to_lowercase();

    let index: ServiceIndex = serde_json::from_str(&get_text(registry_url)?)?;
    let base = index
        .resources
        .iter()
        .find(|r| r.kind == PACKAGE_BASE_ADDRESS)
        .map(|r| r.id.trim_end_matches('/').to_string())
        .ok_or_else(|| {
            registry_error(
                registry_url,
                format!("service index has no {PACKAGE_BASE_ADDRESS} resource"),
            )
        })?;

    let versions_url = format!("{base}/{package_id}/index.json");
    let package_index: PackageIndex = serde_json::from_str(&get_text(&versions_url)?)?;

    let version = semver::latest_matching(package_index.versions.iter().map(String::as_str), pin)
        .ok_or_else(|| {
            registry_error(&versions_url, format!("no published version matches v{pin}"))
        })?;

    let content_url = format!("{base}/{package_id}/{version}/{package_id}.{version}.nupkg");
    Ok(ResolvedPackage {
        version,
        content_url,
    })
}

// ---------------------------------------------------------------------------
// v2: FindPackagesById() feed -> entry list (content URL + version)

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FeedEntry {
    pub content_url: String,
    pub version: String,
}

fn resolve_v2(
    registry_url: &str,
    package_id: &str,
    pin: &SemanticVersion,
) -> SelfprofResult<ResolvedPackage> {
    let feed_url = format!(
        "{}/FindPackagesById()?id='{package_id}'",
        registry_url.trim_end_matches('/')
    );
    let entries = parse_feed_entries(&get_text(&feed_url)?);

    let mut best: Option<(SemanticVersion, &FeedEntry)> = None;
    for entry in &entries {
        let Some(ver) = SemanticVersion::parse(&entry.version) else {
            continue;
        };
        if !ver.pin_matches(pin) {
            continue;
        }
        match &best {
            Some((current, _)) if *current > ver => {}
            _ => best = Some((ver, entry)),
        }
    }

    let (_, entry) = best.ok_or_else(|| {
        registry_error(&feed_url, format!("no published version matches v{pin}"))
    })?;
    Ok(ResolvedPackage {
        version: entry.version.clone(),
        content_url: entry.content_url.clone(),
    })
}

/// Reduces the v2 Atom feed to (content URL, version) pairs. A minimal
/// scanner over the only two fields the flow needs; the rest of the feed
/// envelope is not interpreted.
pub(crate) fn parse_feed_entries(xml: &str) -> Vec<FeedEntry> {
    let mut entries = Vec::new();
    let mut rest = xml;

    while let Some(start) = rest.find("<entry") {
        let body = &rest[start..];
        let Some(end) = body.find("</entry>") else {
            break;
        };
        let entry = &body[..end];

        if let (Some(content_url), Some(version)) =
            (content_src(entry), tag_text(entry, "d:Version"))
        {
            entries.push(FeedEntry {
                content_url,
                version,
            });
        }

        rest = &body[end + "</entry>".len()..];
    }

    entries
}

fn content_src(entry: &str) -> Option<String> {
    let at = entry.find("<content")?;
    let tag_end = entry[at..].find('>')? + at;
    let tag = &entry[at..tag_end];
    let src = tag.find("src=\"")? + "src=\"".len();
    let rest = &tag[src..];
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

fn tag_text(entry: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}");
    let close = format!("</{tag}>");
    let at = entry.find(&open)?;
    let body_start = entry[at..].find('>')? + at + 1;
    let body_end = entry[body_start..].find(&close)? + body_start;
    Some(entry[body_start..body_end].trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NoProgress;

    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;

    #[test]
    fn parses_a_v3_service_index() {
        let json = r#"{
            "version": "3.0.0",
            "resources": [
                {"@id": "https://api.example.org/query", "@type": "SearchQueryService"},
                {"@id": "https://api.example.org/flat/", "@type": "PackageBaseAddress/3.0.0"}
            ]
        }"#;
        let index: ServiceIndex = serde_json::from_str(json).expect("parse");
        let base = index
            .resources
            .iter()
            .find(|r| r.kind == PACKAGE_BASE_ADDRESS)
            .expect("resource");
        assert_eq!(base.id, "https://api.example.org/flat/");
    }

    #[test]
    fn parses_a_v2_feed() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom"
      xmlns:d="http://schemas.microsoft.com/ado/2007/08/dataservices"
      xmlns:m="http://schemas.microsoft.com/ado/2007/08/dataservices/metadata">
  <entry>
    <id>tag:example,2024:Tool/2022.1.0</id>
    <content type="application/zip" src="https://example.org/pkg/tool.2022.1.0.nupkg" />
    <m:properties>
      <d:Version>2022.1.0</d:Version>
    </m:properties>
  </entry>
  <entry>
    <content type="application/zip" src="https://example.org/pkg/tool.2022.1.4.nupkg" />
    <m:properties>
      <d:Version>2022.1.4</d:Version>
    </m:properties>
  </entry>
</feed>"#;

        let entries = parse_feed_entries(xml);
        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[1],
            FeedEntry {
                content_url: "https://example.org/pkg/tool.2022.1.4.nupkg".to_string(),
                version: "2022.1.4".to_string(),
            }
        );
    }

    #[test]
    fn feed_entries_without_version_are_skipped() {
        let xml = "<entry><content src=\"https://example.org/x.nupkg\"/></entry>";
        assert!(parse_feed_entries(xml).is_empty());
    }

    /// Serves one canned HTTP response on a local listener, in a thread.
    fn serve_once(body: Vec<u8>) -> (String, std::thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let mut reader = BufReader::new(stream.try_clone().expect("clone"));
            let mut line = String::new();
            while reader.read_line(&mut line).is_ok() {
                if line == "\r\n" || line.is_empty() {
                    break;
                }
                line.clear();
            }
            let header = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            stream.write_all(header.as_bytes()).expect("write header");
            stream.write_all(&body).expect("write body");
        });
        (format!("http://{addr}/pkg.nupkg"), handle)
    }

    #[test]
    fn downloads_content_to_a_file() {
        let body = vec![7u8; 200_000];
        let (url, server) = serve_once(body.clone());
        let dest = std::env::temp_dir().join(format!("selfprof-dl-{}.bin", uuid::Uuid::new_v4()));

        let cancel = CancelToken::new();
        download_to_file(&url, &dest, 1, &NoProgress, &cancel).expect("download");
        server.join().expect("server");

        let got = std::fs::read(&dest).expect("read dest");
        assert_eq!(got, body);
        std::fs::remove_file(&dest).ok();
    }

    #[test]
    fn pre_cancelled_download_fails_with_cancelled() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let dest = std::env::temp_dir().join(format!("selfprof-dl-{}.bin", uuid::Uuid::new_v4()));
        let err = download_to_file("http://127.0.0.1:9/none", &dest, 1, &NoProgress, &cancel)
            .expect_err("must fail");
        assert!(matches!(err, SelfprofError::Cancelled));
    }

    struct CancelAfterFirstChunk<'a>(&'a CancelToken);

    impl Progress for CancelAfterFirstChunk<'_> {
        fn advance(&self, _percent_delta: f64) {
            self.0.cancel();
        }
    }

    #[test]
    fn mid_transfer_cancellation_is_classified_as_cancelled() {
        let body = vec![1u8; 1_000_000];
        let (url, server) = serve_once(body);
        let dest = std::env::temp_dir().join(format!("selfprof-dl-{}.bin", uuid::Uuid::new_v4()));

        let cancel = CancelToken::new();
        let progress = CancelAfterFirstChunk(&cancel);
        let err =
            download_to_file(&url, &dest, 1, &progress, &cancel).expect_err("must be cancelled");
        assert!(matches!(err, SelfprofError::Cancelled));

        server.join().ok();
        std::fs::remove_file(&dest).ok();
    }

    #[test]
    fn unreachable_registry_reports_the_url() {
        let err = get_text("http://127.0.0.1:1/v3/index.json").expect_err("must fail");
        match err {
            SelfprofError::DownloadFailed { url, .. } => {
                assert!(url.contains("127.0.0.1:1"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
