use async_trait::async_trait;
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::debug;

use crate::config::{PackageSpec, SourceSection};
use crate::error::SourceError;
use crate::model::{DownloadResult, InstallResult, SoftwareInfo, SourceType, UpdateStatus};
use crate::version;

use super::UpdateSource;

const FETCH_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_VERSION_PATTERN: &str = r"(\d+\.\d+(?:\.\d+)*)";

fn tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<[^>]+>").expect("static regex"))
}

fn block_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)<(script|style|noscript)[^>]*>.*?</(script|style|noscript)>")
            .expect("static regex")
    })
}

fn manual_update_error(name: &str) -> SourceError {
    SourceError::Unsupported(format!(
        "{name} must be updated manually through its vendor installer"
    ))
}

/// Replaces markup with spaces so version patterns can match across what
/// the browser would render as adjacent text.
fn strip_html(html: &str) -> String {
    let without_blocks = block_regex().replace_all(html, " ");
    tag_regex().replace_all(&without_blocks, " ").into_owned()
}

/// Checks version numbers scraped off vendor download pages. These apps
/// install through vendor-specific bundles, so updating is check-only and
/// installation stays manual.
pub struct WebSource {
    section: SourceSection,
    client: reqwest::Client,
}

impl WebSource {
    pub fn new(section: SourceSection) -> Self {
        Self {
            section,
            client: super::http_client(),
        }
    }

    fn spec(&self, id: &str) -> Option<&PackageSpec> {
        self.section.packages.iter().find(|p| p.id == id)
    }

    async fn scrape_version(&self, spec: &PackageSpec) -> Result<String, SourceError> {
        let url = spec
            .url
            .as_deref()
            .ok_or_else(|| SourceError::ParseFailure("no URL configured".to_string()))?;
        let pattern = spec
            .version_pattern
            .as_deref()
            .unwrap_or(DEFAULT_VERSION_PATTERN);
        let regex = Regex::new(pattern)
            .map_err(|e| SourceError::ParseFailure(format!("invalid version pattern: {e}")))?;

        let html = self
            .client
            .get(url)
            .timeout(FETCH_TIMEOUT)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| SourceError::Unreachable(e.to_string()))?
            .text()
            .await
            .map_err(|e| SourceError::Unreachable(e.to_string()))?;

        // Try the raw markup first; version strings often live in href
        // attributes the text pass would discard.
        for haystack in [html.as_str(), &strip_html(&html)] {
            if let Some(caps) = regex.captures(haystack) {
                let version = caps
                    .get(1)
                    .map(|m| m.as_str())
                    .unwrap_or_else(|| caps.get(0).expect("match exists").as_str());
                debug!("scraped version {version} from {url}");
                return Ok(version.to_string());
            }
        }
        Err(SourceError::ParseFailure(format!(
            "version pattern matched nothing at {url}"
        )))
    }
}

#[async_trait]
impl UpdateSource for WebSource {
    fn name(&self) -> &'static str {
        "Web"
    }

    fn source_type(&self) -> SourceType {
        SourceType::Web
    }

    async fn tracked(&self) -> Result<Vec<SoftwareInfo>, SourceError> {
        Ok(self
            .section
            .packages
            .iter()
            .map(|spec| {
                let installed = spec
                    .installed_version
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string());
                SoftwareInfo::new(&spec.id, spec.display_name(), installed, SourceType::Web)
                    .with_url(spec.url.clone().unwrap_or_default())
                    .with_description(spec.description.clone())
            })
            .collect())
    }

    async fn check(&self, mut software: SoftwareInfo) -> SoftwareInfo {
        let Some(spec) = self.spec(&software.id).cloned() else {
            software.mark_error("Package not found in configuration");
            return software;
        };

        match self.scrape_version(&spec).await {
            Ok(latest) => {
                software.status = if version::is_newer(&latest, &software.installed_version) {
                    UpdateStatus::UpdateAvailable
                } else {
                    UpdateStatus::UpToDate
                };
                software.latest_version = Some(latest);
                software.error_message = None;
            }
            // A page that stopped matching is a real signal, surface it
            // instead of quietly reporting up to date.
            Err(e) => software.mark_error(e.to_string()),
        }
        software
    }

    async fn download(&self, software: &SoftwareInfo) -> DownloadResult {
        match self.spec(&software.id).and_then(|s| s.url.clone()) {
            Some(url) => DownloadResult {
                download_url: Some(url),
                ..DownloadResult::failed("Manual download required")
            },
            None => DownloadResult::failed("No download URL configured"),
        }
    }

    async fn install(&self, software: &SoftwareInfo, _download: &DownloadResult) -> InstallResult {
        InstallResult::failed(manual_update_error(&software.name).to_string())
    }

    async fn update(&self, software: &SoftwareInfo) -> InstallResult {
        InstallResult::failed(manual_update_error(&software.name).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_html_drops_scripts_and_tags() {
        let html = r#"<html><head><style>.x{color:red}</style>
<script>var v = "9.9.9";</script></head>
<body><h1>DevKinsta</h1><p>Version <b>2.13.4</b> available</p></body></html>"#;
        let text = strip_html(html);
        assert!(text.contains("Version"));
        assert!(text.contains("2.13.4"));
        assert!(!text.contains("9.9.9"));
        assert!(!text.contains("<b>"));
    }

    #[tokio::test]
    async fn manual_sources_refuse_install_as_unsupported() {
        let source = WebSource::new(SourceSection::default());
        let software = SoftwareInfo::new("devkinsta", "DevKinsta", "2.13.4", SourceType::Web);
        let result = source.install(&software, &DownloadResult::failed("none")).await;
        assert!(!result.success);
        assert!(result.error_message.unwrap().starts_with("unsupported:"));
    }

    #[test]
    fn default_pattern_finds_version_in_stripped_text() {
        let regex = Regex::new(DEFAULT_VERSION_PATTERN).unwrap();
        let text = strip_html("<p>Download <a href='/dl'>DevKinsta 2.13.4</a> now</p>");
        assert_eq!(regex.captures(&text).unwrap()[1].to_string(), "2.13.4");
    }
}
