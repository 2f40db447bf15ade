// Reference fetcher: resolves http(s)/s3/file/vault references to local
// paths with retries, Content-Disposition handling, allowlist enforcement
// and the WPS-output locality shortcut.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use url::Url;
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::config::Settings;
use crate::error::{Error, Result};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_RETRIES: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CEILING: Duration = Duration::from_secs(30);
const CACHE_TTL: Duration = Duration::from_secs(300);

/// A resolved reference.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    pub local_path: PathBuf,
    pub media_type: Option<String>,
    pub filename: String,
}

/// One-shot vault retrieval, implemented by the storage layer.
#[async_trait]
pub trait VaultAccess: Send + Sync {
    /// Decrypt record `id` into `dest` and mark it consumed.
    async fn retrieve(&self, id: Uuid, token: &str, dest: &Path) -> Result<Fetched>;
}

/// Options controlling a single fetch call.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub auth: AuthContext,
    /// Declared media type to cross-check against the fetched content.
    pub expect_media_type: Option<String>,
    /// Disable the URL cache for this call.
    pub no_cache: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            auth: AuthContext::default(),
            expect_media_type: None,
            no_cache: false,
        }
    }
}

/// Reject anything that could escape the destination directory.
pub fn sanitise_filename(raw: &str) -> Option<String> {
    let candidate = raw.trim().trim_matches('"');
    // keep the last segment of any path-ish value
    let candidate = candidate
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(candidate)
        .to_string();
    if candidate.is_empty()
        || candidate == "."
        || candidate == ".."
        || candidate.contains("..")
        || candidate.chars().any(|c| c.is_control() || c == '\0')
    {
        return None;
    }
    Some(candidate)
}

/// Filename from a Content-Disposition header (filename* preferred).
pub fn filename_from_disposition(header: &str) -> Option<String> {
    for part in header.split(';') {
        let part = part.trim();
        if let Some(value) = part.strip_prefix("filename*=") {
            let value = value
                .strip_prefix("UTF-8''")
                .or_else(|| value.strip_prefix("utf-8''"))
                .unwrap_or(value);
            if let Some(name) = sanitise_filename(value) {
                return Some(name);
            }
        }
    }
    for part in header.split(';') {
        let part = part.trim();
        if let Some(value) = part.strip_prefix("filename=") {
            if let Some(name) = sanitise_filename(value) {
                return Some(name);
            }
        }
    }
    None
}

/// Parsed s3:// location. Access-point and outpost ARNs travel in the
/// bucket field; the SDK accepts them as bucket names.
#[derive(Debug, Clone, PartialEq)]
pub struct S3Location {
    pub bucket: String,
    pub key: String,
    pub region: Option<String>,
}

/// Accepts s3://bucket/key, path-style and virtual-hosted HTTPS forms,
/// access-point and outpost ARN forms.
pub fn parse_s3_reference(reference: &str) -> Result<S3Location> {
    // ARN forms are not URL-parseable (colons in the authority); handle
    // them before handing the rest to the URL parser.
    // s3://arn:aws:s3:region:acct:accesspoint/name/key
    if let Some(raw) = reference.strip_prefix("s3://arn:") {
        let raw = format!("arn:{}", raw);
        let mut segments = raw.splitn(6, ':');
        let (_arn, _aws, _svc) = (segments.next(), segments.next(), segments.next());
        let region = segments.next().unwrap_or_default().to_string();
        let _account = segments.next();
        let rest = segments.next().unwrap_or_default();
        let mut parts = rest.splitn(3, '/');
        let kind = parts.next().unwrap_or_default();
        let name = parts.next().unwrap_or_default();
        let key = parts.next().unwrap_or_default();
        if key.is_empty() || name.is_empty() {
            return Err(Error::ref_invalid(reference, "ARN form without key"));
        }
        let arn_prefix = raw.splitn(6, ':').take(5).collect::<Vec<_>>().join(":");
        return Ok(S3Location {
            bucket: format!("{}:{}/{}", arn_prefix, kind, name),
            key: key.to_string(),
            region: (!region.is_empty()).then_some(region),
        });
    }
    let url = Url::parse(reference)
        .map_err(|e| Error::ref_invalid(reference, format!("not a URL: {}", e)))?;
    match url.scheme() {
        "s3" => {
            let host = url.host_str().unwrap_or_default();
            let path = url.path().trim_start_matches('/');
            if host.is_empty() || path.is_empty() {
                return Err(Error::ref_invalid(reference, "missing bucket or key"));
            }
            Ok(S3Location {
                bucket: host.to_string(),
                key: path.to_string(),
                region: None,
            })
        }
        "http" | "https" => {
            let host = url.host_str().unwrap_or_default();
            let path = url.path().trim_start_matches('/');
            // virtual-hosted: bucket.s3.region.amazonaws.com/key
            // also bucket.s3-accesspoint.region... and s3-outposts hosts
            if let Some(idx) = host.find(".s3") {
                let bucket = &host[..idx];
                let rest = &host[idx + 1..];
                let region = rest
                    .split('.')
                    .nth(1)
                    .filter(|r| *r != "amazonaws")
                    .map(String::from);
                if !bucket.is_empty() && !path.is_empty() {
                    return Ok(S3Location {
                        bucket: bucket.to_string(),
                        key: path.to_string(),
                        region,
                    });
                }
            }
            // path-style: s3.region.amazonaws.com/bucket/key
            if host.starts_with("s3.") || host.starts_with("s3-") {
                let region = host
                    .split('.')
                    .nth(1)
                    .filter(|r| *r != "amazonaws")
                    .map(String::from);
                let mut parts = path.splitn(2, '/');
                let bucket = parts.next().unwrap_or_default();
                let key = parts.next().unwrap_or_default();
                if !bucket.is_empty() && !key.is_empty() {
                    return Ok(S3Location {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                        region,
                    });
                }
            }
            Err(Error::ref_invalid(reference, "not an S3 URL form"))
        }
        other => Err(Error::ref_invalid(reference, format!("scheme {}", other))),
    }
}

/// Scheme-dispatched fetcher with retry and caching behaviour.
pub struct Fetcher {
    settings: Arc<Settings>,
    client: reqwest::Client,
    vault: Option<Arc<dyn VaultAccess>>,
    cache: Mutex<HashMap<String, (PathBuf, Instant)>>,
}

impl Fetcher {
    pub fn new(settings: Arc<Settings>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .read_timeout(DEFAULT_READ_TIMEOUT)
            .build()
            .expect("reqwest client construction is infallible here");
        Self {
            settings,
            client,
            vault: None,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_vault(mut self, vault: Arc<dyn VaultAccess>) -> Self {
        self.vault = Some(vault);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Resolve a reference into `dest_dir`.
    pub async fn fetch(
        &self,
        reference: &str,
        dest_dir: &Path,
        options: &FetchOptions,
    ) -> Result<Fetched> {
        let url = Url::parse(reference)
            .map_err(|e| Error::ref_invalid(reference, format!("not a URL: {}", e)))?;
        let fetched = match url.scheme() {
            "file" => self.fetch_file(&url, dest_dir)?,
            "http" | "https" => {
                if let Some(local) = self.resolve_local_output(reference).await? {
                    local
                } else {
                    self.fetch_http(reference, dest_dir, options).await?
                }
            }
            "s3" => self.fetch_s3(reference, dest_dir).await?,
            "vault" => self.fetch_vault(&url, dest_dir).await?,
            other => {
                return Err(Error::ref_invalid(
                    reference,
                    format!("unsupported scheme {}", other),
                ))
            }
        };
        if let Some(expected) = &options.expect_media_type {
            check_format(reference, &fetched, expected)?;
        }
        Ok(fetched)
    }

    fn fetch_file(&self, url: &Url, _dest_dir: &Path) -> Result<Fetched> {
        let path = url
            .to_file_path()
            .map_err(|_| Error::ref_invalid(url.as_str(), "invalid file path"))?;
        let canonical = path
            .canonicalize()
            .map_err(|e| Error::ref_unreachable(url.as_str(), e.to_string()))?;
        let allowed = self
            .settings
            .file_allowlist
            .iter()
            .any(|root| canonical.starts_with(root))
            || canonical.starts_with(&self.settings.wps_output_dir)
            || canonical.starts_with(&self.settings.wps_workdir);
        if !allowed {
            return Err(Error::ref_invalid(
                url.as_str(),
                "path outside allowlisted roots",
            ));
        }
        let filename = canonical
            .file_name()
            .and_then(|n| n.to_str())
            .map(String::from)
            .ok_or_else(|| Error::ref_invalid(url.as_str(), "path without filename"))?;
        let media_type = mime_guess::from_path(&canonical)
            .first_raw()
            .map(String::from);
        Ok(Fetched {
            local_path: canonical,
            media_type,
            filename,
        })
    }

    /// Map a URL under the configured public output URL back to its local
    /// path, after containment check and a HEAD reachability probe.
    pub async fn resolve_local_output(&self, reference: &str) -> Result<Option<Fetched>> {
        let base = self.settings.wps_output_url.trim_end_matches('/');
        let Some(rest) = reference.strip_prefix(base) else {
            return Ok(None);
        };
        let rest = rest.trim_start_matches('/');
        if rest.is_empty() {
            return Ok(None);
        }
        let candidate = self.settings.wps_output_dir.join(rest);
        let Ok(canonical) = candidate.canonicalize() else {
            return Ok(None);
        };
        if !canonical.starts_with(&self.settings.wps_output_dir) {
            return Err(Error::ref_invalid(reference, "escapes the output root"));
        }
        // cheap probe before trusting the shortcut
        match self.client.head(reference).send().await {
            Ok(resp) if resp.status().is_success() => {}
            _ => {
                tracing::debug!(reference, "locality probe failed, falling back to download");
                return Ok(None);
            }
        }
        let filename = canonical
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("output")
            .to_string();
        let media_type = mime_guess::from_path(&canonical)
            .first_raw()
            .map(String::from);
        tracing::debug!(reference, path = %canonical.display(), "mapped output URL locally");
        Ok(Some(Fetched {
            local_path: canonical,
            media_type,
            filename,
        }))
    }

    async fn fetch_http(
        &self,
        reference: &str,
        dest_dir: &Path,
        options: &FetchOptions,
    ) -> Result<Fetched> {
        let profile = self.settings.request_options.for_url(reference);
        let cache_enabled = !options.no_cache && profile.and_then(|p| p.cache).unwrap_or(true);

        if cache_enabled {
            if let Some(hit) = self.cache_lookup(reference) {
                let filename = hit
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("cached")
                    .to_string();
                let dest = dest_dir.join(&filename);
                if hit != dest {
                    tokio::fs::create_dir_all(dest_dir).await.map_err(|e| {
                        Error::Internal(anyhow::anyhow!("create {}: {}", dest_dir.display(), e))
                    })?;
                    tokio::fs::copy(&hit, &dest)
                        .await
                        .map_err(|e| Error::Internal(anyhow::anyhow!("cache copy: {}", e)))?;
                }
                tracing::debug!(reference, "served from fetch cache");
                return Ok(Fetched {
                    media_type: mime_guess::from_path(&dest).first_raw().map(String::from),
                    filename,
                    local_path: dest,
                });
            }
        }

        let retries = profile.and_then(|p| p.retries).unwrap_or(DEFAULT_RETRIES);
        let timeout = profile
            .and_then(|p| p.timeout)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_READ_TIMEOUT);

        // HEAD probe for content metadata; failures are not fatal
        let mut media_type = None;
        let mut filename = None;
        if let Ok(head) = self
            .apply_headers(self.client.head(reference).timeout(timeout), options, profile)
            .send()
            .await
        {
            if head.status().is_success() {
                media_type = header_str(&head, reqwest::header::CONTENT_TYPE)
                    .map(|ct| ct.split(';').next().unwrap_or(&ct).trim().to_string());
                filename = header_str(&head, reqwest::header::CONTENT_DISPOSITION)
                    .and_then(|cd| filename_from_disposition(&cd));
            }
        }

        let mut attempt = 0u32;
        let response = loop {
            attempt += 1;
            let request = self
                .apply_headers(self.client.get(reference).timeout(timeout), options, profile);
            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        break resp;
                    }
                    if status == reqwest::StatusCode::UNAUTHORIZED
                        || status == reqwest::StatusCode::FORBIDDEN
                    {
                        return Err(Error::RefAuthRequired(reference.to_string()));
                    }
                    if status == reqwest::StatusCode::NOT_FOUND {
                        return Err(Error::ref_unreachable_permanent(reference, "HTTP 404"));
                    }
                    let retryable = status.is_server_error()
                        || status == reqwest::StatusCode::TOO_MANY_REQUESTS;
                    if !retryable || attempt > retries {
                        return Err(Error::ref_unreachable(
                            reference,
                            format!("HTTP {} after {} attempts", status, attempt),
                        ));
                    }
                    let delay = retry_delay(attempt, retry_after(&resp));
                    tracing::warn!(reference, %status, attempt, "retrying fetch");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    if attempt > retries {
                        return Err(Error::ref_unreachable(reference, err.to_string()));
                    }
                    let delay = retry_delay(attempt, None);
                    tracing::warn!(reference, error = %err, attempt, "retrying fetch");
                    tokio::time::sleep(delay).await;
                }
            }
        };

        if media_type.is_none() {
            media_type = header_str(&response, reqwest::header::CONTENT_TYPE)
                .map(|ct| ct.split(';').next().unwrap_or(&ct).trim().to_string());
        }
        if filename.is_none() {
            filename = header_str(&response, reqwest::header::CONTENT_DISPOSITION)
                .and_then(|cd| filename_from_disposition(&cd));
        }
        let filename = filename
            .or_else(|| {
                Url::parse(reference).ok().and_then(|u| {
                    u.path_segments()
                        .and_then(|s| s.last().map(String::from))
                        .and_then(|s| sanitise_filename(&s))
                })
            })
            .unwrap_or_else(|| "download".to_string());

        tokio::fs::create_dir_all(dest_dir)
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("create {}: {}", dest_dir.display(), e)))?;
        let dest = dest_dir.join(&filename);
        let mut file = tokio::fs::File::create(&dest)
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("create {}: {}", dest.display(), e)))?;
        let mut response = response;
        let mut written: u64 = 0;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| Error::ref_unreachable(reference, e.to_string()))?
        {
            written += chunk.len() as u64;
            if written > self.settings.wps_max_single_input_size {
                return Err(Error::unprocessable(format!(
                    "input {} exceeds the single-input size limit",
                    reference
                )));
            }
            file.write_all(&chunk)
                .await
                .map_err(|e| Error::Internal(anyhow::anyhow!("write {}: {}", dest.display(), e)))?;
        }
        file.flush()
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("flush {}: {}", dest.display(), e)))?;

        if cache_enabled {
            self.cache_store(reference, &dest);
        }

        Ok(Fetched {
            local_path: dest,
            media_type,
            filename,
        })
    }

    fn apply_headers(
        &self,
        mut request: reqwest::RequestBuilder,
        options: &FetchOptions,
        profile: Option<&crate::config::RequestProfile>,
    ) -> reqwest::RequestBuilder {
        request = options.auth.apply(request);
        if let Some(profile) = profile {
            for (name, value) in &profile.headers {
                request = request.header(name, value);
            }
        }
        request
    }

    async fn fetch_s3(&self, reference: &str, dest_dir: &Path) -> Result<Fetched> {
        let location = parse_s3_reference(reference)?;
        let region = location
            .region
            .clone()
            .or_else(|| self.settings.wps_output_s3_region.clone());

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_sdk_s3::config::Region::new(region));
        }
        let config = loader.load().await;
        let client = aws_sdk_s3::Client::new(&config);

        let object = client
            .get_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .send()
            .await
            .map_err(|e| Error::ref_unreachable(reference, e.to_string()))?;

        let media_type = object.content_type().map(String::from);
        let filename = location
            .key
            .rsplit('/')
            .next()
            .and_then(sanitise_filename)
            .unwrap_or_else(|| "object".to_string());

        tokio::fs::create_dir_all(dest_dir)
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("create {}: {}", dest_dir.display(), e)))?;
        let dest = dest_dir.join(&filename);
        let bytes = object
            .body
            .collect()
            .await
            .map_err(|e| Error::ref_unreachable(reference, e.to_string()))?
            .into_bytes();
        tokio::fs::write(&dest, &bytes)
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("write {}: {}", dest.display(), e)))?;

        Ok(Fetched {
            local_path: dest,
            media_type,
            filename,
        })
    }

    async fn fetch_vault(&self, url: &Url, dest_dir: &Path) -> Result<Fetched> {
        let vault = self
            .vault
            .as_ref()
            .ok_or_else(|| Error::ref_invalid(url.as_str(), "vault access not configured"))?;
        let id: Uuid = url
            .host_str()
            .unwrap_or_default()
            .parse()
            .map_err(|_| Error::ref_invalid(url.as_str(), "vault id is not a UUID"))?;
        let token = url
            .query_pairs()
            .find(|(k, _)| k == "token" || k == "access_token")
            .map(|(_, v)| v.to_string())
            .ok_or_else(|| Error::RefAuthRequired(url.to_string()))?;
        tokio::fs::create_dir_all(dest_dir)
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("create {}: {}", dest_dir.display(), e)))?;
        vault.retrieve(id, &token, dest_dir).await
    }

    fn cache_lookup(&self, reference: &str) -> Option<PathBuf> {
        let mut cache = self.cache.lock().expect("fetch cache poisoned");
        if let Some((path, at)) = cache.get(reference) {
            if at.elapsed() < CACHE_TTL && path.exists() {
                return Some(path.clone());
            }
            cache.remove(reference);
        }
        None
    }

    fn cache_store(&self, reference: &str, path: &Path) {
        self.cache
            .lock()
            .expect("fetch cache poisoned")
            .insert(reference.to_string(), (path.to_path_buf(), Instant::now()));
    }
}

fn header_str(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Exponential backoff capped by the ceiling; an explicit Retry-After caps
/// the computed delay in both directions.
fn retry_delay(attempt: u32, retry_after: Option<Duration>) -> Duration {
    let exponential = BACKOFF_BASE * 2u32.saturating_pow(attempt.saturating_sub(1));
    let delay = exponential.min(BACKOFF_CEILING);
    match retry_after {
        Some(after) => after.min(BACKOFF_CEILING),
        None => delay,
    }
}

/// Cross-check the fetched file against a declared media type.
fn check_format(reference: &str, fetched: &Fetched, expected: &str) -> Result<()> {
    use crate::model::formats::{extension_for, normalise_media_type};
    let expected_norm = normalise_media_type(expected);
    if let Some(actual) = &fetched.media_type {
        let actual_norm = normalise_media_type(actual);
        if actual_norm == expected_norm || actual_norm == "application/octet-stream" {
            return Ok(());
        }
    }
    if let Some(expected_ext) = extension_for(&expected_norm) {
        let actual_ext = fetched
            .local_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        if !actual_ext.eq_ignore_ascii_case(expected_ext)
            && !(expected_ext == "jpg" && actual_ext.eq_ignore_ascii_case("jpeg"))
            && !(expected_ext == "tif" && actual_ext.eq_ignore_ascii_case("tiff"))
        {
            return Err(Error::RefFormatMismatch {
                reference: reference.to_string(),
                detail: format!(
                    "extension '{}' does not match declared {}",
                    actual_ext, expected_norm
                ),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Configuration, RequestOptions};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_settings(output_dir: &Path, allow: Vec<PathBuf>) -> Arc<Settings> {
        Arc::new(Settings {
            configuration: Configuration::Default,
            url: "http://localhost:9000".into(),
            wps_output_dir: output_dir.to_path_buf(),
            wps_output_url: "http://localhost:9000/wpsoutputs".into(),
            wps_output_s3_bucket: None,
            wps_output_s3_region: None,
            wps_output_context: None,
            wps_workdir: output_dir.join("work"),
            cwl_euid: None,
            cwl_egid: None,
            execute_sync_max_wait: 20,
            wps_max_request_size: 30 * 1024 * 1024,
            wps_max_single_input_size: 1024 * 1024,
            request_options: RequestOptions::empty(),
            cwl_processes_dir: None,
            cwl_processes_register_error: false,
            cwl_prov: true,
            schema_url: String::new(),
            wps_email_notify_timeout: 10,
            vault_dir: output_dir.join("vault"),
            vault_secret: None,
            file_allowlist: allow,
            cwl_engine: "cwltool".into(),
        })
    }

    #[test]
    fn filename_sanitisation() {
        assert_eq!(sanitise_filename("data.nc"), Some("data.nc".into()));
        assert_eq!(sanitise_filename("\"quoted.txt\""), Some("quoted.txt".into()));
        assert_eq!(sanitise_filename("dir/data.nc"), Some("data.nc".into()));
        assert_eq!(sanitise_filename(".."), None);
        assert_eq!(sanitise_filename("a..b"), None);
        assert_eq!(sanitise_filename("bad\u{0007}name"), None);
        assert_eq!(sanitise_filename(""), None);
    }

    #[test]
    fn disposition_parsing_prefers_extended_form() {
        assert_eq!(
            filename_from_disposition("attachment; filename=\"plain.txt\"; filename*=UTF-8''better.txt"),
            Some("better.txt".into())
        );
        assert_eq!(
            filename_from_disposition("attachment; filename=\"plain.txt\""),
            Some("plain.txt".into())
        );
        assert_eq!(filename_from_disposition("inline"), None);
    }

    #[test]
    fn s3_url_forms() {
        assert_eq!(
            parse_s3_reference("s3://my-bucket/some/key.nc").unwrap(),
            S3Location {
                bucket: "my-bucket".into(),
                key: "some/key.nc".into(),
                region: None
            }
        );
        assert_eq!(
            parse_s3_reference("https://my-bucket.s3.eu-west-1.amazonaws.com/key.nc").unwrap(),
            S3Location {
                bucket: "my-bucket".into(),
                key: "key.nc".into(),
                region: Some("eu-west-1".into())
            }
        );
        assert_eq!(
            parse_s3_reference("https://s3.us-east-2.amazonaws.com/my-bucket/a/b.nc").unwrap(),
            S3Location {
                bucket: "my-bucket".into(),
                key: "a/b.nc".into(),
                region: Some("us-east-2".into())
            }
        );
        let ap = parse_s3_reference(
            "s3://arn:aws:s3:us-west-2:123456789012:accesspoint/my-ap/object/key.nc",
        )
        .unwrap();
        assert_eq!(ap.region.as_deref(), Some("us-west-2"));
        assert!(ap.bucket.contains("accesspoint/my-ap"));
        assert_eq!(ap.key, "object/key.nc");
    }

    #[test]
    fn invalid_s3_forms_rejected() {
        assert!(parse_s3_reference("s3://bucket-only").is_err());
        assert!(parse_s3_reference("https://example.test/not-s3").is_err());
    }

    #[test]
    fn retry_delay_backoff_and_retry_after_cap() {
        assert_eq!(retry_delay(1, None), Duration::from_millis(500));
        assert_eq!(retry_delay(2, None), Duration::from_secs(1));
        assert_eq!(retry_delay(10, None), BACKOFF_CEILING);
        assert_eq!(
            retry_delay(1, Some(Duration::from_secs(7))),
            Duration::from_secs(7)
        );
        assert_eq!(retry_delay(10, Some(Duration::from_secs(120))), BACKOFF_CEILING);
    }

    #[tokio::test]
    async fn http_fetch_names_file_from_disposition() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/data"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Type", "application/json")
                    .insert_header("Content-Disposition", "attachment; filename=\"arr.json\""),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/data"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Type", "application/json")
                    .insert_header("Content-Disposition", "attachment; filename=\"arr.json\"")
                    .set_body_string("[1,2,3]"),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let fetcher = Fetcher::new(test_settings(dir.path(), vec![]));
        let fetched = fetcher
            .fetch(
                &format!("{}/data", server.uri()),
                dir.path(),
                &FetchOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(fetched.filename, "arr.json");
        assert_eq!(fetched.media_type.as_deref(), Some("application/json"));
        assert_eq!(std::fs::read_to_string(fetched.local_path).unwrap(), "[1,2,3]");
    }

    #[tokio::test]
    async fn http_fetch_retries_transient_503() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let fetcher = Fetcher::new(test_settings(dir.path(), vec![]));
        let fetched = fetcher
            .fetch(
                &format!("{}/flaky", server.uri()),
                dir.path(),
                &FetchOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(fetched.local_path).unwrap(), "ok");
    }

    #[tokio::test]
    async fn http_fetch_maps_auth_statuses() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/secret"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let fetcher = Fetcher::new(test_settings(dir.path(), vec![]));
        let err = fetcher
            .fetch(
                &format!("{}/secret", server.uri()),
                dir.path(),
                &FetchOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "REF_AUTH_REQUIRED");
    }

    #[tokio::test]
    async fn http_404_stays_in_the_fetcher_code_family() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/missing.nc"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let fetcher = Fetcher::new(test_settings(dir.path(), vec![]));
        let err = fetcher
            .fetch(
                &format!("{}/missing.nc", server.uri()),
                dir.path(),
                &FetchOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "REF_UNREACHABLE");
        // a definite 404 is not retried, neither here nor at step level
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn file_scheme_requires_allowlist() {
        let dir = tempfile::tempdir().unwrap();
        let allowed = tempfile::tempdir().unwrap();
        let inside = allowed.path().join("data.txt");
        std::fs::write(&inside, "hello").unwrap();
        let outside = dir.path().join("secret.txt");
        std::fs::write(&outside, "no").unwrap();

        let fetcher = Fetcher::new(test_settings(
            &dir.path().join("outputs"),
            vec![allowed.path().canonicalize().unwrap()],
        ));

        let ok = fetcher
            .fetch(
                &format!("file://{}", inside.display()),
                dir.path(),
                &FetchOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(ok.filename, "data.txt");

        let err = fetcher
            .fetch(
                &format!("file://{}", outside.display()),
                dir.path(),
                &FetchOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "REF_INVALID");
    }

    #[tokio::test]
    async fn format_mismatch_detected_by_extension() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/file.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not netcdf"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let fetcher = Fetcher::new(test_settings(dir.path(), vec![]));
        let options = FetchOptions {
            expect_media_type: Some("application/x-netcdf".into()),
            ..Default::default()
        };
        let err = fetcher
            .fetch(&format!("{}/file.txt", server.uri()), dir.path(), &options)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "REF_FORMAT_MISMATCH");
    }
}
