// Resolved settings. Everything is environment-backed (WEFT_* variables);
// binaries load .env via dotenvy before calling Settings::from_env.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;

/// Operating mode of the deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Configuration {
    /// No restriction: local execution and remote dispatch both allowed.
    #[default]
    Default,
    /// Dispatches workflow steps to remote providers only.
    Ems,
    /// Executes application packages locally only.
    Ades,
    /// Both roles.
    Hybrid,
}

impl std::str::FromStr for Configuration {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "default" | "" => Ok(Configuration::Default),
            "ems" => Ok(Configuration::Ems),
            "ades" => Ok(Configuration::Ades),
            "hybrid" => Ok(Configuration::Hybrid),
            _ => anyhow::bail!("unknown configuration: {}. Use DEFAULT, EMS, ADES or HYBRID", s),
        }
    }
}

impl Configuration {
    pub fn allows_local_execution(self) -> bool {
        !matches!(self, Configuration::Ems)
    }

    pub fn allows_remote_dispatch(self) -> bool {
        !matches!(self, Configuration::Ades)
    }
}

/// Per-URL request options profile, loaded from the request-options file.
/// The first profile whose `url` regex matches wins.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestProfile {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub backoff: Option<f64>,
    #[serde(default = "default_true")]
    pub verify: bool,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub cache: Option<bool>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct RequestOptionsFile {
    #[serde(default)]
    requests: Vec<RequestProfile>,
}

/// Compiled request-options with a TTL'd match cache.
#[derive(Debug)]
pub struct RequestOptions {
    profiles: Vec<(Regex, RequestProfile)>,
    cache: Mutex<HashMap<String, (usize, Instant)>>,
    cache_ttl: Duration,
}

impl RequestOptions {
    pub fn empty() -> Self {
        Self {
            profiles: Vec::new(),
            cache: Mutex::new(HashMap::new()),
            cache_ttl: Duration::from_secs(60),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read request options file {}", path.display()))?;
        let file: RequestOptionsFile =
            serde_json::from_str(&raw).context("invalid request options file")?;
        let mut profiles = Vec::with_capacity(file.requests.len());
        for profile in file.requests {
            let re = Regex::new(&profile.url)
                .with_context(|| format!("invalid url pattern: {}", profile.url))?;
            profiles.push((re, profile));
        }
        Ok(Self {
            profiles,
            cache: Mutex::new(HashMap::new()),
            cache_ttl: Duration::from_secs(60),
        })
    }

    /// Profile matching the URL, if any. Matches are cached per URL with a
    /// short TTL since the same URL is probed repeatedly during staging.
    pub fn for_url(&self, url: &str) -> Option<&RequestProfile> {
        if self.profiles.is_empty() {
            return None;
        }
        {
            let cache = self.cache.lock().expect("request options cache poisoned");
            if let Some((idx, at)) = cache.get(url) {
                if at.elapsed() < self.cache_ttl {
                    return Some(&self.profiles[*idx].1);
                }
            }
        }
        let found = self.profiles.iter().position(|(re, _)| re.is_match(url));
        if let Some(idx) = found {
            let mut cache = self.cache.lock().expect("request options cache poisoned");
            cache.insert(url.to_string(), (idx, Instant::now()));
            return Some(&self.profiles[idx].1);
        }
        None
    }
}

/// Centralised resolved settings.
#[derive(Debug)]
pub struct Settings {
    /// Operating mode (WEFT_CONFIGURATION).
    pub configuration: Configuration,
    /// Public URL of the API root (WEFT_URL).
    pub url: String,
    /// Local directory where job outputs are published (WEFT_WPS_OUTPUT_DIR).
    pub wps_output_dir: PathBuf,
    /// Public URL under which `wps_output_dir` is served (WEFT_WPS_OUTPUT_URL).
    pub wps_output_url: String,
    /// Optional S3 bucket for output publication (WEFT_WPS_OUTPUT_S3_BUCKET).
    pub wps_output_s3_bucket: Option<String>,
    pub wps_output_s3_region: Option<String>,
    /// Default output context sub-path (WEFT_WPS_OUTPUT_CONTEXT).
    pub wps_output_context: Option<String>,
    /// CWL engine working directory (WEFT_WPS_WORKDIR).
    pub wps_workdir: PathBuf,
    /// Effective uid/gid handed to the CWL engine (WEFT_CWL_EUID / _EGID).
    pub cwl_euid: Option<u32>,
    pub cwl_egid: Option<u32>,
    /// Upper bound for the synchronous wait bridge, seconds.
    pub execute_sync_max_wait: u64,
    /// Maximum accepted request body, bytes (WEFT_WPS_MAX_REQUEST_SIZE).
    pub wps_max_request_size: u64,
    /// Maximum size of a single staged input, bytes.
    pub wps_max_single_input_size: u64,
    /// Per-URL request profiles.
    pub request_options: RequestOptions,
    /// Directory of CWL processes registered at startup.
    pub cwl_processes_dir: Option<PathBuf>,
    /// Fail startup when a preloaded CWL process cannot register.
    pub cwl_processes_register_error: bool,
    /// Provenance capture toggle (WEFT_CWL_PROV).
    pub cwl_prov: bool,
    /// External schemas base URL.
    pub schema_url: String,
    /// Email notification timeout, seconds.
    pub wps_email_notify_timeout: u64,
    /// Vault storage directory and master secret.
    pub vault_dir: PathBuf,
    pub vault_secret: Option<String>,
    /// Allowlisted roots for file:// references.
    pub file_allowlist: Vec<PathBuf>,
    /// Local CWL engine executable.
    pub cwl_engine: String,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let configuration = std::env::var("WEFT_CONFIGURATION")
            .unwrap_or_default()
            .parse()?;
        let url = std::env::var("WEFT_URL").unwrap_or_else(|_| "http://localhost:9000".into());
        let wps_output_dir: PathBuf = std::env::var("WEFT_WPS_OUTPUT_DIR")
            .unwrap_or_else(|_| "/tmp/weft/outputs".into())
            .into();
        let wps_output_url = std::env::var("WEFT_WPS_OUTPUT_URL")
            .unwrap_or_else(|_| format!("{}/wpsoutputs", url.trim_end_matches('/')));
        let request_options = match std::env::var("WEFT_REQUEST_OPTIONS") {
            Ok(path) => RequestOptions::load(Path::new(&path))?,
            Err(_) => RequestOptions::empty(),
        };

        Ok(Self {
            configuration,
            url,
            wps_output_dir,
            wps_output_url,
            wps_output_s3_bucket: std::env::var("WEFT_WPS_OUTPUT_S3_BUCKET").ok(),
            wps_output_s3_region: std::env::var("WEFT_WPS_OUTPUT_S3_REGION").ok(),
            wps_output_context: std::env::var("WEFT_WPS_OUTPUT_CONTEXT").ok(),
            wps_workdir: std::env::var("WEFT_WPS_WORKDIR")
                .unwrap_or_else(|_| "/tmp/weft/work".into())
                .into(),
            cwl_euid: env_parse("WEFT_CWL_EUID")?,
            cwl_egid: env_parse("WEFT_CWL_EGID")?,
            execute_sync_max_wait: env_parse("WEFT_EXECUTE_SYNC_MAX_WAIT")?.unwrap_or(20),
            wps_max_request_size: env_parse("WEFT_WPS_MAX_REQUEST_SIZE")?
                .unwrap_or(30 * 1024 * 1024),
            wps_max_single_input_size: env_parse("WEFT_WPS_MAX_SINGLE_INPUT_SIZE")?
                .unwrap_or(3 * 1024 * 1024 * 1024),
            request_options,
            cwl_processes_dir: std::env::var("WEFT_CWL_PROCESSES_DIR").ok().map(Into::into),
            cwl_processes_register_error: env_flag("WEFT_CWL_PROCESSES_REGISTER_ERROR", false),
            cwl_prov: env_flag("WEFT_CWL_PROV", true),
            schema_url: std::env::var("WEFT_SCHEMA_URL")
                .unwrap_or_else(|_| "https://schemas.opengis.net".into()),
            wps_email_notify_timeout: env_parse("WEFT_WPS_EMAIL_NOTIFY_TIMEOUT")?.unwrap_or(10),
            vault_dir: std::env::var("WEFT_VAULT_DIR")
                .unwrap_or_else(|_| "/tmp/weft/vault".into())
                .into(),
            vault_secret: std::env::var("WEFT_VAULT_SECRET").ok(),
            file_allowlist: std::env::var("WEFT_FILE_ALLOWLIST")
                .map(|v| v.split(':').map(PathBuf::from).collect())
                .unwrap_or_default(),
            cwl_engine: std::env::var("WEFT_CWL_ENGINE").unwrap_or_else(|_| "cwltool".into()),
        })
    }

    /// Job root under the output directory: `{context?}/{job_id}`.
    pub fn job_output_dir(&self, context: Option<&str>, job_id: uuid::Uuid) -> PathBuf {
        let mut dir = self.wps_output_dir.clone();
        if let Some(ctx) = context.or(self.wps_output_context.as_deref()) {
            dir.push(ctx);
        }
        dir.push(job_id.to_string());
        dir
    }

    /// Public URL mirroring `job_output_dir`.
    pub fn job_output_url(&self, context: Option<&str>, job_id: uuid::Uuid) -> String {
        let base = self.wps_output_url.trim_end_matches('/');
        match context.or(self.wps_output_context.as_deref()) {
            Some(ctx) => format!("{}/{}/{}", base, ctx.trim_matches('/'), job_id),
            None => format!("{}/{}", base, job_id),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => v
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("invalid {}: {}", name, e)),
        _ => Ok(None),
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_parse() {
        assert_eq!(
            "ADES".parse::<Configuration>().unwrap(),
            Configuration::Ades
        );
        assert_eq!("ems".parse::<Configuration>().unwrap(), Configuration::Ems);
        assert_eq!("".parse::<Configuration>().unwrap(), Configuration::Default);
        assert!("wild".parse::<Configuration>().is_err());
    }

    #[test]
    fn mode_capabilities() {
        assert!(Configuration::Ades.allows_local_execution());
        assert!(!Configuration::Ades.allows_remote_dispatch());
        assert!(!Configuration::Ems.allows_local_execution());
        assert!(Configuration::Ems.allows_remote_dispatch());
        assert!(Configuration::Hybrid.allows_local_execution());
        assert!(Configuration::Hybrid.allows_remote_dispatch());
    }

    #[test]
    fn request_options_first_match_wins() {
        let mut opts = RequestOptions::empty();
        opts.profiles.push((
            Regex::new("^https://slow\\.example\\.test/").unwrap(),
            RequestProfile {
                url: "^https://slow\\.example\\.test/".into(),
                method: None,
                timeout: Some(120),
                retries: Some(5),
                backoff: None,
                verify: true,
                headers: HashMap::new(),
                cache: None,
            },
        ));
        opts.profiles.push((
            Regex::new(".*").unwrap(),
            RequestProfile {
                url: ".*".into(),
                method: None,
                timeout: Some(30),
                retries: None,
                backoff: None,
                verify: true,
                headers: HashMap::new(),
                cache: None,
            },
        ));

        let slow = opts.for_url("https://slow.example.test/data").unwrap();
        assert_eq!(slow.timeout, Some(120));
        let other = opts.for_url("https://fast.example.test/data").unwrap();
        assert_eq!(other.timeout, Some(30));
    }

    #[test]
    fn job_output_paths_nest_context() {
        let settings = Settings {
            configuration: Configuration::Default,
            url: "http://localhost:9000".into(),
            wps_output_dir: "/data/outputs".into(),
            wps_output_url: "http://localhost:9000/wpsoutputs".into(),
            wps_output_s3_bucket: None,
            wps_output_s3_region: None,
            wps_output_context: None,
            wps_workdir: "/tmp".into(),
            cwl_euid: None,
            cwl_egid: None,
            execute_sync_max_wait: 20,
            wps_max_request_size: 1,
            wps_max_single_input_size: 1,
            request_options: RequestOptions::empty(),
            cwl_processes_dir: None,
            cwl_processes_register_error: false,
            cwl_prov: true,
            schema_url: String::new(),
            wps_email_notify_timeout: 10,
            vault_dir: "/tmp/vault".into(),
            vault_secret: None,
            file_allowlist: vec![],
            cwl_engine: "cwltool".into(),
        };
        let id = uuid::Uuid::nil();
        assert_eq!(
            settings.job_output_dir(Some("proj-a"), id),
            PathBuf::from(format!("/data/outputs/proj-a/{}", id))
        );
        assert_eq!(
            settings.job_output_url(None, id),
            format!("http://localhost:9000/wpsoutputs/{}", id)
        );
    }
}
