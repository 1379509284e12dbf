use std::{env::VarError, fs, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{Context, Result, bail};
use serde_json::Value;
use url::Url;

use crate::ident::MAX_DIGITS;

const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
/// Slack kept between a drive upload's own deadline and the bounds around it.
const TIMEOUT_HEADROOM: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BlobStoreSelector {
    Fs,
    Gcs,
    S3,
    Drive,
}

impl FromStr for BlobStoreSelector {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fs" | "local" => Ok(Self::Fs),
            "gcs" => Ok(Self::Gcs),
            "s3" => Ok(Self::S3),
            "drive" => Ok(Self::Drive),
            other => bail!("unsupported blob store '{other}'"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" | "text" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => bail!("unsupported log format '{other}'"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct FsConfig {
    pub root: PathBuf,
    pub file_mode: Option<u32>,
    pub dir_mode: Option<u32>,
}

#[derive(Clone, Debug)]
pub struct GcsConfig {
    pub bucket: String,
    /// Service account key. Application default credentials when absent.
    pub credentials_json: Option<Value>,
    pub endpoint: Option<String>,
    pub prefix: String,
}

#[derive(Clone, Debug)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    pub endpoint_url: Option<String>,
    pub force_path_style: bool,
    pub public_url_base: Option<String>,
    pub prefix: String,
}

#[derive(Clone, Debug)]
pub struct DriveConfig {
    pub base_url: Url,
    pub token: Option<String>,
    pub poll_interval: Duration,
    pub upload_timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub request_timeout: Duration,
    pub backend_timeout: Duration,
    pub max_upload_bytes: Option<u64>,
    pub hash_digits: u32,

    pub blob_store: BlobStoreSelector,

    pub fs: Option<FsConfig>,
    pub gcs: Option<GcsConfig>,
    pub s3: Option<S3Config>,
    pub drive: Option<DriveConfig>,

    pub prediction_url: Option<Url>,
    pub log_format: LogFormat,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name))
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Result<String, VarError>,
    {
        let var = |name: &str| optional_string(name, lookup(name));

        let blob_store = match var("BLOB_STORE")? {
            Some(value) => value.parse()?,
            None => infer_blob_store(&var)?,
        };

        let prefix = var("OBJECT_KEY_PREFIX")?
            .map(|p| p.trim_matches('/').to_string())
            .unwrap_or_else(|| "uploads".into());

        let fs = if blob_store == BlobStoreSelector::Fs {
            Some(FsConfig {
                root: parse_optional_path_result("DATA_DIR", lookup("DATA_DIR"))?
                    .unwrap_or_else(|| PathBuf::from("uploads")),
                file_mode: parse_mode("FS_FILE_MODE", lookup("FS_FILE_MODE"))?,
                dir_mode: parse_mode("FS_DIR_MODE", lookup("FS_DIR_MODE"))?,
            })
        } else {
            None
        };

        let gcs = if blob_store == BlobStoreSelector::Gcs {
            let bucket = gcs_bucket(&var)?
                .context("GCS_BUCKET (or GCLOUD_BUCKET) is required when BLOB_STORE=gcs")?;

            let credentials_json = if let Some(inline) = var("GCS_SERVICE_ACCOUNT_JSON")? {
                Some(
                    serde_json::from_str::<Value>(&inline)
                        .context("GCS_SERVICE_ACCOUNT_JSON must contain valid JSON")?,
                )
            } else if let Some(path) = parse_optional_path_result(
                "GCS_SERVICE_ACCOUNT_PATH",
                lookup("GCS_SERVICE_ACCOUNT_PATH"),
            )? {
                let contents = fs::read_to_string(&path).with_context(|| {
                    format!(
                        "failed to read GCS service account file at {}",
                        path.display()
                    )
                })?;
                Some(serde_json::from_str::<Value>(&contents).with_context(|| {
                    format!(
                        "invalid JSON in GCS service account file at {}",
                        path.display()
                    )
                })?)
            } else {
                None
            };

            Some(GcsConfig {
                bucket,
                credentials_json,
                endpoint: var("GCS_ENDPOINT")?,
                prefix: prefix.clone(),
            })
        } else {
            None
        };

        let s3 = if blob_store == BlobStoreSelector::S3 {
            Some(S3Config {
                bucket: var("S3_BUCKET")?.context("S3_BUCKET is required when BLOB_STORE=s3")?,
                region: var("AWS_REGION")?.unwrap_or_else(|| "us-east-1".into()),
                endpoint_url: var("AWS_ENDPOINT_URL")?,
                force_path_style: parse_env_bool_result(
                    "S3_FORCE_PATH_STYLE",
                    lookup("S3_FORCE_PATH_STYLE"),
                )?
                .unwrap_or(false),
                public_url_base: var("S3_PUBLIC_URL_BASE")?,
                prefix: prefix.clone(),
            })
        } else {
            None
        };

        let drive = if blob_store == BlobStoreSelector::Drive {
            let raw = var("REMOTE_DRIVE_URL")?
                .context("REMOTE_DRIVE_URL is required when BLOB_STORE=drive")?;
            Some(DriveConfig {
                base_url: parse_http_url("REMOTE_DRIVE_URL", &raw)?,
                token: var("REMOTE_DRIVE_TOKEN")?,
                poll_interval: Duration::from_millis(
                    parse_number("REMOTE_DRIVE_POLL_MS", var("REMOTE_DRIVE_POLL_MS")?)?
                        .unwrap_or(250)
                        .max(1),
                ),
                upload_timeout: Duration::from_secs(
                    parse_number(
                        "REMOTE_DRIVE_UPLOAD_TIMEOUT_SECS",
                        var("REMOTE_DRIVE_UPLOAD_TIMEOUT_SECS")?,
                    )?
                    .unwrap_or(120),
                ),
            })
        } else {
            None
        };

        let hash_digits = parse_number("HASH_DIGITS", var("HASH_DIGITS")?)?.unwrap_or(9);
        if hash_digits == 0 || hash_digits > MAX_DIGITS {
            bail!("HASH_DIGITS must be between 1 and {MAX_DIGITS}, got {hash_digits}");
        }

        let max_upload_bytes =
            match parse_number::<u64>("MAX_UPLOAD_BYTES", var("MAX_UPLOAD_BYTES")?)? {
                Some(0) => None,
                Some(limit) => Some(limit),
                None => Some(10 * 1024 * 1024),
            };

        let prediction_url = var("PREDICTION_URL")?
            .map(|raw| parse_http_url("PREDICTION_URL", &raw))
            .transpose()?;

        let backend_timeout =
            parse_number::<u64>("BACKEND_TIMEOUT_SECS", var("BACKEND_TIMEOUT_SECS")?)?
                .map(|secs| Duration::from_secs(secs.max(1)));
        let request_timeout =
            parse_number::<u64>("REQUEST_TIMEOUT_SECS", var("REQUEST_TIMEOUT_SECS")?)?
                .map(|secs| Duration::from_secs(secs.max(1)));
        let (backend_timeout, request_timeout) =
            outer_timeouts(drive.as_ref(), backend_timeout, request_timeout)?;

        Ok(Self {
            port: parse_number("PORT", var("PORT")?)?.unwrap_or(4000),
            request_timeout,
            backend_timeout,
            max_upload_bytes,
            hash_digits,

            blob_store,

            fs,
            gcs,
            s3,
            drive,

            prediction_url,
            log_format: var("LOG_FORMAT")?
                .map(|v| v.parse())
                .transpose()?
                .unwrap_or_default(),
        })
    }
}

/// Resolves the backend and request timeouts. A drive upload may poll for
/// up to `upload_timeout`, so both outer bounds must leave it room: unset
/// values default past it and explicit ones that would cut it short are
/// rejected.
fn outer_timeouts(
    drive: Option<&DriveConfig>,
    backend: Option<Duration>,
    request: Option<Duration>,
) -> Result<(Duration, Duration)> {
    let Some(drive) = drive else {
        return Ok((
            backend.unwrap_or(DEFAULT_BACKEND_TIMEOUT),
            request.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
        ));
    };

    let backend = match backend {
        Some(backend) if backend <= drive.upload_timeout => bail!(
            "BACKEND_TIMEOUT_SECS ({}s) must exceed REMOTE_DRIVE_UPLOAD_TIMEOUT_SECS ({}s)",
            backend.as_secs(),
            drive.upload_timeout.as_secs()
        ),
        Some(backend) => backend,
        None => DEFAULT_BACKEND_TIMEOUT.max(drive.upload_timeout + TIMEOUT_HEADROOM),
    };
    let request = match request {
        Some(request) if request <= backend => bail!(
            "REQUEST_TIMEOUT_SECS ({}s) must exceed the backend timeout ({}s) when BLOB_STORE=drive",
            request.as_secs(),
            backend.as_secs()
        ),
        Some(request) => request,
        None => DEFAULT_REQUEST_TIMEOUT.max(backend + TIMEOUT_HEADROOM),
    };
    Ok((backend, request))
}

/// Pick a backend from whichever backend settings are present: GCS, then S3,
/// then the remote drive, falling back to the local directory.
fn infer_blob_store(var: &dyn Fn(&str) -> Result<Option<String>>) -> Result<BlobStoreSelector> {
    if gcs_bucket(var)?.is_some() {
        Ok(BlobStoreSelector::Gcs)
    } else if var("S3_BUCKET")?.is_some() {
        Ok(BlobStoreSelector::S3)
    } else if var("REMOTE_DRIVE_URL")?.is_some() {
        Ok(BlobStoreSelector::Drive)
    } else {
        Ok(BlobStoreSelector::Fs)
    }
}

fn gcs_bucket(var: &dyn Fn(&str) -> Result<Option<String>>) -> Result<Option<String>> {
    match var("GCS_BUCKET")? {
        Some(bucket) => Ok(Some(bucket)),
        None => var("GCLOUD_BUCKET"),
    }
}

/// Trimmed value of `name`; unset and blank both read as `None`.
fn optional_string(name: &str, value: Result<String, VarError>) -> Result<Option<String>> {
    match value {
        Ok(value) => {
            let trimmed = value.trim();
            Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
        }
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => {
            bail!("{name} contains invalid unicode characters")
        }
    }
}

fn parse_number<T>(name: &str, value: Option<String>) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .map(|v| {
            v.parse::<T>()
                .with_context(|| format!("{name} must be a non-negative integer, got '{v}'"))
        })
        .transpose()
}

fn parse_http_url(name: &str, raw: &str) -> Result<Url> {
    let url = Url::parse(raw).with_context(|| format!("{name} is not a valid URL"))?;
    if !matches!(url.scheme(), "http" | "https") {
        bail!("{name} must use http or https");
    }
    Ok(url)
}

fn parse_env_bool_result(name: &str, value: Result<String, VarError>) -> Result<Option<bool>> {
    match value {
        Ok(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                bail!("{name} may not be empty");
            }
            match trimmed.to_ascii_lowercase().as_str() {
                "1" | "true" => Ok(Some(true)),
                "0" | "false" => Ok(Some(false)),
                other => bail!("invalid boolean value '{other}' for {name}"),
            }
        }
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => {
            bail!("{name} contains invalid unicode characters")
        }
    }
}

fn parse_optional_path_result(
    name: &str,
    value: Result<String, VarError>,
) -> Result<Option<PathBuf>> {
    match value {
        Ok(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                bail!("{name} may not be empty");
            }
            Ok(Some(PathBuf::from(trimmed)))
        }
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => {
            bail!("{name} contains invalid unicode characters")
        }
    }
}

fn parse_mode(name: &str, value: Result<String, VarError>) -> Result<Option<u32>> {
    match value {
        Ok(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            let digits = trimmed
                .strip_prefix("0o")
                .or_else(|| trimmed.strip_prefix("0O"))
                .unwrap_or(trimmed)
                .trim_start_matches('0');
            let digits = if digits.is_empty() { "0" } else { digits };
            let mode = u32::from_str_radix(digits, 8)
                .with_context(|| format!("{name} must be a valid octal number"))?;
            Ok(Some(mode))
        }
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => {
            bail!("{name} contains invalid UTF-8")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned().ok_or(VarError::NotPresent))
    }

    #[test]
    fn defaults_to_local_storage() {
        let cfg = config_from(&[]).unwrap();
        assert_eq!(cfg.blob_store, BlobStoreSelector::Fs);
        assert_eq!(cfg.port, 4000);
        assert_eq!(cfg.hash_digits, 9);
        assert_eq!(cfg.max_upload_bytes, Some(10 * 1024 * 1024));
        assert_eq!(cfg.request_timeout, Duration::from_secs(60));
        assert_eq!(cfg.backend_timeout, Duration::from_secs(30));
        assert_eq!(cfg.log_format, LogFormat::Compact);
        assert!(cfg.prediction_url.is_none());
        let fs = cfg.fs.unwrap();
        assert_eq!(fs.root, PathBuf::from("uploads"));
        assert!(cfg.gcs.is_none() && cfg.s3.is_none() && cfg.drive.is_none());
    }

    #[test]
    fn infers_gcs_from_legacy_bucket_variable() {
        let cfg = config_from(&[("GCLOUD_BUCKET", "flowers"), ("S3_BUCKET", "other")]).unwrap();
        assert_eq!(cfg.blob_store, BlobStoreSelector::Gcs);
        let gcs = cfg.gcs.unwrap();
        assert_eq!(gcs.bucket, "flowers");
        assert_eq!(gcs.prefix, "uploads");
        assert!(gcs.credentials_json.is_none());
    }

    #[test]
    fn infers_drive_before_local() {
        let cfg = config_from(&[("REMOTE_DRIVE_URL", "https://drive.example.com/api")]).unwrap();
        assert_eq!(cfg.blob_store, BlobStoreSelector::Drive);
        let drive = cfg.drive.unwrap();
        assert_eq!(drive.poll_interval, Duration::from_millis(250));
        assert_eq!(drive.upload_timeout, Duration::from_secs(120));
        assert_eq!(cfg.backend_timeout, Duration::from_secs(150));
        assert_eq!(cfg.request_timeout, Duration::from_secs(180));
    }

    #[test]
    fn drive_timeouts_must_outlast_the_upload_deadline() {
        let drive_url = ("REMOTE_DRIVE_URL", "https://drive.example.com/api");

        let cfg = config_from(&[drive_url, ("REMOTE_DRIVE_UPLOAD_TIMEOUT_SECS", "10")]).unwrap();
        assert_eq!(cfg.backend_timeout, Duration::from_secs(40));
        assert_eq!(cfg.request_timeout, Duration::from_secs(70));

        let err = config_from(&[drive_url, ("BACKEND_TIMEOUT_SECS", "30")]).unwrap_err();
        assert!(err.to_string().contains("must exceed REMOTE_DRIVE_UPLOAD_TIMEOUT_SECS"));

        let err = config_from(&[
            drive_url,
            ("BACKEND_TIMEOUT_SECS", "200"),
            ("REQUEST_TIMEOUT_SECS", "60"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("REQUEST_TIMEOUT_SECS"));

        let cfg = config_from(&[
            drive_url,
            ("BACKEND_TIMEOUT_SECS", "200"),
            ("REQUEST_TIMEOUT_SECS", "240"),
        ])
        .unwrap();
        assert_eq!(cfg.backend_timeout, Duration::from_secs(200));
        assert_eq!(cfg.request_timeout, Duration::from_secs(240));
    }

    #[test]
    fn explicit_timeouts_apply_without_drive() {
        let cfg = config_from(&[("BACKEND_TIMEOUT_SECS", "5"), ("REQUEST_TIMEOUT_SECS", "0")])
            .unwrap();
        assert_eq!(cfg.backend_timeout, Duration::from_secs(5));
        assert_eq!(cfg.request_timeout, Duration::from_secs(1));
    }

    #[test]
    fn explicit_selector_wins_over_inference() {
        let cfg = config_from(&[
            ("BLOB_STORE", "fs"),
            ("GCS_BUCKET", "flowers"),
            ("DATA_DIR", "/srv/uploads"),
            ("FS_FILE_MODE", "0o640"),
        ])
        .unwrap();
        assert_eq!(cfg.blob_store, BlobStoreSelector::Fs);
        let fs = cfg.fs.unwrap();
        assert_eq!(fs.root, PathBuf::from("/srv/uploads"));
        assert_eq!(fs.file_mode, Some(0o640));
        assert!(cfg.gcs.is_none());
    }

    #[test]
    fn s3_settings_are_read() {
        let cfg = config_from(&[
            ("S3_BUCKET", "petals"),
            ("AWS_ENDPOINT_URL", "http://localhost:9000"),
            ("S3_FORCE_PATH_STYLE", "true"),
            ("OBJECT_KEY_PREFIX", "/subs/"),
        ])
        .unwrap();
        let s3 = cfg.s3.unwrap();
        assert_eq!(s3.bucket, "petals");
        assert_eq!(s3.region, "us-east-1");
        assert!(s3.force_path_style);
        assert_eq!(s3.prefix, "subs");
    }

    #[test]
    fn selected_backend_requires_its_settings() {
        let err = config_from(&[("BLOB_STORE", "s3")]).unwrap_err();
        assert!(err.to_string().contains("S3_BUCKET is required"));
        let err = config_from(&[("BLOB_STORE", "drive")]).unwrap_err();
        assert!(err.to_string().contains("REMOTE_DRIVE_URL is required"));
        let err = config_from(&[("BLOB_STORE", "mega")]).unwrap_err();
        assert!(err.to_string().contains("unsupported blob store 'mega'"));
    }

    #[test]
    fn inline_gcs_credentials_must_be_json() {
        let err = config_from(&[
            ("GCS_BUCKET", "flowers"),
            ("GCS_SERVICE_ACCOUNT_JSON", "{nope"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("must contain valid JSON"));
    }

    #[test]
    fn hash_digits_are_bounded() {
        assert_eq!(config_from(&[("HASH_DIGITS", "4")]).unwrap().hash_digits, 4);
        assert!(config_from(&[("HASH_DIGITS", "0")]).is_err());
        assert!(config_from(&[("HASH_DIGITS", "19")]).is_err());
        assert!(config_from(&[("HASH_DIGITS", "many")]).is_err());
    }

    #[test]
    fn zero_upload_limit_disables_it() {
        let cfg = config_from(&[("MAX_UPLOAD_BYTES", "0")]).unwrap();
        assert_eq!(cfg.max_upload_bytes, None);
    }

    #[test]
    fn prediction_url_must_be_http() {
        let cfg = config_from(&[("PREDICTION_URL", "http://localhost:5000/predict")]).unwrap();
        assert_eq!(
            cfg.prediction_url.unwrap().as_str(),
            "http://localhost:5000/predict"
        );
        assert!(config_from(&[("PREDICTION_URL", "ftp://x/predict")]).is_err());
    }

    #[test]
    fn log_format_parses() {
        let cfg = config_from(&[("LOG_FORMAT", "JSON")]).unwrap();
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert!(config_from(&[("LOG_FORMAT", "xml")]).is_err());
    }

    #[test]
    fn parse_env_bool_supports_true_and_false() {
        assert_eq!(
            parse_env_bool_result("__TEST_BOOL_TRUE", Ok("true".to_string())).unwrap(),
            Some(true)
        );

        assert_eq!(
            parse_env_bool_result("__TEST_BOOL_FALSE", Ok("0".to_string())).unwrap(),
            Some(false)
        );
    }

    #[test]
    fn parse_env_bool_rejects_invalid_values() {
        let err =
            parse_env_bool_result("__TEST_BOOL_INVALID", Ok("maybe".to_string())).unwrap_err();
        assert!(
            err.to_string()
                .contains("invalid boolean value 'maybe' for __TEST_BOOL_INVALID")
        );
    }

    #[test]
    fn parse_env_bool_returns_none_when_missing() {
        assert_eq!(
            parse_env_bool_result("__TEST_BOOL_MISSING", Err(VarError::NotPresent)).unwrap(),
            None
        );
    }

    #[test]
    fn parse_optional_path_rejects_empty_values() {
        let err =
            parse_optional_path_result("__TEST_PATH_EMPTY", Ok("   ".to_string())).unwrap_err();
        assert!(
            err.to_string()
                .contains("__TEST_PATH_EMPTY may not be empty")
        );
    }

    #[test]
    fn parse_mode_accepts_octal_forms() {
        assert_eq!(parse_mode("M", Ok("0755".into())).unwrap(), Some(0o755));
        assert_eq!(parse_mode("M", Ok("0o600".into())).unwrap(), Some(0o600));
        assert_eq!(parse_mode("M", Ok("".into())).unwrap(), None);
        assert!(parse_mode("M", Ok("9".into())).is_err());
    }
}
