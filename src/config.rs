//! CLI arguments, defaults and the validated server configuration.

use clap::Parser;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ConfigError;
use crate::resolver::UploadEndpoint;

pub const DEFAULT_UPLOAD_URL: &str = "/uploads";
pub const DEFAULT_MAX_UPLOAD_SIZE: u64 = 100 * 1024 * 1024 * 1024;
pub const DEFAULT_MAX_CHUNK_SIZE: u64 = 64 * 1024 * 1024;
pub const DEFAULT_RETENTION_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 900;
pub const DEFAULT_LOCK_WAIT_TIMEOUT_MS: u64 = 3_000;
/// Lock wait used by the expiry sweep; busy uploads are simply skipped.
pub const SWEEP_LOCK_TIMEOUT_MS: u64 = 50;
pub const BUSY_RETRY_AFTER_SECS: u64 = 1;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "tus-drive", version, about = "Resumable upload (tus 1.0.0) server")]
pub struct Args {
    #[arg(
        short = 's',
        long,
        env = "TUS_STORAGE_DIR",
        default_value = ".tus-drive/uploads",
        help = "Directory uploads are stored in"
    )]
    pub storage_dir: String,
    #[arg(
        short = 'u',
        long,
        env = "TUS_UPLOAD_URL",
        default_value = DEFAULT_UPLOAD_URL,
        help = "Upload endpoint URL template, e.g. /user/{username}/uploads"
    )]
    pub upload_url: String,
    #[arg(
        long,
        env = "TUS_UPLOAD_SUFFIX",
        help = "Storage sub-path template below the storage dir, e.g. {username}"
    )]
    pub upload_suffix: Option<String>,
    #[arg(
        long,
        env = "TUS_ENDPOINTS_FILE",
        help = "JSON file with a list of endpoints, replaces the single endpoint flags"
    )]
    pub endpoints_file: Option<PathBuf>,
    #[arg(
        short = 'b',
        long = "bind",
        env = "TUS_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "TUS_HTTP_PORT",
        default_value_t = 5080,
        help = "HTTP port"
    )]
    pub http_port: u16,
    #[arg(long, env = "TUS_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "TUS_MAX_UPLOAD_SIZE",
        default_value_t = DEFAULT_MAX_UPLOAD_SIZE,
        help = "Max declared upload length in bytes (0 to disable)"
    )]
    pub max_upload_size: u64,
    #[arg(
        long,
        env = "TUS_MAX_CHUNK_SIZE",
        default_value_t = DEFAULT_MAX_CHUNK_SIZE,
        help = "Max request body per PATCH in bytes"
    )]
    pub max_chunk_size: u64,
    #[arg(
        long,
        env = "TUS_RETENTION_SECS",
        default_value_t = DEFAULT_RETENTION_SECS,
        help = "Idle seconds before an incomplete upload expires (0 to disable)"
    )]
    pub retention_secs: u64,
    #[arg(
        long,
        env = "TUS_SWEEP_INTERVAL_SECS",
        default_value_t = DEFAULT_SWEEP_INTERVAL_SECS,
        help = "Seconds between expiry sweeps"
    )]
    pub sweep_interval_secs: u64,
    #[arg(
        long,
        env = "TUS_LOCK_TIMEOUT_MS",
        default_value_t = DEFAULT_LOCK_WAIT_TIMEOUT_MS,
        help = "Max wait for a busy upload before answering 423"
    )]
    pub lock_timeout_ms: u64,
    #[arg(
        long,
        env = "TUS_ALLOW_OVERWRITE",
        help = "Let finished uploads replace existing files"
    )]
    pub allow_overwrite: bool,
    #[arg(
        long,
        env = "TUS_DROP_COMPLETED",
        help = "Forget upload records as soon as they are finalized"
    )]
    pub drop_completed: bool,
}

/// One entry of the endpoints file.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EndpointSpec {
    pub upload_url: String,
    pub upload_path: PathBuf,
    #[serde(default)]
    pub upload_suffix: Option<String>,
    #[serde(default)]
    pub retention_secs: Option<u64>,
    #[serde(default)]
    pub max_upload_size: Option<u64>,
    #[serde(default)]
    pub allow_overwrite: Option<bool>,
    #[serde(default)]
    pub retain_completed: Option<bool>,
}

/// Immutable configuration shared by every request handler.
#[derive(Debug)]
pub struct TusConfig {
    pub endpoints: Vec<Arc<UploadEndpoint>>,
    pub max_chunk_size: u64,
    pub lock_timeout: Duration,
    pub sweep_interval: Duration,
}

impl TusConfig {
    pub fn new(endpoints: Vec<UploadEndpoint>) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        for endpoint in &endpoints {
            for shape in endpoint.route_shapes() {
                if !seen.insert(shape) {
                    return Err(ConfigError::DuplicateEndpoint(
                        endpoint.url_template().to_string(),
                    ));
                }
            }
        }
        Ok(Self {
            endpoints: endpoints.into_iter().map(Arc::new).collect(),
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            lock_timeout: Duration::from_millis(DEFAULT_LOCK_WAIT_TIMEOUT_MS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
        })
    }

    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        let endpoints = match &args.endpoints_file {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .map_err(|err| ConfigError::EndpointsFile(format!("{}: {err}", path.display())))?;
                let specs: Vec<EndpointSpec> = serde_json::from_str(&content)
                    .map_err(|err| ConfigError::EndpointsFile(format!("{}: {err}", path.display())))?;
                specs
                    .into_iter()
                    .map(|spec| endpoint_from_spec(spec, args))
                    .collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut endpoint = UploadEndpoint::new(
                    &args.upload_url,
                    PathBuf::from(&args.storage_dir),
                    args.upload_suffix.as_deref(),
                )?;
                apply_defaults(&mut endpoint, args);
                vec![endpoint]
            }
        };

        let mut config = Self::new(endpoints)?;
        config.max_chunk_size = args.max_chunk_size;
        config.lock_timeout = Duration::from_millis(args.lock_timeout_ms);
        config.sweep_interval = Duration::from_secs(args.sweep_interval_secs.max(1));
        Ok(config)
    }
}

fn apply_defaults(endpoint: &mut UploadEndpoint, args: &Args) {
    endpoint.retention = Duration::from_secs(args.retention_secs);
    endpoint.max_size = args.max_upload_size;
    endpoint.allow_overwrite = args.allow_overwrite;
    endpoint.retain_completed = !args.drop_completed;
}

fn endpoint_from_spec(spec: EndpointSpec, args: &Args) -> Result<UploadEndpoint, ConfigError> {
    let mut endpoint = UploadEndpoint::new(
        &spec.upload_url,
        spec.upload_path,
        spec.upload_suffix.as_deref(),
    )?;
    apply_defaults(&mut endpoint, args);
    if let Some(secs) = spec.retention_secs {
        endpoint.retention = Duration::from_secs(secs);
    }
    if let Some(max) = spec.max_upload_size {
        endpoint.max_size = max;
    }
    if let Some(allow) = spec.allow_overwrite {
        endpoint.allow_overwrite = allow;
    }
    if let Some(retain) = spec.retain_completed {
        endpoint.retain_completed = retain;
    }
    Ok(endpoint)
}
