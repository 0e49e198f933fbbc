use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use directories::{BaseDirs, ProjectDirs};
use serde::Deserialize;
use url::Url;

use crate::aggregate::{AggregationOptions, DEFAULT_CONFIDENCE_THRESHOLD, MergePolicy};
use crate::cli::{CliArgs, Command};
use plate_scan_capture::Backend;

const DEFAULT_BIND: &str = "0.0.0.0:8000";
const DEFAULT_ENGINE_TIMEOUT_MS: u64 = 15_000;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    threshold: Option<f32>,
    merge_policy: Option<String>,
    model: Option<String>,
    alphabet: Option<String>,
    engine_timeout_ms: Option<u64>,
    server: ServerFileConfig,
    gate: GateFileConfig,
    capture: CaptureFileConfig,
}

#[derive(Debug, Default, Deserialize, Clone)]
#[serde(default)]
struct ServerFileConfig {
    bind: Option<String>,
}

#[derive(Debug, Default, Deserialize, Clone)]
#[serde(default)]
struct GateFileConfig {
    endpoint: Option<String>,
    rfid: Option<String>,
}

#[derive(Debug, Default, Deserialize, Clone)]
#[serde(default)]
struct CaptureFileConfig {
    backend: Option<String>,
    spool_dir: Option<String>,
    poll_interval_ms: Option<u64>,
}

#[derive(Debug)]
pub struct EffectiveSettings {
    pub threshold: f32,
    /// None means "use the channel's default policy".
    pub merge_policy: Option<MergePolicy>,
    pub model: Option<String>,
    pub model_from_cli: bool,
    pub alphabet: Option<PathBuf>,
    pub engine_timeout: Option<Duration>,
    pub server_bind: SocketAddr,
    pub gate_endpoint: Option<Url>,
    pub rfid: String,
    pub capture_backend: Option<Backend>,
    pub spool_dir: Option<PathBuf>,
    pub poll_interval: Option<Duration>,
    pub config_dir: Option<PathBuf>,
}

impl EffectiveSettings {
    pub fn aggregation_options(&self, channel_default: MergePolicy) -> AggregationOptions {
        AggregationOptions {
            threshold: self.threshold,
            policy: self.merge_policy.unwrap_or(channel_default),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    InvalidValue {
        field: &'static str,
        value: String,
    },
    NotFound {
        path: PathBuf,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(
                    f,
                    "failed to read config file {}: {}",
                    path.display(),
                    source
                )
            }
            ConfigError::Parse { path, source } => {
                write!(
                    f,
                    "failed to parse config file {}: {}",
                    path.display(),
                    source
                )
            }
            ConfigError::InvalidValue { field, value } => {
                write!(f, "invalid value '{}' for '{}'", value, field)
            }
            ConfigError::NotFound { path } => {
                write!(f, "config file {} does not exist", path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::InvalidValue { .. } => None,
            ConfigError::NotFound { .. } => None,
        }
    }
}

pub fn resolve_settings(cli: &CliArgs) -> Result<EffectiveSettings, ConfigError> {
    let (file, config_path) = load_config(cli.config.as_deref())?;
    merge(cli, file, config_path)
}

fn merge(
    cli: &CliArgs,
    file: FileConfig,
    config_path: Option<PathBuf>,
) -> Result<EffectiveSettings, ConfigError> {
    let config_dir = config_path
        .as_deref()
        .and_then(Path::parent)
        .map(Path::to_path_buf);

    let threshold = cli
        .threshold
        .or(file.threshold)
        .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD);
    if !threshold.is_finite() || !(0.0..=1.0).contains(&threshold) {
        return Err(ConfigError::InvalidValue {
            field: "threshold",
            value: threshold.to_string(),
        });
    }

    let merge_policy = match (cli.merge_policy, file.merge_policy.as_deref()) {
        (Some(arg), _) => Some(arg.into_policy()),
        (None, Some(value)) => {
            Some(
                MergePolicy::from_str(value).map_err(|_| ConfigError::InvalidValue {
                    field: "merge_policy",
                    value: value.to_string(),
                })?,
            )
        }
        (None, None) => None,
    };

    let model_from_cli = cli.model.is_some();
    let model = cli.model.clone().or(file.model);

    let alphabet = match (&cli.alphabet, file.alphabet.as_deref()) {
        (Some(path), _) => Some(path.clone()),
        (None, Some(value)) => Some(resolve_config_path(value, config_dir.as_deref())),
        (None, None) => None,
    };

    let engine_timeout_ms = cli
        .engine_timeout_ms
        .or(file.engine_timeout_ms)
        .unwrap_or(DEFAULT_ENGINE_TIMEOUT_MS);
    let engine_timeout = if engine_timeout_ms == 0 {
        None
    } else {
        Some(Duration::from_millis(engine_timeout_ms))
    };

    let bind_value = match &cli.command {
        Command::Serve { bind: Some(bind) } => bind.clone(),
        _ => file.server.bind.unwrap_or_else(|| DEFAULT_BIND.to_string()),
    };
    let server_bind = bind_value
        .parse::<SocketAddr>()
        .map_err(|_| ConfigError::InvalidValue {
            field: "server.bind",
            value: bind_value.clone(),
        })?;

    let gate_value = match &cli.command {
        Command::Watch {
            gate_endpoint: Some(endpoint),
            ..
        } => Some(endpoint.clone()),
        _ => file.gate.endpoint,
    };
    let gate_endpoint = match gate_value {
        Some(value) => Some(Url::parse(&value).map_err(|_| ConfigError::InvalidValue {
            field: "gate.endpoint",
            value,
        })?),
        None => None,
    };

    let rfid = match &cli.command {
        Command::Watch {
            rfid: Some(rfid), ..
        } => rfid.clone(),
        _ => file.gate.rfid.unwrap_or_default(),
    };

    let backend_value = match &cli.command {
        Command::Watch {
            capture_backend: Some(backend),
            ..
        } => Some(backend.clone()),
        _ => file.capture.backend,
    };
    let capture_backend = match backend_value {
        Some(value) => Some(Backend::from_str(&value).map_err(|_| {
            ConfigError::InvalidValue {
                field: "capture.backend",
                value,
            }
        })?),
        None => None,
    };

    let spool_dir = match &cli.command {
        Command::Watch {
            spool_dir: Some(dir),
            ..
        } => Some(dir.clone()),
        _ => file
            .capture
            .spool_dir
            .map(|value| resolve_config_path(&value, config_dir.as_deref())),
    };

    let poll_interval = file.capture.poll_interval_ms.map(Duration::from_millis);

    Ok(EffectiveSettings {
        threshold,
        merge_policy,
        model,
        model_from_cli,
        alphabet,
        engine_timeout,
        server_bind,
        gate_endpoint,
        rfid,
        capture_backend,
        spool_dir,
        poll_interval,
        config_dir,
    })
}

/// Relative paths from the config file resolve against its directory.
fn resolve_config_path(value: &str, config_dir: Option<&Path>) -> PathBuf {
    let path = PathBuf::from(value);
    if path.is_absolute() {
        return path;
    }
    match config_dir {
        Some(dir) => dir.join(path),
        None => path,
    }
}

fn load_config(path_override: Option<&Path>) -> Result<(FileConfig, Option<PathBuf>), ConfigError> {
    if let Some(path) = path_override {
        let path = path.to_path_buf();
        if !path.exists() {
            return Err(ConfigError::NotFound { path });
        }
        let config = read_config(&path)?;
        return Ok((config, Some(path)));
    }

    for candidate in candidate_paths() {
        if candidate.exists() {
            let config = read_config(&candidate)?;
            return Ok((config, Some(candidate)));
        }
    }
    Ok((FileConfig::default(), None))
}

fn read_config(path: &Path) -> Result<FileConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn candidate_paths() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(dirs) = ProjectDirs::from("", "", "plate-scan") {
        candidates.push(dirs.config_dir().join("config.toml"));
    }
    if let Some(base) = BaseDirs::new() {
        candidates.push(
            base.home_dir()
                .join(".config")
                .join("plate-scan")
                .join("config.toml"),
        );
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn cli_with(command: Command) -> CliArgs {
        CliArgs {
            config: None,
            threshold: None,
            merge_policy: None,
            model: None,
            alphabet: None,
            engine_timeout_ms: None,
            command,
        }
    }

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn defaults_apply_without_config_or_flags() {
        let settings = merge(
            &cli_with(Command::Recognize { timing: false }),
            FileConfig::default(),
            None,
        )
        .unwrap();
        assert_eq!(settings.threshold, DEFAULT_CONFIDENCE_THRESHOLD);
        assert_eq!(settings.merge_policy, None);
        assert_eq!(settings.server_bind.port(), 8000);
        assert_eq!(settings.engine_timeout, Some(Duration::from_millis(15_000)));
        assert_eq!(settings.rfid, "");
    }

    #[test]
    fn cli_threshold_overrides_config_file() {
        let file = write_config("threshold = 0.8\nmerge_policy = \"concat\"\n");
        let mut cli = cli_with(Command::Recognize { timing: false });
        cli.config = Some(file.path().to_path_buf());
        cli.threshold = Some(0.3);
        let settings = resolve_settings(&cli).unwrap();
        assert_eq!(settings.threshold, 0.3);
        assert_eq!(settings.merge_policy, Some(MergePolicy::Concat));
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        let mut cli = cli_with(Command::Recognize { timing: false });
        cli.threshold = Some(1.5);
        let err = merge(&cli, FileConfig::default(), None).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                field: "threshold",
                ..
            }
        ));
    }

    #[test]
    fn invalid_merge_policy_in_file_is_rejected() {
        let file = FileConfig {
            merge_policy: Some("join".into()),
            ..Default::default()
        };
        let err = merge(&cli_with(Command::Recognize { timing: false }), file, None).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                field: "merge_policy",
                ..
            }
        ));
    }

    #[test]
    fn watch_flags_override_gate_and_capture_sections() {
        let file = write_config(
            "[gate]\nendpoint = \"http://example.com/api/parking\"\nrfid = \"tag-1\"\n\
             [capture]\nbackend = \"mock\"\n",
        );
        let mut cli = cli_with(Command::Watch {
            capture_backend: Some("spool".into()),
            spool_dir: Some(PathBuf::from("/var/frames")),
            gate_endpoint: Some("http://gate.local/api/parking".into()),
            rfid: None,
        });
        cli.config = Some(file.path().to_path_buf());
        let settings = resolve_settings(&cli).unwrap();
        assert_eq!(settings.capture_backend, Some(Backend::Spool));
        assert_eq!(settings.spool_dir, Some(PathBuf::from("/var/frames")));
        assert_eq!(
            settings.gate_endpoint.unwrap().as_str(),
            "http://gate.local/api/parking"
        );
        assert_eq!(settings.rfid, "tag-1");
    }

    #[test]
    fn invalid_bind_address_is_rejected() {
        let settings = merge(
            &cli_with(Command::Serve {
                bind: Some("not-an-addr".into()),
            }),
            FileConfig::default(),
            None,
        );
        assert!(matches!(
            settings,
            Err(ConfigError::InvalidValue {
                field: "server.bind",
                ..
            })
        ));
    }

    #[test]
    fn relative_spool_dir_resolves_against_config_dir() {
        let file = FileConfig {
            capture: CaptureFileConfig {
                spool_dir: Some("frames".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let settings = merge(
            &cli_with(Command::Watch {
                capture_backend: None,
                spool_dir: None,
                gate_endpoint: None,
                rfid: None,
            }),
            file,
            Some(PathBuf::from("/etc/plate-scan/config.toml")),
        )
        .unwrap();
        assert_eq!(
            settings.spool_dir,
            Some(PathBuf::from("/etc/plate-scan/frames"))
        );
    }

    #[test]
    fn zero_timeout_disables_the_engine_deadline() {
        let mut cli = cli_with(Command::Recognize { timing: false });
        cli.engine_timeout_ms = Some(0);
        let settings = merge(&cli, FileConfig::default(), None).unwrap();
        assert_eq!(settings.engine_timeout, None);
    }
}
