//! Configuration layering: command-line flags (and their env vars) override
//! the TOML file, which overrides built-in defaults.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use serde::Deserialize;

use rally::{Credentials, IntegrationInfo, RallyConfig, DEFAULT_SERVER};

use crate::cli::Cli;

/// File read when `--config` is not given. Its absence is not an error.
pub const DEFAULT_CONFIG_FILE: &str = "rally.toml";

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable, coloured when attached to a terminal.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Contents of the TOML file. Every field is optional.
#[derive(Debug, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub server: Option<String>,
    pub workspace: Option<String>,
    #[serde(default)]
    pub credentials: CredentialsSection,
    #[serde(default)]
    pub integration: IntegrationSection,
    #[serde(default)]
    pub telemetry: TelemetrySection,
}

#[derive(Debug, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CredentialsSection {
    pub api_key: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IntegrationSection {
    pub name: Option<String>,
    pub vendor: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetrySection {
    pub log_format: Option<LogFormat>,
    pub otlp_endpoint: Option<String>,
}

/// Observability settings after layering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TelemetrySettings {
    pub log_format: LogFormat,
    pub otlp_endpoint: Option<String>,
}

/// Fully resolved settings for one run.
#[derive(Debug, Clone)]
pub struct Settings {
    pub rally: RallyConfig,
    pub workspace: String,
    pub telemetry: TelemetrySettings,
}

/// Reads the configuration file.
///
/// An explicit path must exist; the default `rally.toml` is optional.
pub fn load(explicit: Option<&Path>) -> Result<FileConfig> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => {
            let path = PathBuf::from(DEFAULT_CONFIG_FILE);
            if !path.exists() {
                return Ok(FileConfig::default());
            }
            path
        }
    };

    let content = fs::read_to_string(&path)
        .with_context(|| format!("Cannot read config file {}", path.display()))?;
    parse(&content).with_context(|| format!("Invalid config file {}", path.display()))
}

/// Parses TOML configuration text.
pub fn parse(content: &str) -> Result<FileConfig> {
    Ok(toml::from_str(content)?)
}

/// Merges flags over the file over defaults.
pub fn resolve(cli: &Cli, file: FileConfig) -> Result<Settings> {
    let conn = &cli.connection;

    let server = first([conn.server.clone(), file.server])
        .unwrap_or_else(|| DEFAULT_SERVER.to_string());

    let Some(workspace) = first([conn.workspace.clone(), file.workspace]) else {
        bail!("No workspace configured. Use --workspace, set RALLY_WORKSPACE, or add `workspace` to the config file");
    };

    let api_key = first([conn.api_key.clone(), file.credentials.api_key]);
    let username = first([conn.username.clone(), file.credentials.username]);
    let password = first([conn.password.clone(), file.credentials.password]);
    let credentials = match (api_key, username, password) {
        (Some(key), _, _) => Credentials::ApiKey { key },
        (None, Some(username), Some(password)) => Credentials::Basic { username, password },
        (None, Some(_), None) => bail!("A username is configured but no password"),
        _ => bail!(
            "No credentials configured. Use --api-key / RALLY_API_KEY, or --username and --password"
        ),
    };

    let defaults = IntegrationInfo::default();
    let integration = IntegrationInfo {
        name: file.integration.name.unwrap_or(defaults.name),
        vendor: file.integration.vendor.unwrap_or(defaults.vendor),
        version: file.integration.version.unwrap_or(defaults.version),
    };

    let rally = RallyConfig::new(server, credentials).with_integration(integration);
    rally.validate().context("Invalid Rally connection settings")?;

    let telemetry = TelemetrySettings {
        log_format: cli
            .log_format
            .or(file.telemetry.log_format)
            .unwrap_or_default(),
        otlp_endpoint: first([cli.otlp_endpoint.clone(), file.telemetry.otlp_endpoint]),
    };

    Ok(Settings {
        rally,
        workspace,
        telemetry,
    })
}

/// First non-blank value, in precedence order.
fn first<const N: usize>(candidates: [Option<String>; N]) -> Option<String> {
    candidates
        .into_iter()
        .flatten()
        .find(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    const FILE: &str = r#"
server = "https://rally.example.com"
workspace = "DBS"

[credentials]
username = "builder@example.com"
password = "from-file"

[integration]
name = "Nightly"

[telemetry]
log_format = "json"
otlp_endpoint = "http://localhost:4317"
"#;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["rally-builds"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_file_values_apply_when_no_flags_given() {
        let settings = resolve(&cli(&[]), parse(FILE).unwrap()).unwrap();

        assert_eq!(settings.rally.server, "https://rally.example.com");
        assert_eq!(settings.workspace, "DBS");
        assert_eq!(
            settings.rally.credentials,
            Credentials::Basic {
                username: "builder@example.com".into(),
                password: "from-file".into()
            }
        );
        assert_eq!(settings.rally.integration.name, "Nightly");
        assert_eq!(settings.rally.integration.vendor, "rally-builds");
        assert_eq!(
            settings.telemetry,
            TelemetrySettings {
                log_format: LogFormat::Json,
                otlp_endpoint: Some("http://localhost:4317".into())
            }
        );
    }

    #[test]
    fn test_flags_override_file() {
        let settings = resolve(
            &cli(&[
                "--server",
                "https://rally1.rallydev.com",
                "--workspace",
                "Other",
                "--password",
                "from-flag",
                "--log-format",
                "pretty",
            ]),
            parse(FILE).unwrap(),
        )
        .unwrap();

        assert_eq!(settings.rally.server, "https://rally1.rallydev.com");
        assert_eq!(settings.workspace, "Other");
        assert_eq!(
            settings.rally.credentials,
            Credentials::Basic {
                username: "builder@example.com".into(),
                password: "from-flag".into()
            }
        );
        assert_eq!(settings.telemetry.log_format, LogFormat::Pretty);
    }

    #[test]
    fn test_api_key_wins_over_basic_credentials() {
        let settings = resolve(&cli(&["--api-key", "_k"]), parse(FILE).unwrap()).unwrap();
        assert_eq!(
            settings.rally.credentials,
            Credentials::ApiKey { key: "_k".into() }
        );
    }

    #[test]
    fn test_defaults_fill_gaps() {
        let settings = resolve(
            &cli(&["--workspace", "DBS", "--api-key", "_k"]),
            FileConfig::default(),
        )
        .unwrap();
        assert_eq!(settings.rally.server, DEFAULT_SERVER);
        assert_eq!(settings.rally.integration.name, "BuildSamples");
        assert_eq!(settings.telemetry, TelemetrySettings::default());
    }

    #[test]
    fn test_missing_workspace_is_an_error() {
        let err = resolve(&cli(&["--api-key", "_k"]), FileConfig::default()).unwrap_err();
        assert!(err.to_string().contains("No workspace configured"));
    }

    #[test]
    fn test_missing_credentials_are_an_error() {
        let err = resolve(&cli(&["--workspace", "DBS"]), FileConfig::default()).unwrap_err();
        assert!(err.to_string().contains("No credentials configured"));

        let err = resolve(
            &cli(&["--workspace", "DBS", "--username", "u"]),
            FileConfig::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("no password"));
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        assert!(parse("wokspace = \"DBS\"").is_err());
        assert!(parse("[telemetry]\nlog_format = \"xml\"").is_err());
    }

    #[test]
    fn test_load_reads_explicit_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(FILE.as_bytes()).unwrap();

        let loaded = load(Some(file.path())).unwrap();
        assert_eq!(loaded.workspace.as_deref(), Some("DBS"));
        assert_eq!(loaded.telemetry.log_format, Some(LogFormat::Json));
    }

    #[test]
    fn test_load_fails_for_missing_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(err.to_string().contains("Cannot read config file"));
    }
}
