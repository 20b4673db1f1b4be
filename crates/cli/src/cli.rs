//! Command-line surface.
//!
//! Connection flags also read `RALLY_*` environment variables; anything left
//! unset falls through to the TOML file (see [`crate::config`]).

use std::path::PathBuf;

use clap::{Args, Parser};
use reconcile::BuildStatus;

use crate::config::LogFormat;

#[derive(Debug, Parser)]
#[command(name = "rally-builds")]
#[command(about = "Record a CI build in Rally and move a story along its kanban field")]
#[command(version)]
pub struct Cli {
    /// TOML configuration file [default: rally.toml, if present]
    #[arg(short, long, env = "RALLY_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub connection: ConnectionArgs,

    #[command(flatten)]
    pub run: RunArgs,

    /// Log output format (overrides the config file)
    #[arg(long, value_enum)]
    pub log_format: Option<LogFormat>,

    /// OTLP gRPC endpoint for span export, e.g. http://localhost:4317
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,
}

/// Where and as whom to connect.
#[derive(Debug, Clone, Default, Args)]
pub struct ConnectionArgs {
    /// Rally server root URL
    #[arg(long, env = "RALLY_SERVER")]
    pub server: Option<String>,

    /// Workspace name
    #[arg(short, long, env = "RALLY_WORKSPACE")]
    pub workspace: Option<String>,

    /// API key (takes precedence over username and password)
    #[arg(long, env = "RALLY_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    #[arg(short, long, env = "RALLY_USERNAME")]
    pub username: Option<String>,

    #[arg(long, env = "RALLY_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
}

/// What to record.
#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Project that owns the build definition
    #[arg(short, long, default_value = "Private Banking")]
    pub project: String,

    /// Build definition name, used both to look it up and to create it
    #[arg(long, default_value = "Build 1")]
    pub definition: String,

    /// Description given to a newly created build definition
    #[arg(long, default_value = "A sample build definition for Team 1")]
    pub description: String,

    /// Build duration in seconds
    #[arg(long, default_value_t = 1.0)]
    pub duration: f64,

    #[arg(long, default_value = "A failing build")]
    pub message: String,

    /// Build number or label
    #[arg(long, default_value = "99")]
    pub number: String,

    /// SUCCESS, FAILURE, INCOMPLETE, UNKNOWN, or NO BUILDS
    #[arg(long, default_value = "FAILURE")]
    pub status: BuildStatus,

    /// Link back to the CI job
    #[arg(long)]
    pub uri: Option<String>,

    /// FormattedID of the story to move
    #[arg(long, default_value = "US1")]
    pub story: String,

    /// Custom field holding the story's kanban column
    #[arg(long, default_value = "c_DeploymentKanban")]
    pub kanban_field: String,

    /// Kanban values to apply in order; repeat the flag for several
    #[arg(long = "state", default_values = ["Defined", "In Dev"])]
    pub states: Vec<String>,

    /// Fail when a lookup matches more than one entity instead of using the first
    #[arg(long)]
    pub strict_lookups: bool,
}
