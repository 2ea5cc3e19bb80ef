use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(name = "sandbox-manager")]
#[clap(version, about = "Multi-tenant sandbox lifecycle manager")]
#[clap(propagate_version = true)]
pub struct Cli {
    #[clap(flatten)]
    pub global_opts: GlobalOpts,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug)]
pub struct GlobalOpts {
    /// Configuration file path
    #[clap(short, long, global = true, env = "SANDBOX_MANAGER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Output format
    #[clap(long, global = true, default_value = "text", value_enum)]
    pub format: OutputFormat,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the HTTP API and log stream server
    Serve(ServeArgs),

    /// Adopt pods and containers the engine knows about, then exit
    Reconcile,

    /// Initialize a new configuration file
    Init(InitArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

// ============================================================================
// Server
// ============================================================================

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to bind (overrides server.bind)
    #[clap(long)]
    pub bind: Option<String>,

    /// Port to listen on (overrides server.port)
    #[clap(long, short = 'p')]
    pub port: Option<u16>,

    /// Bearer token required by the API (overrides server.auth_token)
    #[clap(long, env = "SANDBOX_MANAGER_TOKEN", hide_env_values = true)]
    pub auth_token: Option<String>,

    /// Skip the reconciliation pass at startup
    #[clap(long)]
    pub no_reconcile: bool,
}

// ============================================================================
// Config Commands
// ============================================================================

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Force overwrite existing configuration
    #[clap(short, long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[clap(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,
    /// Show configuration file path
    Path,
}

#[derive(Debug, Clone, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}
