use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "mcpm", version, about = "Aggregates MCP servers behind one upstream endpoint")]
pub struct Cli {
    /// Enable debug-level logging and per-call timing traces.
    #[arg(long, global = true)]
    pub debug: bool,

    /// Fail instead of prompting, wherever a prompt would otherwise appear.
    #[arg(long, global = true)]
    pub non_interactive: bool,

    /// Skip confirmation for destructive catalog operations.
    #[arg(long, global = true)]
    pub force: bool,

    /// Print machine-readable JSON instead of a human-readable table.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Aggregate a single catalog server over stdio (or HTTP with --http).
    Run {
        server: String,
        #[arg(long)]
        http: bool,
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        #[arg(long, default_value_t = 0)]
        port: u16,
    },

    /// Aggregate every server tagged with a profile over stdio (or HTTP).
    ProfileRun {
        profile: String,
        #[arg(long)]
        http: bool,
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        #[arg(long, default_value_t = 0)]
        port: u16,
    },

    /// Aggregate a profile over HTTP and expose it through a tunnel.
    Share {
        profile: String,
        /// Address of the tunnel's control endpoint, e.g. tunnel.example.com:9000.
        #[arg(long)]
        share_host: String,
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        #[arg(long, default_value_t = 0)]
        port: u16,
    },

    /// Manage the persisted server/profile catalog.
    Catalog {
        #[command(subcommand)]
        command: CatalogCommand,
    },

    /// Print aggregate usage statistics over a trailing time window.
    Usage {
        #[arg(long, default_value = "7d")]
        window: String,
    },
}

#[derive(Subcommand)]
pub enum CatalogCommand {
    /// Register a stdio-launched server.
    AddStdio {
        name: String,
        command: String,
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
        #[arg(long = "env", value_parser = parse_key_val)]
        env: Vec<(String, String)>,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Register a remote (HTTP) server.
    AddRemote {
        name: String,
        url: String,
        #[arg(long = "header", value_parser = parse_key_val)]
        headers: Vec<(String, String)>,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Remove a server from the catalog.
    Remove { name: String },

    /// List every registered server.
    List,

    /// Attach a profile tag to a server.
    Tag { server: String, profile: String },

    /// Remove a profile tag from a server.
    Untag { server: String, profile: String },

    /// List every known profile (tagged or with metadata).
    Profiles,

    /// Show a profile's resolved member servers and metadata.
    ProfileShow { name: String },

    /// Set or replace a profile's human-readable description.
    ProfileDescribe { name: String, description: String },

    /// Regenerate a profile's bearer token, used by `mcpm share`.
    ProfileRegenerateKey { name: String },

    /// Delete a profile's metadata (its servers keep their tags).
    ProfileDelete { name: String },
}

fn parse_key_val(input: &str) -> Result<(String, String), String> {
    match input.split_once('=') {
        Some((key, value)) => Ok((key.to_string(), value.to_string())),
        None => Err(format!("expected KEY=VALUE, got {input:?}")),
    }
}
