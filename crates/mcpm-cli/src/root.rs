//! Root dependency-injection wiring: one [`RootApp`] per invocation, built
//! from the parsed CLI flags, threading the catalog/telemetry/hub crates
//! together the way `mcpm_hub::App` threads its own downstreams.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use mcpm_catalog::Catalog;
use mcpm_core::{parse_time_window, Error as CoreError, ProfileMetadata, RemoteServer, RunAction, ServerConfig, StdioServer};
use mcpm_hub::{AggregatorConfig, App, HttpEndpoint};
use mcpm_telemetry::TelemetryStore;
use mcpm_tunnel::TunnelClient;
use serde_json::json;
use tracing::info;

use crate::cli::CatalogCommand;

/// Raised instead of returning `Ok(())` when Ctrl-C interrupted a run, so
/// `main` can translate it into exit code 130 without logging it as an
/// error.
#[derive(Debug)]
pub struct SigintInterrupted;

impl fmt::Display for SigintInterrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "interrupted")
    }
}

impl std::error::Error for SigintInterrupted {}

pub struct RootApp {
    pub debug: bool,
    pub non_interactive: bool,
    pub force: bool,
    pub json: bool,
}

impl RootApp {
    pub fn new(debug: bool, non_interactive: bool, force: bool, json: bool) -> Result<Self> {
        Ok(Self {
            debug,
            non_interactive,
            force,
            json,
        })
    }

    fn load_catalog(&self) -> Result<Catalog> {
        Catalog::load().context("failed to load the catalog")
    }

    async fn open_telemetry(&self) -> Result<TelemetryStore> {
        let path = mcpm_catalog::config_dir()
            .context("failed to resolve the config directory")?
            .join("telemetry.db");
        TelemetryStore::open(path)
            .await
            .context("failed to open the telemetry store")
    }
}

pub async fn run(app: &RootApp, server: &str, http: bool, bind: String, port: u16) -> Result<()> {
    let catalog = app.load_catalog()?;
    let server_config = catalog
        .get_server(server)
        .with_context(|| format!("no such server '{server}' in the catalog"))?
        .clone();

    let mut config = AggregatorConfig::default();
    config.debug_logging = app.debug;
    if http {
        config.http_bind = bind;
        config.http_port = port;
    }

    let action = if http { RunAction::RunHttp } else { RunAction::Run };
    let server_name = Some(server_config.name().to_string());
    run_aggregator(app, vec![server_config], config, action, None, server_name, http).await
}

pub async fn profile_run(app: &RootApp, profile: &str, http: bool, bind: String, port: u16) -> Result<()> {
    let catalog = app.load_catalog()?;
    let complete = catalog.complete_profile(profile);
    if complete.servers.is_empty() {
        bail!("profile '{profile}' has no member servers");
    }
    let servers: Vec<ServerConfig> = complete.servers.into_iter().cloned().collect();

    let mut config = AggregatorConfig::default();
    config.debug_logging = app.debug;
    if http {
        config.http_bind = bind;
        config.http_port = port;
    }
    if let Some(metadata) = complete.metadata {
        config.auth.enabled = metadata.api_key.is_some();
        config.auth.api_key = metadata.api_key.clone();
    }

    run_aggregator(app, servers, config, RunAction::ProfileRun, Some(profile.to_string()), None, http).await
}

pub async fn share(app: &RootApp, profile: &str, share_host: &str, bind: String, port: u16) -> Result<()> {
    let mut catalog = app.load_catalog()?;
    let complete = catalog.complete_profile(profile);
    if complete.servers.is_empty() {
        bail!("profile '{profile}' has no member servers to share");
    }
    let servers: Vec<ServerConfig> = complete.servers.into_iter().cloned().collect();
    let existing_key = complete.metadata.and_then(|m| m.api_key.clone());

    let api_key = match existing_key {
        Some(key) => key,
        None => {
            if app.non_interactive {
                bail!(
                    "profile '{profile}' has no bearer token set; run `mcpm catalog profile-regenerate-key {profile}` first"
                );
            }
            let mut metadata = catalog
                .get_profile_metadata(profile)
                .cloned()
                .unwrap_or_else(|| ProfileMetadata::new(profile));
            let key = metadata.regenerate_api_key().to_string();
            catalog.upsert_profile_metadata(metadata);
            catalog.save().map_err(|e| CoreError::CatalogWrite(e.into()))?;
            key
        }
    };

    let mut config = AggregatorConfig::default();
    config.debug_logging = app.debug;
    config.http_bind = bind;
    config.http_port = port;
    config.auth.enabled = true;
    config.auth.api_key = Some(api_key);

    let share_host: SocketAddr = share_host
        .parse()
        .with_context(|| format!("invalid --share-host address '{share_host}'"))?;

    let telemetry = Arc::new(app.open_telemetry().await?);
    let hub_app = Arc::new(
        App::build(servers, config, telemetry.clone())
            .await
            .context("failed to build the aggregator")?,
    );

    let endpoint = HttpEndpoint::start(hub_app.clone(), RunAction::Proxy, Some(profile.to_string()), None)
        .await
        .context("failed to start the HTTP endpoint")?;
    let local_port = endpoint.addr.port();

    let tunnel = TunnelClient::start(share_host, local_port)
        .await
        .map_err(|e| CoreError::Tunnel(e.into()))
        .context("failed to establish the tunnel")?;
    info!(url = %tunnel.url, "tunnel established");
    println!("{}", tunnel.url);

    let interrupted = wait_for_ctrl_c().await;
    tunnel.kill();
    endpoint.shutdown().await;
    shutdown(hub_app, telemetry).await;

    if interrupted {
        bail!(SigintInterrupted);
    }
    Ok(())
}

pub async fn catalog(app: &RootApp, command: CatalogCommand) -> Result<()> {
    let mut catalog = app.load_catalog()?;

    match command {
        CatalogCommand::AddStdio { name, command, args, env, tags } => {
            let mut server = StdioServer {
                name,
                command,
                args,
                env: env.into_iter().collect(),
                profile_tags: Default::default(),
            };
            server.profile_tags.extend(tags);
            catalog.add_server(ServerConfig::Stdio(server))?;
            catalog.save().map_err(|e| CoreError::CatalogWrite(e.into()))?;
        }
        CatalogCommand::AddRemote { name, url, headers, tags } => {
            let mut server = RemoteServer {
                name,
                url,
                headers: headers.into_iter().collect(),
                profile_tags: Default::default(),
            };
            server.profile_tags.extend(tags);
            catalog.add_server(ServerConfig::Remote(server))?;
            catalog.save().map_err(|e| CoreError::CatalogWrite(e.into()))?;
        }
        CatalogCommand::Remove { name } => {
            if !app.force && !app.non_interactive {
                bail!("removing '{name}' is destructive; pass --force to confirm");
            }
            catalog.remove_server(&name)?;
            catalog.save().map_err(|e| CoreError::CatalogWrite(e.into()))?;
        }
        CatalogCommand::List => {
            let servers: Vec<_> = catalog.list_servers().collect();
            if app.json {
                println!("{}", serde_json::to_string_pretty(&servers)?);
            } else {
                for server in servers {
                    println!("{}\t{:?}", server.name(), server.profile_tags());
                }
            }
        }
        CatalogCommand::Tag { server, profile } => {
            catalog.add_profile_tag(&server, &profile)?;
            catalog.save().map_err(|e| CoreError::CatalogWrite(e.into()))?;
        }
        CatalogCommand::Untag { server, profile } => {
            catalog.remove_profile_tag(&server, &profile)?;
            catalog.save().map_err(|e| CoreError::CatalogWrite(e.into()))?;
        }
        CatalogCommand::Profiles => {
            let profiles = catalog.virtual_profiles();
            if app.json {
                println!("{}", serde_json::to_string_pretty(&profiles)?);
            } else {
                for profile in profiles {
                    println!("{profile}");
                }
            }
        }
        CatalogCommand::ProfileShow { name } => {
            let complete = catalog.complete_profile(&name);
            if app.json {
                let payload = json!({
                    "name": complete.name,
                    "servers": complete.servers.iter().map(|s| s.name()).collect::<Vec<_>>(),
                    "has_metadata": complete.metadata.is_some(),
                });
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                println!("profile: {}", complete.name);
                for server in complete.servers {
                    println!("  {}", server.name());
                }
            }
        }
        CatalogCommand::ProfileDescribe { name, description } => {
            let mut metadata = catalog
                .get_profile_metadata(&name)
                .cloned()
                .unwrap_or_else(|| ProfileMetadata::new(&name));
            metadata.description = Some(description);
            catalog.upsert_profile_metadata(metadata);
            catalog.save().map_err(|e| CoreError::CatalogWrite(e.into()))?;
        }
        CatalogCommand::ProfileRegenerateKey { name } => {
            let mut metadata = catalog
                .get_profile_metadata(&name)
                .cloned()
                .unwrap_or_else(|| ProfileMetadata::new(&name));
            let key = metadata.regenerate_api_key().to_string();
            catalog.upsert_profile_metadata(metadata);
            catalog.save().map_err(|e| CoreError::CatalogWrite(e.into()))?;
            println!("{key}");
        }
        CatalogCommand::ProfileDelete { name } => {
            if !app.force && !app.non_interactive {
                bail!("deleting profile '{name}' is destructive; pass --force to confirm");
            }
            catalog.delete_profile_metadata(&name);
            catalog.save().map_err(|e| CoreError::CatalogWrite(e.into()))?;
        }
    }
    Ok(())
}

pub async fn usage(app: &RootApp, window: &str) -> Result<()> {
    let duration = parse_time_window(window)?;
    let store = app.open_telemetry().await?;
    let stats = mcpm_telemetry::usage_stats(store.pool(), duration)
        .await
        .map_err(|e| CoreError::Telemetry(e.into()))?;
    if app.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!(
            "{} sessions across {} servers and {} profiles in the trailing {}",
            stats.total_sessions, stats.total_servers, stats.total_profiles, window
        );
        for server in &stats.servers {
            println!(
                "  {}\truns={}\tsuccess={:.1}%",
                server.server_name, server.total_runs, server.success_rate
            );
        }
    }
    store.shutdown().await;
    Ok(())
}

/// Runs one aggregator to completion, over stdio or HTTP, returning once the
/// client disconnects (stdio) or Ctrl-C is received (HTTP keeps serving
/// until interrupted, since there is no client-disconnect equivalent).
async fn run_aggregator(
    app: &RootApp,
    servers: Vec<ServerConfig>,
    config: AggregatorConfig,
    action: RunAction,
    profile_name: Option<String>,
    server_name: Option<String>,
    http: bool,
) -> Result<()> {
    let telemetry = Arc::new(app.open_telemetry().await?);
    let hub_app = Arc::new(
        App::build(servers, config, telemetry.clone())
            .await
            .context("failed to build the aggregator")?,
    );

    let interrupted = if http {
        let endpoint = HttpEndpoint::start(hub_app.clone(), action, profile_name, server_name)
            .await
            .context("failed to start the HTTP endpoint")?;
        eprintln!("listening on {}", endpoint.addr);
        let interrupted = wait_for_ctrl_c().await;
        endpoint.shutdown().await;
        interrupted
    } else {
        tokio::select! {
            result = mcpm_hub::serve_stdio(&hub_app, action, profile_name, server_name) => {
                result.context("stdio session ended with an error")?;
                false
            }
            _ = tokio::signal::ctrl_c() => true,
        }
    };

    shutdown(hub_app, telemetry).await;

    if interrupted {
        bail!(SigintInterrupted);
    }
    Ok(())
}

async fn wait_for_ctrl_c() -> bool {
    tokio::signal::ctrl_c().await.is_ok()
}

/// Process shutdown: stop the downstreams, then drain telemetry with its
/// own 2-second deadline. The telemetry `Arc` is only drained if this is
/// the last surviving reference — otherwise a lingering connection still
/// holds it and the writer task is left to finish on its own.
async fn shutdown(hub_app: Arc<App>, telemetry: Arc<TelemetryStore>) {
    hub_app.shutdown_downstreams().await;
    drop(hub_app);
    if let Ok(store) = Arc::try_unwrap(telemetry) {
        store.shutdown().await;
    }
}

impl fmt::Debug for RootApp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootApp")
            .field("debug", &self.debug)
            .field("non_interactive", &self.non_interactive)
            .field("force", &self.force)
            .field("json", &self.json)
            .finish()
    }
}
