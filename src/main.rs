use clap::Parser;
use config::Config;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tunercast::config::Settings;
use tunercast::{build_state, create_app};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,

    /// Listen port (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// Skip the initial discovery pass and catalog sync
    #[arg(long)]
    no_discover: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut builder = Config::builder();
    if std::path::Path::new(&args.config).exists() {
        builder = builder.add_source(config::File::with_name(&args.config));
    } else {
        warn!("config file {} not found, using defaults", args.config);
    }
    let settings: Settings = builder
        .add_source(config::Environment::with_prefix("TUNERCAST").separator("__"))
        .build()?
        .try_deserialize()?;

    info!("configuration loaded from {}: {:?}", args.config, settings);

    let mut settings = settings;
    if let Some(port) = args.port {
        settings.server.port = port;
    }

    let state = build_state(settings.clone()).await?;

    if args.no_discover {
        info!("skipping initial discovery (--no-discover)");
    } else {
        match state.registry.run_pass().await {
            Ok(appliances) => {
                info!("initial discovery found {} appliance(s)", appliances.len());
                state.allocator.register_appliances().await?;
                match state.catalog.sync_all(&state.registry).await {
                    Ok(report) => info!(
                        "initial catalog sync: devices={} series={} episodes={}",
                        report.devices, report.series, report.episodes
                    ),
                    Err(e) => error!("initial catalog sync failed: {}", e),
                }
            }
            Err(e) => error!("initial discovery failed: {}", e),
        }
    }

    // Background maintenance. Sweeps interleave with requests and are never
    // cancelled; they die with the process.
    tokio::spawn(state.engine.clone().run_cleanup_loop());
    tokio::spawn(state.allocator.clone().run_viewer_sweep_loop());
    tokio::spawn(state.allocator.clone().run_tuner_sweep_loop());
    tokio::spawn(Arc::clone(&state.guide).run_refresh_loop());
    {
        let state = Arc::clone(&state);
        let interval = Duration::from_secs(settings.discovery.rediscover_interval);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match state.registry.run_pass().await {
                    Ok(_) => {
                        if let Err(e) = state.allocator.register_appliances().await {
                            warn!("tuner pool refresh failed: {}", e);
                        }
                        if let Err(e) = state.catalog.sync_all(&state.registry).await {
                            warn!("periodic catalog sync failed: {}", e);
                        }
                    }
                    Err(e) => warn!("periodic discovery failed: {}", e),
                }
            }
        });
    }

    let app = create_app(Arc::clone(&state));
    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    info!("listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;

    state.engine.shutdown().await;
    state.allocator.shutdown().await;
    Ok(())
}
