//! zpamd - the ZPAM milter daemon
//!
//! Loads the YAML configuration, wires the DNS cache, the learning store and
//! the score engine together, then serves milter sessions until a shutdown
//! signal arrives.
//!
//! Exit codes: 0 success, 1 invalid configuration, 2 network bind failure,
//! 3 panic during startup.

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;
use zpam_bayes::{BayesStore, FileStore, RedisStore};
use zpam_common::config::{LearningBackend, ZpamConfig};
use zpam_dns::{DnsCache, DnsCacheConfig, HickoryDnsResolver};
use zpam_filter::ScoreEngine;
use zpam_milter::Acceptor;

const EXIT_BAD_CONFIG: i32 = 1;
const EXIT_BIND_FAILURE: i32 = 2;
const EXIT_STARTUP_PANIC: i32 = 3;

#[derive(Parser)]
#[command(name = "zpamd")]
#[command(version)]
#[command(about = "ZPAM spam classification milter", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(long, short, env = "ZPAM_CONFIG", default_value = "zpam.yaml")]
    config: String,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,

    /// Override milter.address from the configuration
    #[arg(long)]
    address: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut config = if std::path::Path::new(&args.config).exists() {
        match ZpamConfig::load(&args.config) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("zpamd: {}", e);
                std::process::exit(EXIT_BAD_CONFIG);
            }
        }
    } else {
        eprintln!("zpamd: {} not found, using built-in defaults", args.config);
        ZpamConfig::default()
    };
    if let Some(address) = args.address {
        config.milter.address = address;
    }
    if let Err(e) = config.validate() {
        eprintln!("zpamd: {}", e);
        std::process::exit(EXIT_BAD_CONFIG);
    }

    init_tracing(&config);

    if args.check {
        println!("configuration OK");
        return;
    }
    if !config.milter.enabled {
        tracing::warn!("milter is disabled in the configuration; nothing to do");
        return;
    }

    // Startup runs on its own task so a panic maps to exit code 3 instead of
    // a raw abort.
    let code = match tokio::spawn(run(config)).await {
        Ok(Ok(())) => 0,
        Ok(Err(code)) => code,
        Err(e) => {
            eprintln!("zpamd: startup panicked: {}", e);
            EXIT_STARTUP_PANIC
        }
    };
    if code != 0 {
        std::process::exit(code);
    }
}

fn init_tracing(config: &ZpamConfig) {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone()),
    );
    let fmt_layer = if config.logging.format == "json" {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

async fn run(config: ZpamConfig) -> Result<(), i32> {
    tracing::info!("ZPAM v{}", env!("CARGO_PKG_VERSION"));

    let resolver = match HickoryDnsResolver::new() {
        Ok(resolver) => Arc::new(resolver),
        Err(e) => {
            tracing::error!("resolver initialization failed: {}", e);
            return Err(EXIT_STARTUP_PANIC);
        }
    };
    let dns = DnsCache::new(
        resolver,
        DnsCacheConfig {
            enabled: config.headers.cache.enabled,
            ttl: Duration::from_secs(config.headers.cache.ttl_secs),
            max_entries: config.headers.cache.max_entries,
            cleanup_interval: Duration::from_secs(config.headers.cache.cleanup_interval_secs),
            timeout: Duration::from_secs(config.headers.dns_timeout_secs),
            workers: config.headers.cache.workers,
        },
    );

    let bayes = build_bayes(&config).await;
    let engine = Arc::new(ScoreEngine::new(
        config.clone(),
        Arc::clone(&dns),
        bayes.clone(),
    ));

    let acceptor = match Acceptor::bind(Arc::clone(&engine), config.milter.clone()).await {
        Ok(acceptor) => acceptor,
        Err(e) => {
            tracing::error!("{}", e);
            return Err(EXIT_BIND_FAILURE);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    if let Err(e) = acceptor.run(shutdown_rx).await {
        tracing::error!("acceptor failed: {}", e);
    }

    dns.shutdown();
    if let Some(store) = bayes {
        if let Err(e) = store.flush().await {
            tracing::warn!("could not persist learning state: {}", e);
        }
    }
    let stats = engine.stats();
    tracing::info!(
        processed = stats.processed,
        spam = stats.spam,
        rejected = stats.rejected,
        quarantined = stats.quarantined,
        "zpamd stopped"
    );
    Ok(())
}

/// Learning store per configuration. An unreachable store degrades to
/// "learning off" with a warning; scoring proceeds on the other components.
async fn build_bayes(config: &ZpamConfig) -> Option<Arc<dyn BayesStore>> {
    if !config.learning.enabled {
        return None;
    }
    match config.learning.backend {
        LearningBackend::File => {
            match FileStore::open(
                config.learning.file.clone(),
                config.learning.tokenizer.clone(),
            ) {
                Ok(store) => Some(Arc::new(store)),
                Err(e) => {
                    tracing::warn!("file learning store unavailable: {}", e);
                    None
                }
            }
        }
        LearningBackend::Redis => {
            match RedisStore::connect(
                config.learning.redis.clone(),
                config.learning.tokenizer.clone(),
            )
            .await
            {
                Ok(store) => Some(Arc::new(store)),
                Err(e) => {
                    tracing::warn!("redis learning store unavailable: {}", e);
                    None
                }
            }
        }
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
