use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use beacon::{
    Host, ImportListener, LocalHost, MemoryStore, Registry, RegistryConfig, Service,
    ServiceInstance,
};
use clap::Parser;

#[derive(Parser)]
#[command(name = "beacon-sim")]
#[command(about = "Drive two registries over an in-memory store and report convergence")]
struct Cli {
    /// JSON registry config; defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Extra `beacon.*` overrides, as key=value
    #[arg(long = "set", value_parser = parse_property)]
    properties: Vec<(String, String)>,

    /// Service name exported by the provider
    #[arg(long, default_value = "com.acme.Orders")]
    service: String,

    #[arg(long, default_value = "1.0")]
    version: String,

    /// Provider endpoints exported per round
    #[arg(long, default_value_t = 4)]
    instances: usize,

    /// Churn rounds (expire and rebuild the provider session)
    #[arg(long, default_value_t = 3)]
    rounds: usize,

    /// Suppress watch delivery during churn so only the sweep can catch up
    #[arg(long)]
    lose_watches: bool,
}

fn parse_property(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .ok_or_else(|| format!("expected key=value, got {raw}"))
}

#[derive(Default)]
struct Counting {
    live: AtomicUsize,
    adds: AtomicUsize,
    changes: AtomicUsize,
    deletes: AtomicUsize,
}

impl ImportListener for Counting {
    fn add(&self, _instance: &ServiceInstance) -> beacon::Result<()> {
        self.adds.fetch_add(1, Ordering::Relaxed);
        self.live.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn change(&self, _old: &ServiceInstance, _new: &ServiceInstance) -> beacon::Result<()> {
        self.changes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn delete(&self, _instance: &ServiceInstance) -> beacon::Result<()> {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        self.live.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }
}

fn load_config(cli: &Cli) -> Result<RegistryConfig> {
    let mut config = match &cli.config {
        Some(path) => RegistryConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RegistryConfig::default(),
    };
    config
        .apply_properties(cli.properties.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .context("applying --set overrides")?;
    Ok(config)
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let service = Service::new(cli.service.clone(), cli.version.clone());
    let store = MemoryStore::new();

    let provider_session = Arc::new(store.session());
    let consumer_listener = Arc::new(Counting::default());
    let consumer = Registry::builder(
        Arc::new(store.session()),
        consumer_listener.clone(),
        LocalHost::new("10.0.0.2:9000"),
    )
    .config(config.clone())
    .build()
    .context("building consumer")?;
    consumer.subscribe(&service)?;

    let mut providers = Vec::new();
    for i in 0..cli.instances {
        let local = LocalHost {
            host: Host::new(format!("10.0.1.{}:7000", i + 1)),
            sid: format!("provider-{i}"),
        };
        let provider = Registry::builder(
            provider_session.clone(),
            Arc::new(Counting::default()),
            local,
        )
        .config(config.clone())
        .status(Arc::new(move || {
            BTreeMap::from([("slot".to_string(), i.to_string())])
        }))
        .build()
        .with_context(|| format!("building provider {i}"))?;
        provider.export(service.clone(), Arc::new(i))?;
        provider.ready()?;
        providers.push(provider);
    }
    // The first subscribe found no directory; pick the exports up directly.
    consumer.subscribe(&service)?;
    println!(
        "initial: {} live instances of {service}",
        consumer_listener.live.load(Ordering::Relaxed)
    );

    for round in 1..=cli.rounds {
        if cli.lose_watches {
            store.set_watch_delivery(false);
        }
        provider_session.expire().context("expiring provider session")?;
        for provider in &providers {
            provider.handle_session_event(beacon::SessionEvent::Expired)?;
        }
        store.set_watch_delivery(true);
        let report = consumer.sweep()?;
        println!(
            "round {round}: {} live, sweep {:?}",
            consumer_listener.live.load(Ordering::Relaxed),
            report
        );
    }

    let demoted = providers
        .first()
        .map(|p| p.demote().demoted.len())
        .unwrap_or(0);
    println!("demoted {demoted} nodes on provider 0");
    consumer.sweep()?;

    println!(
        "adds={} changes={} deletes={} live={} nodes={}",
        consumer_listener.adds.load(Ordering::Relaxed),
        consumer_listener.changes.load(Ordering::Relaxed),
        consumer_listener.deletes.load(Ordering::Relaxed),
        consumer_listener.live.load(Ordering::Relaxed),
        store.node_count()
    );
    for provider in &providers {
        provider.shutdown();
    }
    consumer.sweep()?;
    println!(
        "after shutdown: {} live instances",
        consumer_listener.live.load(Ordering::Relaxed)
    );
    Ok(())
}
