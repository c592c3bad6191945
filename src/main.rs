use std::{
    collections::BTreeSet,
    process,
    sync::{Arc, OnceLock},
    time::Duration,
};

use metricbee::{
    config::Config,
    core::{
        mb::{light::LightModules, Registry},
        monitoring::MonitoringRegistry,
        publisher::{LogPublisher, Publisher},
        reloader::{Reloader, RunnerList},
        runner::ModuleRunnerFactory,
        stats::Stats,
        wrapper::Wrapper,
    },
    logger::LoggerManager,
    print_error,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const METRICS_LOG_PERIOD: Duration = Duration::from_secs(30);

static CONFIG: OnceLock<Config> = OnceLock::new();

pub fn config() -> &'static Config {
    CONFIG.get_or_init(|| {
        Config::new().unwrap_or_else(|e| {
            print_error!("{}", e);
            process::exit(1);
        })
    })
}

/// Logs every known module with its metricsets and whether a static block
/// configures it.
fn log_modules_table(configured: &[toml::Table], registry: &Registry) {
    let configured: BTreeSet<String> = configured
        .iter()
        .filter_map(|block| block.get("module").and_then(toml::Value::as_str))
        .map(str::to_lowercase)
        .collect();

    let all_names: BTreeSet<String> = registry
        .modules()
        .into_iter()
        .chain(configured.iter().cloned())
        .collect();

    let name_width = all_names
        .iter()
        .map(|s| s.len())
        .max()
        .unwrap_or(10)
        .max("Module".len());

    info!("{:<width$} | {:<20} | Metricsets", "Module", "Status", width = name_width);
    info!("{}-+-{}-+-{}", "-".repeat(name_width), "-".repeat(20), "-".repeat(24));

    for name in all_names {
        let status = match (configured.contains(&name), registry.has_module(&name)) {
            (true, true) => "CONFIGURED",
            (true, false) => "CONFIGURED (missing)",
            (false, _) => "AVAILABLE",
        };
        let metricsets = registry.metricsets(&name).join(", ");
        info!("{:<width$} | {:<20} | {}", name, status, metricsets, width = name_width);
    }
}

/// Periodically logs the non-zero counters under `namespace`.
async fn log_metrics(monitoring: MonitoringRegistry, namespace: String, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(METRICS_LOG_PERIOD);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let snapshot = monitoring.snapshot(&namespace);
                let non_zero: Vec<String> = snapshot
                    .iter()
                    .filter(|(_, value)| **value > 0)
                    .map(|(name, value)| format!("{}={}", name, value))
                    .collect();
                if !non_zero.is_empty() {
                    info!("Non-zero metrics in the last {}s: {}", METRICS_LOG_PERIOD.as_secs(), non_zero.join(" "));
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = config();
    let logger_manager = LoggerManager::new(cfg.logger.clone()).unwrap_or_else(|e| {
        print_error!("Failed to setup Log Manager: {}", e);
        process::exit(1);
    });
    logger_manager.init().unwrap_or_else(|e| {
        print_error!("Failed to init Log Manager: {}", e);
        process::exit(1);
    });
    info!("Starting metricbee version {}...", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", cfg.logger.level);
    debug!("{:#?}", cfg.config_modules);

    let mut registry = Registry::with_builtins().unwrap_or_else(|e| {
        error!("Failed to register built-in metricsets: {}", e);
        process::exit(1);
    });
    if !cfg.light_modules.path.is_empty() {
        info!("Light modules: {:?}", cfg.light_modules.path);
        registry.set_secondary_source(Arc::new(LightModules::new(cfg.light_modules.path.clone())));
    }
    let registry = Arc::new(registry);
    log_modules_table(&cfg.modules, &registry);

    let monitoring = MonitoringRegistry::new();
    let stats = Stats::new(cfg.monitoring.namespace.clone(), monitoring.clone());
    let publisher: Arc<dyn Publisher> = Arc::new(LogPublisher);
    let factory = Arc::new(ModuleRunnerFactory::new(publisher));

    let mut wrappers = Vec::with_capacity(cfg.modules.len());
    for block in &cfg.modules {
        let wrapper = Wrapper::new(block.clone(), &registry, &stats).unwrap_or_else(|e| {
            error!("Invalid module configuration: {}", e);
            process::exit(1);
        });
        wrappers.push(wrapper);
    }

    let static_runners = RunnerList::new();
    let outcome = static_runners.reload(wrappers, factory.as_ref()).await;
    info!("Started {} static module(s)", outcome.started);

    let cancel = CancellationToken::new();
    let reloader = Arc::new(Reloader::new(
        cfg.config_modules.clone(),
        Arc::clone(&registry),
        stats.clone(),
        factory,
    ));
    let reloader_task = tokio::spawn({
        let reloader = Arc::clone(&reloader);
        let cancel = cancel.clone();
        async move { reloader.run(cancel).await }
    });
    let metrics_task = tokio::spawn(log_metrics(
        monitoring.clone(),
        cfg.monitoring.namespace.clone(),
        cancel.clone(),
    ));

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, initiating graceful shutdown...");

    for (name, value) in monitoring.snapshot(&cfg.monitoring.namespace) {
        debug!("{} = {}", name, value);
    }

    cancel.cancel();
    static_runners.stop_all().await;
    if let Err(e) = reloader_task.await {
        error!("Reloader task failed: {}", e);
    }
    if let Err(e) = metrics_task.await {
        error!("Metrics log task failed: {}", e);
    }
    info!("Shutdown complete");
    Ok(())
}
