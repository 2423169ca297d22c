use std::sync::Arc;

use actix_web::{App, HttpServer, middleware, web};
use tracing::info;
use tracing_subscriber::EnvFilter;

use chairside::clock::SystemClock;
use chairside::config::Config;
use chairside::directory::InMemoryDirectory;
use chairside::http::{self, AppState};
use chairside::notify::LogSink;
use chairside::tenant::{ClinicManager, ClinicSettings};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    chairside::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;

    let directory = match &config.directory_seed {
        Some(path) => {
            let directory = InMemoryDirectory::from_json_file(path)?;
            info!("directory seeded from {}: {} people", path.display(), directory.len());
            directory
        }
        None => InMemoryDirectory::new(),
    };

    let clinics = Arc::new(ClinicManager::new(ClinicSettings {
        data_dir: config.data_dir.clone(),
        compact_threshold: config.compact_threshold,
        schedule: config.schedule,
        reminder_interval: config.reminder_interval,
        reminder_lead: config.reminder_lead,
        clock: Arc::new(SystemClock),
        directory: Arc::new(directory),
        sinks: vec![Arc::new(LogSink)],
    }));
    // Load the default clinic up front so its journal replays before traffic.
    clinics.get_or_create(http::DEFAULT_CLINIC)?;

    let addr = format!("{}:{}", config.bind, config.port);
    let grid = config.schedule.grid;
    info!("chairside listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!(
        "  hours: {}-{} every {} minutes, {} cabinets",
        grid.open(),
        grid.close(),
        grid.step_minutes(),
        config.schedule.cabinet_count()
    );
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let state = web::Data::new(AppState { clinics });
    // actix handles SIGINT/SIGTERM itself and drains in-flight requests.
    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(middleware::Logger::default())
            .configure(http::configure)
    })
    .bind(&addr)?
    .shutdown_timeout(10)
    .run()
    .await?;

    info!("chairside stopped");
    Ok(())
}
