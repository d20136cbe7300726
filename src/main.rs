use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use ulid::Ulid;

use slotwise::config::Config;
use slotwise::model::Snapshot;
use slotwise::notify::NotifyHub;
use slotwise::scheduler::Scheduler;
use slotwise::store::InMemoryStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    slotwise::observability::init(config.metrics_port)?;

    let snapshot: Snapshot = match &config.snapshot {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => Snapshot::default(),
    };

    let store = Arc::new(InMemoryStore::new(Arc::new(NotifyHub::new())));
    store.seed(&snapshot).await?;
    let scheduler = Scheduler::new(store, config.tz).with_layout(config.layout);

    let date = config
        .date
        .unwrap_or_else(|| Utc::now().with_timezone(&config.tz).date_naive());
    let locations: Vec<Ulid> = match config.location_id {
        Some(id) => vec![id],
        None => snapshot
            .schedules
            .iter()
            .map(|s| s.location_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect(),
    };

    info!("slotwise day view for {date}");
    info!("  tz: {}", config.tz);
    info!("  locations: {}", locations.len());
    info!(
        "  window: {}-{} at {}px/min",
        config.layout.day_start, config.layout.day_end, config.layout.px_per_minute
    );
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    let mut views = Vec::with_capacity(locations.len());
    for location_id in locations {
        views.push(scheduler.load_day(location_id, date).await?);
    }
    println!("{}", serde_json::to_string_pretty(&views)?);
    Ok(())
}
