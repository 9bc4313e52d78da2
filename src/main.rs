use std::time::Duration;

use gopcache::config::SourceConfig;
use gopcache::{Config, CoordinatorEvent, Registry, StreamingCoordinator};
use tracing_subscriber::EnvFilter;

const PLAYBACK_FPS: f64 = 25.0;
const STATS_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_DELAY: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("gopcache=debug".parse()?))
        .init();

    let config = Config::load()?;
    tracing::info!("loaded {} source(s)", config.sources.len());

    let registry = Registry::from_config(&config);
    let mut handles = Vec::new();

    for source in config.sources {
        let registry = registry.clone();
        let source_id = source.id.clone();
        let handle = tokio::spawn(async move {
            play_source(source, registry).await;
        });
        handles.push((source_id, handle));
    }

    tokio::select! {
        _ = async {
            for (source_id, handle) in handles {
                if let Err(e) = handle.await {
                    tracing::error!(source = %source_id, "playback task failed: {}", e);
                }
            }
        } => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(open_files = registry.open_files().len(), "shutdown signal received");
        }
    }

    tracing::info!("shutdown complete");
    Ok(())
}

/// Plays one source from the start at a fixed frame rate, looping at the
/// end. A file that fails to index is retried after a pause.
async fn play_source(source: SourceConfig, registry: Registry) {
    loop {
        tracing::info!(source = %source.id, url = %source.url, "opening source");
        let mut coordinator = StreamingCoordinator::new(registry.clone(), source.url.clone());
        coordinator.start(0.0);

        let duration = match wait_for_meta(&mut coordinator).await {
            Some(duration) => duration,
            None => {
                tracing::info!(source = %source.id, "retrying in {:?}", RETRY_DELAY);
                tokio::time::sleep(RETRY_DELAY).await;
                continue;
            }
        };

        play(&source, &mut coordinator, duration).await;
    }
}

async fn wait_for_meta(coordinator: &mut StreamingCoordinator) -> Option<f64> {
    loop {
        match coordinator.next_event().await? {
            CoordinatorEvent::Meta(meta) => {
                return Some(gopcache::media::micros_to_secs(meta.duration));
            }
            CoordinatorEvent::Error(error) => {
                tracing::error!(url = %coordinator.url(), error = %error, "source unavailable");
                return None;
            }
            _ => {}
        }
    }
}

async fn play(source: &SourceConfig, coordinator: &mut StreamingCoordinator, duration: f64) {
    let step = 1.0 / PLAYBACK_FPS;
    let mut ticker = tokio::time::interval(Duration::from_secs_f64(step));
    let mut stats = tokio::time::interval(STATS_INTERVAL);
    let mut time = 0.0;
    let mut shown = 0u64;
    let mut missed = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                time += step;
                if time > duration {
                    time = 0.0;
                    coordinator.start(time);
                } else {
                    coordinator.process(time);
                }

                while let Some(event) = coordinator.poll_event() {
                    match event {
                        CoordinatorEvent::CanPlay { index } => {
                            tracing::trace!(source = %source.id, gop = index, "gop playable");
                        }
                        CoordinatorEvent::Error(error) => {
                            tracing::warn!(source = %source.id, error = %error, "gop unavailable");
                        }
                        _ => {}
                    }
                }

                if coordinator.frame_at(time).is_some() {
                    shown += 1;
                } else {
                    missed += 1;
                }
            }
            _ = stats.tick() => {
                tracing::info!(
                    source = %source.id,
                    time = format!("{:.1}", time),
                    gop = ?coordinator.gop_index(),
                    held = ?coordinator.held_indices(),
                    shown,
                    missed,
                    "playback stats"
                );
            }
        }
    }
}
