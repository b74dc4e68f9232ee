//! Fetch URLs through the scheduler and print what came back
//!
//! ```text
//! cargo run -p void_loader --example fetch -- http://example.com/ [more urls...]
//! ```
//!
//! Run it twice: the second run is served from `./cache`.

use std::time::{Duration, Instant};

use void_loader::prelude::*;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let urls: Vec<String> = std::env::args().skip(1).collect();
    if urls.is_empty() {
        eprintln!("usage: fetch <url> [url...]");
        return Ok(());
    }

    let config = match std::env::var("VOID_LOADER_CONFIG") {
        Ok(path) => LoaderConfig::load(path)?,
        Err(_) => LoaderConfig::development(),
    };
    let mut scheduler = RequestScheduler::new(config, HttpTransport::new()?)?;

    let group = scheduler.create_group_with::<[u8], _, _>(urls, |view| {
        for request in view.requests() {
            match request.result::<[u8]>() {
                Some(bytes) => log::info!(
                    "{} -> {} bytes ({})",
                    request.locator(),
                    bytes.len(),
                    if request.is_from_cache() { "cache" } else { "network" }
                ),
                None => log::warn!(
                    "{} -> {}",
                    request.locator(),
                    request.error_message().unwrap_or_default()
                ),
            }
        }
    })?;

    let deadline = Instant::now() + Duration::from_secs(60);
    while !scheduler.group(group).is_some_and(|g| g.is_done()) && Instant::now() < deadline {
        scheduler.tick();
        std::thread::sleep(Duration::from_millis(16));
    }

    let stats = scheduler.stats();
    log::info!(
        "{} ticks: {} cache hits, {} network fetches, {} bytes",
        scheduler.frame(),
        stats.cache_hits,
        stats.network_fetches,
        stats.bytes_fetched
    );
    scheduler.flush()?;
    Ok(())
}
