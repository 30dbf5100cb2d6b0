//! Basic usage example for the section timer registry

use std::sync::Arc;

use section_timer::{
    CancellationToken, ChannelSink, Duration, FileTimerStore, RegistryConfig, SectionId,
    SystemClock, TimerRegistry, format_hms,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::init();

    let cancel_token = CancellationToken::new();
    let (sink, mut updates) = ChannelSink::new(100);

    // Persisted state lands next to the binary; delete the file to start clean.
    let (registry, handle) = TimerRegistry::new(
        RegistryConfig {
            sections: vec![SectionId(1), SectionId(2)],
            ..RegistryConfig::default()
        },
        Arc::new(FileTimerStore::open("section_timers.json")),
        Arc::new(sink),
        Arc::new(SystemClock),
        cancel_token.clone(),
    );

    // Spawn the registry task; any countdown persisted by a previous run
    // resumes (or finishes) before the commands below are processed.
    let registry_task = tokio::spawn(registry.run());

    // Two short countdowns side by side.
    handle.start(SectionId(1), 3_000).await?;
    handle.start(SectionId(2), 5_000).await?;
    println!("Timers started! Waiting for them to finish...");

    let mut finished = 0;
    while finished < 2 {
        if let Some(update) = updates.recv().await {
            println!(
                "section {}: {} {}",
                update.section,
                format_hms(update.remaining_ms),
                if update.finished { "(finished)" } else { "" }
            );
            if update.finished {
                handle.stop_alarm(update.section).await?;
                finished += 1;
            }
        }
    }

    // Demonstrate crediting extra time to a stopped section.
    handle.add_time(SectionId(1), 60_000).await?;
    println!("Credited a minute to section 1");

    tokio::time::sleep(Duration::from_millis(100)).await;

    // Shutdown gracefully
    handle.shutdown().await?;
    registry_task.await?;

    println!("Registry shut down successfully!");
    Ok(())
}
