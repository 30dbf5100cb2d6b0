//! # Section Timer
//!
//! A restart-surviving, multi-section countdown timer engine for Rust built on top of Tokio.
//!
//! Each *section* is an independently operated countdown. The registry owns
//! every section's state, runs a cancellable one-second tick loop per running
//! section, persists each transition so a countdown survives a process
//! restart, and emits state updates to a pluggable notification sink.
//!
//! On startup the registry reconciles persisted state against the wall clock:
//! a section whose absolute end timestamp is still in the future resumes
//! anchored to that timestamp; one whose end passed while the process was
//! down is finalized exactly as if its countdown had ticked to zero.
//!
//! ## Features
//!
//! - **Asynchronous**: Built on Tokio; commands flow over a bounded channel
//! - **Restart recovery**: Persisted absolute end timestamps, diffed against
//!   the wall clock on startup
//! - **Pluggable persistence**: A file-backed JSON store ships in the box;
//!   any [`TimerStore`] works
//! - **Shared alarm device**: One audible device derived from per-section
//!   alarm flags
//! - **Graceful Shutdown**: Support for cancellation tokens and clean shutdowns
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use section_timer::{
//!     CancellationToken, ChannelSink, FileTimerStore, RegistryConfig, SectionId,
//!     SystemClock, TimerRegistry,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cancel_token = CancellationToken::new();
//!     let (sink, mut updates) = ChannelSink::new(100);
//!
//!     let (registry, handle) = TimerRegistry::new(
//!         RegistryConfig::default(),
//!         Arc::new(FileTimerStore::open("timers.json")),
//!         Arc::new(sink),
//!         Arc::new(SystemClock),
//!         cancel_token.clone(),
//!     );
//!
//!     // Spawn the registry task; it recovers persisted sections first.
//!     tokio::spawn(registry.run());
//!
//!     // Count section 1 down from five minutes.
//!     handle.start(SectionId(1), 5 * 60 * 1_000).await?;
//!
//!     while let Some(update) = updates.recv().await {
//!         println!("section {}: {} ms left", update.section, update.remaining_ms);
//!         if update.finished {
//!             handle.stop_alarm(update.section).await?;
//!             break;
//!         }
//!     }
//!
//!     handle.shutdown().await?;
//!     Ok(())
//! }
//! ```

mod clock;
mod format;
mod notify;
mod registry;
mod section;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use format::format_hms;
pub use notify::{ChannelSink, NotificationSink, TimerUpdate};
pub use registry::{RegistryConfig, RegistryHandle, TimerCommand, TimerRegistry};
pub use section::{SectionId, SectionState, TickOutcome};
pub use store::{FileTimerStore, MemoryTimerStore, SectionRecord, StoreError, TimerStore};

// Re-export commonly used types for convenience
pub use std::time::Duration;
pub use tokio_util::sync::CancellationToken;
