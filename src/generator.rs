//! Work generator.
//!
//! Produces chunks of freshly named work items at a fixed cadence and
//! appends each chunk to the store as an awaited, independent write.
//! Append failures propagate to the caller; the generator carries no
//! retry logic of its own, the orchestrator decides disposition.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::Result;
use crate::event::{Event, EventKind, EventSink};
use crate::store::Store;

/// Configuration for one generator task.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// Total number of items to produce across the run.
    pub target: u64,
    /// Items per chunk; the final chunk may be smaller.
    pub chunk_size: usize,
    /// Fixed delay before each chunk.
    pub interval: Duration,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            target: 1_000_000,
            chunk_size: 1000,
            interval: Duration::from_millis(500),
        }
    }
}

pub struct Generator {
    store: Arc<dyn Store>,
    sink: Arc<dyn EventSink>,
    config: GeneratorConfig,
}

impl Generator {
    pub fn new(store: Arc<dyn Store>, sink: Arc<dyn EventSink>, config: GeneratorConfig) -> Self {
        Self {
            store,
            sink,
            config,
        }
    }

    /// Produce chunks until the target count is reached or cancellation is
    /// observed. Returns the number of items generated.
    pub async fn run(&self, cancel: watch::Receiver<bool>) -> Result<u64> {
        let mut generated: u64 = 0;

        while generated < self.config.target {
            if *cancel.borrow() {
                info!(generated, "generator cancelled");
                break;
            }

            tokio::time::sleep(self.config.interval).await;

            let remaining = (self.config.target - generated) as usize;
            let count = remaining.min(self.config.chunk_size);
            let names: Vec<String> = (0..count).map(|_| Uuid::new_v4().to_string()).collect();

            // Awaited on purpose: a lost append must be observable, not
            // silently dropped.
            self.store.append_work_items(&names).await?;
            generated += count as u64;

            debug!(count, generated, "appended chunk");
            self.sink.emit(Event::now(EventKind::ChunkAppended {
                count,
                total_generated: generated,
            }));
        }

        self.sink
            .emit(Event::now(EventKind::GeneratorFinished { generated }));
        Ok(generated)
    }
}
