//! Driver loop
//!
//! Consumes the sequencer protocol and the log pipe together until the
//! pipeline completes, then tears it down.

use sluice_core::domain::{Line, Outcome};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{Event, Pipeline};

/// Runs every node of `pipeline`, handing each output line to `on_line`
///
/// Lines still queued when `Done` arrives are delivered before teardown.
pub async fn drive<F>(mut pipeline: Pipeline, mut pipe: mpsc::Receiver<Line>, mut on_line: F) -> Outcome
where
    F: FnMut(Line),
{
    info!(pipeline = %pipeline.id(), "Starting pipeline '{}'", pipeline.context().name());

    let result = loop {
        tokio::select! {
            Some(line) = pipe.recv() => on_line(line),
            event = pipeline.next() => match event {
                Some(Event::Next(index)) => {
                    if let Some(node) = pipeline.head() {
                        debug!(pipeline = %pipeline.id(), "Node {} ({}) ready", index, node.name());
                    }
                    pipeline.exec();
                }
                Some(Event::Done(result)) => break result,
                // Done already delivered by an earlier call
                None => break Ok(()),
            },
        }
    };

    while let Ok(line) = pipe.try_recv() {
        on_line(line);
    }

    let outcome = Outcome::new(result, pipeline.exit_code());
    pipeline.teardown().await;

    info!(
        "Pipeline finished: {} (exit code {})",
        outcome.state, outcome.exit_code
    );
    outcome
}
