use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::runs::Run;

/// Stream run snapshots as SSE. Terminal snapshots use the `done` event so
/// clients can close the connection.
pub fn build_sse_response<S>(stream: S) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send>
where
    S: Stream<Item = Run> + Send + 'static,
{
    let stream = stream.map(|run| {
        let json = serde_json::to_string(&run).unwrap_or_else(|_| "{}".to_string());
        let name = if run.status.is_terminal() { "done" } else { "progress" };
        Ok(Event::default().event(name).data(json))
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

struct Follow<F> {
    updates: BroadcastStream<Run>,
    lookup: F,
    run_id: String,
    next: Option<Run>,
    finished: bool,
}

impl<F> Follow<F>
where
    F: Fn(&str) -> Option<Run>,
{
    async fn next_update(&mut self) -> Option<Run> {
        while let Some(event) = self.updates.next().await {
            match event {
                Ok(run) if run.run_id == self.run_id => return Some(run),
                Ok(_) => {}
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::debug!(run_id = %self.run_id, skipped, "Event stream lagged, re-reading run");
                    return (self.lookup)(&self.run_id);
                }
            }
        }
        None
    }
}

/// Follow one run: yields `current`, then every later snapshot of the same
/// run, and ends right after the first terminal one.
///
/// `rx` must be subscribed before `current` was read. When the receiver
/// lags, the latest state comes from `lookup` instead.
pub fn follow_run<F>(
    current: Run,
    rx: broadcast::Receiver<Run>,
    lookup: F,
) -> impl Stream<Item = Run> + Send + 'static
where
    F: Fn(&str) -> Option<Run> + Send + 'static,
{
    let follow = Follow {
        updates: BroadcastStream::new(rx),
        lookup,
        run_id: current.run_id.clone(),
        next: Some(current),
        finished: false,
    };

    futures::stream::unfold(follow, |mut follow| async move {
        if follow.finished {
            return None;
        }
        let run = match follow.next.take() {
            Some(run) => run,
            None => follow.next_update().await?,
        };
        follow.finished = run.status.is_terminal();
        Some((run, follow))
    })
}
