use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Spawn a Tokio task with a stable name when supported, and trace span otherwise.
pub fn spawn_named_task<F, S>(name: S, future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
    S: Into<String>,
{
    let name_owned = name.into();
    #[cfg(tokio_unstable)]
    {
        tokio::task::Builder::new().name(&name_owned).spawn(future)
    }
    #[cfg(not(tokio_unstable))]
    {
        use tracing::Instrument;
        let span = tracing::info_span!("task", task_name = %name_owned);
        tokio::spawn(future.instrument(span))
    }
}

/// Like [`spawn_named_task`], but the future is dropped as soon as `stop` fires.
/// Yields `None` when the task was cancelled before finishing.
pub fn spawn_cancellable<F, S>(
    name: S,
    stop: CancellationToken,
    future: F,
) -> JoinHandle<Option<F::Output>>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
    S: Into<String>,
{
    spawn_named_task(name, async move {
        tokio::select! {
            biased;
            _ = stop.cancelled() => None,
            output = future => Some(output),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancellable_task_stops_on_token() {
        let stop = CancellationToken::new();
        let handle = spawn_cancellable("sleeper", stop.clone(), async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            1
        });
        stop.cancel();
        assert_eq!(handle.await.unwrap(), None);
    }

    #[tokio::test]
    async fn cancellable_task_returns_output() {
        let handle = spawn_cancellable("quick", CancellationToken::new(), async { 7 });
        assert_eq!(handle.await.unwrap(), Some(7));
    }
}
