use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tonic::Streaming;
use tracing::debug;

/// Drains an inbound client stream into an unbounded queue that a splicing
/// task can read from independently of the outbound response stream. Mirrors
/// splitting the duplex call into a producer thread feeding a `Queue()` and a
/// consumer reading from it, translated to a tokio task and an mpsc channel.
///
/// The task exits (and drops `tx`, closing the queue) when the inbound
/// stream ends or errors; callers await the returned handle with a bounded
/// timeout rather than indefinitely, since a wedged upstream must not hang
/// shutdown.
pub fn spawn_forwarder<T: Send + 'static>(
	mut inbound: Streaming<T>,
	tx: mpsc::UnboundedSender<T>,
) -> JoinHandle<()> {
	tokio::spawn(async move {
		loop {
			match inbound.message().await {
				Ok(Some(item)) => {
					if tx.send(item).is_err() {
						debug!("forwarder queue closed by consumer");
						return;
					}
				}
				Ok(None) => {
					debug!("inbound stream ended");
					return;
				}
				Err(err) => {
					debug!(%err, "inbound stream error, stopping forwarder");
					return;
				}
			}
		}
	})
}

// `Streaming<T>` is only publicly constructible from a live tonic call, so
// this helper is exercised by the integration tests against an in-process
// server rather than a standalone unit test here.
