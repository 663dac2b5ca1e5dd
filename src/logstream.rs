use std::sync::Arc;
use std::time::Duration;

use async_stream::try_stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, instrument};

use crate::error::ManagerError;
use crate::forward::spawn_forwarder;
use crate::manager::ProxyManager;
use crate::proto::backend::v1::log_stream_client::LogStreamClient;
use crate::proto::backend::v1::log_stream_server::LogStream;
use crate::proto::backend::v1::{LogRequest, LogResponse};

const CLIENT_ID_KEY: &str = "client_id";
const RETRY_ATTEMPTS: u32 = 5;
const RETRY_SPACING: Duration = Duration::from_secs(2);
const FORWARDER_JOIN_BUDGET: Duration = Duration::from_secs(1);

/// Bidirectional streaming servicer for logs. Never spawns a backend itself;
/// it depends on a `DataProxy` stream having already provisioned one, so it
/// retries the lookup for a bounded window to absorb the race where the log
/// stream opens first.
pub struct LogProxy {
	manager: Arc<ProxyManager>,
}

impl LogProxy {
	pub fn new(manager: Arc<ProxyManager>) -> Self {
		Self { manager }
	}
}

fn client_id(request: &Request<Streaming<LogRequest>>) -> Option<String> {
	let value = request.metadata().get(CLIENT_ID_KEY)?;
	let value = value.to_str().ok()?;
	if value.is_empty() {
		return None;
	}
	Some(value.to_string())
}

#[tonic::async_trait]
impl LogStream for LogProxy {
	type LogstreamStream =
		std::pin::Pin<Box<dyn tokio_stream::Stream<Item = Result<LogResponse, Status>> + Send + 'static>>;

	#[instrument(skip(self, request))]
	async fn logstream(
		&self,
		request: Request<Streaming<LogRequest>>,
	) -> Result<Response<Self::LogstreamStream>, Status> {
		let cid = client_id(&request).ok_or(ManagerError::MissingIdentity)?;
		let inbound = request.into_inner();

		let mut channel = None;
		for attempt in 0..RETRY_ATTEMPTS {
			match self.manager.get_channel(&cid).await {
				Ok(c) => {
					channel = Some(c);
					break;
				}
				Err(_) if attempt + 1 < RETRY_ATTEMPTS => {
					debug!(client_id = %cid, attempt, "no backend yet for log stream, retrying");
					tokio::time::sleep(RETRY_SPACING).await;
				}
				Err(_) => {}
			}
		}
		let channel = channel.ok_or(ManagerError::NoBackend)?;
		let mut backend = LogStreamClient::new(channel);

		let (tx, rx) = mpsc::unbounded_channel::<LogRequest>();
		let forwarder = spawn_forwarder(inbound, tx);

		let outbound_stream = UnboundedReceiverStream::new(rx);
		let mut backend_request = Request::new(outbound_stream);
		let metadata_value = cid
			.parse()
			.map_err(|_| Status::invalid_argument("client_id is not valid ASCII metadata"))?;
		backend_request.metadata_mut().insert(CLIENT_ID_KEY, metadata_value);

		let backend_responses = backend.logstream(backend_request).await?.into_inner();

		let response_stream = try_stream! {
			let mut backend_responses = backend_responses;
			loop {
				match backend_responses.message().await {
					Ok(Some(item)) => yield item,
					Ok(None) => break,
					Err(err) => Err(err)?,
				}
			}
			if tokio::time::timeout(FORWARDER_JOIN_BUDGET, forwarder).await.is_err() {
				debug!("log forwarder outlived its join budget, abandoning");
			}
		};

		Ok(Response::new(Box::pin(response_stream)))
	}
}
