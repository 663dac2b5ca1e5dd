use std::sync::Arc;
use std::time::Duration;

use async_stream::try_stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, instrument, warn};

use crate::error::ManagerError;
use crate::forward::spawn_forwarder;
use crate::manager::ProxyManager;
use crate::proto::backend::v1::data_request::Kind;
use crate::proto::backend::v1::data_stream_client::DataStreamClient;
use crate::proto::backend::v1::data_stream_server::DataStream;
use crate::proto::backend::v1::{DataRequest, DataResponse, InitRequest};

const CLIENT_ID_KEY: &str = "client_id";
const FORWARDER_JOIN_BUDGET: Duration = Duration::from_secs(1);

/// Rewrites a job configuration before it is handed to a freshly spawned
/// backend. Identity by default; a deployment can plug in its own env-prep
/// step without touching the splice logic.
pub trait EnvPrepHook: Send + Sync {
	fn prepare(&self, job_config: Vec<u8>) -> Vec<u8>;
}

pub struct IdentityEnvPrepHook;

impl EnvPrepHook for IdentityEnvPrepHook {
	fn prepare(&self, job_config: Vec<u8>) -> Vec<u8> {
		job_config
	}
}

fn default_job_config() -> Vec<u8> {
	b"{}".to_vec()
}

/// Bidirectional streaming servicer that provisions a client's backend on
/// the first message, then splices the rest of the stream through to it.
/// This is the only place a backend is spawned.
pub struct DataProxy {
	manager: Arc<ProxyManager>,
	env_prep: Box<dyn EnvPrepHook>,
}

impl DataProxy {
	pub fn new(manager: Arc<ProxyManager>) -> Self {
		Self {
			manager,
			env_prep: Box::new(IdentityEnvPrepHook),
		}
	}

	pub fn with_env_prep(manager: Arc<ProxyManager>, env_prep: Box<dyn EnvPrepHook>) -> Self {
		Self { manager, env_prep }
	}
}

fn client_id(request: &Request<Streaming<DataRequest>>) -> Option<String> {
	let value = request.metadata().get(CLIENT_ID_KEY)?;
	let value = value.to_str().ok()?;
	if value.is_empty() {
		return None;
	}
	Some(value.to_string())
}

#[tonic::async_trait]
impl DataStream for DataProxy {
	type DatapathStream =
		std::pin::Pin<Box<dyn tokio_stream::Stream<Item = Result<DataResponse, Status>> + Send + 'static>>;

	#[instrument(skip(self, request))]
	async fn datapath(
		&self,
		request: Request<Streaming<DataRequest>>,
	) -> Result<Response<Self::DatapathStream>, Status> {
		let cid = client_id(&request).ok_or(ManagerError::MissingIdentity)?;
		let mut inbound = request.into_inner();

		let first = inbound
			.message()
			.await?
			.ok_or_else(|| Status::from(ManagerError::ProtocolError("stream closed before init")))?;

		let job_config = match &first.kind {
			Some(Kind::Init(init)) => init.job_config.clone(),
			_ => return Err(Status::from(ManagerError::ProtocolError("first message must be init"))),
		};

		let raw_config = if job_config.is_empty() {
			default_job_config()
		} else {
			job_config
		};
		let rewritten_config = self.env_prep.prepare(raw_config);

		let rewritten_first = DataRequest {
			kind: Some(Kind::Init(InitRequest {
				job_config: rewritten_config.clone(),
			})),
		};

		let (tx, rx) = mpsc::unbounded_channel::<DataRequest>();
		// The rewritten first message is enqueued before the forwarder starts,
		// guaranteeing the backend observes it ahead of anything else the
		// client sent.
		tx.send(rewritten_first)
			.map_err(|_| Status::internal("splice queue closed before first message"))?;

		self.manager
			.start_backend(&cid, "specific-server", &rewritten_config)
			.await
			.map_err(Status::from)?;

		let channel = self.manager.get_channel(&cid).await.map_err(Status::from)?;
		let mut backend = DataStreamClient::new(channel);

		let forwarder = spawn_forwarder(inbound, tx);

		let outbound_stream = UnboundedReceiverStream::new(rx);
		let mut backend_request = Request::new(outbound_stream);
		let metadata_value = cid
			.parse()
			.map_err(|_| Status::invalid_argument("client_id is not valid ASCII metadata"))?;
		backend_request.metadata_mut().insert(CLIENT_ID_KEY, metadata_value);

		let backend_responses = backend.datapath(backend_request).await?.into_inner();

		let response_stream = try_stream! {
			let mut backend_responses = backend_responses;
			loop {
				match backend_responses.message().await {
					Ok(Some(item)) => yield item,
					Ok(None) => break,
					Err(err) => {
						warn!(%err, "backend datapath stream error");
						Err(err)?;
					}
				}
			}
			if tokio::time::timeout(FORWARDER_JOIN_BUDGET, forwarder).await.is_err() {
				debug!("forwarder task outlived its join budget, abandoning");
			}
		};

		Ok(Response::new(Box::pin(response_stream)))
	}
}
