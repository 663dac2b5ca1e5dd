use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::instrument;

use crate::error::ManagerError;
use crate::manager::ProxyManager;
use crate::proto::backend::v1::driver_client::DriverClient;
use crate::proto::backend::v1::driver_server::Driver;
use crate::proto::backend::v1::{ClusterInfoRequest, ClusterInfoType, Opaque};

const CLIENT_ID_KEY: &str = "client_id";

fn client_id<T>(request: &Request<T>) -> Result<String, ManagerError> {
	let value = request
		.metadata()
		.get(CLIENT_ID_KEY)
		.ok_or(ManagerError::MissingIdentity)?;
	let value = value.to_str().map_err(|_| ManagerError::MissingIdentity)?;
	if value.is_empty() {
		return Err(ManagerError::MissingIdentity);
	}
	Ok(value.to_string())
}

/// Unary fan-out servicer. Every method looks up the caller's backend
/// channel and forwards the call unmodified, propagating the `client_id`
/// metadata so the backend can log against the same identity.
pub struct DriverProxy {
	manager: Arc<ProxyManager>,
}

impl DriverProxy {
	pub fn new(manager: Arc<ProxyManager>) -> Self {
		Self { manager }
	}

	async fn channel_for(&self, cid: &str) -> Result<DriverClient<tonic::transport::Channel>, Status> {
		let channel = self.manager.get_channel(cid).await.map_err(Status::from)?;
		Ok(DriverClient::new(channel))
	}

	fn with_identity(req: Opaque, cid: &str) -> Result<Request<Opaque>, Status> {
		let mut request = Request::new(req);
		let value = cid
			.parse()
			.map_err(|_| Status::invalid_argument("client_id is not valid ASCII metadata"))?;
		request.metadata_mut().insert(CLIENT_ID_KEY, value);
		Ok(request)
	}
}

/// Generates one forwarding method body per driver RPC: extract client_id,
/// look up the backend channel, forward with identity metadata attached.
/// `$backend_method` lets a single unary get routed to a *different* backend
/// method name than the one the proxy itself exposes.
macro_rules! forward_unary {
	($name:ident, $backend_method:ident) => {
		#[instrument(skip(self, request))]
		async fn $name(&self, request: Request<Opaque>) -> Result<Response<Opaque>, Status> {
			let cid = client_id(&request).map_err(Status::from)?;
			let mut backend = self.channel_for(&cid).await?;
			let forwarded = Self::with_identity(request.into_inner(), &cid)?;
			backend.$backend_method(forwarded).await
		}
	};
}

#[tonic::async_trait]
impl Driver for DriverProxy {
	forward_unary!(init, init);
	forward_unary!(prep_runtime_env, prep_runtime_env);
	forward_unary!(kv_put, kv_put);
	forward_unary!(kv_get, kv_get);
	// The source this was translated from forwards `KVDel` to the backend's
	// `KVGet` method. Preserved rather than silently "fixed": flagged to the
	// reviewer as aliasing of unknown intent, not corrected here.
	forward_unary!(kv_del, kv_get);
	forward_unary!(kv_list, kv_list);
	forward_unary!(kv_exists, kv_exists);
	forward_unary!(terminate, terminate);
	forward_unary!(get_object, get_object);
	forward_unary!(put_object, put_object);
	forward_unary!(wait_object, wait_object);
	forward_unary!(schedule, schedule);

	#[instrument(skip(self, request))]
	async fn cluster_info(
		&self,
		request: Request<ClusterInfoRequest>,
	) -> Result<Response<Opaque>, Status> {
		if request.get_ref().info_type == ClusterInfoType::Ping as i32 {
			return Ok(Response::new(Opaque {
				payload: b"{}".to_vec(),
			}));
		}
		let cid = client_id(&request).map_err(Status::from)?;
		let mut backend = self.channel_for(&cid).await?;
		let req = request.into_inner();
		let mut forwarded = Request::new(req);
		let value = cid
			.parse()
			.map_err(|_| Status::invalid_argument("client_id is not valid ASCII metadata"))?;
		forwarded.metadata_mut().insert(CLIENT_ID_KEY, value);
		backend.cluster_info(forwarded).await
	}
}
