use thiserror::Error;

/// Internal failure taxonomy for the manager and its servicers. Every variant
/// maps to exactly one client-visible `tonic::Status` code; nothing here ever
/// propagates as a panic.
#[derive(Error, Debug, Clone)]
pub enum ManagerError {
	#[error("no client_id in request metadata")]
	MissingIdentity,

	#[error("no backend channel for client")]
	NoBackend,

	#[error("backend startup failed")]
	BackendStartupFailed,

	#[error("port pool exhausted")]
	PortExhausted,

	#[error("protocol error: {0}")]
	ProtocolError(&'static str),
}

impl From<ManagerError> for tonic::Status {
	fn from(err: ManagerError) -> Self {
		match err {
			ManagerError::MissingIdentity => tonic::Status::invalid_argument(err.to_string()),
			ManagerError::NoBackend => tonic::Status::not_found(err.to_string()),
			ManagerError::BackendStartupFailed => tonic::Status::aborted(err.to_string()),
			ManagerError::PortExhausted => tonic::Status::resource_exhausted(err.to_string()),
			ManagerError::ProtocolError(_) => tonic::Status::invalid_argument(err.to_string()),
		}
	}
}
