// We don't control the codegen, so disable any code warnings in the proto
// module.
#[allow(warnings)]
#[allow(clippy::derive_partial_eq_without_eq)]
pub mod backend {
	pub mod v1 {
		tonic::include_proto!("clusterproxy.backend.v1");
	}
}
