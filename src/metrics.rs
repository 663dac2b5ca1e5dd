// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Arc;

use axum::{Router, extract::State, http::StatusCode, routing::get};

use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;

/// Creates a metrics sub registry for the proxy.
pub fn sub_registry(registry: &mut Registry) -> &mut Registry {
	registry.sub_registry_with_prefix("clusterproxy")
}

#[derive(Clone)]
pub struct App {
	registry: Arc<Registry>,
	sampler: Option<(Arc<crate::manager::ProxyManager>, ProxyGauges)>,
}

impl App {
	pub fn new(registry: Arc<Registry>) -> Self {
		Self {
			registry,
			sampler: None,
		}
	}

	pub fn with_proxy_sampler(
		registry: Arc<Registry>,
		manager: Arc<crate::manager::ProxyManager>,
		gauges: ProxyGauges,
	) -> Self {
		Self {
			registry,
			sampler: Some((manager, gauges)),
		}
	}

	pub fn router(&self) -> Router {
		Router::new()
			.route("/metrics", get(metrics_handler))
			.with_state(self.clone())
	}
}

async fn metrics_handler(State(app): State<App>) -> Result<String, StatusCode> {
	if let Some((manager, gauges)) = &app.sampler {
		gauges.sample(manager);
	}
	let mut buffer = String::new();
	encode(&mut buffer, &app.registry).unwrap();
	Ok(buffer)
}

/// Proxy-specific gauges sampled from [`crate::manager::ProxyManager`] state.
/// Pull-based: `sample` is called from the `/metrics` handler's request path
/// rather than on a timer, so there is no separate update task to keep
/// alive.
#[derive(Clone, Default)]
pub struct ProxyGauges {
	live_backends: prometheus_client::metrics::gauge::Gauge,
	free_ports: prometheus_client::metrics::gauge::Gauge,
}

impl ProxyGauges {
	pub fn register(registry: &mut Registry) -> Self {
		let gauges = Self::default();
		registry.register(
			"live_backends",
			"Number of client backends currently tracked",
			gauges.live_backends.clone(),
		);
		registry.register(
			"free_ports",
			"Number of ports currently available in the pool",
			gauges.free_ports.clone(),
		);
		gauges
	}

	pub fn sample(&self, manager: &crate::manager::ProxyManager) {
		self.live_backends.set(manager.backend_count() as i64);
		self.free_ports.set(manager.free_ports() as i64);
	}
}
