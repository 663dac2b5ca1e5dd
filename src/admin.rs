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
use serde::Serialize;

use crate::manager::ProxyManager;

#[derive(Clone)]
pub struct App {
	manager: Arc<ProxyManager>,
}

impl App {
	pub fn new(manager: Arc<ProxyManager>) -> Self {
		Self { manager }
	}
	pub fn router(&self) -> Router {
		Router::new()
			.route("/backends", get(backends_handler))
			.with_state(self.clone())
	}
}

#[derive(Serialize)]
struct BackendsView {
	client_ids: Vec<String>,
	free_ports: usize,
	total_ports: usize,
}

async fn backends_handler(State(app): State<App>) -> Result<String, StatusCode> {
	let view = BackendsView {
		client_ids: app.manager.list_client_ids(),
		free_ports: app.manager.free_ports(),
		total_ports: app.manager.total_ports(),
	};
	serde_json::to_string(&view).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}
