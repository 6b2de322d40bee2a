use std::convert::Infallible;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use shoal_db::Argument;
use shoal_model::shoal::Shoal;
use shoal_util::error::Error as ShoalError;

use crate::error::Error;
use crate::helpers::*;

/// Hard deadline applied to every API request
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// The HTTP API server of a shoal node. All five database operations are
/// accepted on any node; the dispatcher forwards them to the right peer.
pub struct ApiServer {
	shoal: Arc<Shoal>,
}

#[derive(Deserialize)]
struct CreateRequest {
	name: String,
	#[serde(default)]
	migration: Option<String>,
}

#[derive(Deserialize)]
struct QueryRequest {
	name: String,
	query: String,
	#[serde(default)]
	args: Option<Vec<serde_json::Value>>,
}

#[derive(Serialize)]
struct ClusterStatusResponse {
	node: String,
	member: String,
	ring_members: Vec<String>,
	known_nodes: Vec<KnownNodeResponse>,
}

#[derive(Serialize)]
struct KnownNodeResponse {
	id: String,
	addr: String,
	is_up: bool,
	last_seen_secs_ago: Option<u64>,
	hostname: String,
	member: String,
}

impl ApiServer {
	/// Bind the HTTP listener and serve until `must_exit` turns true
	pub async fn run(
		shoal: Arc<Shoal>,
		bind_addr: SocketAddr,
		must_exit: watch::Receiver<bool>,
	) -> Result<(), ShoalError> {
		let server = Arc::new(ApiServer { shoal });

		let service = make_service_fn(move |_conn| {
			let server = server.clone();
			async move {
				Ok::<_, Infallible>(service_fn(move |req| {
					let server = server.clone();
					async move { Ok::<_, Infallible>(server.handler(req).await) }
				}))
			}
		});

		info!("API server listening on http://{}", bind_addr);
		Server::try_bind(&bind_addr)
			.map_err(|e| ShoalError::Message(format!("Unable to bind HTTP listener: {}", e)))?
			.serve(service)
			.with_graceful_shutdown(must_exit_await(must_exit))
			.await
			.map_err(|e| ShoalError::Message(format!("HTTP server error: {}", e)))
	}

	/// Middleware chain around the routed handlers: authentication, request
	/// id, access log, panic recovery and the request deadline.
	async fn handler(self: Arc<Self>, req: Request<Body>) -> Response<Body> {
		let request_id = gen_request_id();
		let method = req.method().clone();
		let uri = req.uri().clone();
		let begin = Instant::now();

		let res = match self.check_auth(&req) {
			Ok(()) => {
				match tokio::time::timeout(
					REQUEST_TIMEOUT,
					AssertUnwindSafe(self.handle_request(req)).catch_unwind(),
				)
				.await
				{
					Err(_) => Err(Error::Timeout),
					Ok(Err(_panic)) => Err(Error::Internal(ShoalError::Message(
						"Internal server error (panic)".to_string(),
					))),
					Ok(Ok(res)) => res,
				}
			}
			Err(e) => Err(e),
		};

		let status = match &res {
			Ok(resp) => resp.status(),
			Err(e) => e.http_status_code(),
		};
		info!(
			"{} {} {} ({}) {}ms",
			method,
			uri,
			status.as_u16(),
			request_id,
			begin.elapsed().as_millis()
		);

		let mut resp = res.unwrap_or_else(error_response);
		if let Ok(value) = request_id.parse() {
			resp.headers_mut().insert("x-request-id", value);
		}
		resp
	}

	fn check_auth(&self, req: &Request<Body>) -> Result<(), Error> {
		match (&self.shoal.config.username, &self.shoal.config.password) {
			(Some(username), Some(password)) => check_basic_auth(req, username, password),
			_ => Err(Error::Unauthorized(
				"API credentials are not configured on this node".to_string(),
			)),
		}
	}

	async fn handle_request(&self, req: Request<Body>) -> Result<Response<Body>, Error> {
		let method = req.method().clone();
		let path = req
			.uri()
			.path()
			.trim_start_matches('/')
			.trim_end_matches('/')
			.to_string();
		let segments: Vec<&str> = path.split('/').collect();

		match &segments[..] {
			["v1", "databases"] if method == Method::POST => self.handle_create(req).await,
			["v1", "databases"] if method == Method::GET => self.handle_list().await,
			["v1", "databases", "query"] if method == Method::POST => {
				self.handle_query(req).await
			}
			["v1", "databases", "exec"] if method == Method::POST => self.handle_exec(req).await,
			["v1", "databases", name] if method == Method::GET => {
				self.handle_get(name).await
			}
			["v1", "databases", name] if method == Method::DELETE => {
				self.handle_drop(name).await
			}
			["v1", "status"] if method == Method::GET => self.handle_status(),
			_ => Err(Error::NotFound("No such endpoint".to_string())),
		}
	}

	// ---- Route handlers ----

	async fn handle_create(&self, req: Request<Body>) -> Result<Response<Body>, Error> {
		let req = parse_json_body::<CreateRequest>(req).await?;
		if req.name.is_empty() {
			return Err(Error::BadRequest("database name is required".to_string()));
		}
		let msg = self.shoal.manager.create(&req.name, req.migration).await?;
		json_ok_response(&MessageResponse { message: msg })
	}

	async fn handle_get(&self, name: &str) -> Result<Response<Body>, Error> {
		let msg = self.shoal.manager.get(name).await?;
		json_ok_response(&MessageResponse { message: msg })
	}

	async fn handle_drop(&self, name: &str) -> Result<Response<Body>, Error> {
		let msg = shoal_model::manager::DatabaseManager::drop(&self.shoal.manager, name).await?;
		json_ok_response(&MessageResponse { message: msg })
	}

	async fn handle_query(&self, req: Request<Body>) -> Result<Response<Body>, Error> {
		let req = parse_json_body::<QueryRequest>(req).await?;
		if req.name.is_empty() || req.query.is_empty() {
			return Err(Error::BadRequest(
				"database name and query are required".to_string(),
			));
		}
		let args = Argument::from_json_array(&req.args.unwrap_or_default())
			.map_err(|e| Error::BadRequest(e.to_string()))?;

		let result = self.shoal.manager.query(&req.name, &req.query, args).await?;
		// the result is the raw JSON array produced by the owning node;
		// re-embed it in the response envelope
		let rows: serde_json::Value =
			serde_json::from_slice(&result).map_err(ShoalError::from)?;
		json_ok_response(&MessageResponse { message: rows })
	}

	async fn handle_exec(&self, req: Request<Body>) -> Result<Response<Body>, Error> {
		let req = parse_json_body::<QueryRequest>(req).await?;
		if req.name.is_empty() || req.query.is_empty() {
			return Err(Error::BadRequest(
				"database name and query are required".to_string(),
			));
		}
		let args = Argument::from_json_array(&req.args.unwrap_or_default())
			.map_err(|e| Error::BadRequest(e.to_string()))?;

		let affected = self.shoal.manager.exec(&req.name, &req.query, args).await?;
		json_ok_response(&MessageResponse { message: affected })
	}

	async fn handle_list(&self) -> Result<Response<Body>, Error> {
		let names = self.shoal.manager.list_all().await?;
		json_ok_response(&MessageResponse { message: names })
	}

	fn handle_status(&self) -> Result<Response<Body>, Error> {
		let ring = self.shoal.system.ring.borrow().clone();
		let status = ClusterStatusResponse {
			node: hex::encode(self.shoal.system.id.as_slice()),
			member: self.shoal.system.local_member(),
			ring_members: ring.members().iter().cloned().collect(),
			known_nodes: self
				.shoal
				.system
				.get_known_nodes()
				.iter()
				.map(|n| KnownNodeResponse {
					id: hex::encode(n.id.as_slice()),
					addr: n.addr.to_string(),
					is_up: n.is_up,
					last_seen_secs_ago: n.last_seen_secs_ago,
					hostname: n.status.hostname.clone(),
					member: n.status.rpc_public_addr.clone(),
				})
				.collect(),
		};
		json_ok_response(&status)
	}
}

fn error_response(e: Error) -> Response<Body> {
	let body = serde_json::json!({ "error": e.to_string() }).to_string();
	let mut builder = Response::builder()
		.status(e.http_status_code())
		.header(http::header::CONTENT_TYPE, "application/json");
	if let Error::Unauthorized(_) = &e {
		builder = builder.header(http::header::WWW_AUTHENTICATE, "Basic realm=\"shoal\"");
	}
	builder.body(Body::from(body)).unwrap_or_else(|_| {
		let mut resp = Response::new(Body::from("internal error"));
		*resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
		resp
	})
}

async fn must_exit_await(mut must_exit: watch::Receiver<bool>) {
	while !*must_exit.borrow() {
		if must_exit.changed().await.is_err() {
			return;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use std::net::SocketAddr as StdSocketAddr;

	use base64::Engine;
	use mktemp::Temp;

	use shoal_util::config::Config;

	const USERNAME: &str = "admin";
	const PASSWORD: &str = "hunter2";

	fn test_server(data_dir: &std::path::Path) -> Arc<ApiServer> {
		let _ = sodiumoxide::init();
		let config = Config {
			rpc_bind_addr: StdSocketAddr::from(([127, 0, 0, 1], 0)),
			rpc_public_addr: Some("127.0.0.1:3901".to_string()),
			rpc_secret: Some("00".repeat(32)),
			data_dir: data_dir.to_path_buf(),
			username: Some(USERNAME.to_string()),
			password: Some(PASSWORD.to_string()),
			..Default::default()
		};
		let shoal = Shoal::new(config).expect("could not create node context");
		Arc::new(ApiServer { shoal })
	}

	fn request(method: Method, path: &str, body: &str, with_auth: bool) -> Request<Body> {
		let mut builder = Request::builder().method(method).uri(path);
		if with_auth {
			let credentials = base64::engine::general_purpose::STANDARD
				.encode(format!("{}:{}", USERNAME, PASSWORD));
			builder = builder.header("authorization", format!("Basic {}", credentials));
		}
		builder.body(Body::from(body.to_string())).unwrap()
	}

	async fn body_json(resp: Response<Body>) -> serde_json::Value {
		let bytes = hyper::body::to_bytes(resp.into_body()).await.unwrap();
		serde_json::from_slice(&bytes).unwrap()
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn test_end_to_end_scenarios() {
		let dir = Temp::new_dir().unwrap();
		let server = test_server(&dir.to_path_buf());

		// without credentials, nothing is reachable
		let resp = server
			.clone()
			.handler(request(Method::GET, "/v1/databases/u", "", false))
			.await;
		assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
		assert!(body_json(resp).await.get("error").is_some());

		// create with a migration
		let resp = server
			.clone()
			.handler(request(
				Method::POST,
				"/v1/databases",
				r#"{"name":"u","migration":"CREATE TABLE t(x INT); INSERT INTO t VALUES(1),(2);"}"#,
				true,
			))
			.await;
		assert_eq!(resp.status(), StatusCode::OK);
		assert_eq!(
			body_json(resp).await,
			serde_json::json!({"message": "success"})
		);

		// query returns the rows in order
		let resp = server
			.clone()
			.handler(request(
				Method::POST,
				"/v1/databases/query",
				r#"{"name":"u","query":"SELECT x FROM t ORDER BY x"}"#,
				true,
			))
			.await;
		assert_eq!(resp.status(), StatusCode::OK);
		assert_eq!(
			body_json(resp).await,
			serde_json::json!({"message": [{"x": 1}, {"x": 2}]})
		);

		// parametric exec affects one row
		let resp = server
			.clone()
			.handler(request(
				Method::POST,
				"/v1/databases/exec",
				r#"{"name":"u","query":"INSERT INTO t VALUES(?)","args":[7]}"#,
				true,
			))
			.await;
		assert_eq!(resp.status(), StatusCode::OK);
		assert_eq!(body_json(resp).await, serde_json::json!({"message": 1}));

		// and the table now has three rows
		let resp = server
			.clone()
			.handler(request(
				Method::POST,
				"/v1/databases/query",
				r#"{"name":"u","query":"SELECT count(*) AS n FROM t"}"#,
				true,
			))
			.await;
		assert_eq!(
			body_json(resp).await,
			serde_json::json!({"message": [{"n": 3}]})
		);

		// an empty result set is 200 with an empty array
		let resp = server
			.clone()
			.handler(request(
				Method::POST,
				"/v1/databases/query",
				r#"{"name":"u","query":"SELECT x FROM t WHERE x > 100"}"#,
				true,
			))
			.await;
		assert_eq!(resp.status(), StatusCode::OK);
		assert_eq!(body_json(resp).await, serde_json::json!({"message": []}));

		// duplicate create surfaces the engine message
		let resp = server
			.clone()
			.handler(request(
				Method::POST,
				"/v1/databases",
				r#"{"name":"u"}"#,
				true,
			))
			.await;
		assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
		let body = body_json(resp).await;
		assert!(body["error"].as_str().unwrap().contains("exist"));

		// get and drop; drop is idempotent
		let resp = server
			.clone()
			.handler(request(Method::GET, "/v1/databases/u", "", true))
			.await;
		assert_eq!(resp.status(), StatusCode::OK);
		let resp = server
			.clone()
			.handler(request(Method::DELETE, "/v1/databases/u", "", true))
			.await;
		assert_eq!(resp.status(), StatusCode::OK);
		let resp = server
			.clone()
			.handler(request(Method::DELETE, "/v1/databases/u", "", true))
			.await;
		assert_eq!(resp.status(), StatusCode::OK);
		let resp = server
			.clone()
			.handler(request(Method::GET, "/v1/databases/u", "", true))
			.await;
		assert_eq!(resp.status(), StatusCode::NOT_FOUND);
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn test_query_on_missing_database_is_not_found() {
		let dir = Temp::new_dir().unwrap();
		let server = test_server(&dir.to_path_buf());

		let resp = server
			.clone()
			.handler(request(
				Method::POST,
				"/v1/databases/query",
				r#"{"name":"missing","query":"SELECT 1"}"#,
				true,
			))
			.await;
		assert_eq!(resp.status(), StatusCode::NOT_FOUND);
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn test_request_validation() {
		let dir = Temp::new_dir().unwrap();
		let server = test_server(&dir.to_path_buf());

		// malformed JSON
		let resp = server
			.clone()
			.handler(request(Method::POST, "/v1/databases", "{not json", true))
			.await;
		assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

		// a query without a name, and a name without a query, are both bad
		for body in [
			r#"{"name":"","query":"SELECT 1"}"#,
			r#"{"name":"u","query":""}"#,
		] {
			let resp = server
				.clone()
				.handler(request(Method::POST, "/v1/databases/query", body, true))
				.await;
			assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
		}

		// composite argument values are rejected
		let resp = server
			.clone()
			.handler(request(
				Method::POST,
				"/v1/databases/exec",
				r#"{"name":"u","query":"INSERT INTO t VALUES(?)","args":[[1,2]]}"#,
				true,
			))
			.await;
		assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

		// unknown route
		let resp = server
			.clone()
			.handler(request(Method::GET, "/v2/whatever", "", true))
			.await;
		assert_eq!(resp.status(), StatusCode::NOT_FOUND);
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn test_list_and_status_endpoints() {
		let dir = Temp::new_dir().unwrap();
		let server = test_server(&dir.to_path_buf());

		server
			.clone()
			.handler(request(
				Method::POST,
				"/v1/databases",
				r#"{"name":"aaa"}"#,
				true,
			))
			.await;
		server
			.clone()
			.handler(request(
				Method::POST,
				"/v1/databases",
				r#"{"name":"bbb"}"#,
				true,
			))
			.await;

		let resp = server
			.clone()
			.handler(request(Method::GET, "/v1/databases", "", true))
			.await;
		assert_eq!(resp.status(), StatusCode::OK);
		assert_eq!(
			body_json(resp).await,
			serde_json::json!({"message": ["aaa", "bbb"]})
		);

		let resp = server
			.clone()
			.handler(request(Method::GET, "/v1/status", "", true))
			.await;
		assert_eq!(resp.status(), StatusCode::OK);
		let body = body_json(resp).await;
		assert_eq!(body["member"], "127.0.0.1:3901");
		assert_eq!(body["ring_members"], serde_json::json!(["127.0.0.1:3901"]));
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn test_wrong_credentials_are_rejected() {
		let dir = Temp::new_dir().unwrap();
		let server = test_server(&dir.to_path_buf());

		let credentials = base64::engine::general_purpose::STANDARD.encode("admin:wrong");
		let req = Request::builder()
			.method(Method::GET)
			.uri("/v1/databases")
			.header("authorization", format!("Basic {}", credentials))
			.body(Body::empty())
			.unwrap();
		let resp = server.clone().handler(req).await;
		assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
		assert!(resp.headers().get("www-authenticate").is_some());
	}
}
