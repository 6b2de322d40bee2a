use base64::Engine;
use hyper::{Body, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// The `{"message": ...}` envelope of every successful API response
#[derive(Serialize)]
pub struct MessageResponse<T: Serialize> {
	pub message: T,
}

pub async fn parse_json_body<T: for<'de> Deserialize<'de>>(req: Request<Body>) -> Result<T, Error> {
	let body = hyper::body::to_bytes(req.into_body()).await?;
	serde_json::from_slice::<T>(&body).map_err(|e| Error::BadRequest(format!("Invalid JSON: {}", e)))
}

pub fn json_ok_response<T: Serialize>(resp: &T) -> Result<Response<Body>, Error> {
	let resp_json = serde_json::to_string_pretty(resp)
		.map_err(shoal_util::error::Error::from)
		.map_err(Error::from)?;
	Ok(Response::builder()
		.status(StatusCode::OK)
		.header(http::header::CONTENT_TYPE, "application/json")
		.body(Body::from(resp_json))?)
}

/// Check the BasicAuth header against the single configured credentials pair
pub fn check_basic_auth(req: &Request<Body>, username: &str, password: &str) -> Result<(), Error> {
	let header = req
		.headers()
		.get(http::header::AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
		.ok_or_else(|| Error::Unauthorized("can't authenticate".to_string()))?;
	let encoded = header
		.strip_prefix("Basic ")
		.ok_or_else(|| Error::Unauthorized("can't authenticate".to_string()))?;
	let decoded = base64::engine::general_purpose::STANDARD
		.decode(encoded)
		.ok()
		.and_then(|bytes| String::from_utf8(bytes).ok())
		.ok_or_else(|| Error::Unauthorized("can't authenticate".to_string()))?;
	let (user, pass) = decoded
		.split_once(':')
		.ok_or_else(|| Error::Unauthorized("can't authenticate".to_string()))?;
	if user == username && pass == password {
		Ok(())
	} else {
		Err(Error::Unauthorized("not authorized".to_string()))
	}
}

/// Random id attached to a request for log correlation
pub fn gen_request_id() -> String {
	hex::encode(rand::random::<[u8; 8]>())
}
