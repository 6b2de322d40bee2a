use err_derive::Error;
use hyper::StatusCode;

use shoal_util::error::Error as ShoalError;

/// Errors of this crate, annotated with the HTTP status code sent back to
/// the client
#[derive(Debug, Error)]
pub enum Error {
	#[error(display = "Bad request: {}", _0)]
	BadRequest(String),

	#[error(display = "{}", _0)]
	Unauthorized(String),

	#[error(display = "{}", _0)]
	NotFound(String),

	#[error(display = "{}", _0)]
	Unavailable(String),

	#[error(display = "Request deadline exceeded")]
	Timeout,

	#[error(display = "{}", _0)]
	Internal(#[error(source, no_from)] ShoalError),
}

impl Error {
	/// Status code the client receives for this error
	pub fn http_status_code(&self) -> StatusCode {
		match self {
			Error::BadRequest(_) => StatusCode::BAD_REQUEST,
			Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
			Error::NotFound(_) => StatusCode::NOT_FOUND,
			Error::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
			Error::Timeout => StatusCode::GATEWAY_TIMEOUT,
			Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}
}

impl From<ShoalError> for Error {
	fn from(e: ShoalError) -> Self {
		match e {
			ShoalError::BadRequest(m) => Error::BadRequest(m),
			ShoalError::Timeout => Error::Timeout,
			e @ ShoalError::RingEmpty | e @ ShoalError::UnknownMember(_) => {
				Error::Unavailable(e.to_string())
			}
			e @ ShoalError::Db(shoal_db::Error::NotFound(_)) => Error::NotFound(e.to_string()),
			e @ ShoalError::Db(shoal_db::Error::InvalidName(_)) => {
				Error::BadRequest(e.to_string())
			}
			e => Error::Internal(e),
		}
	}
}

impl From<hyper::Error> for Error {
	fn from(e: hyper::Error) -> Self {
		Error::Internal(ShoalError::Message(format!("HTTP error: {}", e)))
	}
}

impl From<http::Error> for Error {
	fn from(e: http::Error) -> Self {
		Error::Internal(ShoalError::Message(format!("HTTP error: {}", e)))
	}
}
