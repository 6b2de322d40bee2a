use err_derive::Error;

/// Errors of the storage layer
#[derive(Debug, Error)]
pub enum Error {
	#[error(display = "IO error: {}", _0)]
	Io(
		#[error(source)]
		#[error(from)]
		std::io::Error,
	),

	#[error(display = "SQLite error: {}", _0)]
	Sqlite(
		#[error(source)]
		#[error(from)]
		rusqlite::Error,
	),

	#[error(display = "JSON error: {}", _0)]
	Json(
		#[error(source)]
		#[error(from)]
		serde_json::Error,
	),

	#[error(display = "database {:?} already exists", _0)]
	AlreadyExists(String),

	#[error(display = "database {:?} not found", _0)]
	NotFound(String),

	#[error(display = "invalid database name {:?}", _0)]
	InvalidName(String),

	#[error(display = "migration failed: {}", _0)]
	Migration(String),

	#[error(display = "unsupported argument value: {}", _0)]
	BadArgument(String),
}
