use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use rusqlite::types::ValueRef;
use rusqlite::{params_from_iter, Connection};

use crate::error::Error;
use crate::value::Argument;

/// Extension given to every database file under the data directory
pub const DB_EXT: &str = "sqlite";

const MAX_NAME_LEN: usize = 128;

/// Handle on a node-local directory of single-file SQLite databases.
///
/// Every operation opens its own connection and closes it when done: the
/// owning-peer assumption caps concurrent callers per database to one node's
/// in-flight requests, so pooling buys little here.
///
/// `create` and `drop` themselves are not serialized at this level beyond
/// the atomicity of `create_new`; callers that need the full
/// no-interleaving guarantee hold a node-scoped lock around them.
#[derive(Clone)]
pub struct Store {
	data_dir: PathBuf,
}

impl Store {
	pub fn new(data_dir: PathBuf) -> Self {
		Self { data_dir }
	}

	/// Path of the file backing the given database name
	pub fn db_path(&self, name: &str) -> PathBuf {
		self.data_dir.join(format!("{}.{}", name, DB_EXT))
	}

	/// Create a database, optionally running a DDL migration inside a single
	/// transaction. If the migration fails, the file is removed so that a
	/// half-initialized database never looks like a live one.
	pub fn create(&self, name: &str, migration: Option<&str>) -> Result<(), Error> {
		check_name(name)?;
		let path = self.db_path(name);
		match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
			Ok(_) => (),
			Err(e) if e.kind() == ErrorKind::AlreadyExists => {
				return Err(Error::AlreadyExists(name.to_string()));
			}
			Err(e) => return Err(e.into()),
		}
		if let Some(migration) = migration.filter(|m| !m.trim().is_empty()) {
			if let Err(e) = run_migration(&path, migration) {
				let _ = fs::remove_file(&path);
				return Err(Error::Migration(e.to_string()));
			}
		}
		info!("Created database {}", name);
		Ok(())
	}

	/// Remove a database file. Removing an absent database is a no-op.
	pub fn drop(&self, name: &str) -> Result<(), Error> {
		check_name(name)?;
		match fs::remove_file(self.db_path(name)) {
			Ok(()) => {
				info!("Dropped database {}", name);
				Ok(())
			}
			Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
			Err(e) => Err(e.into()),
		}
	}

	/// Check that a database exists
	pub fn get(&self, name: &str) -> Result<(), Error> {
		check_name(name)?;
		if self.db_path(name).is_file() {
			Ok(())
		} else {
			Err(Error::NotFound(name.to_string()))
		}
	}

	/// Run a read query inside a transaction and return the fully
	/// materialized result as a JSON array of row objects. Blob columns are
	/// rendered as (lossy) strings; an empty result set is `[]`.
	pub fn query(&self, name: &str, sql: &str, args: &[Argument]) -> Result<Vec<u8>, Error> {
		self.get(name)?;
		let mut db = Connection::open(self.db_path(name))?;
		let tx = db.transaction()?;
		let rows = {
			let mut stmt = tx.prepare(sql)?;
			let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
			let mut rows = stmt.query(params_from_iter(args.iter()))?;
			let mut out: Vec<serde_json::Value> = vec![];
			while let Some(row) = rows.next()? {
				let mut obj = serde_json::Map::with_capacity(columns.len());
				for (i, col) in columns.iter().enumerate() {
					obj.insert(col.clone(), json_cell(row.get_ref(i)?));
				}
				out.push(serde_json::Value::Object(obj));
			}
			out
		};
		tx.commit()?;
		Ok(serde_json::to_vec(&rows)?)
	}

	/// Run a write statement inside a transaction and return the number of
	/// rows affected. The transaction rolls back if the statement fails.
	pub fn exec(&self, name: &str, sql: &str, args: &[Argument]) -> Result<i64, Error> {
		self.get(name)?;
		let mut db = Connection::open(self.db_path(name))?;
		let tx = db.transaction()?;
		let affected = tx.execute(sql, params_from_iter(args.iter()))?;
		tx.commit()?;
		Ok(affected as i64)
	}

	/// Names of the databases stored on this node, sorted
	pub fn list(&self) -> Result<Vec<String>, Error> {
		let mut names = vec![];
		for entry in fs::read_dir(&self.data_dir)? {
			let path = entry?.path();
			if path.extension().and_then(|e| e.to_str()) == Some(DB_EXT) {
				if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
					names.push(stem.to_string());
				}
			}
		}
		names.sort();
		Ok(names)
	}
}

fn run_migration(path: &Path, migration: &str) -> Result<(), rusqlite::Error> {
	let mut db = Connection::open(path)?;
	let tx = db.transaction()?;
	tx.execute_batch(migration)?;
	tx.commit()
}

fn json_cell(v: ValueRef<'_>) -> serde_json::Value {
	match v {
		ValueRef::Null => serde_json::Value::Null,
		ValueRef::Integer(i) => serde_json::Value::from(i),
		ValueRef::Real(f) => serde_json::Number::from_f64(f)
			.map(serde_json::Value::Number)
			.unwrap_or(serde_json::Value::Null),
		ValueRef::Text(t) => serde_json::Value::from(String::from_utf8_lossy(t).into_owned()),
		ValueRef::Blob(b) => serde_json::Value::from(String::from_utf8_lossy(b).into_owned()),
	}
}

/// Database names name files on disk: restrict them to a filesystem-safe
/// alphabet before any path is built from them.
pub fn check_name(name: &str) -> Result<(), Error> {
	let ok = !name.is_empty()
		&& name.len() <= MAX_NAME_LEN
		&& name
			.chars()
			.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
	if ok {
		Ok(())
	} else {
		Err(Error::InvalidName(name.to_string()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use mktemp::Temp;

	const MIGRATION: &str = "CREATE TABLE t(x INT); INSERT INTO t(x) VALUES(1),(2);";

	fn test_store() -> (Temp, Store) {
		let dir = Temp::new_dir().expect("could not create temp dir");
		let store = Store::new(dir.to_path_buf());
		(dir, store)
	}

	fn rows(store: &Store, name: &str, sql: &str) -> serde_json::Value {
		let bytes = store.query(name, sql, &[]).unwrap();
		serde_json::from_slice(&bytes).unwrap()
	}

	#[test]
	fn test_create_get_drop() {
		let (_dir, store) = test_store();

		store.create("users", None).unwrap();
		store.get("users").unwrap();
		assert!(store.db_path("users").is_file());

		store.drop("users").unwrap();
		// dropping twice is fine
		store.drop("users").unwrap();
		assert!(matches!(store.get("users"), Err(Error::NotFound(_))));
	}

	#[test]
	fn test_duplicate_create() {
		let (_dir, store) = test_store();

		store.create("users", None).unwrap();
		let err = store.create("users", None).unwrap_err();
		assert!(matches!(err, Error::AlreadyExists(_)));
		assert!(err.to_string().contains("exist"));
	}

	#[test]
	fn test_concurrent_create_yields_one_success() {
		let (_dir, store) = test_store();

		let handles: Vec<_> = (0..8)
			.map(|_| {
				let store = store.clone();
				std::thread::spawn(move || store.create("users", None).is_ok())
			})
			.collect();
		let successes = handles
			.into_iter()
			.filter(|h| h.join().unwrap())
			.count();
		assert_eq!(successes, 1);
	}

	#[test]
	fn test_failed_migration_cleans_up() {
		let (_dir, store) = test_store();

		let err = store.create("users", Some("NOT VALID SQL")).unwrap_err();
		assert!(matches!(err, Error::Migration(_)));
		assert!(!store.db_path("users").is_file());

		// the name is free again
		store.create("users", Some(MIGRATION)).unwrap();
	}

	#[test]
	fn test_query_and_exec() {
		let (_dir, store) = test_store();
		store.create("users", Some(MIGRATION)).unwrap();

		let v = rows(&store, "users", "SELECT x FROM t ORDER BY x");
		assert_eq!(v, serde_json::json!([{"x": 1}, {"x": 2}]));

		let n = store
			.exec("users", "INSERT INTO t(x) VALUES(?)", &[Argument::Double(7.0)])
			.unwrap();
		assert_eq!(n, 1);

		let v = rows(&store, "users", "SELECT count(*) AS n FROM t");
		assert_eq!(v, serde_json::json!([{"n": 3}]));
	}

	#[test]
	fn test_empty_result_set_is_empty_array() {
		let (_dir, store) = test_store();
		store.create("users", Some(MIGRATION)).unwrap();

		let bytes = store
			.query("users", "SELECT x FROM t WHERE x > 100", &[])
			.unwrap();
		assert_eq!(&bytes[..], b"[]");
	}

	#[test]
	fn test_exec_rollback_on_error() {
		let (_dir, store) = test_store();
		store.create("users", Some(MIGRATION)).unwrap();

		assert!(store.exec("users", "INSERT INTO nosuch VALUES(1)", &[]).is_err());
		let v = rows(&store, "users", "SELECT count(*) AS n FROM t");
		assert_eq!(v, serde_json::json!([{"n": 2}]));
	}

	#[test]
	fn test_argument_round_trip() {
		let (_dir, store) = test_store();
		store
			.create("vals", Some("CREATE TABLE v(t TEXT, d REAL, b BOOL, n TEXT);"))
			.unwrap();

		let args = [
			Argument::Text("hi".to_string()),
			Argument::Double(1.5),
			Argument::Bool(true),
			Argument::Null,
		];
		store
			.exec("vals", "INSERT INTO v(t, d, b, n) VALUES(?, ?, ?, ?)", &args)
			.unwrap();

		let v = rows(&store, "vals", "SELECT t, d, b, n FROM v");
		assert_eq!(v, serde_json::json!([{"t": "hi", "d": 1.5, "b": 1, "n": null}]));
	}

	#[test]
	fn test_query_missing_database() {
		let (_dir, store) = test_store();
		assert!(matches!(
			store.query("missing", "SELECT 1", &[]),
			Err(Error::NotFound(_))
		));
	}

	#[test]
	fn test_invalid_names_are_rejected() {
		let (_dir, store) = test_store();
		for name in ["", "a/b", "../x", "sp ace", "é"] {
			assert!(matches!(store.create(name, None), Err(Error::InvalidName(_))));
		}
	}

	#[test]
	fn test_list() {
		let (_dir, store) = test_store();
		store.create("bbb", None).unwrap();
		store.create("aaa", None).unwrap();
		assert_eq!(store.list().unwrap(), vec!["aaa".to_string(), "bbb".to_string()]);
	}
}
