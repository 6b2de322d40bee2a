use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::ToSql;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A typed positional argument for parametric SQL, carried as-is from the
/// HTTP client to the node that owns the target database.
///
/// The serde encoding of this enum is the discriminated wrapper that crosses
/// the RPC wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Argument {
	Text(String),
	Double(f64),
	Bool(bool),
	Null,
}

impl Argument {
	/// Convert one JSON value to its tagged SQL form. Arguments are scalars;
	/// composite values are rejected.
	pub fn from_json(v: &serde_json::Value) -> Result<Self, Error> {
		match v {
			serde_json::Value::String(s) => Ok(Argument::Text(s.clone())),
			serde_json::Value::Number(n) => n
				.as_f64()
				.map(Argument::Double)
				.ok_or_else(|| Error::BadArgument(n.to_string())),
			serde_json::Value::Bool(b) => Ok(Argument::Bool(*b)),
			serde_json::Value::Null => Ok(Argument::Null),
			other => Err(Error::BadArgument(other.to_string())),
		}
	}

	/// Convert a JSON argument array, preserving positions.
	pub fn from_json_array(vals: &[serde_json::Value]) -> Result<Vec<Self>, Error> {
		vals.iter().map(Self::from_json).collect()
	}
}

impl ToSql for Argument {
	fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
		Ok(match self {
			Argument::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
			Argument::Double(d) => ToSqlOutput::Owned(Value::Real(*d)),
			Argument::Bool(b) => ToSqlOutput::Owned(Value::Integer(*b as i64)),
			Argument::Null => ToSqlOutput::Owned(Value::Null),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_from_json_scalars() {
		let vals: Vec<serde_json::Value> = serde_json::from_str(r#"["hi", 1.5, true, null]"#).unwrap();
		let args = Argument::from_json_array(&vals).unwrap();
		assert_eq!(
			args,
			vec![
				Argument::Text("hi".to_string()),
				Argument::Double(1.5),
				Argument::Bool(true),
				Argument::Null,
			]
		);
	}

	#[test]
	fn test_from_json_integers_become_doubles() {
		assert_eq!(
			Argument::from_json(&serde_json::json!(7)).unwrap(),
			Argument::Double(7.0)
		);
	}

	#[test]
	fn test_from_json_rejects_composites() {
		assert!(Argument::from_json(&serde_json::json!([1, 2])).is_err());
		assert!(Argument::from_json(&serde_json::json!({"a": 1})).is_err());
	}
}
