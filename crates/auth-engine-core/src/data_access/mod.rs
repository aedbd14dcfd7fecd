// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The Data-Access Port: the only coupling between the engine core and
//! whatever storage engine a host wires in.
//!
//! Steps never see SQL, a specific ORM, or a table schema — they call
//! [`DataAccessPort::find_first`], [`DataAccessPort::create`], and friends
//! against a table name and a composable [`Predicate`]. `auth-engine-core`
//! ships one concrete implementation, [`sqlite::SqliteDataAccessPort`], used
//! both as a working default for embedders without their own store and as
//! the fixture every plugin's test suite runs against.

mod sqlite;

pub use sqlite::SqliteDataAccessPort;

use async_trait::async_trait;
use auth_engine_errors::EngineError;
use serde_json::Value;
use std::collections::HashMap;

/// A single persisted record: a schema-agnostic bag of named JSON values.
pub type Record = serde_json::Map<String, Value>;

/// Build a [`Record`] from field/value pairs.
///
/// ```ignore
/// let rec = record([("id", json!("abc")), ("verified", json!(false))]);
/// ```
pub fn record<I>(fields: I) -> Record
where
	I: IntoIterator<Item = (&'static str, Value)>,
{
	fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

/// A binary comparison operator recognized by the predicate language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
	Eq,
	Ne,
	Lt,
	Le,
	Gt,
	Ge,
	In,
	Like,
}

/// One `field <op> value` condition.
#[derive(Debug, Clone)]
pub struct Condition {
	pub field: String,
	pub op: Op,
	pub value: Value,
}

/// A composable predicate tree: conditions combined with `and`/`or`.
///
/// This is the typed expression AST the design notes call for in place of
/// duck-typed ORM predicate lambdas — implementers of other storage engines
/// build their own SQL/query-language translation from this tree instead of
/// reflecting over closures.
#[derive(Debug, Clone)]
pub enum Predicate {
	Cmp(Condition),
	And(Vec<Predicate>),
	Or(Vec<Predicate>),
}

impl Predicate {
	pub fn cmp(field: impl Into<String>, op: Op, value: impl Into<Value>) -> Self {
		Predicate::Cmp(Condition {
			field: field.into(),
			op,
			value: value.into(),
		})
	}

	pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
		Self::cmp(field, Op::Eq, value)
	}

	pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
		Self::cmp(field, Op::Ne, value)
	}

	pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
		Self::cmp(field, Op::Lt, value)
	}

	pub fn le(field: impl Into<String>, value: impl Into<Value>) -> Self {
		Self::cmp(field, Op::Le, value)
	}

	pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
		Self::cmp(field, Op::Gt, value)
	}

	pub fn ge(field: impl Into<String>, value: impl Into<Value>) -> Self {
		Self::cmp(field, Op::Ge, value)
	}

	pub fn like(field: impl Into<String>, pattern: impl Into<String>) -> Self {
		Self::cmp(field, Op::Like, Value::String(pattern.into()))
	}

	pub fn in_(field: impl Into<String>, values: Vec<Value>) -> Self {
		Self::cmp(field, Op::In, Value::Array(values))
	}

	#[must_use]
	pub fn and(self, other: Self) -> Self {
		match (self, other) {
			(Predicate::And(mut a), Predicate::And(b)) => {
				a.extend(b);
				Predicate::And(a)
			}
			(Predicate::And(mut a), other) => {
				a.push(other);
				Predicate::And(a)
			}
			(this, other) => Predicate::And(vec![this, other]),
		}
	}

	#[must_use]
	pub fn or(self, other: Self) -> Self {
		match (self, other) {
			(Predicate::Or(mut a), Predicate::Or(b)) => {
				a.extend(b);
				Predicate::Or(a)
			}
			(Predicate::Or(mut a), other) => {
				a.push(other);
				Predicate::Or(a)
			}
			(this, other) => Predicate::Or(vec![this, other]),
		}
	}

	/// Evaluate this predicate against an in-memory record.
	///
	/// The reference [`sqlite::SqliteDataAccessPort`] stores each record as a
	/// JSON blob keyed by id and evaluates predicates in-process rather than
	/// compiling them to SQL `WHERE` clauses — schema-agnostic storage has no
	/// fixed column set to compile against. Other storage backends build
	/// their own translation (SQL, a query-language request, …) from this
	/// same tree; this evaluator is specific to the bundled reference port.
	pub fn matches(&self, rec: &Record) -> bool {
		match self {
			Predicate::Cmp(cond) => cond.matches(rec),
			Predicate::And(preds) => preds.iter().all(|p| p.matches(rec)),
			Predicate::Or(preds) => preds.iter().any(|p| p.matches(rec)),
		}
	}
}

impl Condition {
	fn matches(&self, rec: &Record) -> bool {
		let field_value = rec.get(&self.field);
		match self.op {
			Op::Eq => field_value == Some(&self.value),
			Op::Ne => field_value != Some(&self.value),
			Op::In => match &self.value {
				Value::Array(values) => field_value.is_some_and(|v| values.contains(v)),
				_ => false,
			},
			Op::Like => match (field_value, &self.value) {
				(Some(Value::String(actual)), Value::String(pattern)) => {
					like_matches(actual, pattern)
				}
				_ => false,
			},
			Op::Lt | Op::Le | Op::Gt | Op::Ge => {
				compare_ordered(field_value, &self.value, self.op)
			}
		}
	}
}

/// Implements SQL-style `LIKE` with `%` (any run) and `_` (single char)
/// wildcards, case-sensitively — callers wanting case-insensitive matching
/// lower-case both sides before constructing the predicate, mirroring how
/// the email/username case-insensitive ordering rule (below) is applied at
/// the call site rather than baked into the operator.
fn like_matches(actual: &str, pattern: &str) -> bool {
	let regex_like: String = pattern
		.chars()
		.map(|c| match c {
			'%' => ".*".to_string(),
			'_' => ".".to_string(),
			other => regex_escape(other),
		})
		.collect();
	let anchored = format!("^{regex_like}$");
	simple_regex_match(&anchored, actual)
}

fn regex_escape(c: char) -> String {
	if ".^$*+?()[]{}|\\".contains(c) {
		format!("\\{c}")
	} else {
		c.to_string()
	}
}

/// A tiny, dependency-free matcher for the `.`/`.*`/literal patterns
/// `like_matches` produces. Not a general regex engine.
fn simple_regex_match(pattern: &str, text: &str) -> bool {
	fn go(p: &[char], t: &[char]) -> bool {
		match p.first() {
			None => t.is_empty(),
			Some('^') => go(&p[1..], t),
			Some('$') if p.len() == 1 => t.is_empty(),
			Some('.') if p.get(1) == Some(&'*') => {
				for i in 0..=t.len() {
					if go(&p[2..], &t[i..]) {
						return true;
					}
				}
				false
			}
			Some('\\') if p.len() > 1 => {
				!t.is_empty() && t[0] == p[1] && go(&p[2..], &t[1..])
			}
			Some('.') => !t.is_empty() && go(&p[1..], &t[1..]),
			Some(c) => !t.is_empty() && t[0] == *c && go(&p[1..], &t[1..]),
		}
	}
	go(&pattern.chars().collect::<Vec<_>>(), &text.chars().collect::<Vec<_>>())
}

fn compare_ordered(field_value: Option<&Value>, rhs: &Value, op: Op) -> bool {
	let ordering = match (field_value, rhs) {
		(Some(Value::Number(a)), Value::Number(b)) => a
			.as_f64()
			.zip(b.as_f64())
			.map(|(a, b)| a.partial_cmp(&b)),
		(Some(Value::String(a)), Value::String(b)) => Some(Some(a.cmp(b))),
		_ => None,
	};
	match ordering.flatten() {
		Some(std::cmp::Ordering::Less) => matches!(op, Op::Lt | Op::Le),
		Some(std::cmp::Ordering::Equal) => matches!(op, Op::Le | Op::Ge),
		Some(std::cmp::Ordering::Greater) => matches!(op, Op::Gt | Op::Ge),
		None => false,
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderDirection {
	Asc,
	Desc,
}

#[derive(Debug, Clone)]
pub struct OrderBy {
	pub field: String,
	pub direction: OrderDirection,
	/// Case-insensitive comparison, required by the spec for the `email`
	/// and `username` providers' identifier ordering.
	pub case_insensitive: bool,
}

impl OrderBy {
	pub fn asc(field: impl Into<String>) -> Self {
		Self {
			field: field.into(),
			direction: OrderDirection::Asc,
			case_insensitive: false,
		}
	}

	pub fn desc(field: impl Into<String>) -> Self {
		Self {
			field: field.into(),
			direction: OrderDirection::Desc,
			case_insensitive: false,
		}
	}

	#[must_use]
	pub fn case_insensitive(mut self) -> Self {
		self.case_insensitive = true;
		self
	}
}

#[derive(Debug, Clone, Default)]
pub struct FindOptions {
	pub where_: Option<Predicate>,
	pub order_by: Vec<OrderBy>,
	pub limit: Option<u64>,
}

impl FindOptions {
	pub fn new() -> Self {
		Self::default()
	}

	#[must_use]
	pub fn where_clause(mut self, predicate: Predicate) -> Self {
		self.where_ = Some(predicate);
		self
	}

	#[must_use]
	pub fn order_by(mut self, order: OrderBy) -> Self {
		self.order_by.push(order);
		self
	}

	#[must_use]
	pub fn limit(mut self, limit: u64) -> Self {
		self.limit = Some(limit);
		self
	}
}

#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
	pub where_: Option<Predicate>,
	pub set: Record,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
	pub where_: Option<Predicate>,
}

#[derive(Debug, Clone)]
pub struct UpsertOptions {
	pub where_: Predicate,
	pub create: Record,
	pub update: Record,
}

/// Abstract tabular persistence, supplied by the host embedding the engine.
///
/// This is the ONLY coupling between the core and a concrete storage
/// engine — every plugin step reads and writes exclusively through this
/// trait. Implementations must be `Send + Sync` so the engine can be shared
/// freely across concurrently-handled requests (see the concurrency model:
/// the port is a shared resource steps acquire a connection from per call
/// and release on return, on every exit path including errors).
#[async_trait]
pub trait DataAccessPort: Send + Sync {
	async fn find_first(&self, table: &str, opts: FindOptions) -> Result<Option<Record>, EngineError>;

	async fn find_many(&self, table: &str, opts: FindOptions) -> Result<Vec<Record>, EngineError>;

	/// Create a record, returning it with any generated fields (an `id` is
	/// generated as a UUIDv4 if the caller didn't supply one).
	async fn create(&self, table: &str, rec: Record) -> Result<Record, EngineError>;

	async fn update_many(&self, table: &str, opts: UpdateOptions) -> Result<u64, EngineError>;

	async fn delete_many(&self, table: &str, opts: DeleteOptions) -> Result<u64, EngineError>;

	async fn upsert(&self, table: &str, opts: UpsertOptions) -> Result<Record, EngineError>;

	async fn count(&self, table: &str, where_: Option<Predicate>) -> Result<u64, EngineError>;
}

/// Extracts a string field from a record, failing with `EngineError::Internal`
/// if missing or the wrong type — used by steps reading back fields they
/// themselves just wrote, where absence indicates a storage-layer bug
/// rather than an expected user-facing outcome.
pub fn field_str(rec: &Record, field: &str) -> Result<String, EngineError> {
	rec.get(field)
		.and_then(Value::as_str)
		.map(str::to_string)
		.ok_or_else(|| EngineError::Internal(format!("record missing string field `{field}`")))
}

pub fn field_bool(rec: &Record, field: &str) -> Result<bool, EngineError> {
	rec.get(field)
		.and_then(Value::as_bool)
		.ok_or_else(|| EngineError::Internal(format!("record missing bool field `{field}`")))
}

pub fn field_opt_str(rec: &Record, field: &str) -> Option<String> {
	rec.get(field).and_then(Value::as_str).map(str::to_string)
}

pub fn field_i64(rec: &Record, field: &str) -> Result<i64, EngineError> {
	rec.get(field)
		.and_then(Value::as_i64)
		.ok_or_else(|| EngineError::Internal(format!("record missing integer field `{field}`")))
}

/// A batch of per-table deletion counters produced by a cleanup runner,
/// reused to avoid every plugin inventing its own small counter struct.
pub type TableCounters = HashMap<String, u64>;
