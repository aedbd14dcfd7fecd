// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The reference [`DataAccessPort`] implementation: every "table" is a
//! `(id TEXT PRIMARY KEY, data TEXT NOT NULL)` SQLite table holding a JSON
//! blob per record. Predicates are evaluated in-process against the
//! deserialized JSON rather than compiled to a `WHERE` clause — there is no
//! fixed column set to compile against for an arbitrary, schema-agnostic
//! record shape. This keeps the port genuinely schema-agnostic at the cost
//! of doing filtering client-side; a host with a fixed relational schema is
//! expected to supply its own `DataAccessPort` that compiles `Predicate`
//! into real SQL against typed columns.

use super::{
	DataAccessPort, DeleteOptions, FindOptions, OrderDirection, Predicate, Record, UpdateOptions,
	UpsertOptions,
};
use async_trait::async_trait;
use auth_engine_errors::EngineError;
use serde_json::Value;
use sqlx::SqlitePool;
use std::collections::HashSet;
use tokio::sync::Mutex;
use tracing::instrument;

/// Validates a table name is safe to interpolate into DDL/DML. Table names
/// originate from plugin code, not external input, but this guards against
/// a typo or future change accidentally opening an injection surface.
fn validate_table_name(table: &str) -> Result<(), EngineError> {
	let ok = !table.is_empty()
		&& table
			.chars()
			.all(|c| c.is_ascii_alphanumeric() || c == '_')
		&& table.chars().next().is_some_and(|c| c.is_ascii_alphabetic());
	if ok {
		Ok(())
	} else {
		Err(EngineError::Internal(format!("invalid table name `{table}`")))
	}
}

pub struct SqliteDataAccessPort {
	pool: SqlitePool,
	known_tables: Mutex<HashSet<String>>,
}

impl SqliteDataAccessPort {
	pub fn new(pool: SqlitePool) -> Self {
		Self {
			pool,
			known_tables: Mutex::new(HashSet::new()),
		}
	}

	/// Opens an in-memory database, suitable for tests and for hosts that
	/// want a working default without wiring up their own store.
	pub async fn in_memory() -> Result<Self, EngineError> {
		let pool = SqlitePool::connect("sqlite::memory:")
			.await
			.map_err(|e| EngineError::DataAccess(e.to_string()))?;
		Ok(Self::new(pool))
	}

	async fn ensure_table(&self, table: &str) -> Result<(), EngineError> {
		validate_table_name(table)?;
		let mut known = self.known_tables.lock().await;
		if known.contains(table) {
			return Ok(());
		}
		let ddl = format!(
			"CREATE TABLE IF NOT EXISTS {table} (id TEXT PRIMARY KEY, data TEXT NOT NULL)"
		);
		sqlx::query(&ddl)
			.execute(&self.pool)
			.await
			.map_err(|e| EngineError::DataAccess(e.to_string()))?;
		known.insert(table.to_string());
		Ok(())
	}

	async fn load_all(&self, table: &str) -> Result<Vec<Record>, EngineError> {
		self.ensure_table(table).await?;
		let rows: Vec<(String, String)> = sqlx::query_as(&format!("SELECT id, data FROM {table}"))
			.fetch_all(&self.pool)
			.await
			.map_err(|e| EngineError::DataAccess(e.to_string()))?;

		rows
			.into_iter()
			.map(|(_, data)| {
				serde_json::from_str::<Value>(&data)
					.ok()
					.and_then(|v| v.as_object().cloned())
					.ok_or_else(|| EngineError::DataAccess("corrupt record JSON".to_string()))
			})
			.collect()
	}

	fn apply_filter(records: Vec<Record>, predicate: &Option<Predicate>) -> Vec<Record> {
		match predicate {
			None => records,
			Some(p) => records.into_iter().filter(|r| p.matches(r)).collect(),
		}
	}

	fn apply_order_and_limit(mut records: Vec<Record>, opts: &FindOptions) -> Vec<Record> {
		for order in opts.order_by.iter().rev() {
			records.sort_by(|a, b| {
				let av = a.get(&order.field);
				let bv = b.get(&order.field);
				let ordering = compare_values(av, bv, order.case_insensitive);
				match order.direction {
					OrderDirection::Asc => ordering,
					OrderDirection::Desc => ordering.reverse(),
				}
			});
		}
		if let Some(limit) = opts.limit {
			records.truncate(limit as usize);
		}
		records
	}

	async fn persist(&self, table: &str, rec: &Record) -> Result<(), EngineError> {
		let id = rec
			.get("id")
			.and_then(Value::as_str)
			.ok_or_else(|| EngineError::Internal("record has no `id` to persist".to_string()))?
			.to_string();
		let data = serde_json::to_string(rec)
			.map_err(|e| EngineError::DataAccess(format!("serialize record: {e}")))?;
		sqlx::query(&format!(
			"INSERT INTO {table} (id, data) VALUES (?, ?) \
			 ON CONFLICT(id) DO UPDATE SET data = excluded.data"
		))
		.bind(id)
		.bind(data)
		.execute(&self.pool)
		.await
		.map_err(|e| EngineError::DataAccess(e.to_string()))?;
		Ok(())
	}
}

fn compare_values(a: Option<&Value>, b: Option<&Value>, case_insensitive: bool) -> std::cmp::Ordering {
	use std::cmp::Ordering;
	match (a, b) {
		(Some(Value::String(a)), Some(Value::String(b))) => {
			if case_insensitive {
				a.to_lowercase().cmp(&b.to_lowercase())
			} else {
				a.cmp(b)
			}
		}
		(Some(Value::Number(a)), Some(Value::Number(b))) => a
			.as_f64()
			.zip(b.as_f64())
			.and_then(|(a, b)| a.partial_cmp(&b))
			.unwrap_or(Ordering::Equal),
		(None, None) => Ordering::Equal,
		(None, Some(_)) => Ordering::Less,
		(Some(_), None) => Ordering::Greater,
		_ => Ordering::Equal,
	}
}

#[async_trait]
impl DataAccessPort for SqliteDataAccessPort {
	#[instrument(skip(self, opts), fields(table))]
	async fn find_first(&self, table: &str, opts: FindOptions) -> Result<Option<Record>, EngineError> {
		let all = self.load_all(table).await?;
		let filtered = Self::apply_filter(all, &opts.where_);
		let ordered = Self::apply_order_and_limit(filtered, &opts);
		Ok(ordered.into_iter().next())
	}

	#[instrument(skip(self, opts), fields(table))]
	async fn find_many(&self, table: &str, opts: FindOptions) -> Result<Vec<Record>, EngineError> {
		let all = self.load_all(table).await?;
		let filtered = Self::apply_filter(all, &opts.where_);
		Ok(Self::apply_order_and_limit(filtered, &opts))
	}

	#[instrument(skip(self, rec), fields(table))]
	async fn create(&self, table: &str, mut rec: Record) -> Result<Record, EngineError> {
		self.ensure_table(table).await?;
		if !rec.contains_key("id") {
			rec.insert("id".to_string(), Value::String(uuid::Uuid::new_v4().to_string()));
		}
		self.persist(table, &rec).await?;
		Ok(rec)
	}

	#[instrument(skip(self, opts), fields(table))]
	async fn update_many(&self, table: &str, opts: UpdateOptions) -> Result<u64, EngineError> {
		let all = self.load_all(table).await?;
		let matching = Self::apply_filter(all, &opts.where_);
		let mut count = 0u64;
		for mut rec in matching {
			for (k, v) in &opts.set {
				rec.insert(k.clone(), v.clone());
			}
			self.persist(table, &rec).await?;
			count += 1;
		}
		Ok(count)
	}

	#[instrument(skip(self, opts), fields(table))]
	async fn delete_many(&self, table: &str, opts: DeleteOptions) -> Result<u64, EngineError> {
		self.ensure_table(table).await?;
		let all = self.load_all(table).await?;
		let matching = Self::apply_filter(all, &opts.where_);
		let mut count = 0u64;
		for rec in matching {
			if let Some(id) = rec.get("id").and_then(Value::as_str) {
				sqlx::query(&format!("DELETE FROM {table} WHERE id = ?"))
					.bind(id)
					.execute(&self.pool)
					.await
					.map_err(|e| EngineError::DataAccess(e.to_string()))?;
				count += 1;
			}
		}
		Ok(count)
	}

	#[instrument(skip(self, opts), fields(table))]
	async fn upsert(&self, table: &str, opts: UpsertOptions) -> Result<Record, EngineError> {
		let all = self.load_all(table).await?;
		let existing = all.into_iter().find(|r| opts.where_.matches(r));
		match existing {
			Some(mut rec) => {
				for (k, v) in &opts.update {
					rec.insert(k.clone(), v.clone());
				}
				self.persist(table, &rec).await?;
				Ok(rec)
			}
			None => self.create(table, opts.create).await,
		}
	}

	#[instrument(skip(self, where_), fields(table))]
	async fn count(&self, table: &str, where_: Option<Predicate>) -> Result<u64, EngineError> {
		let all = self.load_all(table).await?;
		Ok(Self::apply_filter(all, &where_).len() as u64)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::data_access::{record, FindOptions, OrderBy};
	use serde_json::json;

	async fn port() -> SqliteDataAccessPort {
		SqliteDataAccessPort::in_memory().await.unwrap()
	}

	#[tokio::test]
	async fn create_generates_id_when_absent() {
		let port = port().await;
		let rec = port
			.create("subjects", record([("kind", json!("subject"))]))
			.await
			.unwrap();
		assert!(rec.contains_key("id"));
	}

	#[tokio::test]
	async fn find_first_honors_predicate() {
		let port = port().await;
		port
			.create("identities", record([("provider", json!("email")), ("identifier", json!("a@x.com"))]))
			.await
			.unwrap();
		port
			.create("identities", record([("provider", json!("phone")), ("identifier", json!("+1")) ]))
			.await
			.unwrap();

		let found = port
			.find_first(
				"identities",
				FindOptions::new().where_clause(Predicate::eq("provider", json!("phone"))),
			)
			.await
			.unwrap();
		assert!(found.is_some());
		assert_eq!(found.unwrap().get("identifier").unwrap(), &json!("+1"));
	}

	#[tokio::test]
	async fn update_many_mutates_matching_rows_only() {
		let port = port().await;
		let a = port
			.create("identities", record([("provider", json!("email")), ("verified", json!(false))]))
			.await
			.unwrap();
		let _b = port
			.create("identities", record([("provider", json!("phone")), ("verified", json!(false))]))
			.await
			.unwrap();

		let updated = port
			.update_many(
				"identities",
				UpdateOptions {
					where_: Some(Predicate::eq("id", a.get("id").unwrap().clone())),
					set: record([("verified", json!(true))]),
				},
			)
			.await
			.unwrap();
		assert_eq!(updated, 1);

		let refetched = port
			.find_first(
				"identities",
				FindOptions::new().where_clause(Predicate::eq("id", a.get("id").unwrap().clone())),
			)
			.await
			.unwrap()
			.unwrap();
		assert_eq!(refetched.get("verified").unwrap(), &json!(true));
	}

	#[tokio::test]
	async fn delete_many_removes_matching_rows() {
		let port = port().await;
		port
			.create("magic_links", record([("used_at", json!(Value::Null))]))
			.await
			.unwrap();
		let deleted = port
			.delete_many(
				"magic_links",
				DeleteOptions {
					where_: Some(Predicate::eq("used_at", Value::Null)),
				},
			)
			.await
			.unwrap();
		assert_eq!(deleted, 1);
		assert_eq!(port.count("magic_links", None).await.unwrap(), 0);
	}

	#[tokio::test]
	async fn upsert_creates_when_missing_then_updates() {
		let port = port().await;
		let key = json!("dup-key");
		let created = port
			.upsert(
				"identities",
				UpsertOptions {
					where_: Predicate::eq("key", key.clone()),
					create: record([("key", key.clone()), ("count", json!(1))]),
					update: record([("count", json!(2))]),
				},
			)
			.await
			.unwrap();
		assert_eq!(created.get("count").unwrap(), &json!(1));

		let updated = port
			.upsert(
				"identities",
				UpsertOptions {
					where_: Predicate::eq("key", key.clone()),
					create: record([("key", key), ("count", json!(1))]),
					update: record([("count", json!(2))]),
				},
			)
			.await
			.unwrap();
		assert_eq!(updated.get("count").unwrap(), &json!(2));
		assert_eq!(port.count("identities", None).await.unwrap(), 1);
	}

	#[tokio::test]
	async fn order_by_case_insensitive_sorts_ignoring_case() {
		let port = port().await;
		port
			.create("identities", record([("identifier", json!("Bob"))]))
			.await
			.unwrap();
		port
			.create("identities", record([("identifier", json!("alice"))]))
			.await
			.unwrap();

		let rows = port
			.find_many(
				"identities",
				FindOptions::new().order_by(OrderBy::asc("identifier").case_insensitive()),
			)
			.await
			.unwrap();
		assert_eq!(rows[0].get("identifier").unwrap(), &json!("alice"));
		assert_eq!(rows[1].get("identifier").unwrap(), &json!("Bob"));
	}
}
