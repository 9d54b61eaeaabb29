//! LanceDB connection and housekeeping helpers.
//!
//! Database open, ensure-table for empty tables, and the key/value meta table
//! used to record the vector schema next to the data.

use arrow_array::{Array, RecordBatch, RecordBatchIterator, StringArray, TimestampMillisecondArray};
use chrono::Utc;
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{connect, Connection};
use std::sync::Arc;

use spacedb_core::error::{Error, Result, ResultExt};

use crate::schema::build_meta_schema;

pub async fn open_db(uri: &str) -> Result<Connection> {
	connect(uri).execute().await.storage("open lancedb")
}

pub async fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
	let names = conn.table_names().execute().await.storage("list lancedb tables")?;
	Ok(names.iter().any(|n| n == name))
}

pub async fn ensure_table(conn: &Connection, name: &str, schema: Arc<arrow_schema::Schema>) -> Result<()> {
	if table_exists(conn, name).await? {
		return Ok(());
	}
	// create empty table with 0 rows
	let iter = RecordBatchIterator::new(vec![].into_iter(), schema.clone());
	conn.create_table(name, Box::new(iter)).execute().await.storage("create lancedb table")?;
	Ok(())
}

pub async fn set_meta(conn: &Connection, table: &str, key: &str, value: &str) -> Result<()> {
	ensure_table(conn, table, build_meta_schema()).await?;
	let t = conn.open_table(table).execute().await.storage("open meta table")?;
	let rb = RecordBatch::try_new(
		build_meta_schema(),
		vec![
			Arc::new(StringArray::from(vec![key.to_string()])),
			Arc::new(StringArray::from(vec![value.to_string()])),
			Arc::new(TimestampMillisecondArray::from(vec![Utc::now().timestamp_millis()])),
		],
	)
	.storage("build meta row")?;
	let reader = Box::new(RecordBatchIterator::new(vec![Ok(rb)].into_iter(), build_meta_schema()));
	// key is unique
	let mut mi = t.merge_insert(&["key"]);
	mi.when_matched_update_all(None).when_not_matched_insert_all();
	mi.execute(reader).await.storage("write meta")?;
	Ok(())
}

pub async fn get_meta(conn: &Connection, table: &str, key: &str) -> Result<Option<String>> {
	if !table_exists(conn, table).await? {
		return Ok(None);
	}
	let t = conn.open_table(table).execute().await.storage("open meta table")?;
	let mut stream = t
		.query()
		.only_if(format!("key = '{}'", key.replace('\'', "''")))
		.execute()
		.await
		.storage("query meta")?;
	while let Some(batch) = stream.try_next().await.storage("read meta")? {
		if batch.num_rows() == 0 {
			continue;
		}
		let val = batch
			.column_by_name("value")
			.and_then(|c| c.as_any().downcast_ref::<StringArray>())
			.ok_or_else(|| Error::StorageIO("meta.value column missing".into()))?;
		return Ok(Some(val.value(0).to_string()));
	}
	Ok(None)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn meta_upserts_by_key() {
		let tmp = tempfile::tempdir().unwrap();
		let conn = open_db(tmp.path().to_str().unwrap()).await.unwrap();
		assert_eq!(get_meta(&conn, "meta", "dim").await.unwrap(), None);
		set_meta(&conn, "meta", "dim", "8").await.unwrap();
		set_meta(&conn, "meta", "dim", "16").await.unwrap();
		set_meta(&conn, "meta", "metric", "cosine").await.unwrap();
		assert_eq!(get_meta(&conn, "meta", "dim").await.unwrap().as_deref(), Some("16"));
		assert_eq!(get_meta(&conn, "meta", "metric").await.unwrap().as_deref(), Some("cosine"));
	}
}
