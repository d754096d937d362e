//! D1-style SQL binding ops.
//!
//! Databases are opened once per database-id (per data dir) and shared
//! process-wide; the connection mutex serializes concurrent statements.

use super::{op_err, to_payload};
use crate::registry::{self, RequestState};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use warren_bindings::SqlDatabase;
use warren_engine::{op_sync, OpDecl, OpError, OpResult};

static DATABASES: Lazy<RwLock<HashMap<String, Arc<SqlDatabase>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

pub fn ops() -> Vec<OpDecl> {
    vec![op_sync("__d1_exec", 3, d1_exec)]
}

fn database_for(state: &RequestState, binding: &str) -> Result<Arc<SqlDatabase>, OpError> {
    let database_id = state
        .env
        .d1_bindings
        .get(binding)
        .ok_or_else(|| OpError::new(format!("unknown D1 binding '{binding}'")))?;

    let key = match &state.env.d1_data_dir {
        Some(dir) => format!("{}|{database_id}", dir.display()),
        None => format!("memory|{database_id}"),
    };

    if let Some(db) = DATABASES.read().get(&key) {
        return Ok(db.clone());
    }

    let mut databases = DATABASES.write();
    if let Some(db) = databases.get(&key) {
        return Ok(db.clone());
    }
    let db = match &state.env.d1_data_dir {
        Some(dir) => SqlDatabase::open(&dir.join(format!("{database_id}.sqlite"))),
        None => SqlDatabase::open_in_memory(),
    }
    .map_err(op_err)?;
    let db = Arc::new(db);
    databases.insert(key, db.clone());
    Ok(db)
}

#[derive(Debug, Deserialize)]
struct ExecPayload {
    sql: String,
    #[serde(default)]
    params: Vec<JsonValue>,
    mode: String,
}

fn d1_exec(args: Vec<String>) -> OpResult {
    let state = registry::resolve(&args[0])?;
    let db = database_for(&state, &args[1])?;
    let payload: ExecPayload = serde_json::from_str(&args[2]).map_err(op_err)?;
    let started = Instant::now();

    let result = match payload.mode.as_str() {
        "all" => {
            if SqlDatabase::returns_rows(&payload.sql) {
                let rows = db.query(&payload.sql, &payload.params).map_err(op_err)?;
                json!({
                    "results": rows.as_objects(),
                    "success": true,
                    "meta": { "duration": elapsed_ms(started) },
                })
            } else {
                let meta = db.execute(&payload.sql, &payload.params).map_err(op_err)?;
                json!({
                    "results": [],
                    "success": true,
                    "meta": {
                        "changes": meta.rows_affected,
                        "lastRowId": meta.last_insert_rowid,
                        "duration": elapsed_ms(started),
                    },
                })
            }
        }
        "raw" => {
            let rows = db.query(&payload.sql, &payload.params).map_err(op_err)?;
            json!({ "columns": rows.columns, "rows": rows.rows })
        }
        "run" => {
            let meta = if SqlDatabase::returns_rows(&payload.sql) {
                db.query(&payload.sql, &payload.params).map_err(op_err)?;
                json!({ "duration": elapsed_ms(started) })
            } else {
                let meta = db.execute(&payload.sql, &payload.params).map_err(op_err)?;
                json!({
                    "changes": meta.rows_affected,
                    "lastRowId": meta.last_insert_rowid,
                    "duration": elapsed_ms(started),
                })
            };
            json!({ "success": true, "meta": meta })
        }
        "exec" => {
            db.execute_batch(&payload.sql).map_err(op_err)?;
            let count = payload
                .sql
                .split(';')
                .filter(|s| !s.trim().is_empty())
                .count();
            json!({ "count": count, "duration": elapsed_ms(started) })
        }
        other => return Err(OpError::new(format!("unknown D1 mode '{other}'"))),
    };

    to_payload(&result)
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::Env;

    fn request_with_d1(database_id: &str) -> u64 {
        let mut env = Env::new();
        env.d1_bindings.insert("DB".into(), database_id.into());
        registry::new_state(Arc::new(env))
    }

    fn exec(rid: &str, sql: &str, params: JsonValue, mode: &str) -> JsonValue {
        let payload = json!({ "sql": sql, "params": params, "mode": mode }).to_string();
        let out = d1_exec(vec![rid.to_string(), "DB".into(), payload]).unwrap();
        serde_json::from_str(&out).unwrap()
    }

    #[test]
    fn all_run_and_raw_modes() {
        let id = request_with_d1("test-modes");
        let rid = id.to_string();

        exec(&rid, "CREATE TABLE t (a INTEGER, b TEXT)", json!([]), "run");
        let run = exec(
            &rid,
            "INSERT INTO t VALUES (?1, ?2)",
            json!([1, "x"]),
            "run",
        );
        assert_eq!(run["success"], json!(true));
        assert_eq!(run["meta"]["changes"], json!(1));

        let all = exec(&rid, "SELECT * FROM t", json!([]), "all");
        assert_eq!(all["results"][0]["a"], json!(1));
        assert_eq!(all["results"][0]["b"], json!("x"));

        let raw = exec(&rid, "SELECT a, b FROM t", json!([]), "raw");
        assert_eq!(raw["columns"], json!(["a", "b"]));
        assert_eq!(raw["rows"], json!([[1, "x"]]));

        registry::clear(id);
    }

    #[test]
    fn database_persists_across_requests() {
        let first = request_with_d1("test-persist");
        exec(
            &first.to_string(),
            "CREATE TABLE kv (k TEXT, v TEXT)",
            json!([]),
            "run",
        );
        exec(
            &first.to_string(),
            "INSERT INTO kv VALUES ('a', '1')",
            json!([]),
            "run",
        );
        registry::clear(first);

        let second = request_with_d1("test-persist");
        let all = exec(&second.to_string(), "SELECT v FROM kv", json!([]), "all");
        assert_eq!(all["results"][0]["v"], json!("1"));
        registry::clear(second);
    }
}
