//! Binding bridge round trips driven from JS handlers, plus the SSE
//! lifecycle against a local event-stream server.

use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use warren_bindings::{MemoryObjectStore, MemoryQueue, StaticAssetFetcher};
use warren_runtime::{Engine, EngineConfig, Env, HostRequest};

async fn run(
    engine: &Arc<Engine>,
    site: &str,
    env: Env,
    request: HostRequest,
) -> warren_runtime::WorkerResult {
    let engine = engine.clone();
    let site = site.to_string();
    tokio::task::spawn_blocking(move || engine.execute(&site, "v1", env, request))
        .await
        .expect("join")
        .expect("execute")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn object_storage_round_trip() {
    let engine = Engine::new(EngineConfig::default()).unwrap();
    engine
        .compile_and_cache(
            "site1",
            "v1",
            r#"export default { async fetch(req, env) {
                await env.BUCKET.put("notes/a.txt", "first note", { contentType: "text/plain" });
                const object = await env.BUCKET.get("notes/a.txt");
                const head = await env.BUCKET.head("notes/a.txt");
                const listed = await env.BUCKET.list({ prefix: "notes/" });
                const signed = await env.BUCKET.createSignedUrl("notes/a.txt", { expiresIn: 60 });
                const pub_ = await env.BUCKET.publicUrl("notes/a.txt");
                return Response.json({
                    body: await object.text(),
                    contentType: object.contentType,
                    size: head.size,
                    listed: listed.objects.map((o) => o.key),
                    signedOk: signed.includes("signature="),
                    pubOk: pub_.endsWith("/notes/a.txt"),
                });
            } }"#,
        )
        .unwrap();

    let mut env = Env::new();
    env.storage
        .insert("BUCKET".into(), Arc::new(MemoryObjectStore::new("test")));

    let result = run(&engine, "site1", env, HostRequest::get("http://h/")).await;
    assert_eq!(result.error, None);
    let body: serde_json::Value =
        serde_json::from_str(&result.response.unwrap().body_text()).unwrap();
    assert_eq!(body["body"], "first note");
    assert_eq!(body["contentType"], "text/plain");
    assert_eq!(body["size"], 10);
    assert_eq!(body["listed"], serde_json::json!(["notes/a.txt"]));
    assert_eq!(body["signedOk"], true);
    assert_eq!(body["pubOk"], true);
    engine.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn queue_send_and_batch() {
    let engine = Engine::new(EngineConfig::default()).unwrap();
    engine
        .compile_and_cache(
            "site1",
            "v1",
            r#"export default { async fetch(req, env) {
                await env.JOBS.send({ kind: "single" });
                await env.JOBS.sendBatch([{ body: { kind: "a" } }, { body: { kind: "b" } }]);
                return new Response("queued");
            } }"#,
        )
        .unwrap();

    let queue = Arc::new(MemoryQueue::new());
    let mut env = Env::new();
    env.queues.insert("JOBS".into(), queue.clone());

    let result = run(&engine, "site1", env, HostRequest::get("http://h/")).await;
    assert_eq!(result.error, None);
    assert_eq!(
        queue.sent(),
        vec![
            serde_json::json!({"kind": "single"}),
            serde_json::json!({"kind": "a"}),
            serde_json::json!({"kind": "b"}),
        ]
    );
    engine.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn d1_prepared_statements() {
    let engine = Engine::new(EngineConfig::default()).unwrap();
    engine
        .compile_and_cache(
            "site1",
            "v1",
            r#"export default { async fetch(req, env) {
                await env.DB.exec("CREATE TABLE IF NOT EXISTS users (id INTEGER PRIMARY KEY, name TEXT)");
                const run = await env.DB.prepare("INSERT INTO users (name) VALUES (?1)").bind("alice").run();
                await env.DB.prepare("INSERT INTO users (name) VALUES (?1)").bind("bob").run();
                const all = await env.DB.prepare("SELECT name FROM users ORDER BY id").all();
                const first = await env.DB.prepare("SELECT name FROM users ORDER BY id").first("name");
                const raw = await env.DB.prepare("SELECT id, name FROM users ORDER BY id").raw();
                const batch = await env.DB.batch([
                    env.DB.prepare("SELECT COUNT(*) AS n FROM users"),
                    env.DB.prepare("SELECT name FROM users WHERE id = ?1").bind(2),
                ]);
                return Response.json({
                    changes: run.meta.changes,
                    names: all.results.map((r) => r.name),
                    first,
                    raw,
                    count: batch[0].results[0].n,
                    second: batch[1].results[0].name,
                });
            } }"#,
        )
        .unwrap();

    let mut env = Env::new();
    env.d1_bindings.insert("DB".into(), "bindings-test-db".into());

    let result = run(&engine, "site1", env, HostRequest::get("http://h/")).await;
    assert_eq!(result.error, None);
    let body: serde_json::Value =
        serde_json::from_str(&result.response.unwrap().body_text()).unwrap();
    assert_eq!(body["changes"], 1);
    assert_eq!(body["names"], serde_json::json!(["alice", "bob"]));
    assert_eq!(body["first"], "alice");
    assert_eq!(body["raw"], serde_json::json!([[1, "alice"], [2, "bob"]]));
    assert_eq!(body["count"], 2);
    assert_eq!(body["second"], "bob");
    engine.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn d1_on_disk_databases_persist() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(EngineConfig::default()).unwrap();
    engine
        .compile_and_cache(
            "site1",
            "v1",
            r#"export default { async fetch(req, env) {
                await env.DB.exec("CREATE TABLE IF NOT EXISTS kv (k TEXT PRIMARY KEY, v TEXT)");
                const mode = new URL(req.url).searchParams.get("mode");
                if (mode === "write") {
                    await env.DB.prepare("INSERT OR REPLACE INTO kv VALUES ('a', 'persisted')").run();
                    return new Response("written");
                }
                const row = await env.DB.prepare("SELECT v FROM kv WHERE k = 'a'").first("v");
                return new Response(String(row));
            } }"#,
        )
        .unwrap();

    let env_factory = || {
        let mut env = Env::new();
        env.d1_bindings.insert("DB".into(), "disk-db".into());
        env.d1_data_dir = Some(dir.path().to_path_buf());
        env
    };

    let write = run(
        &engine,
        "site1",
        env_factory(),
        HostRequest::get("http://h/?mode=write"),
    )
    .await;
    assert_eq!(write.error, None);
    assert!(dir.path().join("disk-db.sqlite").exists());

    let read = run(
        &engine,
        "site1",
        env_factory(),
        HostRequest::get("http://h/?mode=read"),
    )
    .await;
    assert_eq!(read.error, None);
    assert_eq!(read.response.unwrap().body_text(), "persisted");
    engine.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn assets_binding_serves_files() {
    let engine = Engine::new(EngineConfig::default()).unwrap();
    engine
        .compile_and_cache(
            "site1",
            "v1",
            r#"export default { async fetch(req, env) {
                const hit = await env.ASSETS.fetch("https://h/index.html");
                const miss = await env.ASSETS.fetch("/nope.txt");
                return Response.json({
                    hitStatus: hit.status,
                    hitBody: await hit.text(),
                    hitType: hit.headers.get("content-type"),
                    missStatus: miss.status,
                });
            } }"#,
        )
        .unwrap();

    let assets = StaticAssetFetcher::new();
    assets.insert("/index.html", "text/html", b"<h1>warren</h1>".to_vec());
    let mut env = Env::new();
    env.assets = Some(Arc::new(assets));

    let result = run(&engine, "site1", env, HostRequest::get("http://h/")).await;
    assert_eq!(result.error, None);
    let body: serde_json::Value =
        serde_json::from_str(&result.response.unwrap().body_text()).unwrap();
    assert_eq!(body["hitStatus"], 200);
    assert_eq!(body["hitBody"], "<h1>warren</h1>");
    assert_eq!(body["hitType"], "text/html");
    assert_eq!(body["missStatus"], 404);
    engine.shutdown();
}

/// Minimal event-stream server: sends `count` events then holds the
/// connection open until the client goes away.
async fn spawn_sse_server(count: usize) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut discard = [0u8; 1024];
                let _ = socket.read(&mut discard).await;
                let header = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n";
                if socket.write_all(header.as_bytes()).await.is_err() {
                    return;
                }
                for i in 0..count {
                    let event = format!("id: {i}\ndata: tick-{i}\n\n");
                    if socket.write_all(event.as_bytes()).await.is_err() {
                        return;
                    }
                }
                let _ = socket.flush().await;
                // Hold the stream open; the client closing tears us down.
                let mut probe = [0u8; 1];
                let _ = socket.read(&mut probe).await;
            });
        }
    });
    format!("http://{addr}/events")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn event_source_receives_messages() {
    let url = spawn_sse_server(3).await;
    let engine = Engine::new(EngineConfig {
        allow_private_network: true,
        ..Default::default()
    })
    .unwrap();
    engine
        .compile_and_cache(
            "site1",
            "v1",
            r#"export default { async fetch(req) {
                const target = new URL(req.url).searchParams.get("target");
                const es = new EventSource(target);
                const seen = [];
                const outcome = await new Promise((resolve) => {
                    es.onmessage = (ev) => {
                        seen.push(ev.data + "@" + ev.lastEventId);
                        if (seen.length === 3) { es.close(); resolve("done"); }
                    };
                    es.onerror = () => { es.close(); resolve("error"); };
                    setTimeout(() => { es.close(); resolve("timeout"); }, 8000);
                });
                return Response.json({ outcome, seen, state: es.readyState });
            } }"#,
        )
        .unwrap();

    let result = run(
        &engine,
        "site1",
        Env::new(),
        HostRequest::get(format!("http://h/?target={url}")),
    )
    .await;
    assert_eq!(result.error, None);
    let body: serde_json::Value =
        serde_json::from_str(&result.response.unwrap().body_text()).unwrap();
    assert_eq!(body["outcome"], "done");
    assert_eq!(
        body["seen"],
        serde_json::json!(["tick-0@0", "tick-1@1", "tick-2@2"])
    );
    assert_eq!(body["state"], 2);
    engine.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn event_source_connection_cap_is_enforced() {
    let url = spawn_sse_server(1).await;
    let engine = Engine::new(EngineConfig {
        allow_private_network: true,
        ..Default::default()
    })
    .unwrap();
    engine
        .compile_and_cache(
            "site1",
            "v1",
            r#"export default { async fetch(req) {
                const target = new URL(req.url).searchParams.get("target");
                const sources = [];
                for (let i = 0; i < 10; i++) sources.push(new EventSource(target));
                let eleventhFailed = false;
                try {
                    new EventSource(target);
                } catch (e) {
                    eleventhFailed = String(e).includes("limit");
                }
                for (const es of sources) es.close();
                return Response.json({ eleventhFailed });
            } }"#,
        )
        .unwrap();

    let result = run(
        &engine,
        "site1",
        Env::new(),
        HostRequest::get(format!("http://h/?target={url}")),
    )
    .await;
    assert_eq!(result.error, None);
    let body: serde_json::Value =
        serde_json::from_str(&result.response.unwrap().body_text()).unwrap();
    assert_eq!(body["eleventhFailed"], true);
    engine.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn private_targets_are_rejected_by_default() {
    let engine = Engine::new(EngineConfig::default()).unwrap();
    engine
        .compile_and_cache(
            "site1",
            "v1",
            r#"export default { async fetch() {
                let esBlocked = false;
                try {
                    new EventSource("http://127.0.0.1:1/never");
                } catch (e) {
                    esBlocked = true;
                }
                let fetchBlocked = false;
                try {
                    await fetch("http://127.0.0.1:1/never");
                } catch (e) {
                    fetchBlocked = true;
                }
                return Response.json({ esBlocked, fetchBlocked });
            } }"#,
        )
        .unwrap();

    let result = run(&engine, "site1", Env::new(), HostRequest::get("http://h/")).await;
    assert_eq!(result.error, None);
    let body: serde_json::Value =
        serde_json::from_str(&result.response.unwrap().body_text()).unwrap();
    assert_eq!(body["esBlocked"], true);
    assert_eq!(body["fetchBlocked"], true);
    engine.shutdown();
}
