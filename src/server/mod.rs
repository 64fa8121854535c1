use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, Request};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task;
use tower::ServiceBuilder;
use tracing::{debug, info};

use crate::acl::{AccessControl, AccessType};
use crate::job::{ExecLimits, LogReader, Status};
use crate::supervisor::Supervisor;

use error::{AppResult, Error};

pub mod error;

/// Header carrying the verified client subject DN, set by the fronting
/// mTLS terminator (nginx/envoy convention). Identity never comes from
/// the client directly.
pub const CLIENT_DN_HEADER: &str = "x-ssl-client-s-dn";

/// How often a follow-mode log stream re-checks a drained file while
/// the job is still able to produce output.
const FOLLOW_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Verified client identity, attached by the identity middleware.
#[derive(Clone)]
pub struct Identity(pub String);

pub fn router(jobs: Arc<Supervisor>, auth: Arc<AccessControl>) -> Router {
    Router::new()
        .route("/v1/jobs", post(start_job))
        .route("/v1/jobs/{id}", get(inspect_job).delete(remove_job))
        .route("/v1/jobs/{id}/stop", post(stop_job))
        .route("/v1/jobs/{id}/logs", get(job_logs))
        .layer(
            ServiceBuilder::new()
                .layer(Extension(jobs))
                .layer(Extension(auth))
                .layer(middleware::from_fn(client_identity)),
        )
        // liveness only, no identity required
        .route("/ping", get(ping))
}

async fn client_identity(mut req: Request, next: Next) -> Response {
    let dn = req
        .headers()
        .get(CLIENT_DN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    match dn {
        Some(dn) => {
            req.extensions_mut().insert(Identity(dn));
            next.run(req).await
        }
        None => Error::unauthenticated().into_response(),
    }
}

async fn ping() -> impl IntoResponse {
    ""
}

#[derive(Deserialize)]
struct StartRequest {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    limits: Limits,
}

#[derive(Deserialize, Default)]
struct Limits {
    #[serde(default)]
    cpus: f32,
    #[serde(default)]
    memory: i64,
    #[serde(default)]
    io: i64,
}

#[derive(Serialize)]
struct StartResponse {
    id: String,
}

#[derive(Deserialize, Default)]
struct StopRequest {
    #[serde(default)]
    mode: StopMode,
}

#[derive(Deserialize, Default, Clone, Copy, PartialEq)]
#[serde(rename_all = "lowercase")]
enum StopMode {
    #[default]
    Graceful,
    Immediate,
}

#[derive(Serialize)]
struct InspectResponse {
    command: String,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    exit_code: Option<i32>,
}

#[derive(Deserialize, Default)]
struct LogsQuery {
    #[serde(default)]
    follow: bool,
}

fn status_name(status: Status) -> &'static str {
    match status {
        Status::Active => "ACTIVE",
        Status::Stopping => "STOPPING",
        Status::Ended => "ENDED",
        Status::Stopped => "STOPPED",
        Status::Removed => "UNSPECIFIED",
    }
}

async fn start_job(
    Extension(jobs): Extension<Arc<Supervisor>>,
    Extension(auth): Extension<Arc<AccessControl>>,
    Extension(Identity(client)): Extension<Identity>,
    Json(req): Json<StartRequest>,
) -> AppResult<Json<StartResponse>> {
    debug!(client = %client, command = %req.command, "start_job");
    let limits = ExecLimits {
        cpu: req.limits.cpus,
        max_ram_bytes: req.limits.memory,
        max_io_bytes_per_sec: req.limits.io,
    };
    let id = task::spawn_blocking(move || jobs.start(req.command, req.args, limits)).await??;
    let _ = auth.set_owner(id.as_str(), &client);
    Ok(Json(StartResponse { id: id.to_string() }))
}

async fn stop_job(
    Extension(jobs): Extension<Arc<Supervisor>>,
    Extension(auth): Extension<Arc<AccessControl>>,
    Extension(Identity(client)): Extension<Identity>,
    Path(id): Path<String>,
    Json(req): Json<StopRequest>,
) -> AppResult<()> {
    debug!(client = %client, job = %id, "stop_job");
    if !auth.check(&client, &id, AccessType::Full) {
        info!(client = %client, job = %id, "no access");
        return Err(Error::not_found());
    }
    let graceful = req.mode == StopMode::Graceful;
    task::spawn_blocking(move || jobs.stop(&id, graceful)).await??;
    Ok(())
}

async fn remove_job(
    Extension(jobs): Extension<Arc<Supervisor>>,
    Extension(auth): Extension<Arc<AccessControl>>,
    Extension(Identity(client)): Extension<Identity>,
    Path(id): Path<String>,
) -> AppResult<()> {
    debug!(client = %client, job = %id, "remove_job");
    if !auth.check(&client, &id, AccessType::Full) {
        info!(client = %client, job = %id, "no access");
        return Err(Error::not_found());
    }
    {
        let id = id.clone();
        task::spawn_blocking(move || jobs.remove(&id)).await??;
    }
    let _ = auth.remove(&id);
    Ok(())
}

async fn inspect_job(
    Extension(jobs): Extension<Arc<Supervisor>>,
    Extension(auth): Extension<Arc<AccessControl>>,
    Extension(Identity(client)): Extension<Identity>,
    Path(id): Path<String>,
) -> AppResult<Json<InspectResponse>> {
    debug!(client = %client, job = %id, "inspect_job");
    if !auth.check(&client, &id, AccessType::Read) {
        info!(client = %client, job = %id, "no access");
        return Err(Error::not_found());
    }
    let details = task::spawn_blocking(move || jobs.inspect(&id)).await??;
    Ok(Json(InspectResponse {
        command: details.command,
        status: status_name(details.status),
        exit_code: details.exit_code,
    }))
}

async fn job_logs(
    Extension(jobs): Extension<Arc<Supervisor>>,
    Extension(auth): Extension<Arc<AccessControl>>,
    Extension(Identity(client)): Extension<Identity>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> AppResult<Response> {
    debug!(client = %client, job = %id, follow = query.follow, "job_logs");
    if !auth.check(&client, &id, AccessType::Read) {
        info!(client = %client, job = %id, "no access");
        return Err(Error::not_found());
    }

    let reader = {
        let jobs = Arc::clone(&jobs);
        let id = id.clone();
        task::spawn_blocking(move || jobs.logs(&id)).await??
    };

    let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(16);
    task::spawn_blocking(move || stream_logs(reader, jobs, id, query.follow, tx));

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    });
    Ok(Body::from_stream(stream).into_response())
}

/// Pump the reader into the response channel. On EOF: finish unless
/// following a job that can still produce output, in which case poll
/// again shortly. Dropping the reader on the way out releases the
/// cleanup wait-group, so a cancelled stream never blocks Remove.
fn stream_logs(
    mut reader: LogReader,
    jobs: Arc<Supervisor>,
    id: String,
    follow: bool,
    tx: mpsc::Sender<std::io::Result<Bytes>>,
) {
    let mut buf = [0u8; 1024];
    loop {
        if tx.is_closed() {
            // client went away
            return;
        }
        match reader.read(&mut buf) {
            Ok(0) => {
                if !follow || !jobs.active(&id) {
                    return;
                }
                std::thread::sleep(FOLLOW_POLL_INTERVAL);
            }
            Ok(n) => {
                if tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                    return;
                }
            }
            Err(e) => {
                let _ = tx.blocking_send(Err(e));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::proc::fake::FakeDriver;
    use crate::job::{ExecIdentity, ExitReason, ProcDriver};
    use axum::body::to_bytes;
    use axum::http::{header, Request as HttpRequest, StatusCode};
    use serde_json::{json, Value};
    use std::io::Write;
    use tower::ServiceExt;

    struct Fixture {
        _base: tempfile::TempDir,
        _cgroot: tempfile::TempDir,
        driver: Arc<FakeDriver>,
        jobs: Arc<Supervisor>,
        auth: Arc<AccessControl>,
        app: Router,
        id: String,
    }

    /// One running job owned by alice; admin is a full superuser,
    /// auditor read-only.
    fn fixture() -> Fixture {
        let base = tempfile::tempdir().unwrap();
        let cgroot = tempfile::tempdir().unwrap();
        let driver = Arc::new(FakeDriver::new());
        let jobs = Arc::new(Supervisor::with_driver(
            ExecIdentity::default(),
            base.path(),
            cgroot.path(),
            Arc::clone(&driver) as Arc<dyn ProcDriver>,
        ));
        let auth = Arc::new(AccessControl::new());
        auth.add_superusers(&["admin".to_string()], AccessType::Full);
        auth.add_superusers(&["auditor".to_string()], AccessType::Read);

        let id = jobs
            .start("sleep".into(), vec!["60".into()], ExecLimits::default())
            .unwrap();
        auth.set_owner(id.as_str(), "alice").unwrap();

        let app = router(Arc::clone(&jobs), Arc::clone(&auth));
        Fixture {
            _base: base,
            _cgroot: cgroot,
            driver,
            jobs,
            auth,
            app,
            id: id.to_string(),
        }
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        client: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut req = HttpRequest::builder().method(method).uri(uri);
        if let Some(client) = client {
            req = req.header(CLIENT_DN_HEADER, client);
        }
        let req = match body {
            Some(v) => req
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&v).unwrap()))
                .unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::String(
                String::from_utf8_lossy(&bytes).into_owned(),
            ))
        };
        (status, value)
    }

    #[tokio::test]
    async fn missing_identity_is_unauthenticated() {
        let f = fixture();
        let uri = format!("/v1/jobs/{}", f.id);
        let (status, _) = send(&f.app, "GET", &uri, None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn ping_needs_no_identity() {
        let f = fixture();
        let (status, _) = send(&f.app, "GET", "/ping", None, None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn owner_can_inspect() {
        let f = fixture();
        let uri = format!("/v1/jobs/{}", f.id);
        let (status, body) = send(&f.app, "GET", &uri, Some("alice"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["command"], "sleep 60");
        assert_eq!(body["status"], "ACTIVE");
        assert!(body.get("exit_code").is_none());
    }

    #[tokio::test]
    async fn unauthorized_read_is_reported_as_not_found() {
        let f = fixture();
        let uri = format!("/v1/jobs/{}", f.id);

        // bob exists nowhere in the table: the job must look gone, not
        // forbidden
        let (status, body) = send(&f.app, "GET", &uri, Some("bob"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "job not found");

        let logs_uri = format!("/v1/jobs/{}/logs", f.id);
        let (status, body) = send(&f.app, "GET", &logs_uri, Some("bob"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "job not found");
    }

    #[tokio::test]
    async fn read_superuser_can_inspect_but_not_stop() {
        let f = fixture();
        let uri = format!("/v1/jobs/{}", f.id);
        let (status, _) = send(&f.app, "GET", &uri, Some("auditor"), None).await;
        assert_eq!(status, StatusCode::OK);

        let stop_uri = format!("/v1/jobs/{}/stop", f.id);
        let (status, body) =
            send(&f.app, "POST", &stop_uri, Some("auditor"), Some(json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "job not found");
    }

    #[tokio::test]
    async fn superuser_cannot_probe_unknown_ids() {
        let f = fixture();
        let (status, _) = send(&f.app, "GET", "/v1/jobs/does-not-exist", Some("admin"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn logs_stream_returns_output() {
        let f = fixture();
        let out_path = f._base.path().join(&f.id).join("out/output");
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(out_path)
            .unwrap();
        file.write_all(b"hello from the job\n").unwrap();

        let uri = format!("/v1/jobs/{}/logs", f.id);
        let req = HttpRequest::builder()
            .method("GET")
            .uri(&uri)
            .header(CLIENT_DN_HEADER, "alice")
            .body(Body::empty())
            .unwrap();
        let resp = f.app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"hello from the job\n");
    }

    #[tokio::test]
    async fn start_records_ownership() {
        let f = fixture();
        let (status, body) = send(
            &f.app,
            "POST",
            "/v1/jobs",
            Some("dave"),
            Some(json!({
                "command": "true",
                "args": [],
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let id = body["id"].as_str().unwrap().to_string();
        assert!(f.auth.check("dave", &id, AccessType::Full));
        assert!(!f.auth.check("alice", &id, AccessType::Read));
    }

    #[tokio::test]
    async fn full_lifecycle_over_the_api() {
        let f = fixture();
        let stop_uri = format!("/v1/jobs/{}/stop", f.id);
        let (status, _) = send(
            &f.app,
            "POST",
            &stop_uri,
            Some("alice"),
            Some(json!({"mode": "immediate"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        f.driver.finish_all(ExitReason::Code(137));
        let uri = format!("/v1/jobs/{}", f.id);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            let (_, body) = send(&f.app, "GET", &uri, Some("alice"), None).await;
            if body["status"] == "STOPPED" {
                assert_eq!(body["exit_code"], 137);
                break;
            }
            assert!(std::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let (status, _) = send(&f.app, "DELETE", &uri, Some("alice"), None).await;
        assert_eq!(status, StatusCode::OK);

        // gone for everyone now, including the former owner
        let (status, _) = send(&f.app, "GET", &uri, Some("alice"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(!f.jobs.active(&f.id));
    }

    #[tokio::test]
    async fn remove_running_job_conflicts() {
        let f = fixture();
        let uri = format!("/v1/jobs/{}", f.id);
        let (status, body) = send(&f.app, "DELETE", &uri, Some("alice"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "job is not completed");
        // a failed remove must not drop the ACL entry
        assert!(f.auth.check("alice", &f.id, AccessType::Full));
    }
}
