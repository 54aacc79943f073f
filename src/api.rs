//! HTTP surface: a thin `hyper` service translating the four endpoints in
//! the external interface into calls against [`Server`]. Every blocking,
//! channel-based operation (acquiring a drive, writing a chunk, running an
//! audit) is handed to a dedicated worker thread via `spawn_blocking` rather
//! than run on the async reactor -- the bridge this crate's concurrency
//! model calls for between the HTTP surface and the actor world beneath it.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, HeaderMap, Method, Request, Response, StatusCode};
use serde::Serialize;

use crate::error::{AdmissionError, RequestError};
use crate::inventory::Volume;
use crate::policy::Policy;
use crate::server::Server;

/// Bind and serve until `shutdown` resolves (SIGINT, typically).
pub async fn serve(
    addr: SocketAddr,
    server: Arc<Server>,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<(), hyper::Error> {
    let make_service = make_service_fn(move |_conn| {
        let server = server.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let server = server.clone();
                async move { Ok::<_, Infallible>(route(server, req).await) }
            }))
        }
    });

    log::info!("listening on {addr}");
    hyper::Server::bind(&addr)
        .serve(make_service)
        .with_graceful_shutdown(shutdown)
        .await
}

fn path_segments(path: &str) -> Vec<&str> {
    path.trim_matches('/').split('/').filter(|s| !s.is_empty()).collect()
}

async fn route(server: Arc<Server>, req: Request<Body>) -> Response<Body> {
    let path = req.uri().path().to_string();
    let segments = path_segments(&path);

    match (req.method().clone(), segments.as_slice()) {
        (Method::PUT, ["obj", id]) => handle_put(server, req, id.to_string()).await,
        (Method::GET, ["obj", _id]) => handle_get(),
        (Method::PATCH, ["cmd", "audit", library]) => handle_audit(server, library.to_string()).await,
        (Method::GET, ["vol", "list", library]) => handle_list_volumes(server, library.to_string()).await,
        (method, _) => error_response(RequestError::BadRequest(format!("no such route: {method} {path}"))),
    }
}

fn parse_policy(headers: &HeaderMap) -> Result<Policy, anyhow::Error> {
    let get = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    Policy::from_headers(
        get("acknowledged-write"),
        get("write-group"),
        get("exclusive"),
        get("exclusive-timeout"),
    )
}

async fn handle_put(server: Arc<Server>, req: Request<Body>, id: String) -> Response<Body> {
    let policy = match parse_policy(req.headers()) {
        Ok(policy) => policy,
        Err(err) => return error_response(RequestError::BadRequest(err.to_string())),
    };

    let request_timeout = match req.headers().get("timeout").and_then(|v| v.to_str().ok()) {
        None => None,
        Some(raw) => match crate::duration::parse_duration(raw) {
            Ok(duration) => Some(duration),
            Err(err) => return error_response(RequestError::BadRequest(err.to_string())),
        },
    };

    let deadline = policy.exclusive_timeout.map(|d| Instant::now() + d);
    let body = req.into_body();
    let work = stream_body_to_server(server, id, policy, deadline, body);

    let result = match request_timeout {
        None => work.await,
        Some(duration) => match tokio::time::timeout(duration, work).await {
            Ok(result) => result,
            Err(_) => Err(RequestError::Admission(AdmissionError::AcquireTimeout(duration))),
        },
    };

    match result {
        Ok(()) => Response::builder().status(StatusCode::OK).body(Body::empty()).unwrap(),
        Err(err) => error_response(err),
    }
}

/// Forwards the request body into a blocking `Stream::write`/`close` loop
/// running on its own thread, one piece at a time, so the async reactor
/// thread is never blocked on tape I/O or drive acquisition.
async fn stream_body_to_server(
    server: Arc<Server>,
    archive: String,
    policy: Policy,
    deadline: Option<Instant>,
    mut body: Body,
) -> Result<(), RequestError> {
    let (tx, mut rx) = tokio::sync::mpsc::channel(4);

    let writer = tokio::task::spawn_blocking(move || -> Result<(), RequestError> {
        let mut stream = server.open_stream(archive, policy, deadline)?;
        while let Some(piece) = rx.blocking_recv() {
            stream.write(&piece)?;
        }
        stream.close()?;
        Ok(())
    });

    while let Some(next) = hyper::body::HttpBody::data(&mut body).await {
        let bytes = next.map_err(|err| RequestError::BadRequest(format!("reading request body: {err}")))?;
        if tx.send(bytes).await.is_err() {
            break;
        }
    }
    drop(tx);

    writer
        .await
        .map_err(|err| RequestError::Internal(anyhow::anyhow!("writer task panicked: {err}")))?
}

fn handle_get() -> Response<Body> {
    error_response(RequestError::NotImplemented)
}

async fn handle_audit(server: Arc<Server>, library: String) -> Response<Body> {
    let result = tokio::task::spawn_blocking(move || server.audit(&library)).await;
    match result {
        Ok(Ok(())) => Response::builder().status(StatusCode::OK).body(Body::empty()).unwrap(),
        Ok(Err(err)) => error_response(err),
        Err(err) => error_response(RequestError::Internal(anyhow::anyhow!("audit task panicked: {err}"))),
    }
}

#[derive(Serialize)]
struct VolumeJson {
    serial: String,
    home: Option<u64>,
    status: String,
    library: String,
}

impl From<Volume> for VolumeJson {
    fn from(volume: Volume) -> Self {
        VolumeJson {
            serial: volume.serial,
            home: volume.slot,
            status: format!("{:?}", volume.status).to_lowercase(),
            library: volume.library,
        }
    }
}

async fn handle_list_volumes(server: Arc<Server>, library: String) -> Response<Body> {
    let result = tokio::task::spawn_blocking(move || server.list_volumes(&library)).await;
    match result {
        Ok(Ok(volumes)) => {
            let payload: Vec<VolumeJson> = volumes.into_iter().map(VolumeJson::from).collect();
            match serde_json::to_vec(&payload) {
                Ok(json) => Response::builder()
                    .status(StatusCode::OK)
                    .header("content-type", "application/json")
                    .body(Body::from(json))
                    .unwrap(),
                Err(err) => error_response(RequestError::Internal(anyhow::anyhow!(err))),
            }
        }
        Ok(Err(err)) => error_response(err),
        Err(err) => error_response(RequestError::Internal(anyhow::anyhow!("volume listing task panicked: {err}"))),
    }
}

fn error_response(err: RequestError) -> Response<Body> {
    let status = match &err {
        RequestError::BadRequest(_) => StatusCode::BAD_REQUEST,
        RequestError::NotImplemented => StatusCode::NOT_IMPLEMENTED,
        RequestError::Admission(_) | RequestError::Media(_) | RequestError::Storage(_) | RequestError::ShortWrite(_) | RequestError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };

    log::warn!("request failed with {status}: {err}");
    Response::builder()
        .status(status)
        .header("content-type", "text/plain")
        .body(Body::from(err.to_string()))
        .unwrap()
}
