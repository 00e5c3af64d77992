//! The serving window of the BrainTrace bootstrap.
//!
//! Once the orchestrator reports every dependency processed, a small
//! `tiny_http` server answers `GET /health` and `GET /status` (the startup
//! report as JSON) until it is stopped. [`run_session`] drives one whole run
//! from startup to shutdown. The [`TestServer`] helper starts a server on a
//! random port for integration testing.

use braintrace_core::{CoreError, Orchestrator, ShutdownReport, StartupReport};
use braintrace_schema::{default_config, parse_config_file, NormalizedConfig};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};
use tokio::sync::Notify;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },
    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Load and normalize the bootstrap config.
///
/// Relative paths in a config file resolve against the file's directory.
/// Without a file the built-in presets are used, relative to the current
/// directory.
pub fn load_config(path: Option<&Path>) -> Result<NormalizedConfig, CoreError> {
    let Some(path) = path else {
        info!("no config file given, using built-in dependency presets");
        let base = std::env::current_dir()?;
        return Ok(default_config()?.normalize(&base)?);
    };

    info!("loading config from {}", path.display());
    let raw = parse_config_file(path)?;
    let base = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    Ok(raw.normalize(&base)?)
}

/// What the HTTP handlers can see.
pub struct AppState {
    report: StartupReport,
}

impl AppState {
    pub fn new(report: StartupReport) -> Self {
        Self { report }
    }

    pub fn report(&self) -> &StartupReport {
        &self.report
    }

    fn status_json(&self) -> String {
        serde_json::to_string(&self.report).unwrap_or_else(|_| "{}".to_owned())
    }
}

fn respond_err(req: Request, code: u16, msg: &str) {
    let _ = req.respond(Response::from_string(msg).with_status_code(StatusCode(code)));
}

fn respond_json(req: Request, json: impl Into<Vec<u8>>) {
    let response = Response::from_data(json.into());
    let response = match Header::from_bytes("Content-Type", "application/json") {
        Ok(header) => response.with_header(header),
        Err(()) => response,
    };
    let _ = req.respond(response);
}

/// Handle a single HTTP request.
pub fn handle_request(state: &AppState, req: Request) {
    let method = req.method().clone();
    let url = req.url().to_owned();
    debug!("{method} {url}");

    let path = url.split('?').next().unwrap_or_default();
    match (&method, path) {
        (Method::Get, "/health") => respond_json(req, r#"{"status":"ok"}"#),
        (Method::Get, "/status") => respond_json(req, state.status_json()),
        (_, "/health" | "/status") => respond_err(req, 405, "method not allowed"),
        _ => respond_err(req, 404, "not found"),
    }
}

/// A bound HTTP listener.
pub struct HttpServer {
    server: Arc<Server>,
}

/// Unblocks a running [`HttpServer::serve`] loop from another thread.
#[derive(Clone)]
pub struct Stopper {
    server: Arc<Server>,
}

impl Stopper {
    pub fn stop(&self) {
        self.server.unblock();
    }
}

impl HttpServer {
    pub fn bind(addr: &str) -> Result<Self, ServerError> {
        let server = Server::http(addr).map_err(|e| ServerError::Bind {
            addr: addr.to_owned(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            server: Arc::new(server),
        })
    }

    pub fn port(&self) -> Option<u16> {
        self.server.server_addr().to_ip().map(|a| a.port())
    }

    pub fn stopper(&self) -> Stopper {
        Stopper {
            server: Arc::clone(&self.server),
        }
    }

    /// Serve requests on the current thread until stopped.
    pub fn serve(&self, state: &AppState) {
        for request in self.server.incoming_requests() {
            handle_request(state, request);
        }
        debug!("HTTP server loop finished");
    }
}

/// How a [`run_session`] ended.
#[derive(Debug)]
pub struct SessionOutcome {
    pub result: Result<(), ServerError>,
    /// Port the status server listened on, if serving began.
    pub served_on: Option<u16>,
    pub shutdown: ShutdownReport,
}

/// Start the dependencies, serve on `addr` until `shutdown` is notified, then
/// stop every process this run spawned.
///
/// A notification while startup is still waiting on a dependency cancels the
/// startup; whatever was already spawned is shut down all the same and the
/// session ends without error.
pub async fn run_session(
    orchestrator: &mut Orchestrator,
    addr: &str,
    shutdown: &Notify,
) -> SessionOutcome {
    let started = tokio::select! {
        result = orchestrator.start() => Some(result),
        () = shutdown.notified() => None,
    };

    let mut served_on = None;
    let result = match started {
        Some(Ok(report)) => serve(addr, report, shutdown, &mut served_on).await,
        Some(Err(e)) => Err(e.into()),
        None => {
            info!("interrupted during startup");
            Ok(())
        }
    };

    SessionOutcome {
        result,
        served_on,
        shutdown: orchestrator.shutdown().await,
    }
}

async fn serve(
    addr: &str,
    report: StartupReport,
    shutdown: &Notify,
    served_on: &mut Option<u16>,
) -> Result<(), ServerError> {
    let http = HttpServer::bind(addr)?;
    *served_on = http.port();
    info!("serving on http://{addr} ({} mode)", report.mode);
    let stopper = http.stopper();
    let state = AppState::new(report);
    let mut task = tokio::task::spawn_blocking(move || http.serve(&state));

    tokio::select! {
        joined = &mut task => {
            return joined.map_err(|e| CoreError::Serving(e.to_string()).into());
        }
        () = shutdown.notified() => {
            info!("stopping HTTP server");
            stopper.stop();
        }
    }
    task.await
        .map_err(|e| CoreError::Serving(e.to_string()).into())
}

/// A test helper that serves a startup report on a random port in a
/// background thread.
///
/// The server listens on `127.0.0.1:{port}`. Dropping the `TestServer` stops
/// it and joins the thread.
pub struct TestServer {
    pub url: String,
    pub port: u16,
    stopper: Stopper,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl TestServer {
    /// Bind `127.0.0.1:0` and serve `report`.
    pub fn start(report: StartupReport) -> Result<Self, ServerError> {
        let http = HttpServer::bind("127.0.0.1:0")?;
        let port = http.port().ok_or_else(|| ServerError::Bind {
            addr: "127.0.0.1:0".to_owned(),
            reason: "not an IP address".to_owned(),
        })?;
        let stopper = http.stopper();
        let state = AppState::new(report);
        let handle = std::thread::spawn(move || http.serve(&state));

        Ok(Self {
            url: format!("http://127.0.0.1:{port}"),
            port,
            stopper,
            handle: Some(handle),
        })
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stopper.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
