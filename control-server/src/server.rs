// control-server/src/server.rs
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use common::ControlConfig;

use crate::auth::{AuthCredentials, Authenticator};
use crate::bridge::ControlBridge;
use crate::error::ServerError;
use crate::http::request::{parse_http_request, HttpRequest};
use crate::http::response::HttpResponse;
use crate::http::router::{RouteAction, Router};
use crate::ws;
use crate::ws::manager::{ManagerStats, WebSocketManager};

/// Budget for reading one complete request off the socket
const READ_TIMEOUT_SECS: u64 = 30;

struct Running {
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

/// The embedded control server. Explicitly constructed with its Bridge;
/// `start()` brings up the listener and issues fresh credentials,
/// `stop()` tears everything down and wipes them.
pub struct ControlServer {
    config: ControlConfig,
    authenticator: Arc<Authenticator>,
    manager: Arc<WebSocketManager>,
    router: Arc<Router>,
    running: tokio::sync::Mutex<Option<Running>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl ControlServer {
    pub fn new(config: ControlConfig, bridge: Arc<dyn ControlBridge>) -> Self {
        let authenticator = Arc::new(Authenticator::new());
        let manager = Arc::new(WebSocketManager::new());
        let router = Arc::new(Router::new(
            authenticator.clone(),
            bridge,
            manager.clone(),
        ));
        Self {
            config,
            authenticator,
            manager,
            router,
            running: tokio::sync::Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// Bind the listener, issue this run's credentials, and start
    /// accepting. Returns the bound address (useful when binding port 0).
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        let credentials = self.authenticator.issue_credentials();
        // The app shell shows these on-screen; standalone operators read
        // them from this line
        info!(
            "Control credentials for this run: {} / {}",
            credentials.username, credentials.password
        );

        self.manager.initialize()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let router = self.router.clone();
        let manager = self.manager.clone();
        let max_request_bytes = self.config.max_request_bytes;
        let accept_task = tokio::spawn(accept_loop(
            listener,
            router,
            manager,
            max_request_bytes,
            shutdown_rx,
        ));

        *running = Some(Running {
            shutdown: shutdown_tx,
            accept_task,
        });
        *self.local_addr.lock().unwrap() = Some(local_addr);

        info!("Control server listening on {}", local_addr);
        Ok(local_addr)
    }

    /// Stop accepting, wipe credentials, notify and close every
    /// WebSocket connection, and reset all state for the next run.
    pub async fn stop(&self) -> Result<(), ServerError> {
        let mut running = self.running.lock().await;
        let state = running.take().ok_or(ServerError::NotRunning)?;

        info!("Control server stopping");
        self.authenticator.clear_credentials();
        let _ = state.shutdown.send(true);

        self.manager.shutdown().await;

        if let Err(e) = state.accept_task.await {
            debug!("Accept loop ended abnormally: {}", e);
        }
        *self.local_addr.lock().unwrap() = None;

        info!("Control server stopped");
        Ok(())
    }

    /// Credentials for the current run, if the server is up.
    pub fn credentials(&self) -> Option<AuthCredentials> {
        self.authenticator.credentials()
    }

    /// Address the listener is bound to, if the server is up.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    pub fn is_running(&self) -> bool {
        self.local_addr().is_some()
    }

    /// Connection counters for the status display.
    pub fn stats(&self) -> ManagerStats {
        self.manager.stats()
    }
}

async fn accept_loop(
    listener: TcpListener,
    router: Arc<Router>,
    manager: Arc<WebSocketManager>,
    max_request_bytes: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                debug!("Accept loop stopping");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!("Accepted connection from {}", peer);
                        let router = router.clone();
                        let manager = manager.clone();
                        tokio::spawn(async move {
                            handle_socket(stream, router, manager, max_request_bytes).await;
                        });
                    }
                    Err(e) => warn!("Accept failed: {}", e),
                }
            }
        }
    }
}

/// One task per socket: read a request, answer it with a single write,
/// or hand the socket to the WebSocket layer on upgrade.
async fn handle_socket(
    mut stream: TcpStream,
    router: Arc<Router>,
    manager: Arc<WebSocketManager>,
    max_request_bytes: usize,
) {
    let raw = match timeout(
        Duration::from_secs(READ_TIMEOUT_SECS),
        read_raw_request(&mut stream, max_request_bytes),
    )
    .await
    {
        Err(_) => {
            debug!("Timed out reading a request");
            return;
        }
        Ok(Err(e)) => {
            debug!("Failed to read request: {}", e);
            return;
        }
        Ok(Ok(None)) => {
            write_once(
                stream,
                HttpResponse::error_json(400, "Bad Request", "Request too large"),
            )
            .await;
            return;
        }
        Ok(Ok(Some(raw))) => raw,
    };

    let request = match parse_http_request(&raw) {
        Some(request) => request,
        None => {
            write_once(
                stream,
                HttpResponse::error_json(400, "Bad Request", "Malformed HTTP request"),
            )
            .await;
            return;
        }
    };
    debug!("{} {}", request.method, request.path);

    match router.route(&request).await {
        RouteAction::Respond(response) => write_once(stream, response).await,
        RouteAction::Upgrade => upgrade(stream, request, manager).await,
    }
}

async fn upgrade(mut stream: TcpStream, request: HttpRequest, manager: Arc<WebSocketManager>) {
    if !manager.is_active() {
        write_once(
            stream,
            HttpResponse::error_json(
                503,
                "Service Unavailable",
                &ServerError::ShuttingDown.to_string(),
            ),
        )
        .await;
        return;
    }

    let response = match ws::handshake::upgrade_response(&request) {
        Ok(response) => response,
        Err(e) => {
            warn!("WebSocket upgrade failed: {}", e);
            write_once(
                stream,
                HttpResponse::error_json(400, "Bad Request", &e.to_string()),
            )
            .await;
            return;
        }
    };

    if let Err(e) = stream.write_all(&response.to_bytes()).await {
        debug!("Failed to write handshake response: {}", e);
        return;
    }

    let client_id = request.query_param("clientId").map(str::to_string);
    ws::connection::serve(stream, manager, client_id).await;
}

async fn write_once(mut stream: TcpStream, response: HttpResponse) {
    if let Err(e) = stream.write_all(&response.to_bytes()).await {
        debug!("Failed to write response: {}", e);
        return;
    }
    let _ = stream.shutdown().await;
}

/// Read one full request: headers to the blank line, then exactly
/// `Content-Length` body bytes. `Ok(None)` means the request blew the
/// size budget and deserves a 400.
async fn read_raw_request(
    stream: &mut TcpStream,
    max_bytes: usize,
) -> std::io::Result<Option<String>> {
    let mut buffer: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        if let Some(pos) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if buffer.len() > max_bytes {
            return Ok(None);
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        buffer.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buffer[..header_end]);
    let total = header_end + content_length(&head);
    if total > max_bytes {
        return Ok(None);
    }

    while buffer.len() < total {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
    buffer.truncate(total);

    Ok(Some(String::from_utf8_lossy(&buffer).into_owned()))
}

fn content_length(head: &str) -> usize {
    head.lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}
