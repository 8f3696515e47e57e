//! Browser-based API key acquisition
//!
//! One login attempt is a single-use challenge/response: generate a nonce,
//! listen on an ephemeral loopback port, send the user to the browser with
//! the port and nonce, then accept exactly one callback carrying a one-time
//! token. The token is exchanged for a durable key and persisted. The
//! worker races the accept against an overall timeout and a cancellation
//! token; the caller observes the outcome through a one-shot result slot
//! on its own schedule.

use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::store::CredentialStore;
use crate::error::{AppError, Result};

/// Page the browser lands on after a successful callback
const SUCCESS_REDIRECT: &str = "https://daydream.live/login/success";

/// Client identity sent with the key exchange
const CLIENT_NAME: &str = "daydream-client";

/// Grace period for joining the worker after cancellation
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Login flow configuration
#[derive(Debug, Clone)]
pub struct LoginOptions {
    /// API base URL for the token-for-key exchange
    pub api_url: String,
    /// Browser login page base URL
    pub login_url: String,
    /// Overall deadline for the callback to arrive
    pub timeout: Duration,
    /// Where to persist the acquired key
    pub store: CredentialStore,
}

impl LoginOptions {
    pub fn new(store: CredentialStore) -> Self {
        Self {
            api_url: "https://api.daydream.live".to_string(),
            login_url: "https://daydream.live/login".to_string(),
            timeout: Duration::from_secs(300),
            store,
        }
    }
}

/// Outcome slot observed by the poller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginStatus {
    Pending,
    Success(String),
    Failed(String),
}

/// One in-flight login attempt
pub struct LoginFlow {
    browser_url: String,
    state: String,
    port: u16,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    result_rx: oneshot::Receiver<LoginStatus>,
    resolved: Option<LoginStatus>,
}

impl LoginFlow {
    /// Bind the callback listener and start the background worker.
    pub async fn start(options: LoginOptions) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();

        let state: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();

        let browser_url = format!(
            "{}?port={}&state={}",
            options.login_url, port, state
        );

        let cancel = CancellationToken::new();
        let (result_tx, result_rx) = oneshot::channel();

        let worker_cancel = cancel.clone();
        let worker_state = state.clone();
        let task = tokio::spawn(async move {
            run_worker(listener, worker_state, options, worker_cancel, result_tx).await;
        });

        info!("Login callback listener on 127.0.0.1:{}", port);

        Ok(Self {
            browser_url,
            state,
            port,
            cancel,
            task: Some(task),
            result_rx,
            resolved: None,
        })
    }

    /// URL to open in the user's browser.
    pub fn browser_url(&self) -> &str {
        &self.browser_url
    }

    /// Loopback port the callback listener is bound to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Nonce the callback must echo in its `state` parameter. Exposed for
    /// hosts assembling their own login page URL.
    pub fn state(&self) -> &str {
        &self.state
    }

    /// Non-blocking check of the result slot.
    pub fn poll(&mut self) -> LoginStatus {
        if let Some(status) = &self.resolved {
            return status.clone();
        }
        match self.result_rx.try_recv() {
            Ok(status) => {
                self.resolved = Some(status.clone());
                status
            }
            Err(oneshot::error::TryRecvError::Empty) => LoginStatus::Pending,
            Err(oneshot::error::TryRecvError::Closed) => {
                let status = if self.cancel.is_cancelled() {
                    LoginStatus::Failed("login cancelled".to_string())
                } else {
                    LoginStatus::Failed("login worker exited unexpectedly".to_string())
                };
                self.resolved = Some(status.clone());
                status
            }
        }
    }

    /// Wait for the attempt to finish.
    pub async fn wait(&mut self) -> LoginStatus {
        if let Some(status) = &self.resolved {
            return status.clone();
        }
        let status = match (&mut self.result_rx).await {
            Ok(status) => status,
            Err(_) => {
                if self.cancel.is_cancelled() {
                    LoginStatus::Failed("login cancelled".to_string())
                } else {
                    LoginStatus::Failed("login worker exited unexpectedly".to_string())
                }
            }
        };
        self.resolved = Some(status.clone());
        status
    }

    /// Stop the listener and join the worker within a bounded grace period.
    ///
    /// Must be called (and awaited) before starting another attempt so no
    /// two listeners coexist.
    pub async fn cancel(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if tokio::time::timeout(CANCEL_GRACE, task).await.is_err() {
                warn!("Login worker did not stop within grace period");
            }
        }
    }
}

/// Serializes login attempts: starting a new one cancels and joins any
/// in-flight worker first, so no two callback listeners coexist.
#[derive(Default)]
pub struct LoginManager {
    active: Option<LoginFlow>,
}

impl LoginManager {
    pub fn new() -> Self {
        Self { active: None }
    }

    /// Tear down the previous attempt, then start a fresh one.
    pub async fn start(&mut self, options: LoginOptions) -> Result<&mut LoginFlow> {
        if let Some(mut prev) = self.active.take() {
            prev.cancel().await;
        }
        let flow = LoginFlow::start(options).await?;
        Ok(self.active.insert(flow))
    }

    /// The in-flight attempt, when one exists.
    pub fn current(&mut self) -> Option<&mut LoginFlow> {
        self.active.as_mut()
    }

    /// Cancel and join the in-flight attempt, when one exists.
    pub async fn cancel(&mut self) {
        if let Some(mut flow) = self.active.take() {
            flow.cancel().await;
        }
    }
}

async fn run_worker(
    listener: TcpListener,
    state: String,
    options: LoginOptions,
    cancel: CancellationToken,
    result_tx: oneshot::Sender<LoginStatus>,
) {
    let outcome = tokio::select! {
        _ = cancel.cancelled() => {
            // Listener dropped on return; cancellation is a clean exit.
            debug!("Login worker stopping on cancellation");
            return;
        }
        result = tokio::time::timeout(
            options.timeout,
            accept_and_exchange(&listener, &state, &options),
        ) => match result {
            Ok(Ok(key)) => LoginStatus::Success(key),
            Ok(Err(e)) => LoginStatus::Failed(e.to_string()),
            Err(_) => LoginStatus::Failed(
                AppError::Timeout("no login callback before the deadline".to_string())
                    .to_string(),
            ),
        },
    };

    let _ = result_tx.send(outcome);
}

/// Accept exactly one callback, validate it, exchange the one-time token
/// for a durable key and persist it.
async fn accept_and_exchange(
    listener: &TcpListener,
    expected_state: &str,
    options: &LoginOptions,
) -> Result<String> {
    let (mut socket, peer) = listener.accept().await?;
    debug!("Login callback connection from {}", peer);

    let query = match read_callback_query(&mut socket).await {
        Ok(q) => q,
        Err(e) => {
            respond_error(&mut socket, &e.to_string()).await;
            return Err(e);
        }
    };

    let token = query_param(&query, "token");
    let state = query_param(&query, "state");

    let token = match (token, state) {
        (Some(token), Some(state)) if state == expected_state => token,
        (_, Some(state)) if state != expected_state => {
            let e = AppError::Auth("callback state does not match".to_string());
            respond_error(&mut socket, &e.to_string()).await;
            return Err(e);
        }
        _ => {
            let e = AppError::Auth("callback missing token or state".to_string());
            respond_error(&mut socket, &e.to_string()).await;
            return Err(e);
        }
    };

    match exchange_token(&options.api_url, &token).await {
        Ok(key) => {
            options.store.save(&key)?;
            respond_redirect(&mut socket).await;
            info!("API key acquired and persisted");
            Ok(key)
        }
        Err(e) => {
            respond_error(&mut socket, &e.to_string()).await;
            Err(e)
        }
    }
}

/// Read the request head and return the query string of the GET target.
async fn read_callback_query(socket: &mut TcpStream) -> Result<String> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") || buf.len() > 16 * 1024 {
            break;
        }
    }

    let head = String::from_utf8_lossy(&buf);
    let request_line = head
        .lines()
        .next()
        .ok_or_else(|| AppError::Auth("empty callback request".to_string()))?;

    let mut parts = request_line.split(' ');
    let method = parts.next().unwrap_or("");
    let target = parts
        .next()
        .ok_or_else(|| AppError::Auth("malformed callback request line".to_string()))?;
    if method != "GET" {
        return Err(AppError::Auth(format!(
            "unexpected callback method {}",
            method
        )));
    }

    Ok(target
        .splitn(2, '?')
        .nth(1)
        .unwrap_or_default()
        .to_string())
}

fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        if k == name {
            urlencoding::decode(v).ok().map(|v| v.into_owned())
        } else {
            None
        }
    })
}

/// Exchange the one-time callback token for a durable API key.
async fn exchange_token(api_url: &str, token: &str) -> Result<String> {
    #[derive(serde::Deserialize)]
    struct KeyResponse {
        #[serde(rename = "apiKey")]
        api_key: String,
    }

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/v1/api-key", api_url.trim_end_matches('/')))
        .bearer_auth(token)
        .json(&serde_json::json!({
            "name": CLIENT_NAME,
            "user_type": CLIENT_NAME,
        }))
        .send()
        .await?;

    let status = resp.status();
    if !status.is_success() {
        return Err(AppError::Auth(format!(
            "key exchange rejected with {}",
            status
        )));
    }

    let body: KeyResponse = resp.json().await?;
    Ok(body.api_key)
}

async fn respond_redirect(socket: &mut TcpStream) {
    let response = format!(
        "HTTP/1.1 302 Found\r\nLocation: {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        SUCCESS_REDIRECT
    );
    if let Err(e) = socket.write_all(response.as_bytes()).await {
        debug!("Failed to write callback response: {}", e);
    }
}

async fn respond_error(socket: &mut TcpStream, message: &str) {
    let response = format!(
        "HTTP/1.1 400 Bad Request\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        message.len(),
        message
    );
    if let Err(e) = socket.write_all(response.as_bytes()).await {
        debug!("Failed to write callback response: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn options(dir: &std::path::Path, api_url: &str, timeout: Duration) -> LoginOptions {
        LoginOptions {
            api_url: api_url.to_string(),
            login_url: "https://daydream.live/login".to_string(),
            timeout,
            store: CredentialStore::at(dir.join("credentials")),
        }
    }

    async fn send_callback(port: u16, token: &str, state: &str) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let request = format!(
            "GET /callback?token={}&state={} HTTP/1.1\r\nHost: localhost\r\n\r\n",
            token, state
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    /// One-request fake of the key-exchange endpoint.
    async fn fake_key_server(key: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let body = format!("{{\"apiKey\":\"{}\"}}", key);
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = socket.write_all(response.as_bytes()).await;
        });
        url
    }

    #[tokio::test]
    async fn happy_path_persists_the_key() {
        let dir = tempdir().unwrap();
        let api_url = fake_key_server("sk-fresh").await;
        let opts = options(dir.path(), &api_url, Duration::from_secs(10));
        let store = opts.store.clone();

        let mut flow = LoginFlow::start(opts).await.unwrap();
        assert_eq!(flow.poll(), LoginStatus::Pending);
        assert!(flow.browser_url().contains(&format!("port={}", flow.port())));

        let state = flow.state().to_string();
        let response = send_callback(flow.port(), "one-time", &state).await;
        assert!(response.starts_with("HTTP/1.1 302"));
        assert!(response.contains(SUCCESS_REDIRECT));

        assert_eq!(flow.wait().await, LoginStatus::Success("sk-fresh".into()));
        assert_eq!(store.load().as_deref(), Some("sk-fresh"));
    }

    #[tokio::test]
    async fn mismatched_state_is_rejected_without_setting_a_credential() {
        let dir = tempdir().unwrap();
        let opts = options(dir.path(), "http://127.0.0.1:1", Duration::from_secs(10));
        let store = opts.store.clone();

        let mut flow = LoginFlow::start(opts).await.unwrap();
        let response = send_callback(flow.port(), "one-time", "not-the-nonce").await;
        assert!(response.starts_with("HTTP/1.1 400"));

        match flow.wait().await {
            LoginStatus::Failed(reason) => assert!(reason.contains("state")),
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(store.load().is_none());
    }

    #[tokio::test]
    async fn missing_parameters_are_rejected() {
        let dir = tempdir().unwrap();
        let opts = options(dir.path(), "http://127.0.0.1:1", Duration::from_secs(10));

        let mut flow = LoginFlow::start(opts).await.unwrap();
        let mut stream = TcpStream::connect(("127.0.0.1", flow.port())).await.unwrap();
        stream
            .write_all(b"GET /callback HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 400"));

        match flow.wait().await {
            LoginStatus::Failed(reason) => assert!(reason.contains("missing")),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn no_callback_times_out() {
        let dir = tempdir().unwrap();
        let opts = options(dir.path(), "http://127.0.0.1:1", Duration::from_millis(100));

        let mut flow = LoginFlow::start(opts).await.unwrap();
        match flow.wait().await {
            LoginStatus::Failed(reason) => assert!(reason.contains("Timed out")),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn starting_again_tears_down_the_previous_listener() {
        let dir = tempdir().unwrap();
        let mut manager = LoginManager::new();

        let first_port = manager
            .start(options(dir.path(), "http://127.0.0.1:1", Duration::from_secs(60)))
            .await
            .unwrap()
            .port();
        let second_port = manager
            .start(options(dir.path(), "http://127.0.0.1:1", Duration::from_secs(60)))
            .await
            .unwrap()
            .port();

        // The first worker was cancelled and joined, so its listener is
        // gone; only the second attempt accepts.
        assert!(TcpStream::connect(("127.0.0.1", first_port)).await.is_err());
        TcpStream::connect(("127.0.0.1", second_port)).await.unwrap();

        assert!(manager.current().is_some());
        manager.cancel().await;
        assert!(manager.current().is_none());
    }

    #[tokio::test]
    async fn cancellation_joins_the_worker_cleanly() {
        let dir = tempdir().unwrap();
        let opts = options(dir.path(), "http://127.0.0.1:1", Duration::from_secs(60));

        let mut flow = LoginFlow::start(opts).await.unwrap();
        flow.cancel().await;
        assert_eq!(
            flow.poll(),
            LoginStatus::Failed("login cancelled".to_string())
        );

        // The port is released, so a fresh attempt can bind again.
        let opts = options(dir.path(), "http://127.0.0.1:1", Duration::from_secs(60));
        let mut next = LoginFlow::start(opts).await.unwrap();
        next.cancel().await;
    }
}
