use crate::types::AuthorizationResponse;
use crate::{OAuthError, Result};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};
use warp::http::StatusCode;
use warp::{Filter, Reply};

/// Path the authorization server redirects the browser to.
pub const CALLBACK_PATH: &str = "/oauth/callback";

/// Upper bound for a single `/wait-for-auth` long-poll.
pub const LONG_POLL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct CallbackOptions {
    /// Host used in the redirect URL. IP literals are also used for binding;
    /// names such as `localhost` bind the loopback interface.
    pub host: String,
    /// Preferred port, 0 for OS-assigned.
    pub port: u16,
    /// When set, callbacks carrying a different `state` are rejected.
    pub expected_state: Option<String>,
    pub long_poll_timeout: Duration,
}

impl Default for CallbackOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 0,
            expected_state: None,
            long_poll_timeout: LONG_POLL_TIMEOUT,
        }
    }
}

struct CallbackState {
    completion: watch::Sender<Option<AuthorizationResponse>>,
    expected_state: Option<String>,
    long_poll_timeout: Duration,
}

impl CallbackState {
    fn is_completed(&self) -> bool {
        self.completion.borrow().is_some()
    }
}

/// Ephemeral local HTTP endpoint receiving the authorization-code redirect.
///
/// The first valid callback resolves the completion signal; later hits see
/// the same completed state. `close()` may be called any number of times.
pub struct CallbackListener {
    addr: SocketAddr,
    host: String,
    completion: watch::Receiver<Option<AuthorizationResponse>>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CallbackListener {
    /// Bind the listener. If the preferred port is taken, an OS-assigned
    /// port is used instead.
    pub async fn bind(options: CallbackOptions) -> Result<Self> {
        let (completion_tx, completion_rx) = watch::channel(None);
        let state = Arc::new(CallbackState {
            completion: completion_tx,
            expected_state: options.expected_state.clone(),
            long_poll_timeout: options.long_poll_timeout,
        });

        let ip = bind_ip(&options.host);
        let (addr, shutdown, task) = match serve(state.clone(), SocketAddr::new(ip, options.port)) {
            Ok(bound) => bound,
            Err(e) if options.port != 0 => {
                warn!(
                    "Callback port {} unavailable ({}), falling back to an ephemeral port",
                    options.port, e
                );
                serve(state, SocketAddr::new(ip, 0))?
            }
            Err(e) => return Err(e),
        };

        info!("OAuth callback listener on {}", addr);

        Ok(Self {
            addr,
            host: options.host,
            completion: completion_rx,
            shutdown: Mutex::new(Some(shutdown)),
            task: Mutex::new(Some(task)),
        })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn redirect_url(&self) -> String {
        format!("http://{}:{}{}", self.host, self.port(), CALLBACK_PATH)
    }

    pub fn is_completed(&self) -> bool {
        self.completion.borrow().is_some()
    }

    /// Resolves once a valid callback has been received.
    pub async fn wait_for_code(&self) -> Result<AuthorizationResponse> {
        let mut rx = self.completion.clone();
        let response = rx
            .wait_for(|value| value.is_some())
            .await
            .map_err(|_| OAuthError::CallbackServer("Callback listener stopped".to_string()))?
            .clone();

        response.ok_or_else(|| OAuthError::CallbackServer("Callback listener stopped".to_string()))
    }

    pub fn close(&self) {
        let shutdown = self.shutdown.lock().ok().and_then(|mut guard| guard.take());
        let task = self.task.lock().ok().and_then(|mut guard| guard.take());

        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(());
            debug!("Closed OAuth callback listener on {}", self.addr);
        }
        // Open long-polls would otherwise hold graceful shutdown for up to 30s.
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl Drop for CallbackListener {
    fn drop(&mut self) {
        self.close();
    }
}

fn bind_ip(host: &str) -> IpAddr {
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse()
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

fn serve(
    state: Arc<CallbackState>,
    addr: SocketAddr,
) -> Result<(SocketAddr, oneshot::Sender<()>, JoinHandle<()>)> {
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let (bound, server) = warp::serve(routes(state))
        .try_bind_with_graceful_shutdown(addr, async {
            let _ = shutdown_rx.await;
        })
        .map_err(|e| OAuthError::CallbackServer(format!("Failed to bind {}: {}", addr, e)))?;

    Ok((bound, shutdown_tx, tokio::spawn(server)))
}

fn routes(
    state: Arc<CallbackState>,
) -> impl Filter<Extract = impl Reply, Error = warp::Rejection> + Clone + Send + Sync + 'static {
    let with_state = warp::any().map(move || state.clone());

    let callback = warp::path!("oauth" / "callback")
        .and(warp::get())
        .and(warp::query::<HashMap<String, String>>())
        .and(with_state.clone())
        .map(handle_callback);

    let wait = warp::path!("wait-for-auth")
        .and(warp::get())
        .and(warp::query::<HashMap<String, String>>())
        .and(with_state)
        .and_then(handle_wait);

    let health = warp::path!("health")
        .and(warp::get())
        .map(|| warp::reply::with_status("ok", StatusCode::OK));

    callback.or(wait).or(health)
}

fn handle_callback(
    params: HashMap<String, String>,
    state: Arc<CallbackState>,
) -> warp::reply::Response {
    if let Some(error) = params.get("error") {
        let description = params
            .get("error_description")
            .map(String::as_str)
            .unwrap_or("No description provided");
        warn!("OAuth authorization error: {} - {}", error, description);
        return html(StatusCode::BAD_REQUEST, error_page(error, description));
    }

    if state.is_completed() {
        debug!("Duplicate OAuth callback ignored");
        return html(StatusCode::OK, success_page());
    }

    let Some(code) = params.get("code") else {
        warn!("Missing authorization code in callback");
        return html(
            StatusCode::BAD_REQUEST,
            error_page("invalid_request", "Missing authorization code"),
        );
    };

    let returned_state = params.get("state").cloned();
    if let Some(expected) = &state.expected_state {
        if returned_state.as_deref() != Some(expected.as_str()) {
            warn!("OAuth callback state mismatch");
            return html(
                StatusCode::BAD_REQUEST,
                error_page("invalid_state", "State parameter mismatch"),
            );
        }
    }

    let response = AuthorizationResponse {
        code: code.clone(),
        state: returned_state,
    };
    state.completion.send_if_modified(|current| {
        if current.is_none() {
            *current = Some(response);
            true
        } else {
            false
        }
    });

    info!("Received OAuth authorization code");
    html(StatusCode::OK, success_page())
}

async fn handle_wait(
    params: HashMap<String, String>,
    state: Arc<CallbackState>,
) -> std::result::Result<warp::reply::Response, Infallible> {
    if state.is_completed() {
        return Ok(plain(StatusCode::OK, "Authorization completed"));
    }

    if params.get("poll").map(String::as_str) == Some("false") {
        return Ok(plain(StatusCode::ACCEPTED, "Authorization pending"));
    }

    let mut rx = state.completion.subscribe();
    let completed = timeout(state.long_poll_timeout, rx.wait_for(|value| value.is_some()))
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false);

    if completed {
        Ok(plain(StatusCode::OK, "Authorization completed"))
    } else {
        Ok(plain(StatusCode::ACCEPTED, "Authorization pending"))
    }
}

fn html(status: StatusCode, body: String) -> warp::reply::Response {
    warp::reply::with_status(warp::reply::html(body), status).into_response()
}

fn plain(status: StatusCode, body: &'static str) -> warp::reply::Response {
    warp::reply::with_status(body, status).into_response()
}

fn success_page() -> String {
    r#"<!DOCTYPE html>
<html>
<head>
    <title>Authorization Complete</title>
    <style>
        body { font-family: Arial, sans-serif; text-align: center; margin-top: 50px; }
        .success { color: #28a745; }
    </style>
</head>
<body>
    <h1 class="success">Authorization Complete</h1>
    <p>You can close this window and return to the application.</p>
</body>
</html>"#
        .to_string()
}

fn error_page(error: &str, description: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Authorization Failed</title>
    <style>
        body {{ font-family: Arial, sans-serif; text-align: center; margin-top: 50px; }}
        .error {{ color: #dc3545; }}
    </style>
</head>
<body>
    <h1 class="error">Authorization Failed</h1>
    <p class="error"><strong>Error:</strong> {}</p>
    <p>{}</p>
    <p>Please return to the application and try again.</p>
</body>
</html>"#,
        html_escape(error),
        html_escape(description)
    )
}

fn html_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;")
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn listener(expected_state: Option<&str>) -> CallbackListener {
        CallbackListener::bind(CallbackOptions {
            host: "127.0.0.1".to_string(),
            port: 0,
            expected_state: expected_state.map(str::to_string),
            long_poll_timeout: Duration::from_millis(200),
        })
        .await
        .unwrap()
    }

    fn url(listener: &CallbackListener, path: &str) -> String {
        format!("http://{}{}", listener.local_addr(), path)
    }

    #[test]
    fn test_html_escape() {
        assert_eq!(html_escape("Hello World"), "Hello World");
        assert_eq!(
            html_escape("<script>alert('xss')</script>"),
            "&lt;script&gt;alert(&#x27;xss&#x27;)&lt;/script&gt;"
        );
        assert_eq!(html_escape("AT&T"), "AT&amp;T");
    }

    #[tokio::test]
    async fn test_health_and_redirect_url() {
        let listener = listener(None).await;
        assert!(listener.port() > 0);
        assert_eq!(
            listener.redirect_url(),
            format!("http://127.0.0.1:{}/oauth/callback", listener.port())
        );

        let resp = reqwest::get(url(&listener, "/health")).await.unwrap();
        assert_eq!(resp.status(), 200);
    }

    #[tokio::test]
    async fn test_error_callback_keeps_signal_unresolved() {
        let listener = listener(None).await;

        let resp = reqwest::get(url(
            &listener,
            "/oauth/callback?error=access_denied&error_description=nope",
        ))
        .await
        .unwrap();
        assert_eq!(resp.status(), 400);
        assert!(!listener.is_completed());

        let resp = reqwest::get(url(&listener, "/wait-for-auth?poll=false"))
            .await
            .unwrap();
        assert_eq!(resp.status(), 202);
    }

    #[tokio::test]
    async fn test_callback_resolves_once() {
        let listener = listener(Some("xyz")).await;

        let resp = reqwest::get(url(&listener, "/oauth/callback?code=abc&state=xyz"))
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert!(resp.text().await.unwrap().contains("Authorization Complete"));

        let second = reqwest::get(url(&listener, "/oauth/callback?code=other&state=xyz"))
            .await
            .unwrap();
        assert_eq!(second.status(), 200);

        let response = listener.wait_for_code().await.unwrap();
        assert_eq!(response.code, "abc");
        assert_eq!(response.state.as_deref(), Some("xyz"));

        let resp = reqwest::get(url(&listener, "/wait-for-auth")).await.unwrap();
        assert_eq!(resp.status(), 200);
    }

    #[tokio::test]
    async fn test_state_mismatch_is_rejected() {
        let listener = listener(Some("expected")).await;

        let resp = reqwest::get(url(&listener, "/oauth/callback?code=abc&state=forged"))
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        assert!(!listener.is_completed());
    }

    #[tokio::test]
    async fn test_long_poll_times_out_then_resolves() {
        let listener = listener(None).await;

        let resp = reqwest::get(url(&listener, "/wait-for-auth")).await.unwrap();
        assert_eq!(resp.status(), 202);

        let poll_url = url(&listener, "/wait-for-auth");
        let pending = tokio::spawn(async move { reqwest::get(poll_url).await.unwrap().status() });
        tokio::time::sleep(Duration::from_millis(50)).await;
        reqwest::get(url(&listener, "/oauth/callback?code=abc"))
            .await
            .unwrap();

        assert_eq!(pending.await.unwrap(), 200);
    }

    #[tokio::test]
    async fn test_port_in_use_falls_back_to_ephemeral() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let busy_port = taken.local_addr().unwrap().port();

        let listener = CallbackListener::bind(CallbackOptions {
            host: "127.0.0.1".to_string(),
            port: busy_port,
            ..Default::default()
        })
        .await
        .unwrap();

        assert_ne!(listener.port(), busy_port);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let listener = listener(None).await;
        let health = url(&listener, "/health");

        listener.close();
        listener.close();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(reqwest::get(health).await.is_err());
    }
}
