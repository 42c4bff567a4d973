use std::time::Duration;

use deviant_core::{OAuthClient, OAuthError, PersistenceError, TokenStore};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use url::Url;

const CALLBACK_PATH: &str = "/callback";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(180);
const READ_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum AuthorizeError {
    #[error("oauth error: {0}")]
    OAuth(#[from] OAuthError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("authorization denied: {0}")]
    Denied(String),
    #[error("authorization code missing in redirect")]
    MissingCode,
    #[error("token response did not include a refresh_token")]
    MissingRefreshToken,
    #[error("timed out waiting for the authorization callback")]
    Timeout,
}

enum Callback {
    Code(String),
    Denied(String),
    Empty,
}

/// One-time authorization-code flow over a loopback redirect.
pub struct AuthorizeFlow {
    client: OAuthClient,
    port: u16,
    scopes: String,
    timeout: Duration,
}

impl AuthorizeFlow {
    pub fn new(client: OAuthClient, port: u16, scopes: impl Into<String>) -> Self {
        Self {
            client,
            port,
            scopes: scopes.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Runs the flow and stores the obtained refresh token.
    pub async fn authorize(&self, store: &dyn TokenStore) -> Result<String, AuthorizeError> {
        let listener = TcpListener::bind(("127.0.0.1", self.port)).await?;
        self.complete(listener, store).await
    }

    /// Same as [`authorize`](Self::authorize) on an already bound listener.
    pub async fn complete(
        &self,
        listener: TcpListener,
        store: &dyn TokenStore,
    ) -> Result<String, AuthorizeError> {
        let port = listener.local_addr()?.port();
        let redirect_uri = format!("http://127.0.0.1:{port}{CALLBACK_PATH}");
        let scope = Some(self.scopes.as_str()).filter(|scope| !scope.trim().is_empty());
        let url = self.client.authorize_url(&redirect_uri, scope, None)?;

        println!("Open this URL in a browser to authorize featured-sync:");
        println!("{url}");
        println!();
        tracing::info!(%redirect_uri, scopes = %self.scopes, "waiting for authorization callback");

        let code = tokio::time::timeout(self.timeout, wait_for_code(&listener))
            .await
            .map_err(|_| AuthorizeError::Timeout)??;

        tracing::info!("exchanging authorization code");
        let token = self.client.exchange_code(&code, &redirect_uri).await?;
        let refresh_token = token
            .refresh_token
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or(AuthorizeError::MissingRefreshToken)?;
        // Printed before saving: the code is spent, so a failed save must not lose it.
        println!("Refresh token: {refresh_token}");
        store.save(&refresh_token)?;
        tracing::info!(
            expires_in = token.expires_in,
            scope = token.scope.as_deref().unwrap_or_default(),
            "refresh token stored"
        );
        Ok(refresh_token)
    }
}

async fn wait_for_code(listener: &TcpListener) -> Result<String, AuthorizeError> {
    loop {
        let (mut stream, _) = listener.accept().await?;
        let mut request = vec![0u8; 8192];
        let read = tokio::time::timeout(READ_TIMEOUT, stream.read(&mut request))
            .await
            .map_err(|_| AuthorizeError::Timeout)??;
        let request_text = String::from_utf8_lossy(&request[..read]);

        match parse_callback(&request_text) {
            None => {
                respond(&mut stream, "404 Not Found", "Not Found").await;
            }
            Some(Callback::Code(code)) => {
                respond(
                    &mut stream,
                    "200 OK",
                    "<h2>Authorization received.</h2><p>You can close this tab and return to the terminal.</p>",
                )
                .await;
                return Ok(code);
            }
            Some(Callback::Denied(error)) => {
                respond(
                    &mut stream,
                    "200 OK",
                    "<h2>Authorization was denied.</h2><p>Check the terminal for details.</p>",
                )
                .await;
                return Err(AuthorizeError::Denied(error));
            }
            Some(Callback::Empty) => {
                respond(
                    &mut stream,
                    "200 OK",
                    "<h2>No authorization code received.</h2><p>Check the terminal for details.</p>",
                )
                .await;
                return Err(AuthorizeError::MissingCode);
            }
        }
    }
}

async fn respond(stream: &mut TcpStream, status: &str, body: &str) {
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

/// `None` for anything that is not a request to the callback path.
fn parse_callback(request: &str) -> Option<Callback> {
    let request_line = request.lines().next()?;
    let target = request_line.split_whitespace().nth(1)?;
    let request_url = Url::parse(&format!("http://127.0.0.1{target}")).ok()?;
    if request_url.path() != CALLBACK_PATH {
        return None;
    }
    let mut code = None;
    let mut error = None;
    for (key, value) in request_url.query_pairs() {
        match key.as_ref() {
            "code" if !value.is_empty() => code = Some(value.into_owned()),
            "error" => error = Some(value.into_owned()),
            _ => {}
        }
    }
    Some(match (error, code) {
        (Some(error), _) => Callback::Denied(error),
        (None, Some(code)) => Callback::Code(code),
        (None, None) => Callback::Empty,
    })
}
