//! Intercepting HTTPS proxy
//!
//! Clients such as GitHub Copilot are pointed at this listener as their
//! HTTPS proxy. `CONNECT` tunnels are terminated with a certificate issued
//! by the local CA for the requested host, so the requests inside them can
//! be read, passed through the PII pipeline and forwarded upstream.
//! Requests sent to the listener directly are routed by path.

pub mod http;
pub mod routes;

use crate::core::certs::{CertificateAuthority, CertificateError};
use crate::core::constants::COPILOT_PROVIDER;
use crate::db::Database;
use crate::pipeline::pii::restore_pii_json;
use crate::pipeline::stream::{Framing, StreamProcessor, process_stream};
use crate::pipeline::{PipelineContext, PipelineFactory, SystemMessageStyle};
use bytes::Bytes;
use self::http::{HOP_BY_HOP, HttpConnection, Request, RequestHead, response_has_body};
use serde_json::Value;
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const CONNECT_TIMEOUT_SECS: u64 = 30;

const CONNECT_ESTABLISHED: &[u8] =
    b"HTTP/1.1 200 Connection Established\r\nProxy-Agent: CodeGate\r\nConnection: keep-alive\r\n\r\n";

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    BadRequest(String),

    #[error("Request body too large")]
    TooLarge,

    #[error("No route for path: {0}")]
    NoRoute(String),

    #[error("{0}")]
    Upstream(String),

    #[error(transparent)]
    Certificate(#[from] CertificateError),
}

impl ProxyError {
    /// Status sent to the client, `None` when the connection itself failed
    pub fn status(&self) -> Option<u16> {
        match self {
            ProxyError::Io(_) => None,
            ProxyError::BadRequest(_) => Some(400),
            ProxyError::NoRoute(_) => Some(404),
            ProxyError::TooLarge => Some(413),
            ProxyError::Upstream(_) | ProxyError::Certificate(_) => Some(502),
        }
    }
}

/// State for one exchange that went through the input pipeline
struct Intercepted {
    context: PipelineContext,
    prompt_id: Option<String>,
}

pub struct ProxyServer {
    ca: Arc<CertificateAuthority>,
    pipelines: Arc<PipelineFactory>,
    db: Arc<Database>,
    client: reqwest::Client,
}

impl ProxyServer {
    pub fn new(
        ca: Arc<CertificateAuthority>,
        pipelines: Arc<PipelineFactory>,
        db: Arc<Database>,
    ) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| ProxyError::Upstream(e.to_string()))?;

        Ok(Self {
            ca,
            pipelines,
            db,
            client,
        })
    }

    /// Accept TLS clients until `shutdown` fires
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), ProxyError> {
        let acceptor = TlsAcceptor::from(self.ca.server_tls_config()?);
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "Proxy listening");
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Proxy shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((tcp, peer)) => {
                        let server = self.clone();
                        let acceptor = acceptor.clone();
                        tokio::spawn(async move {
                            server.handle_tcp(acceptor, tcp, peer).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "Failed to accept proxy connection"),
                },
            }
        }
    }

    async fn handle_tcp(&self, acceptor: TlsAcceptor, tcp: TcpStream, peer: SocketAddr) {
        debug!(%peer, "Proxy client connected");
        match acceptor.accept(tcp).await {
            Ok(tls) => {
                if let Err(e) = self.serve_client(tls).await {
                    debug!(%peer, error = %e, "Proxy connection ended with error");
                }
            }
            Err(e) => debug!(%peer, error = %e, "TLS handshake with client failed"),
        }
    }

    /// Serve requests sent to the proxy itself, including `CONNECT`
    pub async fn serve_client<S>(&self, stream: S) -> Result<(), ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut conn = HttpConnection::new(stream);
        loop {
            let request = match conn.read_request().await {
                Ok(Some(request)) => request,
                Ok(None) => return Ok(()),
                Err(e) => return fail(&mut conn, e).await,
            };

            if request.head.method.eq_ignore_ascii_case("CONNECT") {
                return self.handle_connect(conn, request.head).await;
            }

            let close = request.head.wants_close();
            let path = request.head.path();
            let Some(url) = routes::target_url(request.head.header("authorization"), &path) else {
                warn!(%path, "No route found");
                return fail(&mut conn, ProxyError::NoRoute(path)).await;
            };

            if let Err(e) = self.forward(&mut conn, request, url, false).await {
                return fail(&mut conn, e).await;
            }
            if close {
                return Ok(());
            }
        }
    }

    async fn handle_connect<S>(&self, mut conn: HttpConnection<S>, head: RequestHead) -> Result<(), ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let Some((host, port)) = routes::parse_connect_target(&head.target) else {
            return fail(
                &mut conn,
                ProxyError::BadRequest(format!("Invalid CONNECT path: {}", head.target)),
            )
            .await;
        };

        let tls_config = match self.ca.domain_certificate(&host) {
            Ok(config) => config,
            Err(e) => return fail(&mut conn, e.into()).await,
        };

        debug!(%host, port, "CONNECT tunnel established");
        conn.write_all(CONNECT_ESTABLISHED).await?;

        // The client may have started its handshake before reading our reply
        let (stream, read_ahead) = conn.into_parts();
        if !read_ahead.is_empty() {
            debug!(%host, bytes = read_ahead.len(), "Replaying data sent ahead of the tunnel");
        }
        let (reader, writer) = tokio::io::split(stream);
        let stream = tokio::io::join(Cursor::new(read_ahead).chain(reader), writer);

        let tls = TlsAcceptor::from(tls_config).accept(stream).await?;
        self.serve_tunnel(tls, &host, port).await
    }

    /// Serve the HTTP/1.1 requests a client sends inside a tunnel
    async fn serve_tunnel<S>(&self, stream: S, host: &str, port: u16) -> Result<(), ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let authority = if port == 443 {
            host.to_string()
        } else {
            format!("{}:{}", host, port)
        };

        let mut conn = HttpConnection::new(stream);
        loop {
            let request = match conn.read_request().await {
                Ok(Some(request)) => request,
                Ok(None) => return Ok(()),
                Err(e) => return fail(&mut conn, e).await,
            };

            let close = request.head.wants_close();
            let url = format!("https://{}/{}", authority, request.head.path());
            if let Err(e) = self.forward(&mut conn, request, url, true).await {
                return fail(&mut conn, e).await;
            }
            if close {
                return Ok(());
            }
        }
    }

    async fn forward<S>(
        &self,
        conn: &mut HttpConnection<S>,
        request: Request,
        url: String,
        tunneled: bool,
    ) -> Result<(), ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let Request { head, body } = request;
        debug!(method = %head.method, %url, "Forwarding proxied request");

        let (body, intercepted) = if tunneled && is_chat_completion(&head) {
            self.intercept(body).await
        } else {
            (body, None)
        };

        let method = reqwest::Method::from_bytes(head.method.as_bytes())
            .map_err(|_| ProxyError::BadRequest(format!("Invalid method: {}", head.method)))?;

        let mut builder = self.client.request(method, &url);
        for (name, value) in &head.headers {
            if skip_request_header(name, intercepted.is_some()) {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        // reqwest sets Content-Length from the (possibly rewritten) body
        builder = builder.body(body);

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                if let Some(ref intercepted) = intercepted {
                    self.pipelines.finish(&intercepted.context);
                }
                error!(%url, error = %e, "Upstream request failed");
                return Err(ProxyError::Upstream(e.to_string()));
            }
        };

        let status = response.status();
        let reason = status.canonical_reason().unwrap_or("");
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| Some((name.as_str().to_string(), value.to_str().ok()?.to_string())))
            .collect();

        if !response_has_body(&head.method, status.as_u16()) {
            if let Some(ref intercepted) = intercepted {
                self.pipelines.finish(&intercepted.context);
            }
            return conn.write_head(status.as_u16(), reason, &headers).await;
        }

        let Some(Intercepted { context, prompt_id }) = intercepted else {
            return conn
                .write_chunked(status.as_u16(), reason, &headers, Box::pin(response.bytes_stream()))
                .await;
        };

        if is_event_stream(&headers) {
            let processor = StreamProcessor::new(Framing::Sse, self.pipelines.create_output_pipeline(), context);
            let db = self.db.clone();
            let pipelines = self.pipelines.clone();
            let stream = process_stream(Box::pin(response.bytes_stream()), processor, move |chunks, context| {
                if let Some(prompt_id) = prompt_id {
                    if let Err(e) = db.record_output(&prompt_id, &Value::Array(chunks).to_string()) {
                        error!(error = %e, "Failed to record proxied output");
                    }
                }
                pipelines.finish(&context);
            });
            return conn
                .write_chunked(status.as_u16(), reason, &headers, Box::pin(stream))
                .await;
        }

        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                self.pipelines.finish(&context);
                return Err(ProxyError::Upstream(e.to_string()));
            }
        };
        let bytes = match serde_json::from_slice::<Value>(&bytes) {
            Ok(mut value) => {
                if let Some(ref prompt_id) = prompt_id {
                    if let Err(e) = self.db.record_output(prompt_id, &value.to_string()) {
                        error!(error = %e, "Failed to record proxied output");
                    }
                }
                restore_pii_json(self.pipelines.sensitive(), &context.session_id, &mut value);
                Bytes::from(value.to_string())
            }
            Err(_) => bytes,
        };
        self.pipelines.finish(&context);

        let body = futures::stream::iter([Ok::<_, std::io::Error>(bytes)]);
        conn.write_chunked(status.as_u16(), reason, &headers, body).await
    }

    /// Run a chat request body through the input pipeline and record it
    ///
    /// Bodies that are not JSON objects are forwarded untouched.
    async fn intercept(&self, body: Bytes) -> (Bytes, Option<Intercepted>) {
        let request = match serde_json::from_slice::<Value>(&body) {
            Ok(request) if request.is_object() => request,
            _ => return (body, None),
        };

        let mut context = PipelineContext::new(SystemMessageStyle::Message);
        let request = self
            .pipelines
            .create_input_pipeline()
            .run(request, &mut context)
            .await;

        let prompt_id = match self
            .db
            .record_prompt(Some(COPILOT_PROVIDER), &request.to_string(), "chat")
        {
            Ok(prompt) => {
                for alert in context.alerts_for_prompt(&prompt.id) {
                    if let Err(e) = self.db.record_alert(&alert) {
                        error!(error = %e, "Failed to record alert");
                    }
                }
                Some(prompt.id)
            }
            Err(e) => {
                error!(error = %e, "Failed to record proxied prompt");
                None
            }
        };

        let body = Bytes::from(request.to_string());
        (body, Some(Intercepted { context, prompt_id }))
    }
}

/// Write the error response for `e` and end the connection
async fn fail<S>(conn: &mut HttpConnection<S>, e: ProxyError) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some(status) = e.status() else {
        return Err(e);
    };
    warn!(status, error = %e, "Proxy request failed");
    conn.write_error(status, &e.to_string()).await
}

fn is_chat_completion(head: &RequestHead) -> bool {
    head.method.eq_ignore_ascii_case("POST")
        && head
            .path()
            .split('?')
            .next()
            .is_some_and(|path| path.ends_with("chat/completions"))
}

fn is_event_stream(headers: &[(String, String)]) -> bool {
    headers
        .iter()
        .any(|(n, v)| n.eq_ignore_ascii_case("content-type") && v.contains("text/event-stream"))
}

fn skip_request_header(name: &str, intercepted: bool) -> bool {
    name.eq_ignore_ascii_case("host")
        || name.eq_ignore_ascii_case("content-length")
        || HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
        // keep intercepted responses readable by the output pipeline
        || (intercepted && name.eq_ignore_ascii_case("accept-encoding"))
}
