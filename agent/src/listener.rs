//! # Agent Proxy Listener
//!
//! Presents a conventional HTTP forward/CONNECT proxy on loopback (spec
//! §4.3). One task per accepted client socket, built the way the teacher's
//! connection-handling tasks are built, but the request-line/header parse
//! (`httparse`) is done directly over a raw `TcpListener` rather than
//! through a web framework's routing, since the listener must distinguish
//! `CONNECT`, `Upgrade: websocket`, and plain HTTP before any routing
//! would apply.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tunnel_protocol::WsFrameKind;

use crate::channel::{HttpRequestSpec, TunnelClient};
use crate::error::RequestError;

const MAX_HEAD_BYTES: usize = 32 * 1024;
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;
const TCP_READ_BUFFER: usize = 32 * 1024;

pub async fn run(listener: TcpListener, client: Arc<TunnelClient>, cancellation: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            _ = cancellation.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let client = client.clone();
                        let child = cancellation.child_token();
                        tokio::spawn(async move {
                            if let Err(e) = handle_client(stream, client, child).await {
                                debug!(%peer, error = %e, "proxy client connection ended");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        }
    }
}

struct ParsedHead {
    method: String,
    target: String,
    headers: HashMap<String, Vec<String>>,
    head_len: usize,
}

async fn handle_client(
    mut stream: TcpStream,
    client: Arc<TunnelClient>,
    cancellation: CancellationToken,
) -> std::io::Result<()> {
    let peeked = peek_request_head(&stream).await?;
    let head = parse_head(&peeked)?;

    if head.method.eq_ignore_ascii_case("CONNECT") {
        handle_connect(stream, head, client, cancellation).await
    } else if is_websocket_upgrade(&head.headers) {
        handle_websocket(stream, head, client, cancellation).await
    } else {
        // Plain HTTP: actually consume the head now that we've parsed it.
        let mut head_buf = vec![0u8; head.head_len];
        stream.read_exact(&mut head_buf).await?;
        handle_http(stream, head, client).await
    }
}

async fn peek_request_head(stream: &TcpStream) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; 8192];
    loop {
        stream.readable().await?;
        let n = match stream.peek(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        };
        if n == 0 {
            return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "client closed before sending a request"));
        }
        if find_double_crlf(&buf[..n]).is_some() {
            buf.truncate(n);
            return Ok(buf);
        }
        if n == buf.len() {
            if buf.len() >= MAX_HEAD_BYTES {
                return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "request head too large"));
            }
            buf.resize((buf.len() * 2).min(MAX_HEAD_BYTES), 0);
        }
    }
}

fn find_double_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_head(buf: &[u8]) -> std::io::Result<ParsedHead> {
    let mut raw_headers = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut raw_headers);
    let status = req
        .parse(buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    let head_len = match status {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "incomplete request head"))
        }
    };
    let method = req.method.unwrap_or("GET").to_string();
    let target = req.path.unwrap_or("/").to_string();
    let mut headers: HashMap<String, Vec<String>> = HashMap::new();
    for header in req.headers.iter() {
        if header.name.is_empty() {
            continue;
        }
        let name = header.name.to_ascii_lowercase();
        let value = String::from_utf8_lossy(header.value).into_owned();
        headers.entry(name).or_default().push(value);
    }
    Ok(ParsedHead { method, target, headers, head_len })
}

fn is_websocket_upgrade(headers: &HashMap<String, Vec<String>>) -> bool {
    headers
        .get("upgrade")
        .into_iter()
        .flatten()
        .any(|v| v.eq_ignore_ascii_case("websocket"))
}

fn header_value<'a>(headers: &'a HashMap<String, Vec<String>>, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|values| values.first()).map(|s| s.as_str())
}

/// Resolves an absolute URL for a request whose target may already be
/// absolute-form (forward-proxy convention) or origin-form (falls back to
/// the `Host` header).
fn absolute_url(target: &str, headers: &HashMap<String, Vec<String>>, default_scheme: &str) -> String {
    if target.starts_with("http://") || target.starts_with("https://") || target.starts_with("ws://") || target.starts_with("wss://") {
        return target.to_string();
    }
    let host = header_value(headers, "host").unwrap_or("");
    format!("{default_scheme}://{host}{target}")
}

async fn handle_http(mut stream: TcpStream, head: ParsedHead, client: Arc<TunnelClient>) -> std::io::Result<()> {
    let body = match header_value(&head.headers, "content-length").and_then(|v| v.parse::<usize>().ok()) {
        Some(len) if len > 0 => {
            if len > MAX_BODY_BYTES {
                write_simple_response(&mut stream, 413, "Payload Too Large").await?;
                return Ok(());
            }
            let mut body = vec![0u8; len];
            stream.read_exact(&mut body).await?;
            body
        }
        _ => Vec::new(),
    };

    let url = absolute_url(&head.target, &head.headers, "http");
    let request = HttpRequestSpec {
        method: head.method,
        url,
        headers: head.headers,
        body,
    };

    match client.send_request(request).await {
        Ok(response) => write_http_response(&mut stream, response.status, &response.headers, &response.body).await,
        Err(err) => {
            warn!(error = %err, "tunnel request failed");
            write_simple_response(&mut stream, 502, "Bad Gateway").await
        }
    }
}

async fn write_http_response(
    stream: &mut TcpStream,
    status: u16,
    headers: &HashMap<String, Vec<String>>,
    body: &[u8],
) -> std::io::Result<()> {
    let mut out = format!("HTTP/1.1 {status} {}\r\n", reason_phrase(status));
    for (name, values) in headers {
        for value in values {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
    }
    out.push_str(&format!("content-length: {}\r\n\r\n", body.len()));
    stream.write_all(out.as_bytes()).await?;
    stream.write_all(body).await?;
    Ok(())
}

async fn write_simple_response(stream: &mut TcpStream, status: u16, reason: &str) -> std::io::Result<()> {
    let out = format!("HTTP/1.1 {status} {reason}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
    stream.write_all(out.as_bytes()).await
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        504 => "Gateway Timeout",
        _ => "OK",
    }
}

async fn handle_connect(
    mut stream: TcpStream,
    head: ParsedHead,
    client: Arc<TunnelClient>,
    cancellation: CancellationToken,
) -> std::io::Result<()> {
    let mut head_buf = vec![0u8; head.head_len];
    stream.read_exact(&mut head_buf).await?;

    let address = head.target;
    let handle = match client.open_connect(address.clone()).await {
        Ok(handle) => handle,
        Err(err) => {
            debug!(%address, error = %err, "CONNECT refused");
            if matches!(err, RequestError::Refused(_)) {
                write_simple_response(&mut stream, 502, "Bad Gateway").await?;
            }
            return Ok(());
        }
    };

    stream.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await?;

    let (mut read_half, mut write_half) = stream.into_split();
    let (sender, mut inbound) = handle.split();

    let outbound = tokio::spawn(async move {
        let mut buf = vec![0u8; TCP_READ_BUFFER];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) => {
                    sender.close(None).await;
                    break;
                }
                Ok(n) => {
                    if !sender.send_data(buf[..n].to_vec()).await {
                        break;
                    }
                }
                Err(e) => {
                    sender.close(Some(e.to_string())).await;
                    break;
                }
            }
        }
    });

    let inbound_task = tokio::spawn(async move {
        loop {
            match inbound.recv().await {
                Some(tunnel_protocol::Envelope::ConnectData { chunk, .. }) => {
                    if write_half.write_all(&chunk).await.is_err() {
                        break;
                    }
                }
                Some(tunnel_protocol::Envelope::ConnectClose { .. }) | None => break,
                _ => {}
            }
        }
        let _ = write_half.shutdown().await;
    });

    let mut outbound = outbound;
    let mut inbound_task = inbound_task;
    tokio::select! {
        biased;
        _ = cancellation.cancelled() => {
            outbound.abort();
            inbound_task.abort();
        }
        _ = &mut outbound => { inbound_task.abort(); }
        _ = &mut inbound_task => { outbound.abort(); }
    }

    Ok(())
}

async fn handle_websocket(
    stream: TcpStream,
    head: ParsedHead,
    client: Arc<TunnelClient>,
    cancellation: CancellationToken,
) -> std::io::Result<()> {
    let url = absolute_url(&head.target, &head.headers, "ws");
    let handle = match client.open_websocket(url.clone(), head.headers).await {
        Ok(handle) => handle,
        Err(err) => {
            debug!(%url, error = %err, "websocket tunnel refused");
            return Ok(());
        }
    };

    let ws_stream = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;

    use futures::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    let (mut ws_sink, mut ws_source) = ws_stream.split();
    let (sender, mut inbound) = handle.split();

    let outbound = tokio::spawn(async move {
        loop {
            match inbound.recv().await {
                Some(tunnel_protocol::Envelope::WsMessage { kind, data, .. }) => {
                    let message = match kind {
                        WsFrameKind::Text => Message::Text(String::from_utf8_lossy(&data).into_owned().into()),
                        WsFrameKind::Binary => Message::Binary(data.into()),
                        WsFrameKind::Ping => Message::Ping(data.into()),
                        WsFrameKind::Pong => Message::Pong(data.into()),
                    };
                    if ws_sink.send(message).await.is_err() {
                        break;
                    }
                }
                Some(tunnel_protocol::Envelope::WsClose { code, reason, .. }) => {
                    let frame = tokio_tungstenite::tungstenite::protocol::CloseFrame {
                        code: code.into(),
                        reason: reason.unwrap_or_default().into(),
                    };
                    let _ = ws_sink.send(Message::Close(Some(frame))).await;
                    break;
                }
                _ => break,
            }
        }
        let _ = ws_sink.close().await;
    });

    let inbound_task = tokio::spawn(async move {
        while let Some(message) = ws_source.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    if !sender.send_ws_frame(WsFrameKind::Text, text.as_bytes().to_vec()).await {
                        break;
                    }
                }
                Ok(Message::Binary(data)) => {
                    if !sender.send_ws_frame(WsFrameKind::Binary, data.to_vec()).await {
                        break;
                    }
                }
                Ok(Message::Ping(data)) => {
                    let _ = sender.send_ws_frame(WsFrameKind::Ping, data.to_vec()).await;
                }
                Ok(Message::Pong(data)) => {
                    let _ = sender.send_ws_frame(WsFrameKind::Pong, data.to_vec()).await;
                }
                Ok(Message::Close(_)) => {
                    sender.close(None).await;
                    break;
                }
                Ok(Message::Frame(_)) => {}
                Err(_) => {
                    sender.close(Some("local socket error".to_string())).await;
                    break;
                }
            }
        }
    });

    let mut outbound = outbound;
    let mut inbound_task = inbound_task;
    tokio::select! {
        biased;
        _ = cancellation.cancelled() => {
            outbound.abort();
            inbound_task.abort();
        }
        _ = &mut outbound => { inbound_task.abort(); }
        _ = &mut inbound_task => { outbound.abort(); }
    }

    Ok(())
}
