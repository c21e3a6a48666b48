//! HTTP egress worker (spec §4.6.1): one outbound request per `http_request`
//! envelope, executed through a pooled [`reqwest::Client`] and guarded by
//! the per-host circuit breaker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;
use tunnel_protocol::{EgressErrorKind, Envelope};

use super::{host_key_from_url, BreakerRegistry};
use crate::session::{write_envelope, ChannelWriter};
use tokio::io::AsyncWrite;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn handle<S>(
    envelope: Envelope,
    writer: ChannelWriter<S>,
    breakers: Arc<BreakerRegistry>,
    client: reqwest::Client,
) where
    S: AsyncWrite + Unpin + Send,
{
    let Envelope::HttpRequest {
        id,
        method,
        url,
        headers,
        body,
    } = envelope
    else {
        return;
    };

    let breaker = breakers.get("http", &host_key_from_url(&url));
    let guard = match breaker.try_acquire() {
        Ok(guard) => guard,
        Err(message) => {
            write_envelope(
                &writer,
                Envelope::HttpResponse {
                    id,
                    status: 502,
                    headers: HashMap::new(),
                    body: Vec::new(),
                    error: Some(message.to_string()),
                },
            )
            .await;
            return;
        }
    };

    let response = execute(&client, &method, &url, &headers, body).await;

    match response {
        Ok((status, resp_headers, body)) => {
            guard.on_success();
            write_envelope(
                &writer,
                Envelope::HttpResponse {
                    id,
                    status,
                    headers: resp_headers,
                    body,
                    error: None,
                },
            )
            .await;
        }
        Err(kind) => {
            guard.on_failure();
            write_envelope(
                &writer,
                Envelope::HttpResponse {
                    id,
                    status: 502,
                    headers: HashMap::new(),
                    body: Vec::new(),
                    error: Some(kind.as_wire_str().to_string()),
                },
            )
            .await;
        }
    }
}

async fn execute(
    client: &reqwest::Client,
    method: &str,
    url: &str,
    headers: &HashMap<String, Vec<String>>,
    body: Vec<u8>,
) -> Result<(u16, HashMap<String, Vec<String>>, Vec<u8>), EgressErrorKind> {
    let method = reqwest::Method::from_bytes(method.as_bytes()).map_err(|_| EgressErrorKind::Io)?;

    let mut request = client.request(method, url).timeout(REQUEST_TIMEOUT).body(body);
    for (name, values) in headers {
        for value in values {
            request = request.header(name, value);
        }
    }

    let response = request.send().await.map_err(classify_reqwest_error)?;
    let status = response.status().as_u16();

    let mut resp_headers: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            resp_headers
                .entry(name.as_str().to_string())
                .or_default()
                .push(value.to_string());
        }
    }

    let body = response.bytes().await.map_err(classify_reqwest_error)?.to_vec();
    Ok((status, resp_headers, body))
}

fn classify_reqwest_error(error: reqwest::Error) -> EgressErrorKind {
    if error.is_timeout() {
        EgressErrorKind::Timeout
    } else if error.is_connect() {
        if error.to_string().contains("dns") {
            EgressErrorKind::Dns
        } else {
            EgressErrorKind::ConnectRefused
        }
    } else if error.to_string().to_lowercase().contains("tls")
        || error.to_string().to_lowercase().contains("certificate")
    {
        EgressErrorKind::Tls
    } else {
        warn!(error = %error, "unclassified HTTP egress error");
        EgressErrorKind::Io
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ChannelWriter;
    use futures::StreamExt;
    use std::sync::Arc as StdArc;
    use tokio::sync::Mutex as TokioMutex;
    use tokio_util::codec::Framed;
    use tunnel_protocol::{EnvelopeCodec, StreamId};

    fn writer_pair() -> (ChannelWriter<tokio::io::DuplexStream>, Framed<tokio::io::DuplexStream, EnvelopeCodec>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let sink = Framed::new(a, EnvelopeCodec::new()).split().0;
        (StdArc::new(TokioMutex::new(sink)), Framed::new(b, EnvelopeCodec::new()))
    }

    #[tokio::test]
    async fn open_circuit_rejects_without_dialing_and_reports_in_error_field() {
        let (writer, mut reader) = writer_pair();
        let breakers = StdArc::new(BreakerRegistry::new());
        let breaker = breakers.get("http", "example.invalid");
        for _ in 0..5 {
            breaker.try_acquire().unwrap().on_failure();
        }
        assert_eq!(breaker.state(), tunnel_protocol::CircuitState::Open);

        let id = StreamId::new();
        handle(
            Envelope::HttpRequest {
                id,
                method: "GET".to_string(),
                url: "http://example.invalid/".to_string(),
                headers: HashMap::new(),
                body: Vec::new(),
            },
            writer,
            breakers,
            reqwest::Client::new(),
        )
        .await;

        let response = reader.next().await.unwrap().unwrap();
        match response {
            Envelope::HttpResponse { status, body, error, .. } => {
                assert_eq!(status, 502);
                assert!(body.is_empty(), "circuit-open rejection must not carry a body");
                assert_eq!(error.as_deref(), Some(tunnel_protocol::CIRCUIT_OPEN_MESSAGE));
            }
            other => panic!("expected HttpResponse, got {other:?}"),
        }
    }
}
