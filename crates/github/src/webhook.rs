use std::{fmt::Display, sync::Arc};

use anyhow::Result;
use autoscale_core::{
    config::Config,
    error::SignatureError,
    models::{EventKind, WebhookEvent},
};
use axum::{
    body::Bytes,
    extract::{FromRef, FromRequest, Request},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use hmac::{Hmac, Mac};
use sha2::Sha256;

pub const EVENT_HEADER: &str = "X-GitHub-Event";
pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";
pub const DELIVERY_HEADER: &str = "X-GitHub-Delivery";

fn mac(secret: &[u8]) -> Hmac<Sha256> {
    Hmac::<Sha256>::new_from_slice(secret).expect("HMAC can take key of any size")
}

/// Compute the `X-Hub-Signature-256` header value for `body`.
pub fn sign(body: &[u8], secret: &[u8]) -> String {
    let mut mac = mac(secret);
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Check `header` against the HMAC-SHA256 of the exact `body` bytes.
/// Comparison is constant-time.
pub fn verify_signature(
    body: &[u8],
    header: Option<&str>,
    secret: &[u8],
) -> Result<(), SignatureError> {
    let signature_sha256 = header
        .ok_or(SignatureError::Missing)?
        .strip_prefix("sha256=")
        .ok_or(SignatureError::MissingPrefix)?;
    let signature = hex::decode(signature_sha256).map_err(|_| SignatureError::Malformed)?;
    let mut mac = mac(secret);
    mac.update(body);
    mac.verify_slice(&signature).map_err(|_| SignatureError::Mismatch)
}

pub fn verify(body: &[u8], header: Option<&str>, secret: &[u8]) -> bool {
    verify_signature(body, header, secret).is_ok()
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
}

/// Verify and extract GitHub Event Payload.
///
/// The body is only decoded after the signature has been checked.
#[derive(Clone)]
#[must_use]
pub struct GitHubEvent {
    pub delivery: String,
    pub event: WebhookEvent,
}

impl<S> FromRequest<S> for GitHubEvent
where
    Arc<Config>: FromRef<S>,
    S: Send + Sync + Clone,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        fn err(status: StatusCode, m: impl Display) -> Response {
            tracing::warn!("Rejected webhook: {m}");
            (status, m.to_string()).into_response()
        }
        // Owned copies, so nothing borrowed from `req` lives across the body read.
        let (kind, signature, delivery) = {
            let headers = req.headers();
            (
                header_value(headers, EVENT_HEADER),
                header_value(headers, SIGNATURE_HEADER),
                header_value(headers, DELIVERY_HEADER).unwrap_or_else(|| "[unknown]".to_string()),
            )
        };
        let kind =
            kind.ok_or_else(|| err(StatusCode::BAD_REQUEST, "X-GitHub-Event header missing"))?;
        let config = <Arc<Config>>::from_ref(state);
        let body = Bytes::from_request(req, state)
            .await
            .map_err(|_| err(StatusCode::BAD_REQUEST, "error reading body"))?;
        if let Err(e) =
            verify_signature(&body, signature.as_deref(), config.github.webhook_secret.as_bytes())
        {
            let status = match e {
                SignatureError::Mismatch => StatusCode::UNAUTHORIZED,
                _ => StatusCode::BAD_REQUEST,
            };
            return Err(err(status, format!("{e} (delivery {delivery})")));
        }
        let event = WebhookEvent::parse(&EventKind::from_header(&kind), &body)
            .map_err(|e| err(StatusCode::BAD_REQUEST, format!("error parsing {kind} body: {e}")))?;
        Ok(GitHubEvent { delivery, event })
    }
}

#[cfg(test)]
mod tests {
    use autoscale_core::config::{GitHubConfig, ServerConfig, WorkerConfig};
    use axum::{Router, body::Body, routing::post};
    use tower::ServiceExt;

    use super::*;

    const SECRET: &[u8] = b"It's a Secret to Everybody";
    const BODY: &str = r#"{"action":"queued","workflow_job":{"id":42},"repository":{"name":"widgets","full_name":"acme/widgets","owner":{"login":"acme"}}}"#;

    #[test]
    fn test_sign_verify() {
        // Example from GitHub's webhook validation docs.
        assert_eq!(
            sign(b"Hello, World!", SECRET),
            "sha256=757107ea0eb2509fc211221cce984b8a37570b6d7586c22c46f4379c8b043e17"
        );
        let signature = sign(BODY.as_bytes(), SECRET);
        assert!(verify(BODY.as_bytes(), Some(&signature), SECRET));
        assert!(!verify(BODY.as_bytes(), Some(&signature), b"other secret"));
    }

    #[test]
    fn test_any_body_mutation_fails() {
        let signature = sign(BODY.as_bytes(), SECRET);
        let mut body = BODY.as_bytes().to_vec();
        for i in 0..body.len() {
            body[i] ^= 0x01;
            assert!(!verify(&body, Some(&signature), SECRET), "flipped byte {i}");
            body[i] ^= 0x01;
        }
        assert!(!verify(&body[..body.len() - 1], Some(&signature), SECRET));
    }

    #[test]
    fn test_any_signature_mutation_fails() {
        let signature = sign(BODY.as_bytes(), SECRET);
        let hex_part = &signature["sha256=".len()..];
        for i in 0..hex_part.len() {
            let mut chars = hex_part.chars().collect::<Vec<_>>();
            chars[i] = if chars[i] == '0' { '1' } else { '0' };
            let mutated = format!("sha256={}", chars.into_iter().collect::<String>());
            assert_eq!(
                verify_signature(BODY.as_bytes(), Some(&mutated), SECRET),
                Err(SignatureError::Mismatch)
            );
        }
    }

    #[test]
    fn test_fails_closed() {
        let body = BODY.as_bytes();
        let signature = sign(body, SECRET);
        assert_eq!(verify_signature(body, None, SECRET), Err(SignatureError::Missing));
        assert_eq!(
            verify_signature(body, Some(&signature["sha256=".len()..]), SECRET),
            Err(SignatureError::MissingPrefix)
        );
        assert_eq!(
            verify_signature(body, Some("sha256=zz"), SECRET),
            Err(SignatureError::Malformed)
        );
        assert_eq!(verify_signature(body, Some("sha256="), SECRET), Err(SignatureError::Mismatch));
        assert_eq!(
            verify_signature(body, Some(&signature[..signature.len() - 2]), SECRET),
            Err(SignatureError::Mismatch)
        );
    }

    fn config() -> Arc<Config> {
        Arc::new(Config {
            server: ServerConfig::default(),
            github: GitHubConfig {
                app_id: 1,
                private_key_path: "key.pem".to_string(),
                webhook_secret: String::from_utf8(SECRET.to_vec()).unwrap(),
                api_timeout_secs: 10,
                ..Default::default()
            },
            worker: WorkerConfig::default(),
        })
    }

    async fn extract(kind: &str, body: &str, signature: Option<String>) -> StatusCode {
        async fn handler(GitHubEvent { event, .. }: GitHubEvent) -> String {
            event.tag().map(|t| t.to_string()).unwrap_or_default()
        }
        let app = Router::new().route("/hook", post(handler)).with_state(config());
        let mut request = axum::http::Request::builder()
            .method("POST")
            .uri("/hook")
            .header(EVENT_HEADER, kind)
            .header(DELIVERY_HEADER, "d-1");
        if let Some(signature) = signature {
            request = request.header(SIGNATURE_HEADER, signature);
        }
        let response =
            app.oneshot(request.body(Body::from(body.to_string())).unwrap()).await.unwrap();
        response.status()
    }

    #[test]
    fn test_extractor_future_is_send() {
        fn assert_send<T: Send>(_: &T) {}
        let state = config();
        let request = axum::http::Request::builder().body(Body::empty()).unwrap();
        let extracting = GitHubEvent::from_request(request, &state);
        assert_send(&extracting);
    }

    #[tokio::test]
    async fn test_extractor() {
        let signature = sign(BODY.as_bytes(), SECRET);
        assert_eq!(extract("workflow_job", BODY, Some(signature.clone())).await, StatusCode::OK);
        assert_eq!(
            extract("workflow_job", &BODY.replace("42", "43"), Some(signature)).await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(extract("workflow_job", BODY, None).await, StatusCode::BAD_REQUEST);

        // Signed but not a workflow_job payload.
        let garbage = "{}";
        assert_eq!(
            extract("workflow_job", garbage, Some(sign(garbage.as_bytes(), SECRET))).await,
            StatusCode::BAD_REQUEST
        );
        // Unknown event types are accepted without decoding.
        assert_eq!(
            extract("push", garbage, Some(sign(garbage.as_bytes(), SECRET))).await,
            StatusCode::OK
        );
    }
}
