pub mod webhook;

use std::{
    collections::{HashMap, hash_map::Entry},
    future::Future,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use autoscale_core::{
    config::GitHubConfig,
    error::UpstreamError,
    models::{RegistrationToken, RepositoryTarget},
};
use http::StatusCode;
use octocrab::{Octocrab, models::InstallationId, service::middleware::retry::RetryConfig};
use tokio::{sync::Mutex, time::timeout};

/// Exchanges a repository identity for a runner registration token.
pub trait CredentialProvider: Send + Sync + 'static {
    fn registration_token(
        &self,
        target: &RepositoryTarget,
    ) -> impl Future<Output = Result<RegistrationToken, UpstreamError>> + Send;
}

/// GitHub App client. The app credential is loaded once and never changes;
/// installation clients are created on first use and cached.
#[derive(Clone)]
pub struct GitHub {
    pub app_client: Octocrab,
    installations: Arc<Mutex<HashMap<InstallationId, Octocrab>>>,
    api_timeout: Duration,
    token_deadline: Duration,
}

impl GitHub {
    pub async fn new(config: &GitHubConfig) -> Result<Arc<Self>> {
        let private_key = tokio::fs::read_to_string(&config.private_key_path)
            .await
            .with_context(|| format!("Failed to read private key {}", config.private_key_path))?;
        // Retries are decided by `fetch_token`, not by the HTTP client.
        let app_client = Octocrab::builder()
            .add_retry_config(RetryConfig::None)
            .app(
                config.app_id.into(),
                jsonwebtoken::EncodingKey::from_rsa_pem(private_key.as_bytes())
                    .context("Failed to parse private key")?,
            )
            .build()
            .context("Failed to create GitHub client")?;
        let installations = app_client
            .apps()
            .installations()
            .send()
            .await
            .context("Failed to authenticate as GitHub App")?;
        tracing::info!(
            "Authenticated as GitHub App {} ({} installations)",
            config.app_id,
            installations.items.len()
        );
        Ok(Arc::new(Self {
            app_client,
            installations: Arc::new(Mutex::new(HashMap::new())),
            api_timeout: config.api_timeout(),
            token_deadline: config.token_deadline(),
        }))
    }

    async fn client_for(&self, target: &RepositoryTarget) -> Result<Octocrab, UpstreamError> {
        let installation_id = match target.installation_id {
            Some(id) => InstallationId(id),
            None => {
                let installation = timeout(
                    self.api_timeout,
                    self.app_client.apps().get_repository_installation(&target.owner, &target.repo),
                )
                .await
                .map_err(|_| UpstreamError::timeout(self.api_timeout))?
                .map_err(classify)?;
                installation.id
            }
        };
        let mut installations = self.installations.lock().await;
        match installations.entry(installation_id) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let client = self.app_client.installation(installation_id).map_err(classify)?;
                tracing::debug!("Created client for installation {}", installation_id);
                Ok(entry.insert(client).clone())
            }
        }
    }

    async fn request_registration_token(
        &self,
        target: &RepositoryTarget,
    ) -> Result<RegistrationToken, UpstreamError> {
        let client = self.client_for(target).await?;
        post_registration_token(&client, target, self.api_timeout).await
    }
}

impl CredentialProvider for GitHub {
    async fn registration_token(
        &self,
        target: &RepositoryTarget,
    ) -> Result<RegistrationToken, UpstreamError> {
        let token =
            fetch_token(self.token_deadline, || self.request_registration_token(target)).await?;
        tracing::debug!(
            "Fetched registration token for {} (expires {})",
            target,
            token.expires_at().unwrap_or("[unknown]")
        );
        Ok(token)
    }
}

async fn post_registration_token(
    client: &Octocrab,
    target: &RepositoryTarget,
    api_timeout: Duration,
) -> Result<RegistrationToken, UpstreamError> {
    let route =
        format!("/repos/{}/{}/actions/runners/registration-token", target.owner, target.repo);
    timeout(api_timeout, client.post(route, None::<&()>))
        .await
        .map_err(|_| UpstreamError::timeout(api_timeout))?
        .map_err(classify)
}

/// Run `f` with [`with_single_retry`], giving up on the whole exchange after
/// `deadline`.
pub async fn fetch_token<T, F, Fut>(deadline: Duration, f: F) -> Result<T, UpstreamError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, UpstreamError>>,
{
    timeout(deadline, with_single_retry(f)).await.map_err(|_| UpstreamError::timeout(deadline))?
}

/// Run `f`, retrying once if the first attempt failed with a transient error.
pub async fn with_single_retry<T, F, Fut>(mut f: F) -> Result<T, UpstreamError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, UpstreamError>>,
{
    match f().await {
        Err(e) if e.is_transient() => {
            tracing::warn!("{e}, retrying once");
            f().await
        }
        result => result,
    }
}

fn classify(err: octocrab::Error) -> UpstreamError {
    match err {
        octocrab::Error::GitHub { source, .. } => from_status(source.status_code, &source.message),
        e @ (octocrab::Error::JWT { .. } | octocrab::Error::Installation { .. }) => {
            UpstreamError::Auth(e.to_string())
        }
        e => UpstreamError::Unavailable(e.to_string()),
    }
}

/// Map an API error response onto the upstream error taxonomy.
pub fn from_status(status: StatusCode, message: &str) -> UpstreamError {
    let message = message.to_string();
    match status {
        StatusCode::TOO_MANY_REQUESTS => UpstreamError::RateLimited(message),
        StatusCode::FORBIDDEN if message.to_ascii_lowercase().contains("rate limit") => {
            UpstreamError::RateLimited(message)
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => UpstreamError::Auth(message),
        s if s.is_server_error() => UpstreamError::Unavailable(format!("{s}: {message}")),
        s => UpstreamError::Unexpected { status: s.as_u16(), message },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::{Router, routing::post};
    use http::header;
    use tokio::net::TcpListener;

    use super::*;

    /// Local stand-in for the registration-token endpoint.
    struct TokenEndpoint {
        client: Octocrab,
        hits: Arc<AtomicUsize>,
    }

    async fn token_endpoint(
        status: StatusCode,
        body: &'static str,
        delay: Duration,
    ) -> TokenEndpoint {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/repos/{owner}/{repo}/actions/runners/registration-token",
            post(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(delay).await;
                    (status, [(header::CONTENT_TYPE, "application/json")], body)
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        let client = Octocrab::builder()
            .add_retry_config(RetryConfig::None)
            .base_uri(format!("http://{addr}"))
            .unwrap()
            .personal_token("test-token".to_string())
            .build()
            .unwrap();
        TokenEndpoint { client, hits }
    }

    fn target() -> RepositoryTarget {
        RepositoryTarget { owner: "acme".into(), repo: "widgets".into(), installation_id: Some(3) }
    }

    async fn exchange(
        endpoint: &TokenEndpoint,
        api_timeout: Duration,
        deadline: Duration,
    ) -> Result<RegistrationToken, UpstreamError> {
        let target = target();
        fetch_token(deadline, || post_registration_token(&endpoint.client, &target, api_timeout))
            .await
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_token_exchange() {
        let endpoint = token_endpoint(
            StatusCode::CREATED,
            r#"{"token":"AAAA-registration-token","expires_at":"2030-01-01T00:00:00Z"}"#,
            Duration::ZERO,
        )
        .await;
        let token = exchange(&endpoint, TIMEOUT, TIMEOUT).await.unwrap();
        assert_eq!(token.expose(), "AAAA-registration-token");
        assert_eq!(token.expires_at(), Some("2030-01-01T00:00:00Z"));
        assert_eq!(endpoint.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_error_responses() {
        let endpoint = token_endpoint(
            StatusCode::UNAUTHORIZED,
            r#"{"message":"Bad credentials","documentation_url":"https://docs.github.com/rest"}"#,
            Duration::ZERO,
        )
        .await;
        let result = exchange(&endpoint, TIMEOUT, TIMEOUT).await;
        assert!(matches!(result, Err(UpstreamError::Auth(_))), "{result:?}");
        assert_eq!(endpoint.hits.load(Ordering::SeqCst), 1);

        let endpoint = token_endpoint(
            StatusCode::TOO_MANY_REQUESTS,
            r#"{"message":"API rate limit exceeded"}"#,
            Duration::ZERO,
        )
        .await;
        let result = exchange(&endpoint, TIMEOUT, TIMEOUT).await;
        assert!(matches!(result, Err(UpstreamError::RateLimited(_))), "{result:?}");
        assert_eq!(endpoint.hits.load(Ordering::SeqCst), 1);

        let endpoint = token_endpoint(
            StatusCode::SERVICE_UNAVAILABLE,
            r#"{"message":"Service Unavailable"}"#,
            Duration::ZERO,
        )
        .await;
        let result = exchange(&endpoint, TIMEOUT, TIMEOUT).await;
        assert!(matches!(result, Err(UpstreamError::Unavailable(_))), "{result:?}");
        assert_eq!(endpoint.hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stalled_call_times_out_and_retries_once() {
        let endpoint =
            token_endpoint(StatusCode::CREATED, r#"{"token":"t"}"#, Duration::from_secs(30)).await;
        let result = exchange(&endpoint, Duration::from_millis(100), TIMEOUT).await;
        assert!(matches!(result, Err(UpstreamError::Unavailable(_))), "{result:?}");
        assert_eq!(endpoint.hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_deadline_bounds_whole_exchange() {
        let endpoint =
            token_endpoint(StatusCode::CREATED, r#"{"token":"t"}"#, Duration::from_secs(30)).await;
        let started = tokio::time::Instant::now();
        let result = exchange(&endpoint, Duration::from_secs(10), Duration::from_millis(200)).await;
        assert!(matches!(result, Err(UpstreamError::Unavailable(_))), "{result:?}");
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(endpoint.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_installation_without_app_credential_is_auth_error() {
        let client = Octocrab::builder().build().unwrap();
        let err = client.installation(InstallationId(3)).map(|_| ()).unwrap_err();
        assert!(matches!(classify(err), UpstreamError::Auth(_)));
    }

    #[test]
    fn test_from_status() {
        assert!(matches!(
            from_status(StatusCode::UNAUTHORIZED, "Bad credentials"),
            UpstreamError::Auth(_)
        ));
        assert!(matches!(
            from_status(StatusCode::FORBIDDEN, "API rate limit exceeded for installation"),
            UpstreamError::RateLimited(_)
        ));
        assert!(matches!(
            from_status(StatusCode::FORBIDDEN, "Resource not accessible by integration"),
            UpstreamError::Auth(_)
        ));
        assert!(matches!(
            from_status(StatusCode::TOO_MANY_REQUESTS, ""),
            UpstreamError::RateLimited(_)
        ));
        assert!(matches!(
            from_status(StatusCode::BAD_GATEWAY, "Server Error"),
            UpstreamError::Unavailable(_)
        ));
        assert!(matches!(
            from_status(StatusCode::NOT_FOUND, "Not Found"),
            UpstreamError::Unexpected { status: 404, .. }
        ));
    }

    #[tokio::test]
    async fn test_retry_is_bounded() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = with_single_retry(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(UpstreamError::Unavailable("connection reset".into()))
        })
        .await;
        assert!(matches!(result, Err(UpstreamError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_retry_for_rate_limit_or_auth() {
        for err in [UpstreamError::RateLimited("slow down".into()), UpstreamError::Auth("no".into())]
        {
            let calls = AtomicUsize::new(0);
            let mut err = Some(err);
            let result: Result<(), _> = with_single_retry(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                let err = err.take().unwrap_or(UpstreamError::Unavailable("unreachable".into()));
                async move { Err(err) }
            })
            .await;
            assert!(!matches!(result, Err(UpstreamError::Unavailable(_))));
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_retry_recovers() {
        let calls = AtomicUsize::new(0);
        let result = with_single_retry(|| async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(UpstreamError::timeout(Duration::from_secs(10)))
            } else {
                Ok(RegistrationToken::new("t"))
            }
        })
        .await;
        assert_eq!(result.unwrap().expose(), "t");
    }
}
