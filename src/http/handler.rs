use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::HttpConfig;
use crate::http::{CorsPolicy, HttpRequest, HttpResponse};
use crate::relay::{Message, RelayService, SessionBuilder};
use crate::{log_error, verbose};

/// Path of the contact endpoint
pub const EMAIL_PATH: &str = "/email";

/// Request routing for the contact endpoint
pub struct HttpApp<B: SessionBuilder> {
    service: RelayService<B>,
    cors: CorsPolicy,
    request_timeout: Option<Duration>,
}

impl<B: SessionBuilder> HttpApp<B> {
    pub fn new(service: RelayService<B>, config: &HttpConfig) -> Self {
        Self {
            service,
            cors: CorsPolicy::new(config.cors_allowed_origins.clone()),
            request_timeout: config.request_timeout(),
        }
    }

    /// How long a request may run before its token is cancelled
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    /// Produce the response for one request
    ///
    /// `cancel` fires when the request should be abandoned: deadline, client
    /// disconnect, or process shutdown.
    pub async fn respond(&self, request: &HttpRequest, cancel: &CancellationToken) -> HttpResponse {
        verbose!("{} {}", request.method, request.path);

        if CorsPolicy::is_preflight(request) {
            return self.cors.preflight(request);
        }

        let path = request.path.split('?').next().unwrap_or_default();
        let response = if path != EMAIL_PATH {
            HttpResponse::not_found()
        } else if request.method != "POST" {
            HttpResponse::bad_request(&format!("unexpected method {:?}", request.method))
        } else {
            self.post_email(request, cancel).await
        };

        self.cors.apply(request, response)
    }

    async fn post_email(&self, request: &HttpRequest, cancel: &CancellationToken) -> HttpResponse {
        let message: Message = match serde_json::from_slice(&request.body) {
            Ok(message) => message,
            Err(e) => {
                log_error!("POST /email: failed to decode body: {}", e);
                return HttpResponse::bad_request(&e.to_string());
            }
        };

        let redirect = self.service.handle(&message, cancel).await;
        HttpResponse::redirect(&redirect)
    }
}
