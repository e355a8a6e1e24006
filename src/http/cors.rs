use crate::http::{HttpRequest, HttpResponse};

/// Cross-origin policy for the contact endpoint: POST only, from listed origins
#[derive(Debug, Clone, Default)]
pub struct CorsPolicy {
    allowed_origins: Vec<String>,
}

impl CorsPolicy {
    pub fn new(allowed_origins: Vec<String>) -> Self {
        Self { allowed_origins }
    }

    fn allows(&self, origin: &str) -> bool {
        self.allowed_origins
            .iter()
            .any(|allowed| allowed == "*" || allowed.eq_ignore_ascii_case(origin))
    }

    /// Whether the request is a CORS preflight
    pub fn is_preflight(request: &HttpRequest) -> bool {
        request.method == "OPTIONS" && request.header("Access-Control-Request-Method").is_some()
    }

    /// Answer a preflight request
    pub fn preflight(&self, request: &HttpRequest) -> HttpResponse {
        let response = HttpResponse::no_content()
            .with_header("Vary", "Origin, Access-Control-Request-Method, Access-Control-Request-Headers");

        let origin = match request.header("Origin") {
            Some(origin) if self.allows(origin) => origin,
            _ => return response,
        };
        let method_allowed = request
            .header("Access-Control-Request-Method")
            .is_some_and(|method| method.eq_ignore_ascii_case("POST"));
        if !method_allowed {
            return response;
        }

        let mut response = response
            .with_header("Access-Control-Allow-Origin", origin)
            .with_header("Access-Control-Allow-Methods", "POST");
        if let Some(headers) = request.header("Access-Control-Request-Headers") {
            response = response.with_header("Access-Control-Allow-Headers", headers);
        }
        response
    }

    /// Decorate an actual response for an allowed origin
    pub fn apply(&self, request: &HttpRequest, response: HttpResponse) -> HttpResponse {
        let response = response.with_header("Vary", "Origin");
        match request.header("Origin") {
            Some(origin) if self.allows(origin) && request.method == "POST" => {
                response.with_header("Access-Control-Allow-Origin", origin)
            }
            _ => response,
        }
    }
}
