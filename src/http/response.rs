use crate::relay::Redirect;

/// An HTTP/1.1 response, always sent with `Connection: close`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub code: u16,
    pub reason: &'static str,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(code: u16, reason: &'static str) -> Self {
        Self {
            code,
            reason,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    /// Plain-text error response
    pub fn error(code: u16, reason: &'static str, message: &str) -> Self {
        let mut response = Self::new(code, reason)
            .with_header("Content-Type", "text/plain; charset=utf-8")
            .with_header("X-Content-Type-Options", "nosniff");
        response.body = format!("{}\n", message).into_bytes();
        response
    }

    pub fn bad_request(message: &str) -> Self {
        Self::error(400, "Bad Request", message)
    }

    pub fn not_found() -> Self {
        Self::error(404, "Not Found", "404 page not found")
    }

    pub fn no_content() -> Self {
        Self::new(204, "No Content")
    }

    /// Redirect response for a relay outcome
    pub fn redirect(redirect: &Redirect) -> Self {
        Self::new(redirect.status.code(), redirect.status.reason())
            .with_header("Location", redirect.location.clone())
    }

    /// First value of a header, matched case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Serialize for transmission
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.code, self.reason);
        for (name, value) in &self.headers {
            head.push_str(&format!(
                "{}: {}\r\n",
                without_newlines(name),
                without_newlines(value)
            ));
        }
        head.push_str(&format!(
            "Content-Length: {}\r\nConnection: close\r\n\r\n",
            self.body.len()
        ));

        let mut bytes = head.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

/// Header text with CR and LF replaced by spaces, so caller-supplied values
/// (redirect targets, echoed CORS headers) cannot start a new header line
fn without_newlines(text: &str) -> std::borrow::Cow<'_, str> {
    if text.contains(['\r', '\n']) {
        text.replace(['\r', '\n'], " ").into()
    } else {
        text.into()
    }
}
