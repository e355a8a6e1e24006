use thiserror::Error;

/// Largest header block accepted
const MAX_HEADER_BYTES: usize = 16 * 1024;
/// Largest body accepted; contact-form payloads are small
pub const MAX_BODY_BYTES: usize = 64 * 1024;

/// Error type for reading an HTTP request
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("malformed request line")]
    BadRequestLine,
    #[error("malformed header: {0}")]
    BadHeader(String),
    #[error("invalid Content-Length")]
    BadContentLength,
    #[error("request headers too large")]
    HeadersTooLarge,
    #[error("request body too large")]
    BodyTooLarge,
    #[error("connection closed before the request was complete")]
    Incomplete,
}

/// A parsed HTTP/1.1 request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// First value of a header, matched case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Incremental request reader
///
/// Bytes are pushed as they arrive; a request comes out once the headers and
/// `Content-Length` bytes of body are buffered.
#[derive(Debug, Default)]
pub struct RequestParser {
    buffer: Vec<u8>,
    head: Option<(HttpRequest, usize)>,
}

impl RequestParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes; returns the request once it is complete
    pub fn push(&mut self, data: &[u8]) -> Result<Option<HttpRequest>, RequestError> {
        self.buffer.extend_from_slice(data);

        if self.head.is_none() {
            let Some(pos) = find_header_end(&self.buffer) else {
                if self.buffer.len() > MAX_HEADER_BYTES {
                    return Err(RequestError::HeadersTooLarge);
                }
                return Ok(None);
            };

            let head = String::from_utf8_lossy(&self.buffer[..pos]).to_string();
            self.buffer.drain(..pos + 4); // Remove headers including \r\n\r\n
            self.head = Some(parse_head(&head)?);
        }

        let content_length = match &self.head {
            Some((_, length)) => *length,
            None => return Ok(None),
        };
        if self.buffer.len() < content_length {
            return Ok(None);
        }

        match self.head.take() {
            Some((mut request, length)) => {
                request.body = self.buffer.drain(..length).collect();
                Ok(Some(request))
            }
            None => Ok(None),
        }
    }
}

/// Parse the request line and headers, returning the declared body length
fn parse_head(head: &str) -> Result<(HttpRequest, usize), RequestError> {
    let mut lines = head.split("\r\n");

    let request_line = lines.next().ok_or(RequestError::BadRequestLine)?;
    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() != 3 || !parts[2].starts_with("HTTP/") {
        return Err(RequestError::BadRequestLine);
    }

    let mut headers = Vec::new();
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| RequestError::BadHeader(line.to_string()))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    let request = HttpRequest {
        method: parts[0].to_string(),
        path: parts[1].to_string(),
        headers,
        body: Vec::new(),
    };

    let content_length = match request.header("Content-Length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| RequestError::BadContentLength)?,
        None => 0,
    };
    if content_length > MAX_BODY_BYTES {
        return Err(RequestError::BodyTooLarge);
    }

    Ok((request, content_length))
}

/// Find the end of HTTP headers (double CRLF)
fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|window| window == b"\r\n\r\n")
}
