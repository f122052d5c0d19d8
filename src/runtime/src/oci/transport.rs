//! Registry HTTP transport.
//!
//! Every request runs one `curl` process. The raw text curl prints (status
//! line, headers, optionally the body) is turned into an [`HttpResponse`] by
//! [`parse_response`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use boxroot_core::config::PullConfig;
use boxroot_core::error::{BoxError, Result};

/// A single registry request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// HTTP method; only `GET` is used against registries
    pub method: String,
    /// Absolute URL
    pub url: String,
    /// Extra request headers in send order
    pub headers: Vec<(String, String)>,
    /// Write the body to this file instead of returning it
    pub output: Option<PathBuf>,
    /// Basic credentials (`-u user:pass`)
    pub basic_auth: Option<(String, String)>,
    /// Total time limit in seconds (0 = unlimited)
    pub max_time_secs: u64,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: Vec::new(),
            output: None,
            basic_auth: None,
            max_time_secs: 0,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output = Some(path.into());
        self
    }

    pub fn basic_auth(mut self, username: &str, password: &str) -> Self {
        self.basic_auth = Some((username.to_string(), password.to_string()));
        self
    }

    pub fn max_time(mut self, secs: u64) -> Self {
        self.max_time_secs = secs;
        self
    }
}

/// Parsed response of the authoritative (last) HTTP header block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code, 0 when it could not be parsed or nothing was received
    pub status: u16,
    /// Header map keyed by lowercase name
    pub headers: HashMap<String, String>,
    /// Body text (empty when the body went to a file)
    pub body: String,
}

impl HttpResponse {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// `Content-Type` with parameters (`; charset=...`) removed.
    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
            .map(|ct| ct.split(';').next().unwrap_or(ct).trim())
            .filter(|ct| !ct.is_empty())
    }
}

/// Something that can execute registry requests.
///
/// The production implementation is [`CurlTransport`]; tests script responses.
pub trait HttpTransport: Send + Sync {
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse>;
}

/// Transport running the external `curl` binary once per request.
#[derive(Debug, Clone)]
pub struct CurlTransport {
    curl_path: String,
    user_agent: String,
    proxy: Option<String>,
    connect_timeout_secs: u64,
}

impl CurlTransport {
    pub fn new(curl_path: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            curl_path: curl_path.into(),
            user_agent: user_agent.into(),
            proxy: None,
            connect_timeout_secs: 0,
        }
    }

    pub fn from_config(config: &PullConfig) -> Self {
        Self {
            curl_path: config.curl_path.clone(),
            user_agent: config.user_agent.clone(),
            proxy: config.proxy.clone(),
            connect_timeout_secs: config.connect_timeout_secs,
        }
    }

    pub fn with_proxy(mut self, proxy: Option<String>) -> Self {
        self.proxy = proxy;
        self
    }

    /// Build the argument list for a request (without the program name).
    pub fn build_args(&self, request: &HttpRequest) -> Vec<String> {
        let mut args: Vec<String> = vec!["-sS".into(), "-L".into(), "--insecure".into()];

        if request.method != "GET" {
            args.push("-X".into());
            args.push(request.method.clone());
        }
        args.push("-H".into());
        args.push(format!("User-Agent: {}", self.user_agent));

        if self.connect_timeout_secs > 0 {
            args.push("--connect-timeout".into());
            args.push(self.connect_timeout_secs.to_string());
        }
        if request.max_time_secs > 0 {
            args.push("--max-time".into());
            args.push(request.max_time_secs.to_string());
        }
        if let Some(ref proxy) = self.proxy {
            args.push("--proxy".into());
            args.push(proxy.clone());
        }
        if let Some((ref user, ref pass)) = request.basic_auth {
            args.push("-u".into());
            args.push(format!("{}:{}", user, pass));
        }
        for (name, value) in &request.headers {
            args.push("-H".into());
            args.push(format!("{}: {}", name, value));
        }

        match request.output {
            Some(ref path) => {
                args.push("-o".into());
                args.push(path.to_string_lossy().into_owned());
                args.push("-D".into());
                args.push("-".into());
            }
            None => args.push("-i".into()),
        }

        args.push(request.url.clone());
        args
    }
}

impl HttpTransport for CurlTransport {
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let args = self.build_args(request);
        tracing::debug!(command = %redact_command(&self.curl_path, &args), "Running curl");

        let output = Command::new(&self.curl_path)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| {
                BoxError::TransportError(format!("Failed to run '{}': {}", self.curl_path, e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(BoxError::TransportError(format!(
                "curl exited with {} for {}: {}",
                code,
                request.url,
                stderr.trim()
            )));
        }

        if output.stdout.is_empty() {
            tracing::warn!(url = %request.url, "curl returned an empty response");
            return Ok(HttpResponse::default());
        }

        Ok(parse_response(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Render a command line for logs with `-u` credentials masked.
pub fn redact_command(program: &str, args: &[String]) -> String {
    let mut parts = vec![program.to_string()];
    let mut mask_next = false;
    for arg in args {
        if mask_next {
            let user = arg.split(':').next().unwrap_or_default();
            parts.push(format!("{}:***", user));
            mask_next = false;
            continue;
        }
        mask_next = arg == "-u";
        parts.push(arg.clone());
    }
    parts.join(" ")
}

/// Parse raw curl output into an [`HttpResponse`].
///
/// Header blocks are consumed from the start of the text for as long as the
/// remaining text begins with `HTTP/`; redirect hops and `100 Continue`
/// therefore stack up and the last block wins. Everything after the last
/// block's blank line is the body. Text that does not start with a status line
/// is returned entirely as body with status 0.
pub fn parse_response(raw: &str) -> HttpResponse {
    let mut rest = raw;
    let mut last_head: Option<&str> = None;

    while rest.starts_with("HTTP/") {
        match split_head(rest) {
            Some((head, remaining)) => {
                last_head = Some(head);
                rest = remaining;
            }
            None => {
                last_head = Some(rest);
                rest = "";
            }
        }
    }

    let head = match last_head {
        Some(head) => head,
        None => {
            return HttpResponse {
                status: 0,
                headers: HashMap::new(),
                body: raw.to_string(),
            }
        }
    };

    let mut lines = head.lines().map(|l| l.trim_end_matches('\r'));
    let status = lines
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse::<u16>().ok())
        .unwrap_or(0);

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers
                .entry(name.trim().to_ascii_lowercase())
                .or_insert_with(|| value.trim().to_string());
        }
    }

    HttpResponse {
        status,
        headers,
        body: rest.to_string(),
    }
}

/// Split at the first blank line, accepting CRLF or LF separators.
fn split_head(text: &str) -> Option<(&str, &str)> {
    let crlf = text.find("\r\n\r\n").map(|i| (i, 4));
    let lf = text.find("\n\n").map(|i| (i, 2));
    let (pos, len) = match (crlf, lf) {
        (Some(a), Some(b)) => {
            if a.0 <= b.0 {
                a
            } else {
                b
            }
        }
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => return None,
    };
    Some((&text[..pos], &text[pos + len..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_crlf() {
        let raw = "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 2\r\n\r\n{}";
        let resp = parse_response(raw);
        assert_eq!(resp.status, 200);
        assert_eq!(resp.header("content-type"), Some("application/json"));
        assert_eq!(resp.header("Content-Length"), Some("2"));
        assert_eq!(resp.body, "{}");
        assert!(resp.is_success());
    }

    #[test]
    fn test_parse_lf_only() {
        let raw = "HTTP/1.1 404 Not Found\nDocker-Distribution-Api-Version: registry/2.0\n\nmanifest unknown";
        let resp = parse_response(raw);
        assert_eq!(resp.status, 404);
        assert_eq!(
            resp.header("docker-distribution-api-version"),
            Some("registry/2.0")
        );
        assert_eq!(resp.body, "manifest unknown");
        assert!(!resp.is_success());
    }

    #[test]
    fn test_parse_redirect_chain_last_block_wins() {
        let raw = "HTTP/1.1 307 Temporary Redirect\r\nLocation: https://cdn.example/blob\r\n\r\n\
                   HTTP/2 200\r\ncontent-type: application/octet-stream\r\n\r\nDATA";
        let resp = parse_response(raw);
        assert_eq!(resp.status, 200);
        assert_eq!(resp.header("location"), None);
        assert_eq!(
            resp.header("content-type"),
            Some("application/octet-stream")
        );
        assert_eq!(resp.body, "DATA");
    }

    #[test]
    fn test_parse_continue_then_final() {
        let raw = "HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 201 Created\r\nX-A: b\r\n\r\n";
        let resp = parse_response(raw);
        assert_eq!(resp.status, 201);
        assert_eq!(resp.header("x-a"), Some("b"));
        assert_eq!(resp.body, "");
    }

    #[test]
    fn test_parse_headers_only_dump() {
        // `-D -` with `-o file` prints only header blocks, no trailing body
        let raw = "HTTP/1.1 302 Found\r\nLocation: /x\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n";
        let resp = parse_response(raw);
        assert_eq!(resp.status, 200);
        assert_eq!(resp.header("content-length"), Some("10"));
        assert!(resp.body.is_empty());
    }

    #[test]
    fn test_parse_head_without_separator() {
        let resp = parse_response("HTTP/1.1 204 No Content\r\nServer: x");
        assert_eq!(resp.status, 204);
        assert_eq!(resp.header("server"), Some("x"));
        assert_eq!(resp.body, "");
    }

    #[test]
    fn test_parse_unparseable_status() {
        let resp = parse_response("HTTP/1.1 abc Weird\r\n\r\nbody");
        assert_eq!(resp.status, 0);
        assert_eq!(resp.body, "body");

        let resp = parse_response("HTTP/1.1\r\n\r\nbody");
        assert_eq!(resp.status, 0);
    }

    #[test]
    fn test_parse_no_http_block_is_body() {
        let raw = "{\"token\":\"abc\"}";
        let resp = parse_response(raw);
        assert_eq!(resp.status, 0);
        assert!(resp.headers.is_empty());
        assert_eq!(resp.body, raw);
    }

    #[test]
    fn test_parse_empty() {
        let resp = parse_response("");
        assert_eq!(resp, HttpResponse::default());
    }

    #[test]
    fn test_parse_body_keeps_blank_lines() {
        let raw = "HTTP/1.1 200 OK\n\nline1\n\nline2";
        let resp = parse_response(raw);
        assert_eq!(resp.body, "line1\n\nline2");
    }

    #[test]
    fn test_parse_header_value_with_colons_and_quotes() {
        let raw = "HTTP/1.1 401 Unauthorized\r\nWww-Authenticate: Bearer realm=\"https://auth.docker.io/token\",service=\"registry.docker.io\"\r\n\r\n";
        let resp = parse_response(raw);
        assert_eq!(resp.status, 401);
        assert_eq!(
            resp.header("WWW-Authenticate"),
            Some("Bearer realm=\"https://auth.docker.io/token\",service=\"registry.docker.io\"")
        );
    }

    #[test]
    fn test_parse_duplicate_header_keeps_first() {
        let raw = "HTTP/1.1 401 Unauthorized\nWWW-Authenticate: Bearer realm=\"a\"\nWWW-Authenticate: Basic realm=\"b\"\n\n";
        let resp = parse_response(raw);
        assert_eq!(resp.header("www-authenticate"), Some("Bearer realm=\"a\""));
    }

    #[test]
    fn test_content_type_strips_parameters() {
        let raw = "HTTP/1.1 200 OK\r\nContent-Type: application/vnd.oci.image.index.v1+json; charset=utf-8\r\n\r\n{}";
        let resp = parse_response(raw);
        assert_eq!(
            resp.content_type(),
            Some("application/vnd.oci.image.index.v1+json")
        );
    }

    #[test]
    fn test_build_args_without_output_uses_include() {
        let transport = CurlTransport::new("curl", "boxroot/test");
        let request = HttpRequest::get("https://r.example/v2/foo/manifests/latest")
            .header("Accept", "application/json")
            .max_time(60);
        let args = transport.build_args(&request);

        assert_eq!(&args[..3], &["-sS", "-L", "--insecure"]);
        assert!(args.contains(&"-i".to_string()));
        assert!(!args.contains(&"-o".to_string()));
        assert!(args.contains(&"User-Agent: boxroot/test".to_string()));
        assert!(args.contains(&"Accept: application/json".to_string()));
        assert!(args.windows(2).any(|w| w == ["--max-time", "60"]));
        assert_eq!(
            args.last().map(String::as_str),
            Some("https://r.example/v2/foo/manifests/latest")
        );
    }

    #[test]
    fn test_build_args_with_output_dumps_headers() {
        let transport = CurlTransport::new("curl", "ua").with_proxy(Some("socks5://p:1080".into()));
        let request = HttpRequest::get("https://r.example/v2/foo/blobs/sha256:aa")
            .output("/tmp/blob.partial")
            .basic_auth("alice", "s3cret");
        let args = transport.build_args(&request);

        assert!(args.windows(4).any(|w| w == ["-o", "/tmp/blob.partial", "-D", "-"]));
        assert!(!args.contains(&"-i".to_string()));
        assert!(args.windows(2).any(|w| w == ["--proxy", "socks5://p:1080"]));
        assert!(args.windows(2).any(|w| w == ["-u", "alice:s3cret"]));
    }

    #[test]
    fn test_redact_command_masks_password() {
        let args: Vec<String> = ["-sS", "-u", "alice:s3cret", "https://x"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let line = redact_command("curl", &args);
        assert_eq!(line, "curl -sS -u alice:*** https://x");
        assert!(!line.contains("s3cret"));
    }

    #[test]
    fn test_missing_curl_is_transport_error() {
        let transport = CurlTransport::new("/nonexistent/boxroot-curl", "ua");
        let err = transport
            .execute(&HttpRequest::get("https://r.example/v2/"))
            .unwrap_err();
        assert!(matches!(err, BoxError::TransportError(_)));
    }
}
