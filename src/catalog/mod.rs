//! Remote catalog access: transport seam, token cache, request helper, and
//! manifest quality probing.

pub mod client;
pub mod manifest;
pub mod token_cache;

use std::io::Read;
use std::time::Duration;

/// Minimal response view used by the catalog layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_auth_rejection(&self) -> bool {
        self.status == 401 || self.status == 403
    }
}

/// One outgoing GET request.
#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Interface implemented by HTTP transports. Non-2xx statuses are returned as
/// responses; `Err` is reserved for transport-level failures.
pub trait HttpTransport: Send + Sync {
    fn get(&self, request: &HttpRequest) -> Result<HttpResponse, String>;
}

const USER_AGENT: &str = "tunefetch/0.1.0";

/// `HttpTransport` backed by `ureq`.
pub struct UreqTransport {
    http_client: ureq::Agent,
}

impl UreqTransport {
    pub fn new(default_timeout: Duration) -> Self {
        let http_client = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5))
            .timeout_read(default_timeout)
            .timeout_write(default_timeout)
            .user_agent(USER_AGENT)
            .build();
        Self { http_client }
    }

    fn read_body(response: ureq::Response) -> Result<HttpResponse, String> {
        let status = response.status();
        let mut body = String::new();
        response
            .into_reader()
            .read_to_string(&mut body)
            .map_err(|error| format!("Failed to read response: {error}"))?;
        Ok(HttpResponse { status, body })
    }
}

impl HttpTransport for UreqTransport {
    fn get(&self, request: &HttpRequest) -> Result<HttpResponse, String> {
        let mut call = self.http_client.get(&request.url);
        for (name, value) in &request.headers {
            call = call.set(name, value);
        }
        if let Some(timeout) = request.timeout {
            call = call.timeout(timeout);
        }
        match call.call() {
            Ok(response) => Self::read_body(response),
            Err(ureq::Error::Status(_, response)) => Self::read_body(response),
            Err(ureq::Error::Transport(transport)) => Err(format!("Request failed: {transport}")),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::{HttpRequest, HttpResponse, HttpTransport};

    type Responder = Box<dyn Fn(&HttpRequest) -> Option<Result<HttpResponse, String>> + Send + Sync>;

    /// Scripted transport: each request is answered by the first queued
    /// response for a matching URL fragment, then by the fallback responder.
    pub struct ScriptedTransport {
        queued: Mutex<VecDeque<(String, Result<HttpResponse, String>)>>,
        fallback: Option<Responder>,
        pub requests: Mutex<Vec<HttpRequest>>,
        pub calls: AtomicUsize,
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self {
                queued: Mutex::new(VecDeque::new()),
                fallback: None,
                requests: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn with_fallback<F>(responder: F) -> Self
        where
            F: Fn(&HttpRequest) -> Option<Result<HttpResponse, String>> + Send + Sync + 'static,
        {
            Self {
                fallback: Some(Box::new(responder)),
                ..Self::new()
            }
        }

        pub fn push(&self, url_fragment: &str, response: Result<HttpResponse, String>) {
            self.queued
                .lock()
                .unwrap()
                .push_back((url_fragment.to_string(), response));
        }

        pub fn push_ok(&self, url_fragment: &str, status: u16, body: &str) {
            self.push(
                url_fragment,
                Ok(HttpResponse {
                    status,
                    body: body.to_string(),
                }),
            );
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn requests_matching(&self, url_fragment: &str) -> Vec<HttpRequest> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .filter(|request| request.url.contains(url_fragment))
                .cloned()
                .collect()
        }
    }

    impl HttpTransport for ScriptedTransport {
        fn get(&self, request: &HttpRequest) -> Result<HttpResponse, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request.clone());
            {
                let mut queued = self.queued.lock().unwrap();
                if let Some(position) = queued
                    .iter()
                    .position(|(fragment, _)| request.url.contains(fragment.as_str()))
                {
                    if let Some((_, response)) = queued.remove(position) {
                        return response;
                    }
                }
            }
            if let Some(fallback) = &self.fallback {
                if let Some(response) = fallback(request) {
                    return response;
                }
            }
            Err(format!("no scripted response for {}", request.url))
        }
    }
}
