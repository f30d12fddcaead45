//! Request head parsing and routing
//!
//! The head itself is parsed by `httparse`; this module keeps what the relay
//! needs from it: the request line, the query string, and the few headers
//! shown on the diagnostics page.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use crate::registry::{Interface, SourceParams};

/// Summary page path
pub const STAT_PATH: &str = "/stat";
/// Per-channel detail page path
pub const STAT_CHANNELS_PATH: &str = "/stat/channels";

/// Headers examined per request; more is rejected
const MAX_HEADERS: usize = 32;

/// Error type for request parsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// Request line or header line is not valid HTTP
    Parse(httparse::Error),
    /// Head is valid HTTP but not usable
    Malformed(&'static str),
    /// Head exceeded the configured limit
    TooLarge(usize),
    /// Head did not arrive in time
    Timeout(Duration),
    /// Connection closed before the head was complete
    Incomplete,
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::Parse(e) => write!(f, "Malformed request: {}", e),
            RequestError::Malformed(what) => write!(f, "Malformed request: {}", what),
            RequestError::TooLarge(limit) => {
                write!(f, "Request head exceeds {} bytes", limit)
            }
            RequestError::Timeout(after) => {
                write!(f, "Request head not received within {:?}", after)
            }
            RequestError::Incomplete => write!(f, "Connection closed mid-request"),
        }
    }
}

impl std::error::Error for RequestError {}

impl From<httparse::Error> for RequestError {
    fn from(e: httparse::Error) -> Self {
        RequestError::Parse(e)
    }
}

/// Request method
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Other(String),
}

impl Method {
    fn parse(token: &str) -> Self {
        match token {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            other => Method::Other(other.to_string()),
        }
    }
}

/// Parsed request line and the headers the relay cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: Method,
    /// Path without the query string
    pub path: String,
    /// Query pairs in request order
    pub query: Vec<(String, String)>,
    pub user_agent: Option<String>,
    /// Client address reported by a proxy
    pub real_ip: Option<String>,
}

impl RequestHead {
    /// Parse a request head that may still be arriving
    ///
    /// `Ok(None)` means more bytes are needed.
    pub fn parse_partial(buf: &[u8]) -> Result<Option<Self>, RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        if req.parse(buf)?.is_partial() {
            return Ok(None);
        }

        let (Some(method), Some(target)) = (req.method, req.path) else {
            return Err(RequestError::Malformed("missing request line"));
        };
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, parse_query(query)),
            None => (target, Vec::new()),
        };

        let mut head = RequestHead {
            method: Method::parse(method),
            path: path.to_string(),
            query,
            user_agent: None,
            real_ip: None,
        };

        for header in req.headers.iter() {
            let value = || {
                std::str::from_utf8(header.value)
                    .map(|v| v.trim().to_string())
                    .map_err(|_| RequestError::Malformed("header value not valid UTF-8"))
            };

            if header.name.eq_ignore_ascii_case("user-agent") {
                head.user_agent = Some(value()?);
            } else if header.name.eq_ignore_ascii_case("x-real-ip") {
                head.real_ip = Some(value()?);
            } else if header.name.eq_ignore_ascii_case("x-forwarded-for") && head.real_ip.is_none() {
                // First hop is the originating client
                let value = value()?;
                let first = value.split(',').next().unwrap_or(value.as_str()).trim();
                head.real_ip = Some(first.to_string());
            }
        }

        Ok(Some(head))
    }

    /// Parse a complete request head
    pub fn parse(buf: &[u8]) -> Result<Self, RequestError> {
        Self::parse_partial(buf)?.ok_or(RequestError::Malformed("incomplete request head"))
    }

    /// First value of query parameter `name`
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

/// What a request asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Relay a source
    Stream(SourceParams),
    /// Summary page
    Status,
    /// Per-channel detail page
    ChannelStatus,
    NotFound,
    BadRequest(String),
    MethodNotAllowed,
}

/// Map a request onto a [`Route`]
///
/// `/udp/<addr:port>` and `/rtp/<addr:port>` resolve to the same source; the
/// payload format is detected per datagram. `ifname`/`ifindex` override the
/// default interface and `rejoin_time` sets the rejoin interval in seconds.
pub fn route(head: &RequestHead, default_interface: &Interface) -> Route {
    if !matches!(head.method, Method::Get | Method::Head) {
        return Route::MethodNotAllowed;
    }

    match head.path.as_str() {
        STAT_PATH => return Route::Status,
        STAT_CHANNELS_PATH => return Route::ChannelStatus,
        _ => {}
    }

    let source = head
        .path
        .strip_prefix("/udp/")
        .or_else(|| head.path.strip_prefix("/rtp/"));
    let Some(source) = source else {
        return Route::NotFound;
    };

    match stream_params(head, source.trim_end_matches('/'), default_interface) {
        Ok(params) => Route::Stream(params),
        Err(reason) => Route::BadRequest(reason),
    }
}

fn stream_params(
    head: &RequestHead,
    source: &str,
    default_interface: &Interface,
) -> Result<SourceParams, String> {
    let addr: SocketAddr = source
        .parse()
        .map_err(|_| format!("invalid source address: {}", source))?;
    if addr.port() == 0 {
        return Err("source port must be non-zero".to_string());
    }

    let interface = if let Some(name) = head.query_param("ifname") {
        Interface::by_name(name).map_err(|e| e.to_string())?
    } else if let Some(index) = head.query_param("ifindex") {
        let index: u32 = index
            .parse()
            .map_err(|_| format!("invalid interface index: {}", index))?;
        Interface::by_index(index).map_err(|e| e.to_string())?
    } else {
        default_interface.clone()
    };

    let mut params = SourceParams::new(addr, interface);
    if let Some(secs) = head.query_param("rejoin_time") {
        let secs: u64 = secs
            .parse()
            .map_err(|_| format!("invalid rejoin_time: {}", secs))?;
        params = params.rejoin_interval(Duration::from_secs(secs));
    }
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> RequestHead {
        RequestHead::parse(raw.as_bytes()).unwrap()
    }

    #[test]
    fn test_parse_partial_waits_for_blank_line() {
        assert_eq!(RequestHead::parse_partial(b"GET /stat HTTP/1.1\r\nHost: x\r\n"), Ok(None));

        let head = RequestHead::parse_partial(b"GET /stat HTTP/1.1\r\nHost: x\r\n\r\nextra")
            .unwrap()
            .unwrap();
        assert_eq!(head.path, "/stat");
    }

    #[test]
    fn test_parse_request() {
        let head = parse(
            "GET /udp/239.1.1.1:1234?ifname=lo&rejoin_time=30 HTTP/1.1\r\n\
             Host: relay\r\n\
             User-Agent: VLC/3.0\r\n\
             X-Forwarded-For: 203.0.113.9, 10.0.0.1\r\n\r\n",
        );

        assert_eq!(head.method, Method::Get);
        assert_eq!(head.path, "/udp/239.1.1.1:1234");
        assert_eq!(head.query_param("ifname"), Some("lo"));
        assert_eq!(head.query_param("rejoin_time"), Some("30"));
        assert_eq!(head.user_agent.as_deref(), Some("VLC/3.0"));
        assert_eq!(head.real_ip.as_deref(), Some("203.0.113.9"));
    }

    #[test]
    fn test_real_ip_wins_over_forwarded_for() {
        let head = parse(
            "GET / HTTP/1.0\r\nX-Real-IP: 198.51.100.7\r\nX-Forwarded-For: 203.0.113.9\r\n\r\n",
        );
        assert_eq!(head.real_ip.as_deref(), Some("198.51.100.7"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            RequestHead::parse(b"\r\n\r\n"),
            Err(RequestError::Malformed(_))
        ));
        assert!(matches!(
            RequestHead::parse(b"GET /\r\n\r\n"),
            Err(RequestError::Parse(_))
        ));
        assert_eq!(
            RequestHead::parse(b"GET / SPDY/3\r\n\r\n"),
            Err(RequestError::Parse(httparse::Error::Version))
        );
        assert_eq!(
            RequestHead::parse(b"GET / HTTP/1.1\r\nNoColon\r\n\r\n"),
            Err(RequestError::Parse(httparse::Error::HeaderName))
        );
        assert!(matches!(
            RequestHead::parse(b"GARBAGE\r\n\r\n"),
            Err(RequestError::Parse(_))
        ));
    }

    #[test]
    fn test_parse_rejects_too_many_headers() {
        let mut raw = String::from("GET /stat HTTP/1.1\r\n");
        for i in 0..=MAX_HEADERS {
            raw.push_str(&format!("X-Filler-{}: {}\r\n", i, i));
        }
        raw.push_str("\r\n");

        assert_eq!(
            RequestHead::parse(raw.as_bytes()),
            Err(RequestError::Parse(httparse::Error::TooManyHeaders))
        );
    }

    #[test]
    fn test_route_udp_and_rtp_share_key() {
        let any = Interface::any();
        let udp = route(&parse("GET /udp/239.1.1.1:1234 HTTP/1.1\r\n\r\n"), &any);
        let rtp = route(&parse("HEAD /rtp/239.1.1.1:1234 HTTP/1.1\r\n\r\n"), &any);

        let (Route::Stream(udp), Route::Stream(rtp)) = (udp, rtp) else {
            panic!("expected stream routes");
        };
        assert_eq!(udp.key(), rtp.key());
        assert_eq!(udp.key().as_str(), "/udp/239.1.1.1:1234@any");
    }

    #[test]
    fn test_route_interface_and_rejoin() {
        let route = route(
            &parse("GET /udp/239.1.1.1:1234?ifname=lo&rejoin_time=15 HTTP/1.1\r\n\r\n"),
            &Interface::any(),
        );
        let Route::Stream(params) = route else {
            panic!("expected stream route");
        };
        assert_eq!(params.interface.name(), "lo");
        assert_eq!(params.rejoin_interval, Duration::from_secs(15));
    }

    #[test]
    fn test_route_errors() {
        let any = Interface::any();

        assert_eq!(
            route(&parse("POST /udp/239.1.1.1:1234 HTTP/1.1\r\n\r\n"), &any),
            Route::MethodNotAllowed
        );
        assert_eq!(route(&parse("GET /index.html HTTP/1.1\r\n\r\n"), &any), Route::NotFound);
        assert!(matches!(
            route(&parse("GET /udp/not-an-address HTTP/1.1\r\n\r\n"), &any),
            Route::BadRequest(_)
        ));
        assert!(matches!(
            route(&parse("GET /udp/239.1.1.1:0 HTTP/1.1\r\n\r\n"), &any),
            Route::BadRequest(_)
        ));
        assert!(matches!(
            route(
                &parse("GET /udp/239.1.1.1:1234?ifname=no-such-if0 HTTP/1.1\r\n\r\n"),
                &any
            ),
            Route::BadRequest(_)
        ));
    }

    #[test]
    fn test_route_status_pages() {
        let any = Interface::any();
        assert_eq!(route(&parse("GET /stat HTTP/1.1\r\n\r\n"), &any), Route::Status);
        assert_eq!(
            route(&parse("GET /stat/channels HTTP/1.1\r\n\r\n"), &any),
            Route::ChannelStatus
        );
    }
}
