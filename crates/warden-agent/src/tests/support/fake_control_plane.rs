//! In-process stand-in for the daemon's HTTP control plane.
//!
//! The server answers the handful of endpoints the session uses, keeps a
//! tunnel table so connect/list/disconnect round trips behave like the real
//! daemon, and records every request for later assertions.

use std::collections::{BTreeMap, VecDeque};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{Map, Value, json};

/// A request received by [`FakeControlPlane`].
#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl RecordedRequest {
    pub fn json_body(&self) -> Value {
        serde_json::from_str(&self.body).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone)]
struct CannedResponse {
    status: u16,
    body: String,
    delay: Duration,
}

#[derive(Default)]
struct ServerState {
    tunnels: BTreeMap<String, Value>,
    requests: Vec<RecordedRequest>,
    canned: VecDeque<CannedResponse>,
    legacy_dual_tunnels: bool,
    next_id: u32,
}

/// Threaded HTTP server speaking just enough of the control-plane API.
pub(crate) struct FakeControlPlane {
    addr: SocketAddr,
    state: Arc<Mutex<ServerState>>,
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl FakeControlPlane {
    pub fn spawn() -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).context("bind fake control plane")?;
        listener
            .set_nonblocking(true)
            .context("fake control plane nonblocking")?;
        let addr = listener.local_addr().context("local addr")?;
        let state = Arc::new(Mutex::new(ServerState::default()));
        let stop = Arc::new(AtomicBool::new(false));

        let thread_state = Arc::clone(&state);
        let thread_stop = Arc::clone(&stop);
        let handle = thread::spawn(move || serve(&listener, &thread_state, &thread_stop));

        Ok(Self {
            addr,
            state,
            stop,
            handle: Some(handle),
        })
    }

    /// `host:port` as the daemon would announce it in its `addr` field.
    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    pub fn api_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Answers the next request with `status` and `body` instead of routing it.
    pub fn respond_next(&self, status: u16, body: &str) {
        self.respond_next_after(status, body, Duration::ZERO);
    }

    pub fn respond_next_after(&self, status: u16, body: &str, delay: Duration) {
        lock(&self.state).canned.push_back(CannedResponse {
            status,
            body: body.to_owned(),
            delay,
        });
    }

    /// Emulates 2.x agents, which open an extra plaintext tunnel for bare
    /// `http` requests.
    pub fn enable_legacy_dual_tunnels(&self) {
        lock(&self.state).legacy_dual_tunnels = true;
    }

    /// Registers a tunnel as if another client had created it.
    pub fn insert_tunnel(&self, name: &str, proto: &str, addr: &str) -> Value {
        let mut state = lock(&self.state);
        let tunnel = build_tunnel(&mut state, name, proto, addr, "https");
        state.tunnels.insert(name.to_owned(), tunnel.clone());
        tunnel
    }

    pub fn remove_tunnel(&self, name: &str) {
        lock(&self.state).tunnels.remove(name);
    }

    pub fn tunnel_count(&self) -> usize {
        lock(&self.state).tunnels.len()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        lock(&self.state).requests.clone()
    }

    pub fn requests_matching(&self, method: &str, path_prefix: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|request| request.method == method && request.path.starts_with(path_prefix))
            .collect()
    }
}

impl Drop for FakeControlPlane {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn lock(state: &Mutex<ServerState>) -> MutexGuard<'_, ServerState> {
    state.lock().unwrap_or_else(|poison| poison.into_inner())
}

fn serve(listener: &TcpListener, state: &Mutex<ServerState>, stop: &AtomicBool) {
    while !stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                let _ = handle_connection(stream, state);
            }
            Err(ref error) if error.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(5));
            }
            Err(_) => return,
        }
    }
}

fn handle_connection(stream: TcpStream, state: &Mutex<ServerState>) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = read_request(&stream)?;

    let canned = {
        let mut guard = lock(state);
        guard.requests.push(request.clone());
        guard.canned.pop_front()
    };
    let (status, body) = match canned {
        Some(response) => {
            thread::sleep(response.delay);
            (response.status, response.body)
        }
        None => route(&request, &mut lock(state)),
    };
    write_response(stream, status, &body)
}

fn read_request(stream: &TcpStream) -> Result<RecordedRequest> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_owned();
    let path = parts.next().unwrap_or_default().to_owned();

    let mut headers = BTreeMap::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        let header = line.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_owned());
        }
    }

    let length = headers
        .get("content-length")
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = vec![0_u8; length];
    reader.read_exact(&mut body)?;

    Ok(RecordedRequest {
        method,
        path,
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}

fn write_response(mut stream: TcpStream, status: u16, body: &str) -> Result<()> {
    let response = format!(
        "HTTP/1.1 {status} {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        reason(status),
        body.len()
    );
    stream.write_all(response.as_bytes())?;
    stream.flush()?;
    Ok(())
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        502 => "Bad Gateway",
        _ => "Unknown",
    }
}

fn not_found() -> (u16, String) {
    (
        404,
        json!({"error_code": 100, "status_code": 404, "msg": "not found"}).to_string(),
    )
}

fn route(request: &RecordedRequest, state: &mut ServerState) -> (u16, String) {
    let (path, _query) = request
        .path
        .split_once('?')
        .unwrap_or((request.path.as_str(), ""));
    let decoded = path
        .replace("%20", " ")
        .replace("%28", "(")
        .replace("%29", ")");

    match (request.method.as_str(), decoded.as_str()) {
        ("GET", "/api/tunnels") => {
            let tunnels: Vec<Value> = state.tunnels.values().cloned().collect();
            (200, json!({ "tunnels": tunnels }).to_string())
        }
        ("POST", "/api/tunnels") => create_tunnel(state, &request.json_body()),
        ("GET", "/api/status") => (
            200,
            json!({
                "status": "online",
                "agent_version": "3.5.0",
                "session": {"status": "online"},
                "uri": "/api/status"
            })
            .to_string(),
        ),
        ("GET", "/api/requests/http") => (
            200,
            json!({ "requests": [captured_request("req_1")] }).to_string(),
        ),
        ("POST" | "DELETE", "/api/requests/http") => (204, String::new()),
        ("GET", other) if other.starts_with("/api/requests/http/") => {
            let id = other.trim_start_matches("/api/requests/http/");
            (200, captured_request(id).to_string())
        }
        ("GET", other) => other
            .strip_prefix("/api/tunnels/")
            .and_then(|name| state.tunnels.get(name))
            .map_or_else(not_found, |tunnel| (200, tunnel.to_string())),
        ("DELETE", other) => other
            .strip_prefix("/api/tunnels/")
            .and_then(|name| state.tunnels.remove(name))
            .map_or_else(not_found, |_| (204, String::new())),
        _ => not_found(),
    }
}

fn create_tunnel(state: &mut ServerState, body: &Value) -> (u16, String) {
    let field = |key: &str| {
        body.get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned()
    };
    let name = field("name");
    let proto = field("proto");
    let addr = field("addr");
    if state.tunnels.contains_key(&name) {
        return (
            400,
            json!({"error_code": 102, "status_code": 400, "msg": "tunnel already exists"})
                .to_string(),
        );
    }

    let plaintext_only = body
        .get("schemes")
        .and_then(Value::as_array)
        .is_some_and(|schemes| schemes.iter().all(|scheme| scheme == "http"));
    let scheme = if plaintext_only { "http" } else { "https" };
    let tunnel = build_tunnel(state, &name, &proto, &addr, scheme);

    if state.legacy_dual_tunnels && proto == "http" && body.get("bind_tls").is_none() {
        let variant = format!("{name} (http)");
        let plaintext = build_tunnel(state, &variant, &proto, &addr, "http");
        state.tunnels.insert(variant, plaintext);
    }
    state.tunnels.insert(name, tunnel.clone());
    (201, tunnel.to_string())
}

fn build_tunnel(state: &mut ServerState, name: &str, proto: &str, addr: &str, scheme: &str) -> Value {
    state.next_id += 1;
    let id = state.next_id;
    let is_port = !addr.is_empty() && addr.chars().all(|ch| ch.is_ascii_digit());
    let (public_url, forward) = match proto {
        "tcp" => (
            format!("tcp://0.tcp.ngrok.example:{}", 10_000 + id),
            format!("localhost:{addr}"),
        ),
        _ => (
            format!("{scheme}://t{id}.ngrok.example"),
            if is_port {
                format!("http://localhost:{addr}")
            } else {
                addr.to_owned()
            },
        ),
    };
    let mut config = Map::new();
    config.insert("addr".into(), Value::String(forward));
    config.insert("inspect".into(), Value::Bool(true));
    json!({
        "ID": format!("tn_{id}"),
        "name": name,
        "uri": format!("/api/tunnels/{}", name.replace(' ', "+")),
        "public_url": public_url,
        "proto": if proto == "http" { scheme } else { proto },
        "config": config,
        "metrics": {"conns": {"count": 0}, "http": {"count": 0}}
    })
}

fn captured_request(id: &str) -> Value {
    json!({
        "id": id,
        "uri": format!("/api/requests/http/{id}"),
        "tunnel_name": "web",
        "remote_addr": "192.0.2.1",
        "start": "2024-05-01T10:00:00Z",
        "duration": 1_500_000,
        "request": {"method": "GET", "uri": "/"},
        "response": {"status_code": 200}
    })
}
