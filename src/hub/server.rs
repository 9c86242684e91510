//! Hub receiver: the segment transfer surface.
//!
//! A deliberately small HTTP server over `TcpListener`:
//!
//! - `POST /segments`  - receive one segment (manifest in headers, raw
//!   container bytes as the body); the job is durably queued before the
//!   success response is written
//! - `GET  /health`    - liveness probe
//! - `GET  /jobs`      - recent jobs, including terminal failures, so
//!   operators can diagnose without log access
//! - `GET  /events`    - recent detection events
//!
//! This is the transfer protocol endpoint only; dashboards and account
//! management live elsewhere and query the store directly.

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::hub::queue::{ProcessingQueue, ReceiveOutcome};
use crate::transport::SegmentManifest;

const MAX_HEADER_BYTES: usize = 8192;
/// Hard cap on an uploaded segment body (512 MiB).
const MAX_BODY_BYTES: usize = 512 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct HubServerConfig {
    pub addr: String,
}

pub struct HubServer {
    cfg: HubServerConfig,
    queue: Arc<Mutex<ProcessingQueue>>,
}

#[derive(Debug)]
pub struct HubHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl HubHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("hub server thread panicked"))?;
        }
        Ok(())
    }
}

impl HubServer {
    pub fn new(cfg: HubServerConfig, queue: Arc<Mutex<ProcessingQueue>>) -> Self {
        Self { cfg, queue }
    }

    pub fn spawn(self) -> Result<HubHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let queue = self.queue;
        let join = std::thread::Builder::new()
            .name("hub-server".to_string())
            .spawn(move || {
                if let Err(err) = run_server(listener, queue, shutdown_thread) {
                    log::error!("hub server stopped: {}", err);
                }
            })
            .expect("spawn hub server thread");

        Ok(HubHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_server(
    listener: TcpListener,
    queue: Arc<Mutex<ProcessingQueue>>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, &queue) {
                    log::warn!("hub request rejected: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, queue: &Arc<Mutex<ProcessingQueue>>) -> Result<()> {
    let request = read_request(&mut stream)?;

    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/health") => {
            write_json_response(&mut stream, 200, r#"{"status":"ok"}"#)?;
        }
        ("GET", "/jobs") => {
            let jobs = lock(queue)?.list_jobs(100)?;
            let payload = serde_json::to_vec(&jobs)?;
            write_response(&mut stream, 200, "application/json", &payload)?;
        }
        ("GET", "/events") => {
            let events = lock(queue)?.list_events(100)?;
            let views: Vec<serde_json::Value> = events
                .into_iter()
                .map(|(job_id, camera_id, event)| {
                    serde_json::json!({
                        "job_id": job_id,
                        "camera_id": camera_id,
                        "event": event,
                    })
                })
                .collect();
            let payload = serde_json::to_vec(&views)?;
            write_response(&mut stream, 200, "application/json", &payload)?;
        }
        ("POST", "/segments") => {
            let manifest = match manifest_from_headers(&request) {
                Ok(manifest) => manifest,
                Err(err) => {
                    let body = serde_json::json!({ "error": format!("{}", err) });
                    write_response(&mut stream, 400, "application/json", body.to_string().as_bytes())?;
                    return Err(err);
                }
            };
            // Durability before acknowledgement: receive() commits the
            // pending job before this response line is written.
            match lock(queue)?.receive(&manifest, &request.body) {
                Ok(ReceiveOutcome::Queued(job_id)) => {
                    let body = format!(r#"{{"status":"accepted","job_id":{}}}"#, job_id);
                    write_json_response(&mut stream, 200, &body)?;
                }
                Ok(ReceiveOutcome::Duplicate) => {
                    write_json_response(&mut stream, 200, r#"{"status":"duplicate"}"#)?;
                }
                Err(err) => {
                    let body = serde_json::json!({ "error": format!("{}", err) });
                    write_response(&mut stream, 400, "application/json", body.to_string().as_bytes())?;
                    return Err(err);
                }
            }
        }
        ("POST", _) | ("GET", _) => {
            write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#)?;
        }
        _ => {
            write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)?;
        }
    }
    Ok(())
}

fn lock(queue: &Arc<Mutex<ProcessingQueue>>) -> Result<std::sync::MutexGuard<'_, ProcessingQueue>> {
    queue
        .lock()
        .map_err(|_| anyhow!("processing queue lock poisoned"))
}

fn manifest_from_headers(request: &HttpRequest) -> Result<SegmentManifest> {
    let camera_id = request
        .header("x-camera-id")
        .ok_or_else(|| anyhow!("missing x-camera-id header"))?;
    let start_ms: u64 = request
        .header("x-start-ms")
        .ok_or_else(|| anyhow!("missing x-start-ms header"))?
        .parse()
        .map_err(|_| anyhow!("x-start-ms must be an integer"))?;
    let end_ms = match request.header("x-end-ms") {
        Some(value) => Some(
            value
                .parse::<u64>()
                .map_err(|_| anyhow!("x-end-ms must be an integer"))?,
        ),
        None => None,
    };
    let frame_count: u32 = request
        .header("x-frame-count")
        .unwrap_or_else(|| "0".to_string())
        .parse()
        .map_err(|_| anyhow!("x-frame-count must be an integer"))?;
    let checksum = request
        .header("x-checksum")
        .ok_or_else(|| anyhow!("missing x-checksum header"))?;

    Ok(SegmentManifest {
        camera_id,
        start_ms,
        end_ms,
        frame_count,
        checksum,
    })
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;
    let mut buf = [0u8; 4096];
    let mut data = Vec::new();
    let header_end;
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before headers"));
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(pos) = find_header_end(&data) {
            header_end = pos;
            break;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(anyhow!("request headers too large"));
        }
    }

    let header_text = String::from_utf8_lossy(&data[..header_end]).to_string();
    let mut lines = header_text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length: usize = headers
        .get("content-length")
        .map(|v| v.parse())
        .transpose()
        .map_err(|_| anyhow!("invalid content-length"))?
        .unwrap_or(0);
    if content_length > MAX_BODY_BYTES {
        return Err(anyhow!(
            "body length {} exceeds maximum {}",
            content_length,
            MAX_BODY_BYTES
        ));
    }

    let mut body = data[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed mid-body"));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        headers,
        body,
    })
}

fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    // One request per connection; announce it so clients do not pool.
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl HttpRequest {
    fn header(&self, name: &str) -> Option<String> {
        self.headers.get(name).cloned()
    }
}
