use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::{AppReq, ControlApi, InferenceReq};

pub const MAX_REQUEST_BYTES: usize = 64 * 1024;
pub const DEFAULT_API_ADDR: &str = "127.0.0.1:50052";
const READ_TIMEOUT: Duration = Duration::from_secs(5);
const ROUTE_PREFIX: &str = "/detector/";

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_API_ADDR.to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    api: ControlApi,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, api: ControlApi) -> Self {
        Self { cfg, api }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let api = self.api;
        let join = std::thread::Builder::new()
            .name("control-api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, api, shutdown_thread) {
                    log::error!("control api stopped: {}", err);
                }
            })?;

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, api: ControlApi, shutdown: Arc<AtomicBool>) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let api = api.clone();
                let spawned = std::thread::Builder::new()
                    .name("control-api-conn".to_string())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &api) {
                            log::warn!("control api request from {} failed: {}", peer, err);
                        }
                    });
                if let Err(err) = spawned {
                    log::warn!("control api could not spawn handler: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(20));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, api: &ControlApi) -> Result<()> {
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, r#"{"error":"forbidden"}"#)?;
        return Ok(());
    }

    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(RequestError::TooLarge) => {
            write_json_response(&mut stream, 413, r#"{"error":"request_too_large"}"#)?;
            return Ok(());
        }
        Err(RequestError::Malformed(reason)) => {
            write_json_response(&mut stream, 400, r#"{"error":"bad_request"}"#)?;
            return Err(anyhow!(reason));
        }
        Err(RequestError::Io(err)) => return Err(err.into()),
    };
    log::debug!("{} {} ({} bytes)", request.method, request.path, request.body.len());

    if request.path == "/health" {
        if request.method != "GET" {
            write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)?;
            return Ok(());
        }
        let body = serde_json::json!({
            "status": "ok",
            "sessions": api.store().len(),
            "max_sessions": api.store().max_sessions(),
            "apps": api.store().registry().len(),
        });
        write_response(&mut stream, 200, "application/json", &serde_json::to_vec(&body)?)?;
        return Ok(());
    }

    let Some(op) = request.path.strip_prefix(ROUTE_PREFIX) else {
        write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#)?;
        return Ok(());
    };
    if request.method != "POST" {
        write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)?;
        return Ok(());
    }

    let op = op.to_string();
    let payload = match op.as_str() {
        "GetAppList" => dispatch(&request.body, |req: AppReq| api.get_app_list(&req)),
        "AddInference" => dispatch(&request.body, |req: InferenceReq| api.add_inference(&req)),
        "GetInferenceStatus" => dispatch(&request.body, |req: InferenceReq| {
            api.get_inference_status(&req)
        }),
        "GetInferenceList" => dispatch(&request.body, |req: InferenceReq| {
            api.get_inference_list(&req)
        }),
        "UpdateInference" => {
            dispatch(&request.body, |req: InferenceReq| api.update_inference(&req))
        }
        "GetInferenceStatusAll" => dispatch(&request.body, |req: AppReq| {
            api.get_inference_status_all(&req)
        }),
        "RemoveInference" => {
            dispatch(&request.body, |req: InferenceReq| api.remove_inference(&req))
        }
        "RemoveInferenceAll" => {
            dispatch(&request.body, |req: AppReq| api.remove_inference_all(&req))
        }
        _ => {
            write_json_response(&mut stream, 404, r#"{"error":"unknown_operation"}"#)?;
            return Ok(());
        }
    };

    match payload {
        Ok(body) => write_response(&mut stream, 200, "application/json", &body),
        Err(err) => {
            write_json_response(&mut stream, 400, r#"{"error":"invalid_json"}"#)?;
            Err(anyhow!("{}: {}", op, err))
        }
    }
}

/// Decode the request body (empty means all defaults), run the operation and
/// encode its response.
fn dispatch<Req, Res, F>(body: &[u8], op: F) -> Result<Vec<u8>>
where
    Req: DeserializeOwned + Default,
    Res: Serialize,
    F: FnOnce(Req) -> Res,
{
    let req = if body.iter().all(|b| b.is_ascii_whitespace()) {
        Req::default()
    } else {
        serde_json::from_slice(body)?
    };
    Ok(serde_json::to_vec(&op(req))?)
}

#[derive(Debug)]
enum RequestError {
    TooLarge,
    Malformed(String),
    Io(std::io::Error),
}

impl From<std::io::Error> for RequestError {
    fn from(err: std::io::Error) -> Self {
        RequestError::Io(err)
    }
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest, RequestError> {
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    let mut buf = [0u8; 4096];
    let mut data = Vec::new();
    let header_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(RequestError::Malformed("connection closed before headers".into()));
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if data.len() > MAX_REQUEST_BYTES {
            return Err(RequestError::TooLarge);
        }
    };

    let head = String::from_utf8_lossy(&data[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| RequestError::Malformed("empty request".into()))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| RequestError::Malformed("missing method".into()))?;
    let raw_path = parts
        .next()
        .ok_or_else(|| RequestError::Malformed("missing path".into()))?;
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| RequestError::Malformed(format!("bad content-length '{}'", value)))?,
        None => 0,
    };
    if header_end + 4 + content_length > MAX_REQUEST_BYTES {
        return Err(RequestError::TooLarge);
    }

    let mut body = data[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(RequestError::Malformed("truncated body".into()));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        body,
    })
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
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        413 => "HTTP/1.1 413 Payload Too Large",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    body: Vec<u8>,
}
