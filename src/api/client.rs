use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use super::{AppList, AppReq, AppRes, InferenceList, InferenceReq, InferenceRes, InferenceResList};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Blocking client for the detectord control API. One connection per call.
#[derive(Clone, Debug)]
pub struct ControlClient {
    addr: SocketAddr,
}

impl ControlClient {
    /// `addr` is `host:port`; `localhost` resolves like any other name.
    pub fn new(addr: &str) -> Result<Self> {
        let addr = addr
            .to_socket_addrs()
            .with_context(|| format!("invalid control api address {}", addr))?
            .next()
            .ok_or_else(|| anyhow!("control api address {} did not resolve", addr))?;
        Ok(Self { addr })
    }

    pub fn from_addr(addr: SocketAddr) -> Self {
        Self { addr }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn health(&self) -> Result<serde_json::Value> {
        let (status, body) = self.send("GET", "/health", None)?;
        if status != 200 {
            return Err(anyhow!("health check returned status {}", status));
        }
        serde_json::from_slice(&body).context("failed to parse /health response")
    }

    pub fn get_app_list(&self, req: &AppReq) -> Result<AppList> {
        self.call("GetAppList", req)
    }

    pub fn add_inference(&self, req: &InferenceReq) -> Result<InferenceRes> {
        self.call("AddInference", req)
    }

    pub fn get_inference_status(&self, req: &InferenceReq) -> Result<InferenceRes> {
        self.call("GetInferenceStatus", req)
    }

    pub fn get_inference_list(&self, req: &InferenceReq) -> Result<InferenceList> {
        self.call("GetInferenceList", req)
    }

    pub fn update_inference(&self, req: &InferenceReq) -> Result<InferenceRes> {
        self.call("UpdateInference", req)
    }

    pub fn get_inference_status_all(&self, req: &AppReq) -> Result<InferenceResList> {
        self.call("GetInferenceStatusAll", req)
    }

    pub fn remove_inference(&self, req: &InferenceReq) -> Result<InferenceRes> {
        self.call("RemoveInference", req)
    }

    pub fn remove_inference_all(&self, req: &AppReq) -> Result<AppRes> {
        self.call("RemoveInferenceAll", req)
    }

    fn call<Req: Serialize, Res: DeserializeOwned>(&self, op: &str, req: &Req) -> Result<Res> {
        let body = serde_json::to_vec(req)?;
        let path = format!("/detector/{}", op);
        let (status, body) = self.send("POST", &path, Some(&body))?;
        if status != 200 {
            return Err(anyhow!(
                "{} returned status {}: {}",
                op,
                status,
                String::from_utf8_lossy(&body)
            ));
        }
        serde_json::from_slice(&body).with_context(|| format!("failed to parse {} response", op))
    }

    /// Send one request and return the status code and body.
    pub fn send(&self, method: &str, path: &str, body: Option<&[u8]>) -> Result<(u16, Vec<u8>)> {
        let mut stream = TcpStream::connect_timeout(&self.addr, CONNECT_TIMEOUT)?;
        stream.set_read_timeout(Some(READ_TIMEOUT))?;

        let body = body.unwrap_or_default();
        let request = format!(
            "{method} {path} HTTP/1.1\r\nHost: {host}\r\nContent-Type: application/json\r\nContent-Length: {len}\r\nConnection: close\r\n\r\n",
            method = method,
            path = path,
            host = self.addr,
            len = body.len()
        );
        stream.write_all(request.as_bytes())?;
        stream.write_all(body)?;

        let mut response = Vec::new();
        stream.read_to_end(&mut response)?;
        let header_end = response
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .ok_or_else(|| anyhow!("invalid http response"))?;
        let (header, body) = response.split_at(header_end + 4);
        let header_text = String::from_utf8_lossy(header);
        let status_line = header_text
            .lines()
            .next()
            .ok_or_else(|| anyhow!("missing status line"))?;
        let status: u16 = status_line
            .split_whitespace()
            .nth(1)
            .ok_or_else(|| anyhow!("missing status code"))?
            .parse()
            .context("invalid status code")?;
        Ok((status, body.to_vec()))
    }
}
