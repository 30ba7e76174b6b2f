use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use anyhow::Result;

use stream_detector::api::{
    ApiConfig, ApiHandle, ApiServer, AppReq, ControlApi, ControlClient, InferenceReq,
    MAX_REQUEST_BYTES,
};
use stream_detector::events::EventBus;
use stream_detector::registry::{AppRegistry, Application, Model};
use stream_detector::session::{SessionStore, StoreSettings};
use stream_detector::LifecycleState;

struct TestApi {
    handle: Option<ApiHandle>,
    client: ControlClient,
}

impl TestApi {
    fn new(apps: Vec<Application>) -> Result<Self> {
        let store = SessionStore::new(
            AppRegistry::new(apps)?,
            EventBus::default(),
            StoreSettings::default(),
        );
        let handle = ApiServer::new(
            ApiConfig {
                addr: "127.0.0.1:0".to_string(),
            },
            ControlApi::new(store),
        )
        .spawn()?;
        let client = ControlClient::from_addr(handle.addr);
        Ok(Self {
            handle: Some(handle),
            client,
        })
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.stop().expect("failed to stop API server");
        }
    }
}

fn yolo() -> Application {
    Application {
        id: "yolo".into(),
        name: "YOLO".into(),
        description: "object detector".into(),
        version: "8".into(),
        models: vec![Model {
            name: "yolov8n".into(),
            path: "/models/yolov8n/model.hef".into(),
            labels: vec!["person".into()],
        }],
    }
}

fn raw_request(api: &TestApi, request: &str) -> Result<String> {
    let mut stream = TcpStream::connect(api.client.addr())?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.write_all(request.as_bytes())?;
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    Ok(response)
}

#[test]
fn health_reports_counts() -> Result<()> {
    let api = TestApi::new(vec![yolo()])?;
    let health = api.client.health()?;
    assert_eq!(health["status"], "ok");
    assert_eq!(health["apps"], 1);
    assert_eq!(health["sessions"], 0);
    assert_eq!(health["max_sessions"], 4);
    Ok(())
}

#[test]
fn reference_client_flow_over_http() -> Result<()> {
    let api = TestApi::new(vec![yolo()])?;
    let client = &api.client;

    let apps = client.get_app_list(&AppReq::default())?;
    assert_eq!(apps.app.len(), 1);
    assert_eq!(apps.app[0].id, "yolo");
    assert_eq!(apps.app[0].models[0].name, "yolov8n");

    let res = client.add_inference(&InferenceReq {
        app_id: "yolo".into(),
        stream_id: "cam1".into(),
        uri: "stub://cam1".into(),
        settings: r#"{"width":320,"height":240,"fps":30,"confidence_threshold":0.5}"#.into(),
    })?;
    assert_eq!(res.count, 1, "{res:?}");
    assert!(res.err.is_empty());
    assert!(res.meta.is_none());

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let status = client.get_inference_status(&InferenceReq::stream("cam1"))?;
        if status.state() == Some(LifecycleState::Connected) {
            assert!(status.err.is_empty());
            break;
        }
        assert!(Instant::now() < deadline, "never connected: {status:?}");
        std::thread::sleep(Duration::from_millis(20));
    }

    let list = client.get_inference_list(&InferenceReq::default())?;
    assert_eq!(list.inferences.len(), 1);
    assert_eq!(list.inferences[0].stream_id, "cam1");
    assert_eq!(list.inferences[0].uri, "stub://cam1");
    assert_eq!(list.inferences[0].status, 3);

    let dup = client.add_inference(&InferenceReq {
        app_id: "yolo".into(),
        stream_id: "cam1".into(),
        uri: "stub://cam1".into(),
        settings: String::new(),
    })?;
    assert_eq!(dup.count, 0);
    assert_eq!(dup.code().as_deref(), Some("DuplicateStream"));

    let removed = client.remove_inference(&InferenceReq::stream("cam1"))?;
    assert_eq!(removed.count, 1);
    let gone = client.get_inference_status(&InferenceReq::stream("cam1"))?;
    assert_eq!(gone.count, 0);
    assert_eq!(gone.status, 0);
    assert_eq!(gone.code().as_deref(), Some("NotFound"));
    Ok(())
}

#[test]
fn update_and_bulk_operations_over_http() -> Result<()> {
    let api = TestApi::new(vec![yolo()])?;
    let client = &api.client;
    for id in ["cam1", "cam2"] {
        let res = client.add_inference(&InferenceReq {
            app_id: "yolo".into(),
            stream_id: id.into(),
            uri: format!("stub://{id}"),
            settings: r#"{"width":64,"height":48,"fps":30}"#.into(),
        })?;
        assert_eq!(res.count, 1, "{res:?}");
    }

    let updated = client.update_inference(&InferenceReq {
        stream_id: "cam2".into(),
        uri: "stub://cam2-moved".into(),
        ..InferenceReq::default()
    })?;
    assert_eq!(updated.count, 1, "{updated:?}");
    let list = client.get_inference_list(&InferenceReq::default())?;
    assert_eq!(list.inferences[1].uri, "stub://cam2-moved");

    let statuses = client.get_inference_status_all(&AppReq::app("yolo"))?;
    assert_eq!(statuses.res.len(), 2);
    assert_eq!(statuses.res[0].stream_id, "cam1");

    let removed = client.remove_inference_all(&AppReq::app("yolo"))?;
    assert!(removed.result);
    assert_eq!(removed.count, 2);
    assert!(client
        .get_inference_status_all(&AppReq::default())?
        .res
        .is_empty());
    Ok(())
}

#[test]
fn unknown_app_is_reported_in_body() -> Result<()> {
    let api = TestApi::new(vec![])?;
    let res = api.client.add_inference(&InferenceReq {
        app_id: "yolo".into(),
        stream_id: "cam1".into(),
        uri: "stub://cam1".into(),
        settings: String::new(),
    })?;
    assert_eq!(res.count, 0);
    assert!(!res.err.is_empty());
    assert_eq!(res.code().as_deref(), Some("UnknownApp"));
    assert!(api.client.get_app_list(&AppReq::default())?.app.is_empty());
    Ok(())
}

#[test]
fn empty_body_uses_request_defaults() -> Result<()> {
    let api = TestApi::new(vec![yolo()])?;
    let (status, body) = api.client.send("POST", "/detector/GetInferenceList", None)?;
    assert_eq!(status, 200);
    let value: serde_json::Value = serde_json::from_slice(&body)?;
    assert_eq!(value["inferences"], serde_json::json!([]));
    Ok(())
}

#[test]
fn rejects_unknown_routes_methods_and_bad_json() -> Result<()> {
    let api = TestApi::new(vec![yolo()])?;

    let (status, _) = api.client.send("POST", "/detector/Nope", Some(b"{}".as_slice()))?;
    assert_eq!(status, 404);
    let (status, _) = api.client.send("GET", "/events", None)?;
    assert_eq!(status, 404);
    let (status, _) = api.client.send("GET", "/detector/GetAppList", None)?;
    assert_eq!(status, 405);
    let (status, _) = api.client.send("POST", "/health", None)?;
    assert_eq!(status, 405);
    let (status, _) = api
        .client
        .send("POST", "/detector/AddInference", Some(b"{not json".as_slice()))?;
    assert_eq!(status, 400);
    Ok(())
}

#[test]
fn rejects_oversized_requests() -> Result<()> {
    let api = TestApi::new(vec![yolo()])?;
    let request = format!(
        "POST /detector/AddInference HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n\r\n",
        MAX_REQUEST_BYTES + 1
    );
    let response = raw_request(&api, &request)?;
    assert!(response.contains("413 Payload Too Large"), "{response}");
    Ok(())
}
