//! End-to-end rotation against mocked provider endpoints, a scratch settings
//! database and a recording service manager.

use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use wgswap::config::{RegistrationSection, TimeoutSection};
use wgswap::{RotationConfig, RotationErrorKind, RotationManager, RotationState};
use wgswap_service::{ServiceError, ServiceManager};
use wgswap_store::{DocumentError, SettingsStore, StoreError, DEFAULT_SETTINGS_KEY};
use wgswap_vpn::{PrivateKey, SelectError};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SERVER_KEY: &str = "WDvCRKv9hVAx1P3L7dKxiNxI3CxbK9Ue1tL8x2ZqRVk=";
const UNIT: &str = "x-ui.service";

// ============================================================================
// Recording service manager
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Call {
    IsActive,
    /// Stored document at the time of the call
    Stop(String),
    Start(String),
}

#[derive(Default)]
struct Behavior {
    active: bool,
    fail_query: bool,
    fail_stop: bool,
    fail_start: bool,
    /// Empty `outbounds` while the unit is stopped
    clear_outbounds_on_stop: bool,
}

#[derive(Clone)]
struct RecordingService {
    db: PathBuf,
    behavior: Arc<Behavior>,
    calls: Arc<Mutex<Vec<Call>>>,
}

impl RecordingService {
    fn new(db: &Path, behavior: Behavior) -> Self {
        Self {
            db: db.to_path_buf(),
            behavior: Arc::new(behavior),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn failure(&self, action: &'static str) -> ServiceError {
        ServiceError::Failed {
            action,
            unit: UNIT.to_string(),
            status: "exit status: 1".to_string(),
            stderr: "Job failed".to_string(),
        }
    }
}

impl ServiceManager for RecordingService {
    async fn is_active(&self, _unit: &str) -> Result<bool, ServiceError> {
        self.record(Call::IsActive);
        if self.behavior.fail_query {
            return Err(ServiceError::Timeout {
                action: "is-active",
                unit: UNIT.to_string(),
                timeout: std::time::Duration::from_secs(11),
            });
        }
        Ok(self.behavior.active)
    }

    async fn stop(&self, _unit: &str) -> Result<(), ServiceError> {
        self.record(Call::Stop(read_document(&self.db)));
        if self.behavior.clear_outbounds_on_stop {
            overwrite_document(&self.db, r#"{"outbounds":[]}"#);
        }
        if self.behavior.fail_stop {
            return Err(self.failure("stop"));
        }
        Ok(())
    }

    async fn start(&self, _unit: &str) -> Result<(), ServiceError> {
        self.record(Call::Start(read_document(&self.db)));
        if self.behavior.fail_start {
            return Err(self.failure("start"));
        }
        Ok(())
    }
}

// ============================================================================
// Fixtures
// ============================================================================

fn template() -> String {
    json!({
        "log": {"loglevel": "warning"},
        "outbounds": [
            {"tag": "t1", "protocol": "wireguard", "settings": {
                "secretKey": "old-1", "address": ["10.0.0.1/32"],
                "peers": [{"publicKey": "pk-1", "endpoint": "1.1.1.1:1337"}]}},
            {"tag": "t2", "protocol": "wireguard", "settings": {
                "secretKey": "old-2", "address": ["10.0.0.2/32"],
                "peers": [{"publicKey": "pk-2", "allowedIPs": ["0.0.0.0/0"], "endpoint": "2.2.2.2:1337"}],
                "mtu": 1420}}
        ]
    })
    .to_string()
}

fn read_document(db: &Path) -> String {
    SettingsStore::open(db, DEFAULT_SETTINGS_KEY)
        .and_then(|store| store.read_document())
        .unwrap()
}

fn overwrite_document(db: &Path, value: &str) {
    let conn = rusqlite::Connection::open(db).unwrap();
    conn.execute(
        "UPDATE settings SET value = ?1 WHERE key = ?2",
        [value, DEFAULT_SETTINGS_KEY],
    )
    .unwrap();
}

struct Harness {
    server: MockServer,
    db: PathBuf,
    _dir: TempDir,
}

impl Harness {
    async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("x-ui.db");

        let conn = rusqlite::Connection::open(&db).unwrap();
        conn.execute_batch(
            "CREATE TABLE settings (id INTEGER PRIMARY KEY AUTOINCREMENT, key TEXT, value TEXT);",
        )
        .unwrap();
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)",
            [DEFAULT_SETTINGS_KEY, template().as_str()],
        )
        .unwrap();

        Self {
            server: MockServer::start().await,
            db,
            _dir: dir,
        }
    }

    fn config(&self) -> RotationConfig {
        RotationConfig {
            username: Some("user".to_string()),
            password: Some("pass".to_string()),
            region: "x".to_string(),
            retry_count: "2".to_string(),
            tag: "t2".to_string(),
            cert: String::new(),
            db: self.db.clone(),
            directory_url: format!("{}/vpninfo/servers/v6", self.server.uri()),
            token_url: format!("{}/api/client/v2/token", self.server.uri()),
            registration: RegistrationSection {
                scheme: "http".to_string(),
                port: self.server.address().port(),
            },
            timeouts: TimeoutSection {
                retry_delay_ms: 0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Mount directory, token and registration endpoints with expected hit counts
    async fn mount(&self, directory: u64, token: u64, registration: u64) {
        let body = format!(
            "{}\n\nc2lnbmF0dXJl\n",
            json!({"regions": [{"id": "x", "servers": {"wg": [
                {"ip": "127.0.0.1", "cn": "istanbul401"},
                {"ip": "127.0.0.2", "cn": "istanbul402"}
            ]}}]})
        );
        Mock::given(method("GET"))
            .and(path("/vpninfo/servers/v6"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .expect(directory)
            .mount(&self.server)
            .await;

        Mock::given(method("POST"))
            .and(path("/api/client/v2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"token":"tok-1"}"#))
            .expect(token)
            .mount(&self.server)
            .await;

        let registration_body = json!({
            "status": "OK",
            "server_key": SERVER_KEY,
            "server_port": 1337,
            "server_ip": "185.1.2.3",
            "peer_ip": "10.20.30.40",
            "dns_servers": ["10.0.0.243"]
        });
        Mock::given(method("GET"))
            .and(path("/addKey"))
            .and(query_param("pt", "tok-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(registration_body))
            .expect(registration)
            .mount(&self.server)
            .await;
    }

    fn document(&self) -> Value {
        serde_json::from_str(&read_document(&self.db)).unwrap()
    }
}

fn assert_rotated(doc: &Value) {
    let original: Value = serde_json::from_str(&template()).unwrap();
    assert_eq!(doc["outbounds"][0], original["outbounds"][0]);
    assert_eq!(doc["log"], original["log"]);

    let settings = &doc["outbounds"][1]["settings"];
    assert_ne!(settings["secretKey"], "old-2");
    assert_eq!(settings["address"], json!(["10.20.30.40/32"]));
    assert_eq!(settings["peers"][0]["publicKey"], SERVER_KEY);
    assert_eq!(settings["peers"][0]["endpoint"], "185.1.2.3:1337");
    assert_eq!(settings["peers"][0]["allowedIPs"], json!(["0.0.0.0/0"]));
    assert_eq!(settings["mtu"], 1420);
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_active_service_stopped_before_write_and_started_after() {
    let h = Harness::new().await;
    h.mount(1, 1, 1).await;
    let service = RecordingService::new(&h.db, Behavior { active: true, ..Default::default() });

    let manager = RotationManager::new(h.config(), service.clone()).unwrap();
    let report = manager.rotate().await.unwrap();

    assert_eq!(report.state, RotationState::Done);
    assert_eq!(report.server.cn, "istanbul401");
    assert!(report.service_was_active);
    assert!(report.service_restarted);

    let calls = service.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[0], Call::IsActive);
    assert_eq!(calls[1], Call::Stop(template()));
    match &calls[2] {
        Call::Start(doc) => assert_rotated(&serde_json::from_str(doc).unwrap()),
        other => panic!("expected start, got {:?}", other),
    }

    let doc = h.document();
    assert_rotated(&doc);

    // The stored secret belongs to the reported public key
    let secret = doc["outbounds"][1]["settings"]["secretKey"].as_str().unwrap();
    assert_eq!(PrivateKey::from_base64(secret).unwrap().public_key(), report.public_key);

    let peer = report.peer.unwrap();
    assert_eq!(peer.endpoint.to_string(), "185.1.2.3:1337");
}

#[tokio::test]
async fn test_inactive_service_left_alone() {
    let h = Harness::new().await;
    h.mount(1, 1, 1).await;
    let service = RecordingService::new(&h.db, Behavior::default());

    let report = RotationManager::new(h.config(), service.clone())
        .unwrap()
        .rotate()
        .await
        .unwrap();

    assert_eq!(report.state, RotationState::Done);
    assert!(!report.service_was_active);
    assert!(!report.service_restarted);
    assert_eq!(service.calls(), vec![Call::IsActive]);
    assert_rotated(&h.document());
}

#[tokio::test]
async fn test_stop_failure_aborts_before_write() {
    let h = Harness::new().await;
    h.mount(1, 1, 1).await;
    let service = RecordingService::new(
        &h.db,
        Behavior { active: true, fail_stop: true, ..Default::default() },
    );

    let err = RotationManager::new(h.config(), service.clone())
        .unwrap()
        .rotate()
        .await
        .unwrap_err();

    assert_eq!(err.state, RotationState::KeyRegistered);
    assert!(matches!(err.kind, RotationErrorKind::Service(ServiceError::Failed { action: "stop", .. })));
    assert_eq!(service.calls(), vec![Call::IsActive, Call::Stop(template())]);
    assert_eq!(read_document(&h.db), template());
}

#[tokio::test]
async fn test_failed_write_restarts_stopped_service() {
    let h = Harness::new().await;
    h.mount(1, 1, 1).await;
    let service = RecordingService::new(
        &h.db,
        Behavior { active: true, clear_outbounds_on_stop: true, ..Default::default() },
    );

    let err = RotationManager::new(h.config(), service.clone())
        .unwrap()
        .rotate()
        .await
        .unwrap_err();

    assert_eq!(err.state, RotationState::ServiceStopped);
    match &err.kind {
        RotationErrorKind::Store(StoreError::Document(DocumentError::TagNotFound(tag))) => {
            assert_eq!(tag, "t2");
        }
        other => panic!("expected TagNotFound, got {:?}", other),
    }

    let cleared = r#"{"outbounds":[]}"#.to_string();
    assert_eq!(
        service.calls(),
        vec![Call::IsActive, Call::Stop(template()), Call::Start(cleared.clone())]
    );
    assert_eq!(read_document(&h.db), cleared);
}

#[tokio::test]
async fn test_start_failure_still_succeeds() {
    let h = Harness::new().await;
    h.mount(1, 1, 1).await;
    let service = RecordingService::new(
        &h.db,
        Behavior { active: true, fail_start: true, ..Default::default() },
    );

    let report = RotationManager::new(h.config(), service.clone())
        .unwrap()
        .rotate()
        .await
        .unwrap();

    assert_eq!(report.state, RotationState::Done);
    assert!(report.service_was_active);
    assert!(!report.service_restarted);
    assert_eq!(service.calls().len(), 3);
    assert_rotated(&h.document());
}

#[tokio::test]
async fn test_query_failure_assumes_inactive() {
    let h = Harness::new().await;
    h.mount(1, 1, 1).await;
    let service = RecordingService::new(
        &h.db,
        Behavior { active: true, fail_query: true, ..Default::default() },
    );

    let report = RotationManager::new(h.config(), service.clone())
        .unwrap()
        .rotate()
        .await
        .unwrap();

    assert!(!report.service_was_active);
    assert_eq!(service.calls(), vec![Call::IsActive]);
    assert_rotated(&h.document());
}

#[tokio::test]
async fn test_missing_tag_fails_before_token_request() {
    let h = Harness::new().await;
    h.mount(1, 0, 0).await;
    let service = RecordingService::new(&h.db, Behavior { active: true, ..Default::default() });

    let mut config = h.config();
    config.tag = "wg-missing".to_string();

    let err = RotationManager::new(config, service.clone())
        .unwrap()
        .rotate()
        .await
        .unwrap_err();

    assert_eq!(err.state, RotationState::ServerSelected);
    match &err.kind {
        RotationErrorKind::Store(StoreError::Document(DocumentError::TagNotFound(tag))) => {
            assert_eq!(tag, "wg-missing");
        }
        other => panic!("expected TagNotFound, got {:?}", other),
    }
    assert!(service.calls().is_empty());
    assert_eq!(read_document(&h.db), template());
}

#[tokio::test]
async fn test_dry_run_registers_and_writes_nothing() {
    let h = Harness::new().await;
    h.mount(1, 0, 0).await;
    let service = RecordingService::new(&h.db, Behavior { active: true, ..Default::default() });

    let mut config = h.config();
    config.dry_run = true;
    config.username = None;
    config.password = None;

    let report = RotationManager::new(config, service.clone())
        .unwrap()
        .rotate()
        .await
        .unwrap();

    assert_eq!(report.state, RotationState::ConfigValidated);
    assert!(report.peer.is_none());
    assert_eq!(report.server.ip.to_string(), "127.0.0.1");
    assert!(service.calls().is_empty());
    assert_eq!(read_document(&h.db), template());
}

#[tokio::test]
async fn test_missing_credentials_fail_before_network() {
    let h = Harness::new().await;
    h.mount(0, 0, 0).await;
    let service = RecordingService::new(&h.db, Behavior::default());

    let mut config = h.config();
    config.password = None;

    let err = RotationManager::new(config, service.clone())
        .unwrap()
        .rotate()
        .await
        .unwrap_err();

    assert_eq!(err.state, RotationState::Idle);
    assert!(matches!(err.kind, RotationErrorKind::Config(_)));
    assert!(service.calls().is_empty());
}

#[tokio::test]
async fn test_invalid_filter_makes_no_requests() {
    let h = Harness::new().await;
    h.mount(0, 0, 0).await;
    let service = RecordingService::new(&h.db, Behavior::default());

    let mut config = h.config();
    config.filter_cn = Some("([".to_string());

    let err = RotationManager::new(config, service)
        .unwrap()
        .rotate()
        .await
        .unwrap_err();

    assert!(matches!(err.kind, RotationErrorKind::Select(SelectError::Filter { .. })));
}

#[tokio::test]
async fn test_cn_filter_selects_matching_server() {
    let h = Harness::new().await;
    h.mount(1, 0, 0).await;
    let service = RecordingService::new(&h.db, Behavior::default());

    let mut config = h.config();
    config.dry_run = true;
    config.filter_cn = Some("402$".to_string());

    let report = RotationManager::new(config, service)
        .unwrap()
        .rotate()
        .await
        .unwrap();

    assert_eq!(report.server.cn, "istanbul402");
    assert_eq!(report.server.ip.to_string(), "127.0.0.2");
}
