use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use peerwarden_daemon::config::{EndpointSettings, OwnerSettings, TunnelSettings, WireguardSettings};
use peerwarden_daemon::endpoint::{HttpProbe, Probe};
use peerwarden_daemon::exec::{EngineExec, ExecError, ExecOutput};
use peerwarden_daemon::lock::PathLocks;
use peerwarden_daemon::owners::OwnerStore;
use peerwarden_daemon::peers::WgPeers;
use peerwarden_daemon::reconcile::Reconciler;
use peerwarden_daemon::tunnel::TunnelClients;
use peerwarden_daemon::{CoreError, ErrorKind};
use peerwarden_types::{ItemOutcome, SkipReason, SyncStatus};

const WG_CONF: &str = "/opt/awg/wg0.conf";
const WG_TABLE: &str = "/opt/awg/clientsTable";
const WG_SERVER_KEY: &str = "/opt/awg/server.pub";
const XRAY_CONF: &str = "/opt/xray/server.json";
const XRAY_TABLE: &str = "/opt/xray/clientsTable";
const VISION: &str = "xtls-rprx-vision";

fn key(byte: u8) -> String {
    STANDARD.encode([byte; 32])
}

fn server_conf(extra: &str) -> String {
    format!(
        "[Interface]\nPrivateKey = {}\nAddress = 10.8.1.1/24\nListenPort = 51820\nJc = 4\n{extra}",
        key(250)
    )
}

// -- Fake engine: files, a simulated wg runtime and a restart counter --

#[derive(Debug, Clone, Default)]
struct LivePeer {
    public_key: String,
    preshared_key: Option<String>,
    allowed_ips: String,
}

#[derive(Default)]
struct State {
    files: HashMap<String, String>,
    keypairs: HashMap<String, String>,
    next_key: u8,
    live: Vec<LivePeer>,
    no_flock: bool,
    fail_writes_with: Option<String>,
    restarts: usize,
    commands: Vec<String>,
}

#[derive(Default)]
struct FakeEngine {
    state: Mutex<State>,
}

fn ok(stdout: &str) -> ExecOutput {
    ExecOutput {
        status: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

fn failed(stderr: &str) -> ExecOutput {
    ExecOutput {
        status: 1,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

fn parse_peers(conf: &str) -> Vec<LivePeer> {
    let mut peers = Vec::new();
    let mut current: Option<LivePeer> = None;
    for line in conf.lines().map(str::trim) {
        if line.eq_ignore_ascii_case("[peer]") {
            peers.extend(current.take());
            current = Some(LivePeer::default());
            continue;
        }
        if line.starts_with('[') {
            peers.extend(current.take());
            continue;
        }
        let (Some(peer), Some((k, v))) = (current.as_mut(), line.split_once('=')) else {
            continue;
        };
        match k.trim() {
            "PublicKey" => peer.public_key = v.trim().to_string(),
            "PresharedKey" => peer.preshared_key = Some(v.trim().to_string()),
            "AllowedIPs" => peer.allowed_ips = v.trim().to_string(),
            _ => {}
        }
    }
    peers.extend(current);
    peers
}

impl FakeEngine {
    fn new() -> Arc<Self> {
        let engine = Self::default();
        {
            let mut st = engine.state.lock().unwrap();
            st.files.insert(WG_CONF.into(), server_conf(""));
            st.files.insert(WG_SERVER_KEY.into(), format!("{}\n", key(251)));
            st.files.insert(XRAY_CONF.into(), tunnel_doc(&[]).to_string());
        }
        Arc::new(engine)
    }

    fn put(&self, path: &str, contents: &str) {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(path.to_string(), contents.to_string());
    }

    fn file(&self, path: &str) -> String {
        self.state.lock().unwrap().files.get(path).cloned().unwrap_or_default()
    }

    fn json(&self, path: &str) -> Value {
        serde_json::from_str(&self.file(path)).unwrap()
    }

    fn live_keys(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .live
            .iter()
            .map(|p| p.public_key.clone())
            .collect()
    }

    /// Make every write whose contents mention `marker` fail.
    fn fail_writes_with(&self, marker: &str) {
        self.state.lock().unwrap().fail_writes_with = Some(marker.to_string());
    }

    fn set_live(&self, peers: Vec<LivePeer>) {
        self.state.lock().unwrap().live = peers;
    }

    fn restarts(&self) -> usize {
        self.state.lock().unwrap().restarts
    }

    fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    fn xray_clients(&self) -> Vec<Value> {
        self.json(XRAY_CONF)["inbounds"][0]["settings"]["clients"]
            .as_array()
            .cloned()
            .unwrap_or_default()
    }

    fn run(&self, command: &str) -> ExecOutput {
        let mut st = self.state.lock().unwrap();
        st.commands.push(command.to_string());

        if command.contains("command -v flock") {
            return if st.no_flock { failed("") } else { ok("/usr/bin/flock\n") };
        }
        if command.contains("mv -f") {
            let Some(staged) = command
                .split(|c: char| c.is_whitespace() || c == '\'')
                .find(|t| t.ends_with(".staged"))
            else {
                return failed("mv: missing operand");
            };
            let dest = staged.trim_end_matches(".staged");
            return match st.files.remove(staged) {
                Some(text) => {
                    st.files.insert(dest.to_string(), text);
                    ok("")
                }
                None => failed("mv: cannot stat: No such file or directory"),
            };
        }
        if command.contains(" pubkey") {
            let private = command
                .trim_start_matches("printf %s ")
                .split_whitespace()
                .next()
                .unwrap_or_default();
            return match st.keypairs.get(private) {
                Some(public) => ok(&format!("{public}\n")),
                None => failed("Key is not the correct length or format"),
            };
        }
        if command.contains("genkey") {
            st.next_key += 1;
            let private = key(st.next_key);
            let public = key(st.next_key + 100);
            st.keypairs.insert(private.clone(), public);
            return ok(&format!("{private}\n"));
        }
        if command.contains("genpsk") {
            return ok(&format!("{}\n", key(200 - st.next_key)));
        }
        if command.contains("ip -brief") {
            return ok("wg0             UNKNOWN        10.8.1.1/24 \n");
        }
        if command.contains(" dump") {
            let mut out = format!("(hidden)\t{}\t51820\toff\n", key(251));
            for p in &st.live {
                out.push_str(&format!(
                    "{}\t{}\t(none)\t{}\t0\t0\t0\t25\n",
                    p.public_key,
                    p.preshared_key.as_deref().unwrap_or("(none)"),
                    p.allowed_ips
                ));
            }
            return ok(&out);
        }
        if command.contains("public-key") {
            return ok(&format!("{}\n", key(251)));
        }
        if command.contains("-quick strip") {
            return ok("");
        }
        if command.contains("syncconf") {
            let conf = st.files.get(WG_CONF).cloned().unwrap_or_default();
            st.live = parse_peers(&conf);
            return ok("");
        }
        if command.contains("getent hosts") {
            return ok("172.29.172.254  amnezia-dns\n");
        }
        if command.contains("x25519") {
            return ok("Private key: srv-priv\nPublic key: srv-pub-derived\n");
        }
        if command.starts_with("wg show") {
            return ok("interface: wg0\n  listening port: 51820\n  jmin: 50\n");
        }
        ok("")
    }
}

impl EngineExec for FakeEngine {
    async fn exec(&self, _engine: &str, command: &str) -> Result<ExecOutput, ExecError> {
        Ok(self.run(command))
    }

    async fn read_file(&self, _engine: &str, path: &str) -> Result<String, ExecError> {
        self.state
            .lock()
            .unwrap()
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| ExecError::Failed {
                status: 1,
                stderr: format!("cat: {path}: No such file or directory"),
            })
    }

    async fn write_file_atomic(&self, _engine: &str, path: &str, contents: &str) -> Result<(), ExecError> {
        let mut st = self.state.lock().unwrap();
        if st.fail_writes_with.as_ref().is_some_and(|m| contents.contains(m.as_str())) {
            return Err(ExecError::Failed {
                status: 1,
                stderr: format!("sh: can't create {path}: No space left on device"),
            });
        }
        st.files.insert(path.to_string(), contents.to_string());
        Ok(())
    }

    async fn restart(&self, _engine: &str) -> Result<(), ExecError> {
        self.state.lock().unwrap().restarts += 1;
        Ok(())
    }
}

// -- Helpers --

fn tunnel_doc(clients: &[Value]) -> Value {
    json!({
        "log": {"loglevel": "warning"},
        "inbounds": [{
            "port": 8443,
            "protocol": "vless",
            "settings": {"clients": clients, "decryption": "none"},
            "streamSettings": {
                "network": "tcp",
                "security": "reality",
                "realitySettings": {
                    "privateKey": "srv-priv",
                    "serverNames": ["www.example.com"],
                    "shortIds": ["abcd"]
                }
            }
        }],
        "outbounds": [{"protocol": "freedom"}]
    })
}

fn xray_client(id: &str, tag: &str) -> Value {
    json!({"id": id, "flow": VISION, "email": tag})
}

fn xray_record(owner: i64, name: &str, id: &str, suspended: bool) -> Value {
    json!({
        "clientId": id,
        "userData": {"clientName": name, "creationDate": "Mon Nov 10 08:35:32 2025", "flow": VISION},
        "addInfo": {
            "type": "xray", "uuid": format!("u-{id}"), "owner_tid": owner,
            "created_at": "2025-11-10T08:35:32Z", "source": "bot", "suspended": suspended
        }
    })
}

struct Harness {
    engine: Arc<FakeEngine>,
    peers: WgPeers<FakeEngine>,
    tunnel: Arc<TunnelClients<FakeEngine>>,
    owners: Arc<OwnerStore>,
    reconciler: Reconciler<FakeEngine>,
    _dir: TempDir,
}

fn harness() -> Harness {
    let engine = FakeEngine::new();
    let locks = PathLocks::new();
    let dir = tempfile::tempdir().unwrap();

    let wireguard = WireguardSettings {
        engine: "awg".into(),
        config_path: WG_CONF.into(),
        clients_table_path: WG_TABLE.into(),
        server_public_key_path: WG_SERVER_KEY.into(),
        lock_path: "/opt/awg/.conf.lock".into(),
        connect_host: Some("vpn.example.net".into()),
        peer_wait_attempts: 2,
        peer_wait_interval_ms: 1,
        ..Default::default()
    };
    let tunnel = TunnelSettings {
        engine: "xray".into(),
        config_path: XRAY_CONF.into(),
        clients_table_path: XRAY_TABLE.into(),
        connect_host: Some("edge.example.net".into()),
        ..Default::default()
    };
    let endpoint = EndpointSettings {
        lookup_url: None,
        http_timeout_secs: 1,
    };
    let owners = Arc::new(OwnerStore::new(&OwnerSettings {
        state_path: dir.path().join("state.json").display().to_string(),
        backups_dir: dir.path().join("backups").display().to_string(),
        backups_keep: 3,
    }));

    let peers = WgPeers::new(Arc::clone(&engine), locks.clone(), &wireguard, &endpoint);
    let tunnel = Arc::new(TunnelClients::new(Arc::clone(&engine), locks, &tunnel, &endpoint));
    let reconciler = Reconciler::new(Arc::clone(&tunnel), Arc::clone(&owners));
    Harness {
        engine,
        peers,
        tunnel,
        owners,
        reconciler,
        _dir: dir,
    }
}

/// Serve a plain-text address lookup at `/ip`: every GET there gets `status`
/// and `body`, any other path a 404. Dropping the sender stops the server.
async fn spawn_lookup_server(status: u16, body: &str) -> (SocketAddr, tokio::sync::oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let body = body.to_string();
    let (tx, mut rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                accept = listener.accept() => {
                    let Ok((mut stream, _)) = accept else { break };
                    let mut buf = vec![0u8; 4096];
                    let n = stream.read(&mut buf).await.unwrap_or(0);
                    let request = String::from_utf8_lossy(&buf[..n]);
                    let (status, reason, body) = if request.starts_with("GET /ip ") {
                        let reason = if status < 400 { "OK" } else { "Error" };
                        (status, reason, body.as_str())
                    } else {
                        (404, "Not Found", "")
                    };
                    let response = format!(
                        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len(),
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                }
                _ = &mut rx => break,
            }
        }
    });

    (addr, tx)
}

// -- Tunnel reconciliation --

#[tokio::test]
async fn absent_client_is_restored_then_active() {
    let h = harness();
    h.engine.put(XRAY_TABLE, &json!([xray_record(7, "laptop", "id-1", false)]).to_string());

    let snapshot = h.reconciler.classify().await.unwrap();
    assert_eq!(snapshot.status_of(7, "laptop"), SyncStatus::Absent);

    h.reconciler.repair_absent(7, "laptop").await.unwrap();

    let clients = h.engine.xray_clients();
    assert_eq!(clients, vec![xray_client("id-1", "7-laptop")]);
    let snapshot = h.reconciler.classify().await.unwrap();
    assert_eq!(snapshot.status_of(7, "laptop"), SyncStatus::Active);
    assert_eq!(h.engine.restarts(), 1);

    // A second repair finds the client live and changes nothing.
    let err = h.reconciler.repair_absent(7, "laptop").await.unwrap_err();
    assert!(matches!(err, CoreError::AlreadyPresent(_)), "{err}");
    assert_eq!(h.engine.xray_clients().len(), 1);
    assert_eq!(h.engine.restarts(), 1);

    let records = h.tunnel.table().read_all().await.unwrap();
    assert!(records[0].add_info.last_sync_at.is_some());
}

#[tokio::test]
async fn extra_client_is_removed() {
    let h = harness();
    h.engine.put(
        XRAY_CONF,
        &tunnel_doc(&[
            xray_client("admin-id", "admin@example.com"),
            xray_client("id-9", "7-phone"),
        ])
        .to_string(),
    );

    let snapshot = h.reconciler.classify().await.unwrap();
    assert_eq!(snapshot.status_of(7, "phone"), SyncStatus::Extra);
    assert_eq!(snapshot.counters.foreign, 1);

    h.reconciler.repair_extra(7, "phone").await.unwrap();

    let snapshot = h.reconciler.classify().await.unwrap();
    assert_eq!(snapshot.status_of(7, "phone"), SyncStatus::Unknown);
    assert_eq!(snapshot.counters.extra, 0);
    assert_eq!(h.engine.xray_clients(), vec![xray_client("admin-id", "admin@example.com")]);

    let err = h.reconciler.repair_extra(7, "phone").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn registered_client_is_not_extra() {
    let h = harness();
    h.engine.put(XRAY_CONF, &tunnel_doc(&[xray_client("id-1", "7-My_Phone")]).to_string());
    h.engine.put(XRAY_TABLE, &json!([xray_record(7, "My Phone", "id-1", false)]).to_string());

    let snapshot = h.reconciler.classify().await.unwrap();
    assert_eq!(snapshot.status_of(7, "My Phone"), SyncStatus::Active);
    assert!(snapshot.extra.is_empty());

    let err = h.reconciler.repair_extra(7, "My Phone").await.unwrap_err();
    assert_eq!(err.skip_reason(), Some(SkipReason::Registered));
    assert_eq!(h.engine.xray_clients().len(), 1);
}

#[tokio::test]
async fn suspended_profile_is_not_repaired() {
    let h = harness();
    h.engine.put(XRAY_TABLE, &json!([xray_record(7, "laptop", "id-1", true)]).to_string());

    let snapshot = h.reconciler.classify().await.unwrap();
    assert_eq!(snapshot.status_of(7, "laptop"), SyncStatus::Suspended);
    assert!(snapshot.absent.is_empty());

    let err = h.reconciler.repair_absent(7, "laptop").await.unwrap_err();
    assert!(matches!(err, CoreError::Suspended(_)), "{err}");
    assert!(h.engine.xray_clients().is_empty());

    let summary = h.reconciler.repair_all_absent().await.unwrap();
    assert_eq!(summary.total, 0);
}

#[tokio::test]
async fn absent_repair_ignores_owner_access() {
    let h = harness();
    h.engine.put(
        XRAY_TABLE,
        &json!([
            xray_record(7, "laptop", "id-1", false),
            xray_record(8, "phone", "id-2", false),
        ])
        .to_string(),
    );
    h.owners.set_allowed(8, false).await.unwrap();

    let summary = h.reconciler.repair_all_absent().await.unwrap();
    assert_eq!((summary.total, summary.done, summary.skipped, summary.errors), (2, 2, 0, 0));
    assert_eq!(h.engine.xray_clients().len(), 2);
}

#[tokio::test]
async fn rebuild_batch_skips_revoked_owners() {
    let h = harness();
    h.engine.put(
        XRAY_CONF,
        &tunnel_doc(&[xray_client("live-1", "7-laptop"), xray_client("live-2", "8-phone")]).to_string(),
    );
    h.engine.put(
        XRAY_TABLE,
        &json!([
            xray_record(7, "laptop", "id-1", false),
            xray_record(8, "phone", "id-2", false),
        ])
        .to_string(),
    );
    h.owners.set_allowed(7, true).await.unwrap();
    h.owners.set_allowed(8, false).await.unwrap();

    let summary = h.reconciler.rebuild_all_from_registry().await.unwrap();
    assert_eq!((summary.total, summary.done, summary.skipped, summary.errors), (2, 1, 1, 0));
    let revoked = summary.items.iter().find(|i| i.owner == 8).unwrap();
    assert_eq!(
        revoked.outcome,
        ItemOutcome::Skipped {
            reason: SkipReason::OwnerRevoked
        }
    );
    assert_eq!(
        h.engine.xray_clients(),
        vec![xray_client("id-1", "7-laptop"), xray_client("live-2", "8-phone")]
    );
}

#[tokio::test]
async fn batch_continues_past_failed_item() {
    let h = harness();
    h.engine.put(
        XRAY_TABLE,
        &json!([
            xray_record(7, "laptop", "id-1", false),
            xray_record(8, "phone", "id-2", false),
        ])
        .to_string(),
    );
    h.engine.fail_writes_with("8-phone");

    let summary = h.reconciler.repair_all_absent().await.unwrap();
    assert_eq!((summary.total, summary.done, summary.skipped, summary.errors), (2, 1, 0, 1));
    let failed = summary.items.iter().find(|i| i.owner == 8).unwrap();
    assert!(
        matches!(&failed.outcome, ItemOutcome::Failed { error } if error.contains("No space left")),
        "{:?}",
        failed.outcome
    );
    let done = summary.items.iter().find(|i| i.owner == 7).unwrap();
    assert_eq!(done.outcome, ItemOutcome::Done);
    assert_eq!(h.engine.xray_clients(), vec![xray_client("id-1", "7-laptop")]);

    let snapshot = h.reconciler.classify().await.unwrap();
    assert_eq!(snapshot.status_of(8, "phone"), SyncStatus::Absent);
}

#[tokio::test]
async fn diverged_identity_pushed_from_registry() {
    let h = harness();
    h.engine.put(XRAY_CONF, &tunnel_doc(&[xray_client("id-live", "7-laptop")]).to_string());
    h.engine.put(XRAY_TABLE, &json!([xray_record(7, "laptop", "id-1", false)]).to_string());
    h.owners.set_allowed(7, true).await.unwrap();

    let snapshot = h.reconciler.classify().await.unwrap();
    assert_eq!(snapshot.status_of(7, "laptop"), SyncStatus::Diverged);

    let summary = h.reconciler.rebuild_all_from_registry().await.unwrap();
    assert_eq!(summary.done, 1);
    assert_eq!(h.engine.xray_clients(), vec![xray_client("id-1", "7-laptop")]);
    let snapshot = h.reconciler.classify().await.unwrap();
    assert_eq!(snapshot.status_of(7, "laptop"), SyncStatus::Active);
}

#[tokio::test]
async fn diverged_identity_pulled_from_engine() {
    let h = harness();
    h.engine.put(XRAY_CONF, &tunnel_doc(&[xray_client("id-live", "7-laptop")]).to_string());
    h.engine.put(XRAY_TABLE, &json!([xray_record(7, "laptop", "id-1", false)]).to_string());

    let summary = h.reconciler.sync_all_from_engine().await.unwrap();
    assert_eq!(summary.done, 1);

    let records = h.tunnel.table().read_all().await.unwrap();
    assert_eq!(records[0].client_id, "id-live");
    assert_eq!(records[0].uuid(), "u-id-1");
    assert_eq!(h.engine.restarts(), 0);
}

// -- Tunnel lifecycle --

#[tokio::test]
async fn tunnel_suspend_resume_keeps_identity() {
    let h = harness();
    let record = h.tunnel.add_client(7, "tablet").await.unwrap();
    assert_eq!(record.user_data.flow.as_deref(), Some(VISION));
    assert_eq!(h.engine.xray_clients(), vec![xray_client(&record.client_id, "7-tablet")]);

    let snapshot = h.tunnel.suspend_client_by_name(7, "tablet").await.unwrap().unwrap();
    assert_eq!(snapshot.identity, record.client_id);
    assert!(h.engine.xray_clients().is_empty());
    let classified = h.reconciler.classify().await.unwrap();
    assert_eq!(classified.status_of(7, "tablet"), SyncStatus::Suspended);

    let resumed = h.tunnel.resume_client_by_name(7, "tablet").await.unwrap();
    assert_eq!(resumed.client_id, record.client_id);
    assert_eq!(resumed.uuid(), record.uuid());
    assert!(!resumed.is_suspended());
    assert_eq!(h.engine.xray_clients(), vec![xray_client(&record.client_id, "7-tablet")]);
    assert_eq!(h.engine.restarts(), 3);
}

#[tokio::test]
async fn tunnel_names_conflict_when_normalized() {
    let h = harness();
    h.tunnel.add_client(7, "My Phone").await.unwrap();

    let err = h.tunnel.add_client(7, "  my   PHONE ").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NameConflict);
    assert!(h.tunnel.add_client(8, "My Phone").await.is_ok());
    assert_eq!(h.engine.xray_clients().len(), 2);

    assert!(h.tunnel.remove_client_by_name(7, "my phone").await.unwrap());
    assert_eq!(h.tunnel.list_records(Some(7)).await.unwrap().len(), 0);
    assert_eq!(h.engine.xray_clients().len(), 1);
}

#[tokio::test]
async fn share_link_uses_inbound_reality() {
    let h = harness();
    let record = h.tunnel.add_client(7, "laptop").await.unwrap();

    let uri = h.tunnel.share_link(7, "laptop").await.unwrap().uri();
    assert!(
        uri.starts_with(&format!("vless://{}@edge.example.net:8443?", record.client_id)),
        "{uri}"
    );
    assert!(uri.contains("sni=www.example.com"));
    assert!(uri.contains("pbk=srv-pub-derived"));
    assert!(uri.contains("sid=abcd"));
    assert!(uri.ends_with("#edge.example.net"));

    let err = h.tunnel.share_link(7, "nope").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn non_vless_inbound_is_rejected() {
    let h = harness();
    let mut doc = tunnel_doc(&[]);
    doc["inbounds"][0]["protocol"] = json!("vmess");
    h.engine.put(XRAY_CONF, &doc.to_string());

    let err = h.tunnel.add_client(7, "laptop").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationFailed);
    assert_eq!(h.engine.restarts(), 0);
}

// -- WireGuard lifecycle --

#[tokio::test]
async fn create_peer_allocates_and_applies() {
    let h = harness();
    let first = h.peers.create_peer(1, "Laptop", Some("@joey")).await.unwrap();
    let second = h.peers.create_peer(1, "Phone", None).await.unwrap();

    assert_eq!(first.user_data.ip.as_deref(), Some("10.8.1.2"));
    assert_eq!(second.user_data.ip.as_deref(), Some("10.8.1.3"));
    assert!(first.user_data.private_key.is_some());
    assert_eq!(first.add_info.email.as_deref(), Some("@joey"));
    assert_ne!(first.uuid(), second.uuid());

    let conf = h.engine.file(WG_CONF);
    assert!(conf.contains(&format!("PublicKey = {}", first.client_id)));
    assert!(conf.contains("AllowedIPs = 10.8.1.3/32"));
    assert!(conf.contains("Jmin = 50"), "runtime parameter filled in:\n{conf}");
    assert_eq!(h.engine.live_keys(), vec![first.client_id.clone(), second.client_id.clone()]);

    let profiles = h.peers.list_profiles(Some(1)).await.unwrap();
    assert_eq!(profiles.len(), 2);
    assert_eq!(profiles[0].allowed_ips, "10.8.1.2/32");
    assert!(h.peers.list_profiles(Some(2)).await.unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_creates_get_distinct_addresses() {
    let h = harness();
    let (a, b) = tokio::join!(h.peers.create_peer(1, "a", None), h.peers.create_peer(2, "b", None));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_ne!(a.user_data.ip, b.user_data.ip);
    assert_eq!(h.peers.table().read_all().await.unwrap().len(), 2);
    assert_eq!(h.engine.live_keys().len(), 2);
}

#[tokio::test]
async fn peer_names_conflict_when_normalized() {
    let h = harness();
    h.peers.create_peer(1, "My Phone", None).await.unwrap();

    let err = h.peers.create_peer(1, "  my   PHONE ", None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NameConflict);
    assert_eq!(h.peers.table().read_all().await.unwrap().len(), 1);
}

#[tokio::test]
async fn delete_preserves_foreign_blocks() {
    let h = harness();
    let foreign = format!("\n[Peer]\nPublicKey = {}\nAllowedIPs = 10.8.1.50/32\n", key(90));
    h.engine.put(WG_CONF, &server_conf(&foreign));

    let record = h.peers.create_peer(1, "Laptop", None).await.unwrap();
    h.peers.delete_peer(record.uuid()).await.unwrap();

    let conf = h.engine.file(WG_CONF);
    assert!(conf.contains(&format!("PublicKey = {}", key(90))));
    assert!(!conf.contains(&record.client_id));
    assert_eq!(h.engine.live_keys(), vec![key(90)]);

    let err = h.peers.find_profile(record.uuid()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(h.peers.table().read_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn suspend_resume_reuses_key_and_address() {
    let h = harness();
    let record = h.peers.create_peer(1, "Laptop", None).await.unwrap();

    let suspended = h.peers.suspend_peer(record.uuid()).await.unwrap();
    assert!(suspended.is_suspended());
    assert!(h.engine.live_keys().is_empty());
    assert!(!h.engine.file(WG_CONF).contains(&record.client_id));
    // Idempotent.
    h.peers.suspend_peer(record.uuid()).await.unwrap();

    let resumed = h.peers.resume_peer(record.uuid()).await.unwrap();
    assert!(!resumed.is_suspended());
    assert_eq!(resumed.client_id, record.client_id);
    assert_eq!(resumed.user_data.ip, record.user_data.ip);
    assert_eq!(resumed.user_data.psk, record.user_data.psk);
    assert_eq!(h.engine.live_keys(), vec![record.client_id.clone()]);
}

#[tokio::test]
async fn renders_client_config() {
    let h = harness();
    let record = h.peers.create_peer(1, "Laptop", None).await.unwrap();

    let text = h.peers.render_client_config(record.uuid()).await.unwrap();
    assert!(text.contains("Address = 10.8.1.2/32\n"));
    assert!(text.contains("DNS = 172.29.172.254, 1.0.0.1\n"));
    assert!(text.contains(&format!(
        "PrivateKey = {}\n",
        record.user_data.private_key.as_deref().unwrap()
    )));
    assert!(text.contains("Jc = 4\n"));
    assert!(text.contains(&format!("PublicKey = {}\n", key(251))));
    assert!(text.contains("Endpoint = vpn.example.net:51820\n"));

    let err = h.peers.render_client_config("missing").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn drift_and_resync() {
    let h = harness();
    h.engine.put(
        WG_TABLE,
        &json!([{
            "clientId": key(60),
            "userData": {"clientName": "gone", "creationDate": "x", "ip": "10.8.1.9", "psk": key(61)},
            "addInfo": {"type": "awg", "uuid": "u-gone", "owner_tid": 3, "created_at": "x", "source": "bot"}
        }])
        .to_string(),
    );
    h.engine.set_live(vec![LivePeer {
        public_key: key(70),
        preshared_key: None,
        allowed_ips: "10.8.1.20/32".into(),
    }]);

    let report = h.peers.drift().await.unwrap();
    assert_eq!(report.missing_live.len(), 1);
    assert_eq!(report.missing_live[0].uuid, "u-gone");
    assert_eq!(report.unknown_live, vec![key(70)]);

    assert_eq!(h.peers.resync().await.unwrap(), 1);
    assert!(h.engine.file(WG_CONF).contains("AllowedIPs = 10.8.1.9/32"));
    assert!(h.peers.drift().await.unwrap().is_clean());
}

#[tokio::test]
async fn clean_all_peers_keeps_registry() {
    let h = harness();
    h.peers.create_peer(1, "a", None).await.unwrap();
    h.peers.create_peer(1, "b", None).await.unwrap();

    assert_eq!(h.peers.clean_all_peers().await.unwrap(), 2);
    assert!(!h.engine.file(WG_CONF).contains("[Peer]"));
    assert!(h.engine.live_keys().is_empty());
    assert_eq!(h.peers.table().read_all().await.unwrap().len(), 2);
}

#[tokio::test]
async fn foreign_records_are_refused() {
    let h = harness();
    h.engine.put(
        WG_TABLE,
        &json!([{
            "clientId": key(80),
            "userData": {"clientName": "admin", "creationDate": "x", "ip": "10.8.1.30"},
            "addInfo": {"type": "awg", "uuid": "u-admin", "created_at": "x", "source": "panel"}
        }])
        .to_string(),
    );

    let err = h.peers.delete_peer("u-admin").await.unwrap_err();
    assert_eq!(err.skip_reason(), Some(SkipReason::Foreign));
    assert_eq!(h.peers.table().read_all().await.unwrap().len(), 1);
}

#[tokio::test]
async fn moves_without_flock_when_unavailable() {
    let h = harness();
    h.engine.state.lock().unwrap().no_flock = true;

    h.peers.create_peer(1, "Laptop", None).await.unwrap();

    let commands = h.engine.commands();
    assert!(commands.iter().any(|c| c.starts_with("mv -f")));
    assert!(!commands.iter().any(|c| c.starts_with("flock")));
    assert!(h.engine.file(WG_CONF).contains("[Peer]"));
}

// -- Registry --

#[tokio::test]
async fn legacy_map_registry_is_normalized() {
    let h = harness();
    h.engine.put(
        WG_TABLE,
        &json!({
            "KEYA=": {"userData": {"clientName": "Old"}, "addInfo": {"owner_tid": "5"}},
            "KEYB=": {"userData": {}}
        })
        .to_string(),
    );

    let records = h.peers.table().read_all().await.unwrap();
    assert_eq!(records.len(), 2);
    let old = records.iter().find(|r| r.client_id == "KEYA=").unwrap();
    assert_eq!(old.owner(), Some(5));
    assert!(old.is_bot());
    assert_eq!(old.uuid(), "KEYA=");
    let unnamed = records.iter().find(|r| r.client_id == "KEYB=").unwrap();
    assert_eq!(unnamed.name(), "AWG-KEYB=");
    assert!(!unnamed.is_bot());

    assert!(h.engine.json(WG_TABLE).is_array(), "normalized form persisted");
}

#[tokio::test]
async fn missing_registry_reads_empty() {
    let h = harness();
    assert!(h.peers.table().read_all().await.unwrap().is_empty());
    assert!(h.tunnel.list_records(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn upsert_is_idempotent() {
    let h = harness();
    let record: peerwarden_types::ClientRecord =
        serde_json::from_value(xray_record(7, "laptop", "id-1", false)).unwrap();

    h.tunnel.table().upsert(record.clone()).await.unwrap();
    h.tunnel.table().upsert(record.clone()).await.unwrap();
    assert_eq!(h.tunnel.table().read_all().await.unwrap(), vec![record.clone()]);

    let mut clash = record;
    clash.add_info.uuid = "u-other".into();
    let err = h.tunnel.table().upsert(clash).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationFailed);
}

// -- Owners and probes --

#[tokio::test]
async fn owner_access_persists() {
    let h = harness();
    assert!(!h.owners.is_allowed(5).await.unwrap());

    h.owners.ensure_owner(5, "joey", "Joey").await.unwrap();
    assert!(!h.owners.is_allowed(5).await.unwrap());
    h.owners.set_allowed(5, true).await.unwrap();

    let reopened = OwnerStore::new(&OwnerSettings {
        state_path: h.owners.path().display().to_string(),
        ..Default::default()
    });
    let state = reopened.load().await.unwrap();
    let owner = state.get(5).unwrap();
    assert!(owner.allowed);
    assert_eq!(owner.username, "joey");

    let raw: Value = serde_json::from_str(&std::fs::read_to_string(h.owners.path()).unwrap()).unwrap();
    assert_eq!(raw["users"]["5"]["allowed"], json!(true));
}

#[tokio::test]
async fn http_probe_reads_address() {
    let (addr, _shutdown) = spawn_lookup_server(200, "203.0.113.9\n").await;
    let probe = HttpProbe::new(&format!("http://{addr}/ip"), Duration::from_secs(2)).unwrap();
    assert_eq!(probe.probe().await.as_deref(), Some("203.0.113.9"));
}

#[tokio::test]
async fn http_probe_ignores_errors() {
    let (addr, _shutdown) = spawn_lookup_server(500, "203.0.113.9").await;
    let probe = HttpProbe::new(&format!("http://{addr}/ip"), Duration::from_secs(2)).unwrap();
    assert_eq!(probe.probe().await, None);

    let probe = HttpProbe::new(&format!("http://{addr}/elsewhere"), Duration::from_secs(2)).unwrap();
    assert_eq!(probe.probe().await, None);
}

#[tokio::test]
async fn http_probe_rejects_non_address_body() {
    let (addr, _shutdown) = spawn_lookup_server(200, "<html><body>Sign in to continue</body></html>").await;
    let probe = HttpProbe::new(&format!("http://{addr}/ip"), Duration::from_secs(2)).unwrap();
    assert_eq!(probe.probe().await, None);
}
