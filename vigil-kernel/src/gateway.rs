//! Session gateway: the websocket surface reporters and clients talk to.
//!
//! Every connection declares its role at the handshake (query string) and
//! is rejected before upgrade when the role is missing, the client token
//! does not verify, or a reporter omits its hardware identity. Upgraded
//! sockets get one registry session, one writer pump, and a single
//! dispatch point decoding `{e,d}` envelopes.
//!
//! Inbound reports run through the pipeline, update the snapshot map and
//! are persisted only when not rogue. Terminal frames are relayed between
//! the client holding a machine's terminal and the machine's reporter
//! room. Per-session tasks (writer pump, reporter point award) are
//! aborted synchronously when the socket closes.

use crate::auth::TokenVerifier;
use crate::config::KernelConfig;
use crate::events::{InboundEvent, OutboundEvent, StaticData};
use crate::geo::HttpGeoLookup;
use crate::health::{HealthTracker, KernelHealth};
use crate::pipeline::ReportPipeline;
use crate::registry::{machine_room, ConnectionRegistry, Role, Session, SessionId, ROOM_CLIENTS, ROOM_REPORTERS};
use crate::report::strip_uuid;
use crate::scheduler::epoch_ms;
use crate::store::{now_rfc3339, MachineRecord, MachineStore};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct GatewayState {
    pub cfg: KernelConfig,
    pub registry: Arc<ConnectionRegistry>,
    pub pipeline: Arc<ReportPipeline>,
    pub store: Arc<dyn MachineStore>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub geo: Option<Arc<HttpGeoLookup>>,
    pub health: HealthTracker,
}

pub fn build_router(state: GatewayState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/gateway", get(ws_upgrade))
        .with_state(state)
}

async fn get_system_health(State(app): State<GatewayState>) -> Json<KernelHealth> {
    Json(app.health.get_health(&app.registry))
}

#[derive(Debug, Deserialize)]
struct HandshakeParams {
    role: Option<String>,
    uuid: Option<String>,
    token: Option<String>,
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<HandshakeParams>,
    State(app): State<GatewayState>,
) -> Response {
    let (role, identity) = match params.role.as_deref() {
        Some("reporter") => {
            let Some(uuid) = params.uuid.as_deref().filter(|u| !u.is_empty()) else {
                warn!(%addr, "reporter handshake without uuid");
                return StatusCode::BAD_REQUEST.into_response();
            };
            (Role::Reporter, strip_uuid(uuid))
        }
        Some("client") => {
            match app.verifier.verify(params.token.as_deref().unwrap_or_default()) {
                Ok(identity) => (Role::Client, identity),
                Err(e) => {
                    warn!(%addr, "client auth failed: {e}");
                    return StatusCode::UNAUTHORIZED.into_response();
                }
            }
        }
        _ => {
            warn!(%addr, "handshake without declared role");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };
    ws.on_upgrade(move |socket| handle_session(socket, app, role, identity, addr))
}

async fn handle_session(
    socket: WebSocket,
    app: GatewayState,
    role: Role,
    identity: String,
    addr: SocketAddr,
) {
    let session_id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::unbounded_channel();
    app.registry.register(Session { id: session_id, identity: identity.clone(), role, tx });

    let mut point_task = None;
    match role {
        Role::Reporter => {
            // no serving a machine we cannot persist
            if let Err(e) = app.store.upsert_machine(connect_record(&identity)) {
                error!(uuid = %identity, "machine registration failed: {e}");
                app.registry.unregister(session_id);
                return;
            }
            app.registry.join_room(session_id, ROOM_REPORTERS);
            app.registry.join_room(session_id, &machine_room(&identity));
            point_task = Some(spawn_point_award(app.clone(), identity.clone()));
        }
        Role::Client => {
            app.registry.join_room(session_id, ROOM_CLIENTS);
            app.registry.join_room(session_id, &identity);
        }
    }
    info!(?role, identity = %identity, %addr, "session connected");

    let (mut sink, mut stream) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&event) else { continue };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => match serde_json::from_str::<InboundEvent>(&text) {
                Ok(event) => dispatch(&app, session_id, role, &identity, addr, event).await,
                Err(e) => warn!(identity = %identity, "undecodable frame: {e}"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    // deterministic teardown: per-session tasks stop and rooms/terminal
    // guards are released before the handler returns
    if let Some(task) = point_task {
        task.abort();
    }
    writer.abort();
    app.registry.unregister(session_id);
    info!(identity = %identity, "session disconnected");
}

fn connect_record(uuid: &str) -> MachineRecord {
    MachineRecord {
        uuid: uuid.to_string(),
        hostname: None,
        os: None,
        owner: None,
        country: None,
        registered_at: now_rfc3339(),
        last_seen: now_rfc3339(),
    }
}

/// Reporters accrue points for staying connected; each tick's new total is
/// pushed to the owning client's room.
fn spawn_point_award(app: GatewayState, identity: String) -> JoinHandle<()> {
    let period = Duration::from_secs(app.cfg.point_award_secs);
    let amount = app.cfg.points_per_award;
    let first_tick = Instant::now() + period;
    tokio::spawn(async move {
        let mut ticker = interval_at(first_tick, period);
        loop {
            ticker.tick().await;
            award_points(&app, &identity, amount);
        }
    })
}

/// Credit a machine's points to its owner once the store knows one, to the
/// machine identity until then. The new total lands in the credited
/// identity's own room, which that owner's client sessions sit in.
fn award_points(app: &GatewayState, machine: &str, amount: i64) {
    let target = app
        .store
        .find_machine(machine)
        .and_then(|m| m.owner)
        .unwrap_or_else(|| machine.to_string());
    match app.store.add_points(&target, amount) {
        Ok(total) => app.registry.broadcast(&target, &OutboundEvent::Points(total)),
        Err(e) => warn!(uuid = %machine, "point award failed: {e}"),
    }
}

async fn dispatch(
    app: &GatewayState,
    session_id: SessionId,
    role: Role,
    identity: &str,
    addr: SocketAddr,
    event: InboundEvent,
) {
    match (role, event) {
        (Role::Reporter, InboundEvent::Report(raw)) => {
            let report = app.pipeline.process(*raw, &app.registry.latency_all());
            app.health.record_report(report.rogue);
            let persist = !report.rogue;
            app.registry.snapshot_set(report.uuid.clone(), report.clone());
            if persist {
                // fire-and-forget for the session: a failed sample write
                // must not take down in-flight connections
                if let Err(e) = app.store.append_stats_sample(&report) {
                    error!(uuid = %report.uuid, "stats write failed: {e}");
                }
            }
        }
        (Role::Reporter, InboundEvent::HeartbeatResponse { uuid, epoch }) => {
            let rtt = epoch_ms().saturating_sub(epoch) as f64 / 2.0;
            app.registry.latency_update(strip_uuid(&uuid), rtt);
        }
        (Role::Reporter, InboundEvent::Speedtest(result)) => {
            if let Err(e) = app.store.append_speedtest(identity, &result) {
                warn!(uuid = %identity, "speedtest write failed: {e}");
            }
            award_points(app, identity, app.cfg.speedtest_points);
        }
        (Role::Reporter, InboundEvent::StaticData(data)) => {
            let country = lookup_country(app, addr).await;
            let record = static_record(identity, data, country);
            if let Err(e) = app.store.upsert_machine(record) {
                error!(uuid = %identity, "static data upsert failed: {e}");
            }
        }
        (Role::Reporter, InboundEvent::DynamicData(data)) => {
            app.registry.broadcast(
                ROOM_CLIENTS,
                &OutboundEvent::DynamicData { uuid: identity.to_string(), data },
            );
        }
        (_, InboundEvent::GetMachines) => {
            app.registry
                .send_to(session_id, OutboundEvent::Machines(app.registry.snapshot_all()));
        }
        (_, InboundEvent::GetPoints) => {
            let points = app.store.find_user(identity).map(|u| u.points).unwrap_or(0);
            app.registry.send_to(session_id, OutboundEvent::Points(points));
        }
        (Role::Client, InboundEvent::NewTerminalConnection { uuid }) => {
            let machine = strip_uuid(&uuid);
            if app.registry.terminal_open(session_id, machine.clone()) {
                app.registry
                    .broadcast(&machine_room(&machine), &OutboundEvent::StartTerminal { uuid: machine });
            } else {
                debug!(identity = %identity, machine = %machine, "terminal already open, ignoring");
            }
        }
        (Role::Client, InboundEvent::Input { uuid, data }) => {
            let machine = strip_uuid(&uuid);
            // only the holder of the terminal may type into it
            if app.registry.terminal_client_for(&machine) == Some(session_id) {
                app.registry
                    .broadcast(&machine_room(&machine), &OutboundEvent::Input { uuid: machine, data });
            }
        }
        (Role::Reporter, InboundEvent::Input { data, .. }) => {
            // terminal output is routed by the reporter's own identity,
            // never by a uuid claimed in the payload
            if let Some(client) = app.registry.terminal_client_for(identity) {
                app.registry
                    .send_to(client, OutboundEvent::Input { uuid: identity.to_string(), data });
            }
        }
        (Role::Client, InboundEvent::TerminateTerminal { uuid }) => {
            let machine = strip_uuid(&uuid);
            if app.registry.terminal_client_for(&machine) == Some(session_id) {
                app.registry.terminal_close(&machine);
                app.registry.broadcast(
                    &machine_room(&machine),
                    &OutboundEvent::TerminateTerminal { uuid: machine },
                );
            }
        }
        (Role::Reporter, InboundEvent::TerminateTerminal { .. }) => {
            if let Some(client) = app.registry.terminal_client_for(identity) {
                app.registry.terminal_close(identity);
                app.registry
                    .send_to(client, OutboundEvent::TerminateTerminal { uuid: identity.to_string() });
            }
        }
        (role, event) => {
            debug!(?role, identity = %identity, "event not permitted for role: {event:?}");
        }
    }
}

async fn lookup_country(app: &GatewayState, addr: SocketAddr) -> Option<String> {
    let geo = app.geo.as_ref()?;
    if !HttpGeoLookup::is_lookupable(&addr.ip()) {
        return None;
    }
    match geo.lookup(addr.ip()).await {
        Ok(info) => info.country,
        Err(e) => {
            // enrichment only; never blocks the session
            warn!(%addr, "geo lookup failed: {e}");
            None
        }
    }
}

fn static_record(identity: &str, data: StaticData, country: Option<String>) -> MachineRecord {
    MachineRecord {
        uuid: identity.to_string(),
        hostname: data.hostname,
        os: data.os,
        owner: data.owner,
        country,
        registered_at: now_rfc3339(),
        last_seen: now_rfc3339(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ApiKeyVerifier;
    use crate::store::JsonStore;
    use serde_json::json;

    fn test_state() -> GatewayState {
        let dir = std::env::temp_dir().join(format!("vigil-gw-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        GatewayState {
            cfg: KernelConfig::default(),
            registry: Arc::new(ConnectionRegistry::new()),
            pipeline: Arc::new(ReportPipeline::new(0.23)),
            store: Arc::new(JsonStore::open(dir.to_str().unwrap()).unwrap()),
            verifier: Arc::new(ApiKeyVerifier::with_key("s3cret")),
            geo: None,
            health: HealthTracker::new(),
        }
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    fn connect(
        app: &GatewayState,
        role: Role,
        identity: &str,
    ) -> (SessionId, mpsc::UnboundedReceiver<OutboundEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session { id: Uuid::new_v4(), identity: identity.to_string(), role, tx };
        let id = session.id;
        app.registry.register(session);
        match role {
            Role::Reporter => {
                app.registry.join_room(id, ROOM_REPORTERS);
                app.registry.join_room(id, &machine_room(identity));
            }
            Role::Client => {
                app.registry.join_room(id, ROOM_CLIENTS);
                app.registry.join_room(id, identity);
            }
        }
        (id, rx)
    }

    fn sample_report(uuid: &str) -> InboundEvent {
        serde_json::from_value(json!({
            "e": "report",
            "d": {
                "uuid": uuid,
                "hostname": "host-a",
                "platform": "linux",
                "ram": { "total": 8_000_000_000u64, "free": 2_000_000_000u64 },
                "cpu": 12,
                "network": [],
                "disks": [],
                "uptime": 300,
                "reporterUptime": 60,
                "reporterVersion": 0.23,
                "isVirtual": false,
                "timestamp": 1_700_000_000_000u64
            }
        }))
        .unwrap()
    }

    const MACHINE: &str = "9a7b8ccc0f194ab693cc1d7e6f8f9b10";

    #[tokio::test]
    async fn test_report_updates_snapshot_and_persists() {
        let app = test_state();
        let (reporter, _rx) = connect(&app, Role::Reporter, MACHINE);

        dispatch(&app, reporter, Role::Reporter, MACHINE, addr(), sample_report(MACHINE)).await;

        let snapshot = app.registry.snapshot_all();
        assert_eq!(snapshot.len(), 1);
        assert!(!snapshot[MACHINE].rogue);
        assert_eq!(app.health.get_health(&app.registry).reports_processed, 1);
    }

    #[tokio::test]
    async fn test_rogue_report_broadcast_but_not_persisted() {
        let app = test_state();
        let (reporter, _rx) = connect(&app, Role::Reporter, MACHINE);

        let event: InboundEvent = serde_json::from_value(json!({
            "e": "report",
            "d": { "uuid": "not a uuid at all" }
        }))
        .unwrap();
        dispatch(&app, reporter, Role::Reporter, MACHINE, addr(), event).await;

        // still lands in the snapshot, flagged
        let snapshot = app.registry.snapshot_all();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.values().next().unwrap().rogue);
        assert_eq!(app.health.get_health(&app.registry).rogue_reports, 1);
    }

    #[tokio::test]
    async fn test_heartbeat_response_updates_latency() {
        let app = test_state();
        let (reporter, _rx) = connect(&app, Role::Reporter, MACHINE);

        let event = InboundEvent::HeartbeatResponse {
            uuid: MACHINE.to_string(),
            epoch: epoch_ms().saturating_sub(60),
        };
        dispatch(&app, reporter, Role::Reporter, MACHINE, addr(), event).await;

        let rtt = app.registry.latency_get(MACHINE).unwrap();
        assert!(rtt >= 30.0 && rtt < 100.0, "rtt was {rtt}");
    }

    #[tokio::test]
    async fn test_client_cannot_inject_reports() {
        let app = test_state();
        let (client, _rx) = connect(&app, Role::Client, "user-1");

        dispatch(&app, client, Role::Client, "user-1", addr(), sample_report(MACHINE)).await;
        assert!(app.registry.snapshot_all().is_empty());
    }

    #[tokio::test]
    async fn test_terminal_relay_round_trip() {
        let app = test_state();
        let (client, mut client_rx) = connect(&app, Role::Client, "user-1");
        let (_reporter, mut reporter_rx) = connect(&app, Role::Reporter, MACHINE);

        let open = InboundEvent::NewTerminalConnection { uuid: MACHINE.to_string() };
        dispatch(&app, client, Role::Client, "user-1", addr(), open).await;
        assert!(matches!(reporter_rx.try_recv(), Ok(OutboundEvent::StartTerminal { .. })));

        let keys = InboundEvent::Input { uuid: MACHINE.to_string(), data: "ls\n".into() };
        dispatch(&app, client, Role::Client, "user-1", addr(), keys).await;
        assert!(matches!(reporter_rx.try_recv(), Ok(OutboundEvent::Input { .. })));

        let output = InboundEvent::Input { uuid: MACHINE.to_string(), data: "file.txt\n".into() };
        assert_eq!(app.registry.terminal_client_for(MACHINE), Some(client));
        dispatch(&app, _reporter, Role::Reporter, MACHINE, addr(), output).await;
        assert!(matches!(client_rx.try_recv(), Ok(OutboundEvent::Input { .. })));

        let close = InboundEvent::TerminateTerminal { uuid: MACHINE.to_string() };
        dispatch(&app, client, Role::Client, "user-1", addr(), close).await;
        assert!(matches!(reporter_rx.try_recv(), Ok(OutboundEvent::TerminateTerminal { .. })));
        assert!(app.registry.terminal_client_for(MACHINE).is_none());
    }

    #[tokio::test]
    async fn test_get_machines_replies_to_requester_only() {
        let app = test_state();
        let (reporter, _rrx) = connect(&app, Role::Reporter, MACHINE);
        let (client, mut client_rx) = connect(&app, Role::Client, "user-1");

        dispatch(&app, reporter, Role::Reporter, MACHINE, addr(), sample_report(MACHINE)).await;
        dispatch(&app, client, Role::Client, "user-1", addr(), InboundEvent::GetMachines).await;

        match client_rx.try_recv() {
            Ok(OutboundEvent::Machines(map)) => assert_eq!(map.len(), 1),
            other => panic!("expected machines event, got {other:?}"),
        }
    }

    fn owned_machine(owner: &str) -> MachineRecord {
        MachineRecord {
            uuid: MACHINE.to_string(),
            hostname: None,
            os: None,
            owner: Some(owner.to_string()),
            country: None,
            registered_at: now_rfc3339(),
            last_seen: now_rfc3339(),
        }
    }

    #[tokio::test]
    async fn test_speedtest_points_reach_owning_client() {
        let app = test_state();
        app.store.upsert_machine(owned_machine("user-1")).unwrap();
        let (reporter, mut reporter_rx) = connect(&app, Role::Reporter, MACHINE);
        let (_client, mut client_rx) = connect(&app, Role::Client, "user-1");

        let event = InboundEvent::Speedtest(json!({ "down_mbps": 940, "up_mbps": 732 }));
        dispatch(&app, reporter, Role::Reporter, MACHINE, addr(), event).await;

        assert_eq!(app.store.find_user("user-1").unwrap().points, 50);
        assert!(matches!(client_rx.try_recv(), Ok(OutboundEvent::Points(50))));
        assert!(reporter_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_ownerless_award_credits_machine_identity() {
        let app = test_state();
        let (reporter, _rx) = connect(&app, Role::Reporter, MACHINE);

        let event = InboundEvent::Speedtest(json!({ "down_mbps": 10, "up_mbps": 10 }));
        dispatch(&app, reporter, Role::Reporter, MACHINE, addr(), event).await;

        assert_eq!(app.store.find_user(MACHINE).unwrap().points, 50);
    }

    #[tokio::test]
    async fn test_dynamic_data_reaches_clients() {
        let app = test_state();
        let (reporter, mut reporter_rx) = connect(&app, Role::Reporter, MACHINE);
        let (_client, mut client_rx) = connect(&app, Role::Client, "user-1");

        let event = InboundEvent::DynamicData(json!({ "processes": 132 }));
        dispatch(&app, reporter, Role::Reporter, MACHINE, addr(), event).await;

        match client_rx.try_recv() {
            Ok(OutboundEvent::DynamicData { uuid, .. }) => assert_eq!(uuid, MACHINE),
            other => panic!("expected dynamicData, got {other:?}"),
        }
        assert!(reporter_rx.try_recv().is_err());
    }
}
