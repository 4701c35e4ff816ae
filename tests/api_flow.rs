//! End-to-end flow over a real listener: session lifecycle, presence,
//! room end, payouts and snapshot subscriptions.
//!
//! Every backend is in memory and every collaborator is an in-process
//! double, so the suite needs no external services.

#![allow(clippy::panic)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio_tungstenite::tungstenite::Message;

use room_ads_engine::api;
use room_ads_engine::app_state::{AppState, Backends, Collaborators};
use room_ads_engine::config::EngineConfig;
use room_ads_engine::coordination::MemoryCoordinator;
use room_ads_engine::domain::{AdId, AdStatus, Advertisement, Room, RoomId};
use room_ads_engine::persistence::MemoryStore;
use room_ads_engine::service::DistributionSettings;
use room_ads_engine::testing::{FakeChain, FakeSwap, MapIdentity, StaticConferencing};

const TREASURY: &str = "0xtreasury";

struct Server {
    addr: SocketAddr,
    http: reqwest::Client,
    room: RoomId,
}

impl Server {
    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    fn room_url(&self, suffix: &str) -> String {
        self.url(&format!("/api/v1/rooms/{}{suffix}", self.room))
    }

    async fn post(&self, url: String, body: Value) -> (u16, Value) {
        let Ok(response) = self.http.post(url).json(&body).send().await else {
            panic!("request should reach the server");
        };
        let status = response.status().as_u16();
        let Ok(body) = response.json::<Value>().await else {
            panic!("response should be JSON");
        };
        (status, body)
    }

    async fn get(&self, url: String) -> (u16, Value) {
        let Ok(response) = self.http.get(url).send().await else {
            panic!("request should reach the server");
        };
        let status = response.status().as_u16();
        let Ok(body) = response.json::<Value>().await else {
            panic!("response should be JSON");
        };
        (status, body)
    }
}

async fn spawn_server() -> Server {
    spawn_server_with(Arc::new(StaticConferencing::new(3)), Duration::from_secs(30)).await
}

async fn spawn_server_with(
    conferencing: Arc<StaticConferencing>,
    request_timeout: Duration,
) -> Server {
    let store = Arc::new(MemoryStore::new());
    let coordinator = Arc::new(MemoryCoordinator::new());

    let room = RoomId::new();
    store
        .upsert_room(Room {
            id: room,
            ads_enabled: true,
            ended_at: None,
        })
        .await;
    store
        .insert_ad(Advertisement {
            id: AdId::new(),
            title: "Spring sale".to_string(),
            image_ref: "img/spring.png".to_string(),
            minutes_per_room: 5,
            total_rooms: 10,
            rooms_remaining: 10,
            min_participants: 1,
            status: AdStatus::Active,
            webhook_url: None,
            created_at: Utc::now(),
            seq: 0,
        })
        .await;

    let chain = Arc::new(FakeChain::new(TREASURY));
    let config = EngineConfig {
        distribution: DistributionSettings::new("0xstable", "0xreward", TREASURY, "0xmulti"),
        request_timeout,
        ..EngineConfig::default()
    };
    let collaborators = Collaborators {
        conferencing,
        identity: Arc::new(MapIdentity::new()),
        swap: Arc::new(FakeSwap::new(Arc::clone(&chain), 1, 1)),
        chain,
    };
    let state = AppState::assemble(
        &config,
        Backends::in_memory(&store, &coordinator),
        collaborators,
        reqwest::Client::new(),
    );

    let app = api::app(state, config.request_timeout);
    let Ok(listener) = tokio::net::TcpListener::bind("127.0.0.1:0").await else {
        panic!("listener should bind");
    };
    let Ok(addr) = listener.local_addr() else {
        panic!("listener should have an address");
    };
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    Server {
        addr,
        http: reqwest::Client::new(),
        room,
    }
}

#[tokio::test]
async fn health_reports_backends() {
    let server = spawn_server().await;
    let (status, body) = server.get(server.url("/health")).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["persistence"], "memory");
    assert_eq!(body["coordination"], "memory");
    assert_eq!(body["running_sessions"], 0);
}

#[tokio::test]
async fn session_lifecycle_over_http() {
    let server = spawn_server().await;

    let (status, started) = server
        .post(server.room_url("/ads/start"), json!({ "participant_count": 3 }))
        .await;
    assert_eq!(status, 201);
    assert_eq!(started["status"], "started");
    assert_eq!(started["duration_sec"], 300);

    let (status, again) = server.post(server.room_url("/ads/start"), json!({})).await;
    assert_eq!(status, 200);
    assert_eq!(again["status"], "already_running");
    assert_eq!(again["session_id"], started["session_id"]);

    let (status, snapshot) = server.get(server.room_url("/ads/snapshot")).await;
    assert_eq!(status, 200);
    assert_eq!(snapshot["state"], "running");
    assert_eq!(snapshot["session_id"], started["session_id"]);

    let (status, joined) = server
        .post(server.room_url("/participants/alice/join"), json!({}))
        .await;
    assert_eq!(status, 200);
    assert_eq!(joined["user_id"], "alice");
    assert_eq!(joined["evaluation"]["accepted"], true);

    let (status, _) = server
        .post(server.room_url("/participants/alice/leave"), json!({}))
        .await;
    assert_eq!(status, 200);

    let (status, stopped) = server
        .post(server.room_url("/ads/stop"), json!({ "reason": "manual" }))
        .await;
    assert_eq!(status, 200);
    assert_eq!(stopped["state"], "stopped");
    assert_eq!(stopped["reason"], "manual");

    let (status, _) = server
        .post(server.room_url("/ads/stop"), json!({ "reason": "bogus" }))
        .await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn start_rejects_unknown_rooms() {
    let server = spawn_server().await;
    let url = server.url(&format!("/api/v1/rooms/{}/ads/start", RoomId::new()));
    let (status, body) = server.post(url, json!({})).await;
    assert_eq!(status, 404);
    assert_eq!(body["status"], "rejected");
    assert_eq!(body["reason"], "room_not_found");
}

#[tokio::test]
async fn evaluate_is_accepted() {
    let server = spawn_server().await;
    let (status, body) = server
        .post(server.room_url("/ads/evaluate"), json!({ "participant_count": 2 }))
        .await;
    assert_eq!(status, 202);
    assert_eq!(body["accepted"], true);
    assert_eq!(body["outcome"], "started");
}

#[tokio::test]
async fn ending_a_room_stops_ads_and_schedules_payout() {
    let server = spawn_server().await;
    let (status, _) = server
        .post(server.room_url("/ads/start"), json!({ "participant_count": 3 }))
        .await;
    assert_eq!(status, 201);

    let (status, ended) = server.post(server.room_url("/end"), json!({})).await;
    assert_eq!(status, 200);
    assert_eq!(ended["snapshot"]["state"], "stopped");
    assert_eq!(ended["snapshot"]["reason"], "room_ended");
    assert_eq!(ended["media_room_ended"], true);
    assert_eq!(ended["distribution"], "scheduled");

    // Nobody watched, so the background run settles as skipped.
    let mut settled = None;
    for _ in 0..50 {
        let (status, payout) = server.get(server.room_url("/payout")).await;
        if status == 200 && payout["status"] != "pending" {
            settled = Some(payout);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let Some(payout) = settled else {
        panic!("background distribution should settle");
    };
    assert_eq!(payout["status"], "skipped");
}

#[tokio::test]
async fn ended_rooms_stay_off_for_evaluation() {
    let server = spawn_server().await;
    let (status, _) = server.post(server.room_url("/end"), json!({})).await;
    assert_eq!(status, 200);

    let (status, body) = server
        .post(server.room_url("/ads/evaluate"), json!({ "participant_count": 2 }))
        .await;
    assert_eq!(status, 202);
    assert_eq!(body["outcome"], "unchanged");

    let (_, snapshot) = server.get(server.room_url("/ads/snapshot")).await;
    assert_eq!(snapshot["state"], "stopped");
    assert_eq!(snapshot["reason"], "room_ended");
}

#[tokio::test]
async fn slow_requests_time_out() {
    let conferencing = Arc::new(StaticConferencing::new(3));
    conferencing.set_delay(Duration::from_secs(5));
    let server = spawn_server_with(conferencing, Duration::from_millis(200)).await;

    // ending the room waits on the media provider
    let Ok(response) = server
        .http
        .post(server.room_url("/end"))
        .json(&json!({}))
        .send()
        .await
    else {
        panic!("request should reach the server");
    };
    assert_eq!(response.status().as_u16(), 408);
}

#[tokio::test]
async fn payouts_are_triggered_and_read_back() {
    let server = spawn_server().await;

    let (status, missing) = server.get(server.room_url("/payout")).await;
    assert_eq!(status, 404);
    assert_eq!(missing["error"]["code"], 2003);

    let (status, triggered) = server.post(server.room_url("/payout"), json!({})).await;
    assert_eq!(status, 200);
    assert_eq!(triggered["outcome"], "finished");
    assert_eq!(triggered["payout"]["status"], "skipped");
    assert_eq!(triggered["payout"]["skip_reason"], "no_revenue");

    let (status, stored) = server.get(server.room_url("/payout")).await;
    assert_eq!(status, 200);
    assert_eq!(stored["status"], "skipped");
}

#[tokio::test]
async fn websocket_subscribers_receive_snapshots() {
    let server = spawn_server().await;
    let Ok((mut socket, _)) =
        tokio_tungstenite::connect_async(format!("ws://{}/ws", server.addr)).await
    else {
        panic!("websocket should connect");
    };

    let subscribe = json!({
        "id": "sub-1",
        "type": "command",
        "timestamp": Utc::now(),
        "payload": { "command": "subscribe", "room_ids": [server.room.to_string()] },
    });
    let Ok(()) = socket.send(Message::Text(subscribe.to_string().into())).await else {
        panic!("subscribe should send");
    };

    let reply = next_json(&mut socket).await;
    assert_eq!(reply["id"], "sub-1");
    assert_eq!(reply["type"], "response");
    assert_eq!(reply["payload"]["count"], 1);

    let initial = next_json(&mut socket).await;
    assert_eq!(initial["type"], "event");
    assert_eq!(initial["payload"]["room_id"], server.room.to_string());
    assert_eq!(initial["payload"]["state"], "stopped");

    let (status, _) = server
        .post(server.room_url("/ads/start"), json!({ "participant_count": 3 }))
        .await;
    assert_eq!(status, 201);

    let live = next_json(&mut socket).await;
    assert_eq!(live["type"], "event");
    assert_eq!(live["payload"]["state"], "running");
}

async fn next_json<S>(socket: &mut S) -> Value
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let next = tokio::time::timeout(Duration::from_secs(5), socket.next()).await;
        let Ok(Some(Ok(message))) = next else {
            panic!("expected a websocket frame");
        };
        if let Message::Text(text) = message {
            let Ok(value) = serde_json::from_str::<Value>(&text) else {
                panic!("frame should be JSON");
            };
            return value;
        }
    }
}
