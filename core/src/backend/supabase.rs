/// Hosted backend: GoTrue auth, PostgREST tables and the Realtime websocket
///
/// Endpoints:
///   POST  /auth/v1/signup
///   POST  /auth/v1/token?grant_type=password
///   POST  /auth/v1/token?grant_type=refresh_token
///   POST  /auth/v1/logout
///   GET   /auth/v1/user
///   GET   /rest/v1/<table>?<filters>&order=created_at.asc
///   POST  /rest/v1/<table>                 (insert / upsert)
///   PATCH /rest/v1/<table>?<filters>       (read flag)
///   WS    /realtime/v1/websocket           (postgres_changes on messages)
use super::{Backend, MessageFilter, Subscription, SUBSCRIPTION_BUFFER};
use crate::config::{BackendConfig, Config};
use crate::error::{ChatError, Result};
use crate::messenger_types::{
    AuthEvent, AuthSession, AuthUser, ChangeEvent, ChangeKind, Message, NewMessage, Profile,
};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use chrono::Utc;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tokio::time::interval;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tracing::{debug, error, info, warn};

const SESSION_FILE: &str = "session.json";
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
/// Refresh this long before the access token runs out
const REFRESH_MARGIN_SECS: i64 = 60;

pub struct SupabaseBackend {
    http: reqwest::Client,
    backend: BackendConfig,
    profiles_table: String,
    messages_table: String,
    session_path: PathBuf,
    session: RwLock<Option<AuthSession>>,
    refresh_lock: Mutex<()>,
    auth_tx: broadcast::Sender<AuthEvent>,
}

/// GoTrue answers sign-up either with a session or with the bare user
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SignUpResponse {
    WithUser { user: AuthUser },
    Bare(AuthUser),
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(alias = "error_description", alias = "msg")]
    message: Option<String>,
}

impl SupabaseBackend {
    pub fn new(config: &Config, backend: BackendConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ChatError::Config(format!("HTTP client: {}", e)))?;
        let session_path = config.data_dir.join(SESSION_FILE);
        let session = load_session(&session_path);
        if session.is_some() {
            debug!("Restored persisted session from {:?}", session_path);
        }
        let (auth_tx, _) = broadcast::channel(16);

        Ok(Self {
            http,
            backend,
            profiles_table: config.profiles_table.clone(),
            messages_table: config.messages_table.clone(),
            session_path,
            session: RwLock::new(session),
            refresh_lock: Mutex::new(()),
            auth_tx,
        })
    }

    fn auth_url(&self, path: &str) -> String {
        format!("{}/auth/v1/{}", self.backend.url, path)
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.backend.url, table)
    }

    fn realtime_url(&self) -> String {
        let ws_base = if let Some(rest) = self.backend.url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.backend.url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.backend.url.clone()
        };
        format!(
            "{}/realtime/v1/websocket?apikey={}&vsn=1.0.0",
            ws_base,
            urlencoding::encode(&self.backend.key)
        )
    }

    /// Bearer is the user's access token when signed in, the anon key otherwise
    async fn bearer(&self) -> String {
        match self.session.read().await.as_ref() {
            Some(s) => s.access_token.clone(),
            None => self.backend.key.clone(),
        }
    }

    fn with_auth(&self, builder: RequestBuilder, token: &str) -> RequestBuilder {
        builder.header("apikey", &self.backend.key).bearer_auth(token)
    }

    /// Send a request built by `build` with the current access token.
    ///
    /// A token about to expire is refreshed first; a 401 triggers one
    /// refresh and one retry. If the refresh fails the 401 is returned.
    async fn send_authed<F>(&self, build: F) -> reqwest::Result<Response>
    where
        F: Fn() -> RequestBuilder + Send + Sync,
    {
        self.refresh_if_expiring().await;
        let token = self.bearer().await;
        let resp = self.with_auth(build(), &token).send().await?;
        if resp.status() != StatusCode::UNAUTHORIZED || !self.can_refresh().await {
            return Ok(resp);
        }
        match self.refresh_session(&token).await {
            Ok(session) => self.with_auth(build(), &session.access_token).send().await,
            Err(e) => {
                warn!("Token refresh failed: {}", e);
                Ok(resp)
            }
        }
    }

    async fn can_refresh(&self) -> bool {
        self.session
            .read()
            .await
            .as_ref()
            .is_some_and(|s| s.refresh_token.is_some())
    }

    async fn refresh_if_expiring(&self) {
        let stale = match self.session.read().await.as_ref() {
            Some(s) if s.refresh_token.is_some() && s.expires_within(Utc::now(), REFRESH_MARGIN_SECS) => {
                s.access_token.clone()
            }
            _ => return,
        };
        if let Err(e) = self.refresh_session(&stale).await {
            warn!("Token refresh failed: {}", e);
        }
    }

    /// Trade the refresh token for a new session. `stale` is the access token
    /// the caller saw rejected; if another request already replaced it, the
    /// current session is returned without a second refresh.
    async fn refresh_session(&self, stale: &str) -> Result<AuthSession> {
        let _guard = self.refresh_lock.lock().await;
        let refresh_token = match self.session.read().await.as_ref() {
            Some(s) if s.access_token != stale => return Ok(s.clone()),
            Some(s) => s.refresh_token.clone(),
            None => None,
        }
        .ok_or_else(|| ChatError::Auth("No refresh token".to_string()))?;

        let resp = self
            .http
            .post(self.auth_url("token?grant_type=refresh_token"))
            .header("apikey", &self.backend.key)
            .json(&json!({ "refresh_token": refresh_token }))
            .send()
            .await?;
        let resp = check(resp, ChatError::Auth).await?;
        let session: AuthSession = resp.json().await?;
        self.store_session(Some(session.clone())).await;
        let _ = self.auth_tx.send(AuthEvent::TokenRefreshed(session.clone()));
        info!("Access token refreshed for {}", session.user.id);
        Ok(session)
    }

    async fn store_session(&self, session: Option<AuthSession>) {
        match &session {
            Some(s) => match serde_json::to_string_pretty(s) {
                Ok(json) => {
                    let dir = self.session_path.parent().unwrap_or(Path::new("."));
                    if let Err(e) = fs::create_dir_all(dir).and_then(|_| fs::write(&self.session_path, json))
                    {
                        warn!("Could not persist session: {}", e);
                    }
                }
                Err(e) => warn!("Could not serialize session: {}", e),
            },
            None => {
                let _ = fs::remove_file(&self.session_path);
            }
        }
        *self.session.write().await = session;
    }

    fn filter_query(filter: &MessageFilter) -> Vec<(String, String)> {
        let mut params = Vec::new();
        if let Some(sender) = &filter.sender_id {
            params.push(("sender_id".to_string(), format!("eq.{}", sender)));
        }
        if let Some(recipient) = &filter.recipient_id {
            params.push(("recipient_id".to_string(), format!("eq.{}", recipient)));
        }
        if let Some(read) = filter.read {
            params.push(("read".to_string(), format!("eq.{}", read)));
        }
        params
    }
}

/// Turn a non-2xx response into an error built by `make`
async fn check(resp: Response, make: fn(String) -> ChatError) -> Result<Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .ok()
        .and_then(|b| b.message)
        .unwrap_or(body);
    Err(make(format!("{} ({})", message, status)))
}

fn load_session(path: &Path) -> Option<AuthSession> {
    let raw = fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

#[async_trait]
impl Backend for SupabaseBackend {
    async fn sign_up(&self, email: &str, password: &str) -> Result<AuthUser> {
        let resp = self
            .http
            .post(self.auth_url("signup"))
            .header("apikey", &self.backend.key)
            .json(&json!({ "email": email, "password": password }))
            .send()
            .await?;
        let resp = check(resp, ChatError::Auth).await?;
        let user = match resp.json::<SignUpResponse>().await? {
            SignUpResponse::WithUser { user } => user,
            SignUpResponse::Bare(user) => user,
        };
        info!("Signed up {}", user.email);
        Ok(user)
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthSession> {
        let resp = self
            .http
            .post(self.auth_url("token?grant_type=password"))
            .header("apikey", &self.backend.key)
            .json(&json!({ "email": email, "password": password }))
            .send()
            .await?;
        let resp = check(resp, ChatError::Auth).await?;
        let session: AuthSession = resp.json().await?;
        self.store_session(Some(session.clone())).await;
        let _ = self.auth_tx.send(AuthEvent::SignedIn(session.clone()));
        Ok(session)
    }

    async fn sign_out(&self) -> Result<()> {
        if self.session.read().await.is_none() {
            return Ok(());
        }
        let token = self.bearer().await;
        let req = self.with_auth(self.http.post(self.auth_url("logout")), &token);
        // The local session goes away even if the server call fails
        if let Err(e) = req.send().await {
            warn!("Logout request failed: {}", e);
        }
        self.store_session(None).await;
        let _ = self.auth_tx.send(AuthEvent::SignedOut);
        Ok(())
    }

    async fn get_session(&self) -> Result<Option<AuthSession>> {
        Ok(self.session.read().await.clone())
    }

    async fn get_user(&self) -> Result<Option<AuthUser>> {
        if self.session.read().await.is_none() {
            return Ok(None);
        }
        let resp = self.send_authed(|| self.http.get(self.auth_url("user"))).await?;
        if resp.status() == StatusCode::UNAUTHORIZED || resp.status() == StatusCode::FORBIDDEN {
            return Ok(None);
        }
        let resp = check(resp, ChatError::Auth).await?;
        Ok(Some(resp.json().await?))
    }

    fn on_auth_state_change(&self) -> broadcast::Receiver<AuthEvent> {
        self.auth_tx.subscribe()
    }

    async fn upsert_profile(&self, profile: &Profile) -> Result<()> {
        let resp = self
            .send_authed(|| {
                self.http
                    .post(self.table_url(&self.profiles_table))
                    .query(&[("on_conflict", "id")])
                    .header("Prefer", "resolution=merge-duplicates,return=minimal")
                    .json(&[profile])
            })
            .await?;
        check(resp, ChatError::ProfileSync).await?;
        Ok(())
    }

    async fn insert_profile(&self, profile: &Profile) -> Result<()> {
        let resp = self
            .send_authed(|| {
                self.http
                    .post(self.table_url(&self.profiles_table))
                    .header("Prefer", "return=minimal")
                    .json(&[profile])
            })
            .await?;
        check(resp, ChatError::ProfileSync).await?;
        Ok(())
    }

    async fn list_profiles(&self, exclude_id: &str) -> Result<Vec<Profile>> {
        let params = [("select", "*".to_string()), ("id", format!("neq.{}", exclude_id))];
        let resp = self
            .send_authed(|| self.http.get(self.table_url(&self.profiles_table)).query(&params))
            .await?;
        let resp = check(resp, ChatError::Query).await?;
        Ok(resp.json().await?)
    }

    async fn query_messages(&self, filter: &MessageFilter) -> Result<Vec<Message>> {
        let mut params = Self::filter_query(filter);
        params.push(("select".to_string(), "*".to_string()));
        params.push(("order".to_string(), "created_at.asc".to_string()));
        let resp = self
            .send_authed(|| self.http.get(self.table_url(&self.messages_table)).query(&params))
            .await
            .map_err(|e| ChatError::Query(e.to_string()))?;
        let resp = check(resp, ChatError::Query).await?;
        resp.json().await.map_err(|e| ChatError::Query(e.to_string()))
    }

    async fn insert_message(&self, message: &NewMessage) -> Result<Message> {
        let resp = self
            .send_authed(|| {
                self.http
                    .post(self.table_url(&self.messages_table))
                    .header("Prefer", "return=representation")
                    .json(&[message])
            })
            .await
            .map_err(|e| ChatError::Send(e.to_string()))?;
        let resp = check(resp, ChatError::Send).await?;
        let mut rows: Vec<Message> = resp.json().await.map_err(|e| ChatError::Send(e.to_string()))?;
        if rows.is_empty() {
            return Err(ChatError::Send("insert returned no row".to_string()));
        }
        Ok(rows.swap_remove(0))
    }

    async fn update_read(&self, filter: &MessageFilter) -> Result<Vec<Message>> {
        let params = Self::filter_query(filter);
        let resp = self
            .send_authed(|| {
                self.http
                    .patch(self.table_url(&self.messages_table))
                    .query(&params)
                    .header("Prefer", "return=representation")
                    .json(&json!({ "read": true }))
            })
            .await?;
        let resp = check(resp, ChatError::Query).await?;
        Ok(resp.json().await?)
    }

    async fn subscribe(&self) -> Result<Subscription> {
        self.refresh_if_expiring().await;
        let url = self.realtime_url();
        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| ChatError::Subscription(format!("connect: {}", e)))?;
        let (mut sink, mut stream) = ws.split();

        let topic = format!("realtime:public:{}", self.messages_table);
        let join = json!({
            "topic": topic,
            "event": "phx_join",
            "payload": {
                "config": {
                    "postgres_changes": [
                        { "event": "*", "schema": "public", "table": self.messages_table }
                    ]
                },
                "access_token": self.bearer().await,
            },
            "ref": "1",
        });
        sink.send(WsMessage::Text(join.to_string().into()))
            .await
            .map_err(|e| ChatError::Subscription(format!("join: {}", e)))?;
        info!("Realtime channel {} joined", topic);

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let mut heartbeat = interval(HEARTBEAT_INTERVAL);
            let mut next_ref: u64 = 2;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => {
                        let leave = json!({ "topic": topic, "event": "phx_leave", "payload": {}, "ref": next_ref.to_string() });
                        let _ = sink.send(WsMessage::Text(leave.to_string().into())).await;
                        let _ = sink.close().await;
                        debug!("Realtime channel {} left", topic);
                        break;
                    }
                    _ = heartbeat.tick() => {
                        let beat = json!({ "topic": "phoenix", "event": "heartbeat", "payload": {}, "ref": next_ref.to_string() });
                        next_ref += 1;
                        if let Err(e) = sink.send(WsMessage::Text(beat.to_string().into())).await {
                            warn!("Realtime heartbeat failed: {}", e);
                            break;
                        }
                    }
                    frame = stream.next() => match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            match decode_realtime_frame(&text) {
                                Ok(Some(event)) => {
                                    if tx.send(event).await.is_err() {
                                        break;
                                    }
                                }
                                Ok(None) => {}
                                // Closing the feed hands the listener over to polling
                                Err(ChatError::Subscription(reason)) => {
                                    error!("Realtime channel failed: {}", reason);
                                    break;
                                }
                                Err(e) => warn!("Ignoring realtime frame: {}", e),
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            warn!("Realtime connection closed");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!("Realtime connection error: {}", e);
                            break;
                        }
                    },
                }
            }
        });

        Ok(Subscription::new(rx, stop_tx))
    }
}

#[derive(Debug, Deserialize)]
struct PhoenixFrame {
    event: String,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct PostgresChange {
    #[serde(rename = "type", alias = "eventType")]
    kind: String,
    #[serde(alias = "new")]
    record: Option<Message>,
}

/// Decode one Phoenix frame. `Ok(None)` for replies, heartbeats and
/// changes this client does not care about (deletes). Channel errors and
/// rejected replies are `ChatError::Subscription`.
pub(crate) fn decode_realtime_frame(text: &str) -> Result<Option<ChangeEvent>> {
    let frame: PhoenixFrame = serde_json::from_str(text)?;
    match frame.event.as_str() {
        "postgres_changes" => {
            let data = frame.payload.get("data").cloned().unwrap_or(frame.payload);
            let change: PostgresChange = serde_json::from_value(data)?;
            let kind = match change.kind.as_str() {
                "INSERT" => ChangeKind::Insert,
                "UPDATE" => ChangeKind::Update,
                _ => return Ok(None),
            };
            Ok(change.record.map(|message| ChangeEvent { kind, message }))
        }
        "phx_reply" => {
            if frame.payload.get("status").and_then(|s| s.as_str()) == Some("error") {
                return Err(ChatError::Subscription(format!("request rejected: {}", frame.payload)));
            }
            Ok(None)
        }
        "phx_error" | "system" => {
            if frame.payload.get("status").and_then(|s| s.as_str()) == Some("error") || frame.event == "phx_error" {
                return Err(ChatError::Subscription(format!("channel error: {}", frame.payload)));
            }
            Ok(None)
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::time::{sleep, timeout};

    type Responder = fn(&str, &str) -> (u16, String);

    /// HTTP stub answering one request per connection. `respond` gets
    /// "METHOD /path?query" and the Authorization header.
    async fn stub_http(respond: Responder) -> (String, Arc<StdMutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let log = seen.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let log = log.clone();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 4096];
                    let header_end = loop {
                        let n = socket.read(&mut chunk).await.unwrap();
                        if n == 0 {
                            return;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                            break pos + 4;
                        }
                    };
                    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
                    let header = |name: &str| {
                        head.lines().find_map(|line| {
                            let (key, value) = line.split_once(':')?;
                            key.trim().eq_ignore_ascii_case(name).then(|| value.trim().to_string())
                        })
                    };
                    let body_len: usize = header("content-length").and_then(|v| v.parse().ok()).unwrap_or(0);
                    while buf.len() < header_end + body_len {
                        let n = socket.read(&mut chunk).await.unwrap();
                        if n == 0 {
                            break;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                    }

                    let mut request_line = head.lines().next().unwrap_or_default().split_whitespace();
                    let target = format!(
                        "{} {}",
                        request_line.next().unwrap_or_default(),
                        request_line.next().unwrap_or_default()
                    );
                    let auth = header("authorization").unwrap_or_default();
                    log.lock().unwrap().push(target.clone());

                    let (status, body) = respond(&target, &auth);
                    let reply = format!(
                        "HTTP/1.1 {} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status,
                        body.len(),
                        body
                    );
                    socket.write_all(reply.as_bytes()).await.unwrap();
                    let _ = socket.shutdown().await;
                });
            }
        });
        (format!("http://{}", addr), seen)
    }

    fn session(access_token: &str, expires_at: Option<i64>) -> AuthSession {
        AuthSession {
            access_token: access_token.to_string(),
            refresh_token: Some("refresh-1".to_string()),
            expires_at,
            user: AuthUser {
                id: "u1".to_string(),
                email: "ana@example.com".to_string(),
            },
        }
    }

    fn refreshed_body() -> String {
        json!({
            "access_token": "fresh",
            "refresh_token": "refresh-2",
            "expires_at": Utc::now().timestamp() + 3600,
            "user": { "id": "u1", "email": "ana@example.com" }
        })
        .to_string()
    }

    fn user_endpoint(target: &str, auth: &str) -> (u16, String) {
        match (target, auth) {
            ("POST /auth/v1/token?grant_type=refresh_token", _) => (200, refreshed_body()),
            ("GET /auth/v1/user", "Bearer fresh") => (200, r#"{"id":"u1","email":"ana@example.com"}"#.to_string()),
            _ => (401, r#"{"message":"JWT expired"}"#.to_string()),
        }
    }

    fn backend(url: &str) -> (tempfile::TempDir, SupabaseBackend) {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let config = Config {
            data_dir: temp_dir.path().to_path_buf(),
            ..Default::default()
        };
        let b = SupabaseBackend::new(&config, BackendConfig::new(url, "anon-key").unwrap()).unwrap();
        (temp_dir, b)
    }

    #[test]
    fn test_urls() {
        let (_dir, b) = backend("https://abc.supabase.co");
        assert_eq!(b.table_url("messages"), "https://abc.supabase.co/rest/v1/messages");
        assert_eq!(b.auth_url("user"), "https://abc.supabase.co/auth/v1/user");
        assert_eq!(
            b.realtime_url(),
            "wss://abc.supabase.co/realtime/v1/websocket?apikey=anon-key&vsn=1.0.0"
        );
    }

    #[test]
    fn test_filter_query() {
        let params = SupabaseBackend::filter_query(&MessageFilter::unread("a", "b"));
        assert_eq!(
            params,
            vec![
                ("sender_id".to_string(), "eq.a".to_string()),
                ("recipient_id".to_string(), "eq.b".to_string()),
                ("read".to_string(), "eq.false".to_string()),
            ]
        );
    }

    #[test]
    fn test_decode_insert_frame() {
        let frame = r#"{
            "topic": "realtime:public:messages",
            "event": "postgres_changes",
            "payload": {
                "data": {
                    "type": "INSERT",
                    "schema": "public",
                    "table": "messages",
                    "record": {
                        "id": 42,
                        "content": "oi",
                        "sender_id": "a",
                        "recipient_id": "b",
                        "created_at": "2024-05-01T10:00:00.5+00:00",
                        "read": false
                    }
                },
                "ids": [1]
            },
            "ref": null
        }"#;
        let event = decode_realtime_frame(frame).unwrap().unwrap();
        assert_eq!(event.kind, ChangeKind::Insert);
        assert_eq!(event.message.id, Some(42));
    }

    #[test]
    fn test_decode_ignores_replies_and_deletes() {
        let reply = r#"{"topic":"phoenix","event":"phx_reply","payload":{"status":"ok"},"ref":"2"}"#;
        assert!(decode_realtime_frame(reply).unwrap().is_none());

        let delete = r#"{"topic":"t","event":"postgres_changes","payload":{"data":{"type":"DELETE","old_record":{"id":1}}}}"#;
        assert!(decode_realtime_frame(delete).unwrap().is_none());

        let err = r#"{"topic":"t","event":"phx_error","payload":{}}"#;
        assert!(decode_realtime_frame(err).is_err());
    }

    #[test]
    fn test_decode_rejected_join_reply() {
        let rejected = r#"{"topic":"realtime:public:messages","event":"phx_reply","payload":{"status":"error","response":{"reason":"unmatched topic"}},"ref":"1"}"#;
        assert!(matches!(decode_realtime_frame(rejected), Err(ChatError::Subscription(_))));
    }

    async fn stub_realtime(frame: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            let _join = ws.next().await;
            ws.send(WsMessage::Text(frame.to_string().into())).await.unwrap();
            // Socket stays open; only the channel failed
            sleep(Duration::from_secs(10)).await;
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_channel_error_closes_subscription() {
        let url = stub_realtime(r#"{"topic":"realtime:public:messages","event":"phx_error","payload":{},"ref":"1"}"#).await;
        let (_dir, b) = backend(&url);
        let mut sub = b.subscribe().await.unwrap();
        let next = timeout(Duration::from_secs(3), sub.recv()).await;
        assert_eq!(next.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rejected_join_closes_subscription() {
        let url = stub_realtime(
            r#"{"topic":"realtime:public:messages","event":"phx_reply","payload":{"status":"error","response":{}},"ref":"1"}"#,
        )
        .await;
        let (_dir, b) = backend(&url);
        let mut sub = b.subscribe().await.unwrap();
        let next = timeout(Duration::from_secs(3), sub.recv()).await;
        assert_eq!(next.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unauthorized_request_refreshes_token() {
        let (url, seen) = stub_http(user_endpoint).await;
        let (dir, b) = backend(&url);
        b.store_session(Some(session("expired", None))).await;
        let mut auth_events = b.on_auth_state_change();

        let user = b.get_user().await.unwrap().unwrap();
        assert_eq!(user.id, "u1");

        match auth_events.try_recv().unwrap() {
            AuthEvent::TokenRefreshed(s) => assert_eq!(s.access_token, "fresh"),
            other => panic!("unexpected auth event {:?}", other),
        }
        let current = b.get_session().await.unwrap().unwrap();
        assert_eq!(current.refresh_token.as_deref(), Some("refresh-2"));
        let persisted = load_session(&dir.path().join(SESSION_FILE)).unwrap();
        assert_eq!(persisted.access_token, "fresh");
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "GET /auth/v1/user".to_string(),
                "POST /auth/v1/token?grant_type=refresh_token".to_string(),
                "GET /auth/v1/user".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_expiring_token_is_refreshed_up_front() {
        let (url, seen) = stub_http(user_endpoint).await;
        let (_dir, b) = backend(&url);
        b.store_session(Some(session("expired", Some(Utc::now().timestamp() + 5)))).await;

        assert!(b.get_user().await.unwrap().is_some());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "POST /auth/v1/token?grant_type=refresh_token".to_string(),
                "GET /auth/v1/user".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_refresh_reports_no_user() {
        fn revoked(target: &str, _auth: &str) -> (u16, String) {
            match target {
                "POST /auth/v1/token?grant_type=refresh_token" => {
                    (400, r#"{"error_description":"Invalid Refresh Token"}"#.to_string())
                }
                _ => (401, r#"{"message":"JWT expired"}"#.to_string()),
            }
        }
        let (url, _seen) = stub_http(revoked).await;
        let (_dir, b) = backend(&url);
        b.store_session(Some(session("expired", None))).await;
        let mut auth_events = b.on_auth_state_change();

        assert!(b.get_user().await.unwrap().is_none());
        assert!(auth_events.try_recv().is_err());
        assert_eq!(b.get_session().await.unwrap().unwrap().access_token, "expired");
    }
}
