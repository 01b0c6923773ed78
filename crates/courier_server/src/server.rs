use crate::ServerConfig;
use crate::hub::HubRegistry;
use crate::session::{SessionKey, clear_session_cookie, session_cookie};
use axum::{
    Json, Router,
    extract::ws::{CloseFrame, Message as WsMessage, Utf8Bytes, WebSocket},
    extract::ws::rejection::WebSocketUpgradeRejection,
    extract::{Path, Query, State, WebSocketUpgrade, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header::SET_COOKIE},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use courier_api::{
    ContactBody, ContactResponse, ContactsResponse, ConversationsResponse, DevInboundRequest,
    Direction, ErrorResponse, LoginRequest, LoginResponse, MAX_MESSAGE_LENGTH, MAX_NAME_LENGTH,
    MeResponse, MessagesResponse, OkResponse, RealtimeEvent, SendMessageRequest,
    SendMessageResponse, SessionUser, phone,
};
use courier_backend::{SIMULATED_PHONE, SqliteStore, StoreError};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tower_http::trace::TraceLayer;

pub fn router(config: ServerConfig) -> anyhow::Result<Router> {
    let store = SqliteStore::new(config.db_path.clone())?;
    let state = AppStateHolder {
        store,
        hubs: Arc::new(HubRegistry::new()),
        session: SessionKey::new(&config.session_secret),
        config: Arc::new(config),
    };

    let api = Router::new()
        .route("/health", get(health))
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/me", get(me))
        .route("/conversations", get(list_conversations))
        .route("/conversations/{conversation_id}/messages", get(list_messages))
        .route("/conversations/{conversation_id}/read", post(mark_read))
        .route("/messages/send", post(send_message))
        .route("/dev/inbound", post(dev_inbound))
        .route("/contacts", get(list_contacts).post(create_contact))
        .route(
            "/contacts/{contact_id}",
            put(update_contact).delete(delete_contact),
        )
        .route("/ws", get(ws_events))
        .fallback(not_found)
        .method_not_allowed_fallback(not_found)
        .layer(axum::middleware::from_fn(reject_cross_origin))
        .with_state(state);

    Ok(Router::new().nest("/api", api).layer(TraceLayer::new_for_http()))
}

async fn health() -> &'static str {
    "ok"
}

/// Unmatched paths and methods still answer with the JSON error envelope.
async fn not_found() -> ApiError {
    ApiError::new(StatusCode::NOT_FOUND, "Not found")
}

#[derive(Clone)]
pub(crate) struct AppStateHolder {
    store: SqliteStore,
    hubs: Arc<HubRegistry>,
    session: SessionKey,
    config: Arc<ServerConfig>,
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Unauthorized")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast_ref::<StoreError>() {
            Some(StoreError::ContactPhoneConflict) => Self::new(
                StatusCode::CONFLICT,
                "A contact with that phone already exists",
            ),
            Some(StoreError::ContactNotFound) => {
                Self::new(StatusCode::NOT_FOUND, "Contact not found")
            }
            Some(StoreError::ConversationNotFound) => {
                Self::new(StatusCode::NOT_FOUND, "Conversation not found")
            }
            None => {
                tracing::error!(error = %format!("{err:#}"), "request failed");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
            }
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Browser-sent state-changing requests must come from the same origin the
/// request was addressed to. Requests without an Origin header (curl, tests,
/// native clients) pass through.
async fn reject_cross_origin(
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let method = req.method();
    let read_only = *method == Method::GET || *method == Method::HEAD || *method == Method::OPTIONS;
    if !read_only
        && let Some(origin) = req.headers().get("origin").and_then(|h| h.to_str().ok())
    {
        let host = req
            .headers()
            .get("host")
            .and_then(|h| h.to_str().ok())
            .unwrap_or_default();
        let origin_host = origin
            .strip_prefix("https://")
            .or_else(|| origin.strip_prefix("http://"))
            .unwrap_or(origin);
        if !origin_host.eq_ignore_ascii_case(host) {
            return ApiError::new(StatusCode::FORBIDDEN, "Invalid origin").into_response();
        }
    }
    next.run(req).await
}

fn require_session(state: &AppStateHolder, headers: &HeaderMap) -> ApiResult<SessionUser> {
    state
        .session
        .session_from_headers(headers, now_ms())
        .ok_or_else(ApiError::unauthorized)
}

fn request_is_https(headers: &HeaderMap) -> bool {
    headers
        .get("x-forwarded-proto")
        .and_then(|h| h.to_str().ok())
        .is_some_and(|proto| proto.eq_ignore_ascii_case("https"))
}

fn parse_json<T>(body: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    match body {
        Ok(Json(value)) => Ok(value),
        Err(_) => Err(ApiError::bad_request("Invalid JSON")),
    }
}

async fn login(
    State(state): State<AppStateHolder>,
    headers: HeaderMap,
    body: Result<Json<LoginRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let body = parse_json(body)?;
    let workspace_code = body.workspace_code.trim();
    let pin = body.pin.trim();
    let display_name = body.display_name.trim();

    if workspace_code.is_empty() || pin.is_empty() || display_name.is_empty() {
        return Err(ApiError::bad_request("Missing fields"));
    }
    if display_name.chars().count() > MAX_NAME_LENGTH {
        return Err(ApiError::bad_request("Display name too long"));
    }
    if workspace_code != state.config.workspace_code || pin != state.config.shared_pin {
        return Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            "Invalid workspace code or PIN",
        ));
    }

    let user = state
        .store
        .find_or_create_user(workspace_code, display_name)
        .await?;

    let token = state.session.issue(
        &SessionUser {
            id: user.id.clone(),
            workspace_id: user.workspace_id.clone(),
            display_name: user.display_name.clone(),
        },
        now_ms(),
    );

    let mut resp = Json(LoginResponse { user }).into_response();
    set_cookie(&mut resp, &session_cookie(&token, request_is_https(&headers)));
    Ok(resp)
}

async fn logout(headers: HeaderMap) -> Response {
    let mut resp = Json(OkResponse { ok: true }).into_response();
    set_cookie(&mut resp, &clear_session_cookie(request_is_https(&headers)));
    resp
}

fn set_cookie(resp: &mut Response, cookie: &str) {
    if let Ok(value) = HeaderValue::from_str(cookie) {
        resp.headers_mut().append(SET_COOKIE, value);
    }
}

async fn me(State(state): State<AppStateHolder>, headers: HeaderMap) -> ApiResult<Json<MeResponse>> {
    let user = require_session(&state, &headers)?;
    Ok(Json(MeResponse { user }))
}

async fn list_conversations(
    State(state): State<AppStateHolder>,
    headers: HeaderMap,
) -> ApiResult<Json<ConversationsResponse>> {
    let user = require_session(&state, &headers)?;
    let conversations = state.store.list_conversations(user.workspace_id).await?;
    Ok(Json(ConversationsResponse { conversations }))
}

/// Query values arrive as strings; anything unparsable is ignored rather than
/// rejected so a sloppy client still gets the default page.
#[derive(serde::Deserialize)]
struct MessagesQuery {
    limit: Option<String>,
    before: Option<String>,
}

async fn list_messages(
    State(state): State<AppStateHolder>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> ApiResult<Json<MessagesResponse>> {
    let user = require_session(&state, &headers)?;

    let limit = query.limit.as_deref().and_then(|v| v.parse::<i64>().ok());
    let before = query
        .before
        .as_deref()
        .and_then(|v| v.parse::<i64>().ok())
        .filter(|v| *v > 0);

    let messages = state
        .store
        .list_messages(user.workspace_id, conversation_id, limit, before)
        .await?;
    Ok(Json(MessagesResponse { messages }))
}

async fn mark_read(
    State(state): State<AppStateHolder>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
) -> ApiResult<Json<OkResponse>> {
    let user = require_session(&state, &headers)?;
    state.store.mark_read(user.workspace_id, conversation_id).await?;
    Ok(Json(OkResponse { ok: true }))
}

async fn send_message(
    State(state): State<AppStateHolder>,
    headers: HeaderMap,
    body: Result<Json<SendMessageRequest>, JsonRejection>,
) -> ApiResult<Json<SendMessageResponse>> {
    let user = require_session(&state, &headers)?;
    let body = parse_json(body)?;

    let text = body.body.trim();
    if body.to_phone.trim().is_empty() || text.is_empty() {
        return Err(ApiError::bad_request("Missing fields"));
    }
    let Some(to_phone) = phone::normalize(&body.to_phone) else {
        return Err(ApiError::bad_request("Invalid phone"));
    };
    if text.chars().count() > MAX_MESSAGE_LENGTH {
        return Err(ApiError::bad_request("Message too long"));
    }

    let workspace_id = user.workspace_id;
    let (conversation, _) = state
        .store
        .ensure_conversation(&workspace_id, &to_phone)
        .await?;
    let message = state
        .store
        .insert_message(
            &workspace_id,
            &conversation.id,
            Direction::Out,
            SIMULATED_PHONE,
            &to_phone,
            text,
        )
        .await?;
    let conversation = state
        .store
        .touch_conversation(&workspace_id, &conversation.id, message.created_at, false)
        .await?;

    state
        .hubs
        .broadcast(
            &workspace_id,
            &RealtimeEvent::MessageNew {
                conversation_id: conversation.id.clone(),
                conversation: conversation.clone(),
                message: message.clone(),
            },
        )
        .await;

    Ok(Json(SendMessageResponse {
        conversation,
        message,
    }))
}

/// Test-only injection of an inbound message, standing in for a carrier
/// webhook. Disabled unless the server runs in dev mode.
async fn dev_inbound(
    State(state): State<AppStateHolder>,
    headers: HeaderMap,
    body: Result<Json<DevInboundRequest>, JsonRejection>,
) -> ApiResult<Json<SendMessageResponse>> {
    let user = require_session(&state, &headers)?;
    if !state.config.dev_mode {
        return Err(ApiError::new(StatusCode::FORBIDDEN, "Dev endpoint disabled"));
    }
    let body = parse_json(body)?;

    let text = body.body.trim();
    if body.from_phone.trim().is_empty() || text.is_empty() {
        return Err(ApiError::bad_request("Missing fields"));
    }
    let Some(from_phone) = phone::normalize(&body.from_phone) else {
        return Err(ApiError::bad_request("Invalid phone"));
    };
    if text.chars().count() > MAX_MESSAGE_LENGTH {
        return Err(ApiError::bad_request("Message too long"));
    }

    let workspace_id = user.workspace_id;
    let (conversation, _) = state
        .store
        .ensure_conversation(&workspace_id, &from_phone)
        .await?;
    let message = state
        .store
        .insert_message(
            &workspace_id,
            &conversation.id,
            Direction::In,
            &from_phone,
            SIMULATED_PHONE,
            text,
        )
        .await?;
    let conversation = state
        .store
        .touch_conversation(&workspace_id, &conversation.id, message.created_at, true)
        .await?;

    state
        .hubs
        .broadcast(
            &workspace_id,
            &RealtimeEvent::MessageNew {
                conversation_id: conversation.id.clone(),
                conversation: conversation.clone(),
                message: message.clone(),
            },
        )
        .await;

    Ok(Json(SendMessageResponse {
        conversation,
        message,
    }))
}

async fn list_contacts(
    State(state): State<AppStateHolder>,
    headers: HeaderMap,
) -> ApiResult<Json<ContactsResponse>> {
    let user = require_session(&state, &headers)?;
    let contacts = state.store.list_contacts(user.workspace_id).await?;
    Ok(Json(ContactsResponse { contacts }))
}

fn validate_contact_body(body: &ContactBody) -> ApiResult<(String, String)> {
    let name = body.name.trim();
    if name.is_empty() || body.phone.trim().is_empty() {
        return Err(ApiError::bad_request("Missing fields"));
    }
    if name.chars().count() > MAX_NAME_LENGTH {
        return Err(ApiError::bad_request("Name too long"));
    }
    let Some(phone) = phone::normalize(&body.phone) else {
        return Err(ApiError::bad_request("Invalid phone"));
    };
    Ok((name.to_owned(), phone))
}

async fn create_contact(
    State(state): State<AppStateHolder>,
    headers: HeaderMap,
    body: Result<Json<ContactBody>, JsonRejection>,
) -> ApiResult<Json<ContactResponse>> {
    let user = require_session(&state, &headers)?;
    let body = parse_json(body)?;
    let (name, phone) = validate_contact_body(&body)?;

    let workspace_id = user.workspace_id;
    let contact = state.store.create_contact(&workspace_id, name, phone).await?;

    broadcast_contact_change(&state, &workspace_id, &contact, None).await?;
    Ok(Json(ContactResponse { contact }))
}

async fn update_contact(
    State(state): State<AppStateHolder>,
    headers: HeaderMap,
    Path(contact_id): Path<String>,
    body: Result<Json<ContactBody>, JsonRejection>,
) -> ApiResult<Json<ContactResponse>> {
    let user = require_session(&state, &headers)?;
    let body = parse_json(body)?;
    let (name, phone) = validate_contact_body(&body)?;

    let workspace_id = user.workspace_id;
    let contact = state
        .store
        .update_contact(&workspace_id, contact_id, name, phone)
        .await?;

    broadcast_contact_change(&state, &workspace_id, &contact, None).await?;
    Ok(Json(ContactResponse { contact }))
}

/// Relink the conversation matching the contact's phone, then announce both
/// the conversation refresh and the contact change.
async fn broadcast_contact_change(
    state: &AppStateHolder,
    workspace_id: &str,
    contact: &courier_api::Contact,
    deleted: Option<bool>,
) -> ApiResult<()> {
    if deleted.is_none()
        && let Some(conversation) = state
            .store
            .link_conversation_by_phone(workspace_id, contact)
            .await?
    {
        state
            .hubs
            .broadcast(workspace_id, &RealtimeEvent::ConversationUpdate { conversation })
            .await;
    }

    state
        .hubs
        .broadcast(
            workspace_id,
            &RealtimeEvent::ContactUpdate {
                contact: contact.clone(),
                deleted,
            },
        )
        .await;
    Ok(())
}

async fn delete_contact(
    State(state): State<AppStateHolder>,
    headers: HeaderMap,
    Path(contact_id): Path<String>,
) -> ApiResult<Json<OkResponse>> {
    let user = require_session(&state, &headers)?;

    // Idempotent: an unknown or already-deleted id still reports success,
    // it just has nothing to detach or announce.
    let workspace_id = user.workspace_id;
    if let Some(contact) = state.store.delete_contact(&workspace_id, contact_id).await? {
        broadcast_contact_change(&state, &workspace_id, &contact, Some(true)).await?;
    }
    Ok(Json(OkResponse { ok: true }))
}

async fn ws_events(
    State(state): State<AppStateHolder>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> ApiResult<Response> {
    let Some(user) = state.session.session_from_headers(&headers, now_ms()) else {
        // Returned before the upgrade so the handshake itself fails.
        return Err(ApiError::unauthorized());
    };

    let Ok(ws) = ws else {
        return Err(ApiError::bad_request("Expected websocket upgrade"));
    };

    let hub = state.hubs.workspace(&user.workspace_id).await;
    Ok(ws.on_upgrade(move |socket| ws_connection(socket, hub)))
}

async fn ws_connection(mut socket: WebSocket, hub: Arc<crate::hub::Hub>) {
    let (id, mut rx) = hub.connect().await;

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) if text.as_str() == "ping" => {
                        if socket.send(WsMessage::Text(Utf8Bytes::from_static("pong"))).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(_)) | None => break,
                }
            }
            outgoing = rx.recv() => {
                match outgoing {
                    Some(payload) => {
                        if socket.send(WsMessage::Text(payload.as_ref().into())).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        // The hub dropped us as a slow consumer.
                        let _ = socket
                            .send(WsMessage::Close(Some(CloseFrame {
                                code: 1011,
                                reason: Utf8Bytes::from_static("broadcast overflow"),
                            })))
                            .await;
                        break;
                    }
                }
            }
        }
    }

    hub.disconnect(id).await;
}
