use std::net::SocketAddr;
use std::time::Duration;

async fn start_test_server(dev_mode: bool) -> (courier_server::StartedServer, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let config = courier_server::ServerConfig {
        db_path: dir.path().join("courier.db"),
        workspace_code: "acme".to_owned(),
        shared_pin: "1234".to_owned(),
        session_secret: "integration-test-secret".to_owned(),
        dev_mode,
    };

    let addr: SocketAddr = "127.0.0.1:0".parse().expect("parse addr");
    let server = courier_server::start_server_with_config(addr, config)
        .await
        .expect("start server");
    (server, dir)
}

fn new_client() -> reqwest::Client {
    reqwest::Client::builder()
        .cookie_store(true)
        .timeout(Duration::from_secs(10))
        .build()
        .expect("reqwest client")
}

async fn login(client: &reqwest::Client, base: &str, display_name: &str) -> courier_api::User {
    let res = client
        .post(format!("{base}/api/login"))
        .json(&serde_json::json!({
            "workspaceCode": "acme",
            "pin": "1234",
            "displayName": display_name,
        }))
        .send()
        .await
        .expect("POST /api/login");
    assert_eq!(res.status(), reqwest::StatusCode::OK);
    let body: courier_api::LoginResponse = res.json().await.expect("login json");
    body.user
}

async fn error_message(res: reqwest::Response) -> String {
    let body: courier_api::ErrorResponse = res.json().await.expect("error json");
    body.error
}

#[tokio::test]
async fn health_login_me_logout_cycle() {
    let (server, _dir) = start_test_server(false).await;
    let base = format!("http://{}", server.addr);
    let client = new_client();

    let res = client
        .get(format!("{base}/api/health"))
        .send()
        .await
        .expect("GET /api/health");
    assert!(res.status().is_success());
    assert_eq!(res.text().await.expect("health body"), "ok");

    // No session yet.
    let res = client
        .get(format!("{base}/api/me"))
        .send()
        .await
        .expect("GET /api/me");
    assert_eq!(res.status(), reqwest::StatusCode::UNAUTHORIZED);

    // Wrong credentials.
    let res = client
        .post(format!("{base}/api/login"))
        .json(&serde_json::json!({
            "workspaceCode": "acme",
            "pin": "9999",
            "displayName": "Ada",
        }))
        .send()
        .await
        .expect("POST /api/login (bad pin)");
    assert_eq!(res.status(), reqwest::StatusCode::UNAUTHORIZED);
    assert_eq!(error_message(res).await, "Invalid workspace code or PIN");

    let user = login(&client, &base, "Ada").await;
    assert_eq!(user.workspace_id, "acme");
    assert_eq!(user.display_name, "Ada");

    let res = client
        .get(format!("{base}/api/me"))
        .send()
        .await
        .expect("GET /api/me (logged in)");
    assert_eq!(res.status(), reqwest::StatusCode::OK);
    let me: courier_api::MeResponse = res.json().await.expect("me json");
    assert_eq!(me.user.id, user.id);
    assert_eq!(me.user.display_name, "Ada");

    // Logging in twice with the same name reuses the user row.
    let again = login(&client, &base, "Ada").await;
    assert_eq!(again.id, user.id);

    let res = client
        .post(format!("{base}/api/logout"))
        .send()
        .await
        .expect("POST /api/logout");
    assert_eq!(res.status(), reqwest::StatusCode::OK);

    let res = client
        .get(format!("{base}/api/me"))
        .send()
        .await
        .expect("GET /api/me (after logout)");
    assert_eq!(res.status(), reqwest::StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn login_validation_errors() {
    let (server, _dir) = start_test_server(false).await;
    let base = format!("http://{}", server.addr);
    let client = new_client();

    let res = client
        .post(format!("{base}/api/login"))
        .json(&serde_json::json!({ "workspaceCode": "acme", "pin": "1234" }))
        .send()
        .await
        .expect("POST /api/login (missing name)");
    assert_eq!(res.status(), reqwest::StatusCode::BAD_REQUEST);
    assert_eq!(error_message(res).await, "Missing fields");

    let res = client
        .post(format!("{base}/api/login"))
        .json(&serde_json::json!({
            "workspaceCode": "acme",
            "pin": "1234",
            "displayName": "x".repeat(81),
        }))
        .send()
        .await
        .expect("POST /api/login (long name)");
    assert_eq!(res.status(), reqwest::StatusCode::BAD_REQUEST);
    assert_eq!(error_message(res).await, "Display name too long");

    let res = client
        .post(format!("{base}/api/login"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .expect("POST /api/login (bad json)");
    assert_eq!(res.status(), reqwest::StatusCode::BAD_REQUEST);
    assert_eq!(error_message(res).await, "Invalid JSON");
}

#[tokio::test]
async fn authenticated_endpoints_reject_missing_session() {
    let (server, _dir) = start_test_server(false).await;
    let base = format!("http://{}", server.addr);
    let client = new_client();

    for (method, path) in [
        ("GET", "/api/conversations"),
        ("GET", "/api/conversations/conv-1/messages"),
        ("POST", "/api/conversations/conv-1/read"),
        ("POST", "/api/messages/send"),
        ("GET", "/api/contacts"),
        ("POST", "/api/contacts"),
        // Session is checked before the dev-mode gate and the upgrade check.
        ("POST", "/api/dev/inbound"),
        ("GET", "/api/ws"),
    ] {
        let req = match method {
            "GET" => client.get(format!("{base}{path}")),
            _ => client.post(format!("{base}{path}")).json(&serde_json::json!({})),
        };
        let res = req.send().await.expect("request without session");
        assert_eq!(
            res.status(),
            reqwest::StatusCode::UNAUTHORIZED,
            "{method} {path} should require a session"
        );
    }
}

#[tokio::test]
async fn send_message_creates_and_reuses_conversation() {
    let (server, _dir) = start_test_server(false).await;
    let base = format!("http://{}", server.addr);
    let client = new_client();
    login(&client, &base, "Ada").await;

    // Two spellings of the same number land in one conversation.
    let res = client
        .post(format!("{base}/api/messages/send"))
        .json(&serde_json::json!({ "toPhone": "(555) 123-4567", "body": "hello" }))
        .send()
        .await
        .expect("POST /api/messages/send");
    assert_eq!(res.status(), reqwest::StatusCode::OK);
    let first: courier_api::SendMessageResponse = res.json().await.expect("send json");
    assert_eq!(first.conversation.phone, "+15551234567");
    assert_eq!(first.message.direction, courier_api::Direction::Out);
    assert_eq!(first.message.status, "sent");
    assert_eq!(first.message.from_phone, "+1SIMULATED");

    let res = client
        .post(format!("{base}/api/messages/send"))
        .json(&serde_json::json!({ "toPhone": "+1 555 123 4567", "body": "again" }))
        .send()
        .await
        .expect("POST /api/messages/send (same phone)");
    let second: courier_api::SendMessageResponse = res.json().await.expect("send json");
    assert_eq!(second.conversation.id, first.conversation.id);

    let res = client
        .get(format!("{base}/api/conversations"))
        .send()
        .await
        .expect("GET /api/conversations");
    let list: courier_api::ConversationsResponse = res.json().await.expect("conversations json");
    assert_eq!(list.conversations.len(), 1);
    assert_eq!(list.conversations[0].last_message_body.as_deref(), Some("again"));
    assert_eq!(
        list.conversations[0].last_message_direction,
        Some(courier_api::Direction::Out)
    );
    assert_eq!(list.conversations[0].unread_count, 0);

    // Validation.
    let res = client
        .post(format!("{base}/api/messages/send"))
        .json(&serde_json::json!({ "toPhone": "12", "body": "hi" }))
        .send()
        .await
        .expect("POST /api/messages/send (bad phone)");
    assert_eq!(res.status(), reqwest::StatusCode::BAD_REQUEST);
    assert_eq!(error_message(res).await, "Invalid phone");

    let res = client
        .post(format!("{base}/api/messages/send"))
        .json(&serde_json::json!({ "toPhone": "+15551234567", "body": "x".repeat(2001) }))
        .send()
        .await
        .expect("POST /api/messages/send (long body)");
    assert_eq!(res.status(), reqwest::StatusCode::BAD_REQUEST);
    assert_eq!(error_message(res).await, "Message too long");

    let res = client
        .post(format!("{base}/api/messages/send"))
        .json(&serde_json::json!({ "toPhone": "+15551234567" }))
        .send()
        .await
        .expect("POST /api/messages/send (no body)");
    assert_eq!(res.status(), reqwest::StatusCode::BAD_REQUEST);
    assert_eq!(error_message(res).await, "Missing fields");
}

#[tokio::test]
async fn messages_paginate_oldest_to_newest() {
    let (server, _dir) = start_test_server(false).await;
    let base = format!("http://{}", server.addr);
    let client = new_client();
    login(&client, &base, "Ada").await;

    let mut conversation_id = String::new();
    for body in ["one", "two", "three"] {
        let res = client
            .post(format!("{base}/api/messages/send"))
            .json(&serde_json::json!({ "toPhone": "+15551234567", "body": body }))
            .send()
            .await
            .expect("POST /api/messages/send");
        let sent: courier_api::SendMessageResponse = res.json().await.expect("send json");
        conversation_id = sent.conversation.id;
    }

    let res = client
        .get(format!(
            "{base}/api/conversations/{conversation_id}/messages?limit=2"
        ))
        .send()
        .await
        .expect("GET messages (limit=2)");
    let page: courier_api::MessagesResponse = res.json().await.expect("messages json");
    assert_eq!(
        page.messages.iter().map(|m| m.body.as_str()).collect::<Vec<_>>(),
        vec!["two", "three"]
    );

    let before = page.messages[0].created_at;
    let res = client
        .get(format!(
            "{base}/api/conversations/{conversation_id}/messages?limit=2&before={before}"
        ))
        .send()
        .await
        .expect("GET messages (before)");
    let earlier: courier_api::MessagesResponse = res.json().await.expect("messages json");
    assert_eq!(
        earlier.messages.iter().map(|m| m.body.as_str()).collect::<Vec<_>>(),
        vec!["one"]
    );

    // Unparsable query values fall back to the defaults.
    let res = client
        .get(format!(
            "{base}/api/conversations/{conversation_id}/messages?limit=lots&before=yesterday"
        ))
        .send()
        .await
        .expect("GET messages (garbage query)");
    assert_eq!(res.status(), reqwest::StatusCode::OK);
    let all: courier_api::MessagesResponse = res.json().await.expect("messages json");
    assert_eq!(all.messages.len(), 3);
}

#[tokio::test]
async fn dev_inbound_counts_unread_until_marked_read() {
    let (server, _dir) = start_test_server(true).await;
    let base = format!("http://{}", server.addr);
    let client = new_client();
    login(&client, &base, "Ada").await;

    let mut conversation_id = String::new();
    for body in ["hey", "you there?"] {
        let res = client
            .post(format!("{base}/api/dev/inbound"))
            .json(&serde_json::json!({ "fromPhone": "+15551234567", "body": body }))
            .send()
            .await
            .expect("POST /api/dev/inbound");
        assert_eq!(res.status(), reqwest::StatusCode::OK);
        let injected: courier_api::SendMessageResponse = res.json().await.expect("inbound json");
        assert_eq!(injected.message.direction, courier_api::Direction::In);
        assert_eq!(injected.message.to_phone, "+1SIMULATED");
        conversation_id = injected.conversation.id;
    }

    let res = client
        .get(format!("{base}/api/conversations"))
        .send()
        .await
        .expect("GET /api/conversations");
    let list: courier_api::ConversationsResponse = res.json().await.expect("conversations json");
    assert_eq!(list.conversations[0].unread_count, 2);

    let res = client
        .post(format!("{base}/api/conversations/{conversation_id}/read"))
        .send()
        .await
        .expect("POST read");
    assert_eq!(res.status(), reqwest::StatusCode::OK);
    let ok: courier_api::OkResponse = res.json().await.expect("read json");
    assert!(ok.ok);

    let res = client
        .get(format!("{base}/api/conversations"))
        .send()
        .await
        .expect("GET /api/conversations (after read)");
    let list: courier_api::ConversationsResponse = res.json().await.expect("conversations json");
    assert_eq!(list.conversations[0].unread_count, 0);
}

#[tokio::test]
async fn dev_inbound_is_disabled_outside_dev_mode() {
    let (server, _dir) = start_test_server(false).await;
    let base = format!("http://{}", server.addr);
    let client = new_client();
    login(&client, &base, "Ada").await;

    let res = client
        .post(format!("{base}/api/dev/inbound"))
        .json(&serde_json::json!({ "fromPhone": "+15551234567", "body": "hey" }))
        .send()
        .await
        .expect("POST /api/dev/inbound");
    assert_eq!(res.status(), reqwest::StatusCode::FORBIDDEN);
    assert_eq!(error_message(res).await, "Dev endpoint disabled");
}

#[tokio::test]
async fn contacts_crud_with_conflicts_and_detach() {
    let (server, _dir) = start_test_server(false).await;
    let base = format!("http://{}", server.addr);
    let client = new_client();
    login(&client, &base, "Ada").await;

    // Start a conversation before the contact exists.
    let res = client
        .post(format!("{base}/api/messages/send"))
        .json(&serde_json::json!({ "toPhone": "+15551234567", "body": "hello" }))
        .send()
        .await
        .expect("POST /api/messages/send");
    let sent: courier_api::SendMessageResponse = res.json().await.expect("send json");
    assert!(sent.conversation.contact_name.is_none());

    let res = client
        .post(format!("{base}/api/contacts"))
        .json(&serde_json::json!({ "name": "Grace", "phone": "555-123-4567" }))
        .send()
        .await
        .expect("POST /api/contacts");
    assert_eq!(res.status(), reqwest::StatusCode::OK);
    let created: courier_api::ContactResponse = res.json().await.expect("contact json");
    assert_eq!(created.contact.phone, "+15551234567");

    // The existing conversation picks up the contact name.
    let res = client
        .get(format!("{base}/api/conversations"))
        .send()
        .await
        .expect("GET /api/conversations");
    let list: courier_api::ConversationsResponse = res.json().await.expect("conversations json");
    assert_eq!(list.conversations[0].contact_name.as_deref(), Some("Grace"));

    // Duplicate phone in the same workspace.
    let res = client
        .post(format!("{base}/api/contacts"))
        .json(&serde_json::json!({ "name": "Other", "phone": "+15551234567" }))
        .send()
        .await
        .expect("POST /api/contacts (duplicate)");
    assert_eq!(res.status(), reqwest::StatusCode::CONFLICT);
    assert_eq!(
        error_message(res).await,
        "A contact with that phone already exists"
    );

    let res = client
        .put(format!("{base}/api/contacts/{}", created.contact.id))
        .json(&serde_json::json!({ "name": "Grace Hopper", "phone": "+15551234567" }))
        .send()
        .await
        .expect("PUT /api/contacts/{id}");
    assert_eq!(res.status(), reqwest::StatusCode::OK);
    let updated: courier_api::ContactResponse = res.json().await.expect("contact json");
    assert_eq!(updated.contact.name, "Grace Hopper");

    let res = client
        .put(format!("{base}/api/contacts/no-such-id"))
        .json(&serde_json::json!({ "name": "Ghost", "phone": "+15550000000" }))
        .send()
        .await
        .expect("PUT /api/contacts (unknown)");
    assert_eq!(res.status(), reqwest::StatusCode::NOT_FOUND);
    assert_eq!(error_message(res).await, "Contact not found");

    let res = client
        .delete(format!("{base}/api/contacts/{}", created.contact.id))
        .send()
        .await
        .expect("DELETE /api/contacts/{id}");
    assert_eq!(res.status(), reqwest::StatusCode::OK);

    // Conversation survives, detached from the deleted contact.
    let res = client
        .get(format!("{base}/api/conversations"))
        .send()
        .await
        .expect("GET /api/conversations (after delete)");
    let list: courier_api::ConversationsResponse = res.json().await.expect("conversations json");
    assert_eq!(list.conversations.len(), 1);
    assert!(list.conversations[0].contact_id.is_none());
    assert!(list.conversations[0].contact_name.is_none());

    // Deleting again is a no-op, not an error.
    let res = client
        .delete(format!("{base}/api/contacts/{}", created.contact.id))
        .send()
        .await
        .expect("DELETE /api/contacts/{id} (again)");
    assert_eq!(res.status(), reqwest::StatusCode::OK);
    let ok: courier_api::OkResponse = res.json().await.expect("delete json");
    assert!(ok.ok);

    let res = client
        .get(format!("{base}/api/contacts"))
        .send()
        .await
        .expect("GET /api/contacts");
    let contacts: courier_api::ContactsResponse = res.json().await.expect("contacts json");
    assert!(contacts.contacts.is_empty());
}

#[tokio::test]
async fn unmatched_api_requests_get_the_json_error_envelope() {
    let (server, _dir) = start_test_server(false).await;
    let base = format!("http://{}", server.addr);
    let client = new_client();

    let res = client
        .get(format!("{base}/api/no-such-route"))
        .send()
        .await
        .expect("GET /api/no-such-route");
    assert_eq!(res.status(), reqwest::StatusCode::NOT_FOUND);
    assert_eq!(error_message(res).await, "Not found");

    // Wrong method on a known path gets the same envelope.
    let res = client
        .delete(format!("{base}/api/health"))
        .send()
        .await
        .expect("DELETE /api/health");
    assert!(res.status().is_client_error());
    assert_eq!(error_message(res).await, "Not found");
}

#[tokio::test]
async fn plain_get_on_ws_route_needs_session_then_upgrade() {
    let (server, _dir) = start_test_server(false).await;
    let base = format!("http://{}", server.addr);
    let client = new_client();

    // Without a session the route is indistinguishable from the rest.
    let res = client
        .get(format!("{base}/api/ws"))
        .send()
        .await
        .expect("GET /api/ws (no session)");
    assert_eq!(res.status(), reqwest::StatusCode::UNAUTHORIZED);

    login(&client, &base, "Ada").await;

    let res = client
        .get(format!("{base}/api/ws"))
        .send()
        .await
        .expect("GET /api/ws (no upgrade)");
    assert_eq!(res.status(), reqwest::StatusCode::BAD_REQUEST);
    assert_eq!(error_message(res).await, "Expected websocket upgrade");
}

#[tokio::test]
async fn cross_origin_writes_are_rejected() {
    let (server, _dir) = start_test_server(false).await;
    let base = format!("http://{}", server.addr);
    let client = new_client();

    let res = client
        .post(format!("{base}/api/login"))
        .header("origin", "http://evil.example")
        .json(&serde_json::json!({
            "workspaceCode": "acme",
            "pin": "1234",
            "displayName": "Ada",
        }))
        .send()
        .await
        .expect("POST /api/login (cross origin)");
    assert_eq!(res.status(), reqwest::StatusCode::FORBIDDEN);
    assert_eq!(error_message(res).await, "Invalid origin");

    // Same-origin requests pass.
    let res = client
        .post(format!("{base}/api/login"))
        .header("origin", format!("http://{}", server.addr))
        .json(&serde_json::json!({
            "workspaceCode": "acme",
            "pin": "1234",
            "displayName": "Ada",
        }))
        .send()
        .await
        .expect("POST /api/login (same origin)");
    assert_eq!(res.status(), reqwest::StatusCode::OK);

    // GETs are exempt from the origin check.
    let res = client
        .get(format!("{base}/api/health"))
        .header("origin", "http://evil.example")
        .send()
        .await
        .expect("GET /api/health (cross origin)");
    assert!(res.status().is_success());
}
