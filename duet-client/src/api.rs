//! Account and pairing calls. Each function is a thin wrapper over the
//! gateway; callers read the returned envelope for success and message.

use duet_core::{BindingCode, Envelope};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::gateway::RequestGateway;

/// Logs in and, on success, persists the issued token and profile so later
/// requests (including across restarts) carry credentials.
pub async fn login(gateway: &RequestGateway, phone: &str, password: &str) -> Envelope<Value> {
    let envelope: Envelope<Value> = gateway
        .post("/api/login", &json!({ "phone": phone, "password": password }))
        .await;

    if envelope.success
        && let (Some(token), Some(user)) = (envelope.token.clone(), envelope.user.clone())
    {
        if let Err(err) = gateway.session().set(token, Some(user)) {
            warn!(error = %err, "failed to persist session after login");
        }
        info!("logged in");
    }
    envelope
}

/// Registers a new account. Does not log in; the caller follows up with
/// [`login`] on success.
pub async fn register(
    gateway: &RequestGateway,
    phone: &str,
    password: &str,
    nickname: Option<&str>,
) -> Envelope<Value> {
    let mut body = json!({ "phone": phone, "password": password });
    if let (Some(nickname), Some(map)) = (nickname, body.as_object_mut()) {
        map.insert("nickname".into(), json!(nickname));
    }
    gateway.post("/api/register", &body).await
}

/// Tells the server to drop the session, then clears local credentials.
/// The local clear happens even when the request fails; a stale server-side
/// token expires on its own, but stale local credentials would keep
/// resurrecting the session.
pub async fn logout(gateway: &RequestGateway) -> Envelope<Value> {
    let envelope: Envelope<Value> = gateway.post("/api/logout", &json!({})).await;
    if let Err(err) = gateway.session().clear() {
        warn!(error = %err, "failed to clear session on logout");
    }
    envelope
}

/// Re-fetches the profile and replaces the cached copy wholesale. Partner
/// state (bound, unbound, partner id) only changes through this call.
pub async fn refresh_profile(gateway: &RequestGateway) -> Envelope<Value> {
    let envelope: Envelope<Value> = gateway.get("/api/user/profile", &[]).await;
    if envelope.success
        && let Some(profile) = envelope.user.clone()
        && let Err(err) = gateway.session().update_profile(profile)
    {
        warn!(error = %err, "failed to persist refreshed profile");
    }
    envelope
}

/// Asks the server for a short code the partner enters to pair.
pub async fn generate_binding_code(gateway: &RequestGateway) -> Envelope<BindingCode> {
    gateway.post("/api/bindcode/generate", &json!({})).await
}

/// Pairs this account with the one that issued `code`. Callers refresh the
/// profile afterwards to pick up the new partner state.
pub async fn bind_partner(gateway: &RequestGateway, code: &str) -> Envelope<Value> {
    gateway.post("/api/bind", &json!({ "code": code })).await
}

/// Dissolves the pairing on both sides.
pub async fn unbind_partner(gateway: &RequestGateway) -> Envelope<Value> {
    gateway.post("/api/unbind", &json!({})).await
}
