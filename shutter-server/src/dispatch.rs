use log::warn;
use serde_json::{json, Value};
use shutter_core::{
    actions, ClientHandle, DissolveReason, InstanceSnapshot, InviteeSlot, NewInstanceRequest,
    OutboundMessage, PrimaryKey, UserData,
};
use validator::Validate;

use crate::{
    errors::{ServerError, ServerResult},
    protocol::{first_validation_error, ClientMessage, CreateInstancePayload, KeyPayload, RawEnvelope},
    ServerContext,
};

/// Name carried by error envelopes when the frame never named an action
const GENERIC_ACTION: &str = "GENERIC";

/// What a connection has presented so far. Credentials live here, on the
/// reader side of the socket, never on the shared handle.
#[derive(Debug, Default)]
pub struct ConnState {
    credential: Option<String>,
    device_uuid: Option<String>,
    system: bool,
}

impl ConnState {
    fn user_credentials(&self) -> ServerResult<(&str, &str)> {
        let token = self.credential.as_deref().ok_or(ServerError::Unauthorized)?;
        let device_uuid = self.device_uuid.as_deref().ok_or(ServerError::Unauthorized)?;

        Ok((token, device_uuid))
    }

    fn system_credential(&self) -> ServerResult<&str> {
        if !self.system {
            return Err(ServerError::Unauthorized);
        }

        self.credential.as_deref().ok_or(ServerError::Unauthorized)
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Handles one inbound frame. Every failure is converted here, into an
/// error envelope named after the action that caused it.
pub async fn handle_frame(
    context: &ServerContext,
    state: &mut ConnState,
    handle: &ClientHandle,
    text: &str,
) {
    match dispatch(context, state, handle, text).await {
        Ok(Some(reply)) => handle.send(reply),
        Ok(None) => {}
        Err(err) => {
            let action = named_action(text);

            handle.send(OutboundMessage::error(
                err.code().as_u16(),
                &err.to_string(),
                &action,
            ));
        }
    }
}

/// Runs the teardown a closed connection leaves behind: the instance it
/// was in dissolves, then its session or peer binding is dropped.
pub async fn disconnected(context: &ServerContext, state: &ConnState, handle: &ClientHandle) {
    if state.system {
        context.shutter.system.unbind(handle.id());
        return;
    }

    let Some(binding) = context.shutter.sessions.binding(handle.id()) else {
        return;
    };

    if let Err(err) = teardown_departure(context, &binding.user).await {
        warn!(
            "Could not tear down the instance {} was in: {err}",
            binding.user.username
        );
    }

    if let Err(err) = context.shutter.sessions.logout(handle.id()).await {
        warn!(
            "Could not close the session of {}: {err}",
            binding.user.username
        );
    }
}

async fn dispatch(
    context: &ServerContext,
    state: &mut ConnState,
    handle: &ClientHandle,
    text: &str,
) -> ServerResult<Option<OutboundMessage>> {
    let envelope = serde_json::from_str::<RawEnvelope>(text)
        .map_err(|_| ServerError::Malformed("Message is not valid JSON".to_string()))?;

    let action = envelope
        .action
        .ok_or_else(|| ServerError::Malformed("No action provided".to_string()))?;

    if !actions::ALL.contains(&action.as_str()) {
        return Err(ServerError::UnknownAction);
    }

    let message = serde_json::from_str::<ClientMessage>(text)
        .map_err(|err| ServerError::Malformed(err.to_string()))?;

    match message {
        ClientMessage::Login { token, device_uuid } => {
            login(context, state, handle, token, device_uuid).await.map(Some)
        }
        ClientMessage::LoginSystem { token } => {
            login_system(context, state, handle, token).await.map(Some)
        }
        ClientMessage::Logout => logout(context, state, handle).await.map(Some),
        ClientMessage::GetConnectedUsers => connected_users(context).map(Some),
        ClientMessage::CreateSnapInstance { data } => {
            create_instance(context, state, handle, data).await.map(|_| None)
        }
        ClientMessage::JoinSnapInstance { data } => {
            join_instance(context, state, handle, data).await.map(|_| None)
        }
        ClientMessage::LeaveSnapInstance => {
            leave_instance(context, state, handle).await.map(|_| None)
        }
        ClientMessage::DeleteSnapInstance { data } => {
            delete_instance(context, state, handle, data).await.map(|_| None)
        }
        ClientMessage::SendSnap { data } => send_snap(context, state, data).await.map(Some),
        ClientMessage::ErrorSnap { data } => error_snap(context, state, data).await.map(|_| None),
        ClientMessage::PublishSnap { data } => {
            publish_snap(context, state, data).await.map(|_| None)
        }
    }
}

async fn login(
    context: &ServerContext,
    state: &mut ConnState,
    handle: &ClientHandle,
    token: String,
    device_uuid: String,
) -> ServerResult<OutboundMessage> {
    if context.shutter.sessions.is_logged(&token, &device_uuid).await {
        return Err(ServerError::Conflict("User already logged".to_string()));
    }

    // A connection without a binding is a fresh start, which sweeps any
    // session rows a crash left behind for this seat
    let prior = context
        .shutter
        .sessions
        .binding(handle.id())
        .map(|binding| binding.session_id);

    let binding = context
        .shutter
        .sessions
        .login(&token, &device_uuid, prior.as_deref(), handle.clone())
        .await?;

    state.credential = Some(token);
    state.device_uuid = Some(device_uuid);

    Ok(OutboundMessage::ok(
        "User logged",
        actions::LOGIN,
        json!({ "sessionId": binding.session_id }),
    ))
}

async fn login_system(
    context: &ServerContext,
    state: &mut ConnState,
    handle: &ClientHandle,
    token: String,
) -> ServerResult<OutboundMessage> {
    context.shutter.system.login_system(&token, handle.clone()).await?;

    state.credential = Some(token);
    state.system = true;

    Ok(OutboundMessage::ok("System logged", actions::LOGIN_SYSTEM, Value::Null))
}

async fn logout(
    context: &ServerContext,
    state: &mut ConnState,
    handle: &ClientHandle,
) -> ServerResult<OutboundMessage> {
    let user = require_user(context, state, handle).await?;

    // Unlike a dropped connection, a logging-out one is still listening,
    // so it receives the eviction for its own instance too
    if let Some(eviction) = teardown_departure(context, &user).await? {
        handle.send(eviction);
    }

    context.shutter.sessions.logout(handle.id()).await?;
    state.clear();

    Ok(OutboundMessage::ok("User logged out", actions::LOGOUT, Value::Null))
}

fn connected_users(context: &ServerContext) -> ServerResult<OutboundMessage> {
    let users = context.shutter.sessions.connected();
    let data = serde_json::to_value(users).map_err(|_| ServerError::Internal)?;

    Ok(OutboundMessage::ok(
        "Connected users found",
        actions::GET_CONNECTED_USERS,
        data,
    ))
}

async fn create_instance(
    context: &ServerContext,
    state: &ConnState,
    handle: &ClientHandle,
    payload: CreateInstancePayload,
) -> ServerResult<()> {
    let user = require_user(context, state, handle).await?;
    validated(&payload)?;

    let invitees = payload
        .users
        .into_iter()
        .map(|invitee| InviteeSlot {
            user_id: invitee.id,
            position: invitee.position,
        })
        .collect();

    let request = NewInstanceRequest {
        shape_id: payload.shape_id,
        invitees,
    };

    let created = context.shutter.instances.create(&user, request, handle.clone()).await?;

    announce(context, &created.key, &created.snapshot, actions::CREATE_SNAP_INSTANCE)
}

async fn join_instance(
    context: &ServerContext,
    state: &ConnState,
    handle: &ClientHandle,
    payload: KeyPayload,
) -> ServerResult<()> {
    let user = require_user(context, state, handle).await?;
    validated(&payload)?;

    let outcome = context
        .shutter
        .instances
        .join(&payload.key, &user, handle.clone())
        .await?;

    announce(context, &payload.key, &outcome.snapshot, actions::JOIN_SNAP_INSTANCE)
}

async fn leave_instance(
    context: &ServerContext,
    state: &ConnState,
    handle: &ClientHandle,
) -> ServerResult<()> {
    let user = require_user(context, state, handle).await?;

    let dissolved = context.shutter.instances.leave(&user).await?;
    let message = eviction("User Left", actions::LEAVE_SNAP_INSTANCE, &dissolved.key);

    // The leaver was still attached when the instance dissolved, so the
    // eviction reaches them as well
    for (_, peer) in dissolved.evicted {
        peer.send(message.clone());
    }

    Ok(())
}

async fn delete_instance(
    context: &ServerContext,
    state: &ConnState,
    handle: &ClientHandle,
    payload: KeyPayload,
) -> ServerResult<()> {
    let user = require_user(context, state, handle).await?;
    validated(&payload)?;

    let dissolved = context
        .shutter
        .instances
        .delete_by_owner(&payload.key, &user)
        .await?;

    let message = eviction(
        dissolved.reason.describe(),
        actions::DELETE_SNAP_INSTANCE,
        &dissolved.key,
    );

    for (_, peer) in dissolved.evicted {
        peer.send(message.clone());
    }

    Ok(())
}

async fn send_snap(
    context: &ServerContext,
    state: &ConnState,
    payload: KeyPayload,
) -> ServerResult<OutboundMessage> {
    require_system(context, state)?;
    validated(&payload)?;

    let snapshot = context.shutter.instances.snapshot(&payload.key, true).await?;
    let data = serde_json::to_value(&snapshot).map_err(|_| ServerError::Internal)?;

    for (_, peer) in context.shutter.instances.participants(&payload.key) {
        peer.send(OutboundMessage::broadcast(
            "Snap received",
            actions::SEND_SNAP,
            data.clone(),
        ));
    }

    Ok(OutboundMessage::ok("Snap sent", actions::SEND_SNAP, Value::Null))
}

async fn error_snap(
    context: &ServerContext,
    state: &ConnState,
    payload: KeyPayload,
) -> ServerResult<()> {
    require_system(context, state)?;
    validated(&payload)?;

    dissolve_for_system(
        context,
        &payload.key,
        DissolveReason::CaptureFailed,
        "SnapSync deleted",
        actions::ERROR_SNAP,
    )
    .await
}

async fn publish_snap(
    context: &ServerContext,
    state: &ConnState,
    payload: KeyPayload,
) -> ServerResult<()> {
    require_system(context, state)?;
    validated(&payload)?;

    dissolve_for_system(
        context,
        &payload.key,
        DissolveReason::Published,
        "SnapSync published",
        actions::PUBLISH_SNAP,
    )
    .await
}

/// Gate for session-scoped actions. Resolves the user the connection is
/// bound to, refusing connections that never logged in or lost their seat.
async fn require_user(
    context: &ServerContext,
    state: &ConnState,
    handle: &ClientHandle,
) -> ServerResult<UserData> {
    let (token, device_uuid) = state.user_credentials()?;

    if !context.shutter.sessions.is_logged(token, device_uuid).await {
        return Err(ServerError::Unauthorized);
    }

    context
        .shutter
        .sessions
        .binding(handle.id())
        .map(|binding| binding.user)
        .ok_or(ServerError::Unauthorized)
}

/// Gate for the capture pipeline's signals
fn require_system(context: &ServerContext, state: &ConnState) -> ServerResult<()> {
    let token = state.system_credential()?;

    if !context.shutter.system.is_logged_system(token) {
        return Err(ServerError::Unauthorized);
    }

    Ok(())
}

fn validated<T: Validate>(payload: &T) -> ServerResult<()> {
    payload
        .validate()
        .map_err(|errors| ServerError::Malformed(first_validation_error(&errors)))
}

/// Pushes the fresh snapshot to everyone attached, each with their own title
fn announce(
    context: &ServerContext,
    key: &str,
    snapshot: &InstanceSnapshot,
    action: &str,
) -> ServerResult<()> {
    for (viewer, peer) in context.shutter.instances.participants(key) {
        peer.send(OutboundMessage::broadcast(
            "User Joined",
            action,
            with_title(snapshot, viewer)?,
        ));
    }

    Ok(())
}

/// Dissolves whatever instance the user is in, evicting everyone else.
/// Returns the eviction envelope so callers can echo it to the user.
async fn teardown_departure(
    context: &ServerContext,
    user: &UserData,
) -> ServerResult<Option<OutboundMessage>> {
    let Some(dissolved) = context.shutter.instances.handle_disconnect(user).await? else {
        return Ok(None);
    };

    let message = OutboundMessage::broadcast(
        &format!(
            "The instance has been deleted because {} has left.",
            user.username
        ),
        actions::DELETE_SNAP_INSTANCE,
        json!({ "key": dissolved.key, "exit": true }),
    );

    for (_, peer) in dissolved.evicted {
        peer.send(message.clone());
    }

    Ok(Some(message))
}

async fn dissolve_for_system(
    context: &ServerContext,
    key: &str,
    reason: DissolveReason,
    message: &str,
    action: &str,
) -> ServerResult<()> {
    let dissolved = context.shutter.instances.dissolve_by_system(key, reason).await?;
    let message = eviction(message, action, &dissolved.key);

    for (_, peer) in dissolved.evicted {
        peer.send(message.clone());
    }

    Ok(())
}

fn eviction(message: &str, action: &str, key: &str) -> OutboundMessage {
    OutboundMessage::broadcast(message, action, json!({ "key": key, "exit": true }))
}

/// Snapshot data merged with the headline one recipient should see
fn with_title(snapshot: &InstanceSnapshot, viewer: PrimaryKey) -> ServerResult<Value> {
    let mut data = serde_json::to_value(snapshot).map_err(|_| ServerError::Internal)?;

    if let Value::Object(map) = &mut data {
        map.insert("title".to_string(), Value::String(snapshot.title_for(viewer)));
    }

    Ok(data)
}

fn named_action(text: &str) -> String {
    serde_json::from_str::<RawEnvelope>(text)
        .ok()
        .and_then(|envelope| envelope.action)
        .unwrap_or_else(|| GENERIC_ACTION.to_string())
}

#[cfg(test)]
mod test {
    use super::*;
    use shutter_core::{SnapshotShape, SnapshotTimer, SnapshotUser};

    fn snapshot() -> InstanceSnapshot {
        InstanceSnapshot {
            id: 1,
            key: "k".repeat(64),
            shape: SnapshotShape {
                id: 7,
                name: "Duo".to_string(),
            },
            users: vec![
                SnapshotUser {
                    id: 1,
                    username: "mika".to_string(),
                    position: "LEFT".to_string(),
                    is_owner: true,
                    is_joined: true,
                    profile_picture_url: None,
                    image_url: None,
                },
                SnapshotUser {
                    id: 2,
                    username: "noa".to_string(),
                    position: "RIGHT".to_string(),
                    is_owner: false,
                    is_joined: false,
                    profile_picture_url: None,
                    image_url: None,
                },
            ],
            timer: SnapshotTimer {
                started: false,
                seconds: 10,
                started_at: None,
            },
        }
    }

    #[test]
    fn titles_are_merged_into_the_snapshot() {
        let snapshot = snapshot();
        let data = with_title(&snapshot, 1).unwrap();

        assert_eq!(data["title"], "Wait for noa to join...");
        assert_eq!(data["key"], snapshot.key.as_str());
        assert_eq!(data["users"].as_array().unwrap().len(), 2);
        assert_eq!(data["shape"]["name"], "Duo");
    }

    #[test]
    fn evictions_carry_the_exit_marker() {
        let message = eviction("User Left", actions::LEAVE_SNAP_INSTANCE, "the-key");

        assert!(message.is_broadcast);
        assert_eq!(message.data["key"], "the-key");
        assert_eq!(message.data["exit"], true);
    }

    #[test]
    fn error_envelopes_fall_back_to_a_generic_action() {
        assert_eq!(named_action(r#"{"action":"LOGIN"}"#), "LOGIN");
        assert_eq!(named_action(r#"{"data":{}}"#), "GENERIC");
        assert_eq!(named_action("not json"), "GENERIC");
    }

    #[test]
    fn blank_connections_hold_no_credentials() {
        let mut state = ConnState::default();

        assert!(matches!(
            state.user_credentials(),
            Err(ServerError::Unauthorized)
        ));
        assert!(matches!(
            state.system_credential(),
            Err(ServerError::Unauthorized)
        ));

        state.credential = Some("token".to_string());
        state.device_uuid = Some("device-1".to_string());

        let (token, device_uuid) = state.user_credentials().unwrap();
        assert_eq!(token, "token");
        assert_eq!(device_uuid, "device-1");

        // A user credential never passes the system gate
        assert!(state.system_credential().is_err());

        state.clear();
        assert!(state.user_credentials().is_err());
    }
}
