use serde::Serialize;
use serde_json::Value;

/// Name every message is stamped with, so clients can tell
/// coordinator traffic apart from peer traffic.
pub const SENDER: &str = "NS";

/// Action names as they appear on the wire.
pub mod actions {
    pub const WSS_INFO: &str = "WSS_INFO";
    pub const LOGIN: &str = "LOGIN";
    pub const LOGIN_SYSTEM: &str = "LOGIN_SYSTEM";
    pub const LOGOUT: &str = "LOGOUT";
    pub const GET_CONNECTED_USERS: &str = "GET_CONNECTED_USERS";
    pub const CREATE_SNAP_INSTANCE: &str = "CREATE_SNAP_INSTANCE";
    pub const JOIN_SNAP_INSTANCE: &str = "JOIN_SNAP_INSTANCE";
    pub const LEAVE_SNAP_INSTANCE: &str = "LEAVE_SNAP_INSTANCE";
    pub const DELETE_SNAP_INSTANCE: &str = "DELETE_SNAP_INSTANCE";
    pub const SEND_SNAP: &str = "SEND_SNAP";
    pub const ERROR_SNAP: &str = "ERROR_SNAP";
    pub const PUBLISH_SNAP: &str = "PUBLISH_SNAP";

    /// Every action a client is allowed to send.
    pub const ALL: [&str; 11] = [
        LOGIN,
        LOGIN_SYSTEM,
        LOGOUT,
        GET_CONNECTED_USERS,
        CREATE_SNAP_INSTANCE,
        JOIN_SNAP_INSTANCE,
        LEAVE_SNAP_INSTANCE,
        DELETE_SNAP_INSTANCE,
        SEND_SNAP,
        ERROR_SNAP,
        PUBLISH_SNAP,
    ];
}

/// Envelope wrapping everything pushed down a connection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub success: bool,
    pub message: String,
    pub action: String,
    pub data: Value,
    pub is_broadcast: bool,
    pub sender: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
}

impl OutboundMessage {
    /// A direct reply to the message a client just sent.
    pub fn ok(message: &str, action: &str, data: Value) -> Self {
        Self {
            success: true,
            message: message.to_string(),
            action: action.to_string(),
            data,
            is_broadcast: false,
            sender: SENDER.to_string(),
            code: None,
        }
    }

    /// A message pushed because of something another party did.
    pub fn broadcast(message: &str, action: &str, data: Value) -> Self {
        Self {
            is_broadcast: true,
            ..Self::ok(message, action, data)
        }
    }

    /// A failed reply, with a code in the HTTP range.
    pub fn error(code: u16, message: &str, action: &str) -> Self {
        Self {
            success: false,
            code: Some(code),
            ..Self::ok(message, action, Value::Null)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn replies_serialize_in_wire_casing() {
        let message = OutboundMessage::ok("User logged in", actions::LOGIN, json!({ "sessionId": "abc" }));
        let value = serde_json::to_value(&message).unwrap();

        assert_eq!(value["success"], json!(true));
        assert_eq!(value["action"], json!("LOGIN"));
        assert_eq!(value["isBroadcast"], json!(false));
        assert_eq!(value["sender"], json!("NS"));
        assert_eq!(value["data"]["sessionId"], json!("abc"));
        assert!(value.get("code").is_none());
    }

    #[test]
    fn errors_carry_a_code() {
        let message = OutboundMessage::error(401, "Invalid credentials", actions::CREATE_SNAP_INSTANCE);
        let value = serde_json::to_value(&message).unwrap();

        assert_eq!(value["success"], json!(false));
        assert_eq!(value["code"], json!(401));
        assert_eq!(value["data"], json!(null));
    }

    #[test]
    fn broadcasts_are_marked() {
        let message = OutboundMessage::broadcast("User joined", actions::JOIN_SNAP_INSTANCE, json!({}));

        assert!(message.is_broadcast);
        assert!(message.success);
    }
}
