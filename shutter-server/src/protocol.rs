use serde::{Deserialize, Serialize};
use shutter_core::PrimaryKey;
use validator::{Validate, ValidationErrors, ValidationErrorsKind};

/// A frame before the action is known. Used to name the action in
/// error envelopes even when the rest of the frame is unusable.
#[derive(Debug, Deserialize)]
pub struct RawEnvelope {
    pub action: Option<String>,
}

/// Every action a connection can send, tagged by its action name
#[derive(Debug, Deserialize)]
#[serde(
    tag = "action",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    Login { token: String, device_uuid: String },
    LoginSystem { token: String },
    Logout,
    GetConnectedUsers,
    CreateSnapInstance { data: CreateInstancePayload },
    JoinSnapInstance { data: KeyPayload },
    LeaveSnapInstance,
    DeleteSnapInstance { data: KeyPayload },
    SendSnap { data: KeyPayload },
    ErrorSnap { data: KeyPayload },
    PublishSnap { data: KeyPayload },
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstancePayload {
    pub shape_id: PrimaryKey,
    #[validate(length(min = 1), nested)]
    pub users: Vec<InviteePayload>,
}

#[derive(Debug, Deserialize, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct InviteePayload {
    pub id: PrimaryKey,
    #[validate(length(min = 1, max = 64))]
    pub position: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct KeyPayload {
    #[validate(length(equal = 64))]
    pub key: String,
}

/// Digs the first concrete problem out of a validation tree
pub fn first_validation_error(errors: &ValidationErrors) -> String {
    fn walk(errors: &ValidationErrors) -> Option<String> {
        for (field, kind) in errors.errors() {
            match kind {
                ValidationErrorsKind::Field(problems) => {
                    if let Some(problem) = problems.first() {
                        return Some(format!("{field} is invalid: {}", problem.code));
                    }
                }
                ValidationErrorsKind::Struct(inner) => {
                    if let Some(found) = walk(inner) {
                        return Some(found);
                    }
                }
                ValidationErrorsKind::List(items) => {
                    for inner in items.values() {
                        if let Some(found) = walk(inner) {
                            return Some(found);
                        }
                    }
                }
            }
        }

        None
    }

    walk(errors).unwrap_or_else(|| "Payload is invalid".to_string())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn every_known_action_parses() {
        let key = "k".repeat(64);

        let samples = [
            r#"{"action":"LOGIN","token":"t","deviceUuid":"d"}"#.to_string(),
            r#"{"action":"LOGIN_SYSTEM","token":"t"}"#.to_string(),
            r#"{"action":"LOGOUT"}"#.to_string(),
            r#"{"action":"GET_CONNECTED_USERS"}"#.to_string(),
            r#"{"action":"CREATE_SNAP_INSTANCE","data":{"shapeId":1,"users":[{"id":2,"position":"BACK"}]}}"#.to_string(),
            format!(r#"{{"action":"JOIN_SNAP_INSTANCE","data":{{"key":"{key}"}}}}"#),
            r#"{"action":"LEAVE_SNAP_INSTANCE"}"#.to_string(),
            format!(r#"{{"action":"DELETE_SNAP_INSTANCE","data":{{"key":"{key}"}}}}"#),
            format!(r#"{{"action":"SEND_SNAP","data":{{"key":"{key}"}}}}"#),
            format!(r#"{{"action":"ERROR_SNAP","data":{{"key":"{key}"}}}}"#),
            format!(r#"{{"action":"PUBLISH_SNAP","data":{{"key":"{key}"}}}}"#),
        ];

        assert_eq!(samples.len(), shutter_core::actions::ALL.len());

        for sample in &samples {
            let parsed = serde_json::from_str::<ClientMessage>(sample);
            assert!(parsed.is_ok(), "failed to parse {sample}: {parsed:?}");

            let envelope: RawEnvelope = serde_json::from_str(sample).unwrap();
            let action = envelope.action.unwrap();
            assert!(shutter_core::actions::ALL.contains(&action.as_str()));
        }
    }

    #[test]
    fn frames_without_an_action_still_parse_as_envelopes() {
        let envelope: RawEnvelope = serde_json::from_str(r#"{"data":{"key":"x"}}"#).unwrap();
        assert!(envelope.action.is_none());
    }

    #[test]
    fn payload_fields_use_the_wire_casing() {
        let frame = r#"{"action":"LOGIN","token":"t","deviceUuid":"device-1"}"#;
        let parsed: ClientMessage = serde_json::from_str(frame).unwrap();

        match parsed {
            ClientMessage::Login { token, device_uuid } => {
                assert_eq!(token, "t");
                assert_eq!(device_uuid, "device-1");
            }
            other => panic!("parsed the wrong variant: {other:?}"),
        }
    }

    #[test]
    fn keys_must_be_exactly_64_characters() {
        let short = KeyPayload {
            key: "short".to_string(),
        };

        let errors = short.validate().unwrap_err();
        assert!(first_validation_error(&errors).contains("key"));

        let exact = KeyPayload {
            key: "k".repeat(64),
        };
        assert!(exact.validate().is_ok());
    }

    #[test]
    fn invitee_lists_cannot_be_empty() {
        let payload = CreateInstancePayload {
            shape_id: 1,
            users: Vec::new(),
        };

        let errors = payload.validate().unwrap_err();
        assert!(first_validation_error(&errors).contains("users"));
    }

    #[test]
    fn invitee_problems_are_found_through_the_list() {
        let payload = CreateInstancePayload {
            shape_id: 1,
            users: vec![InviteePayload {
                id: 2,
                position: String::new(),
            }],
        };

        let errors = payload.validate().unwrap_err();
        assert!(first_validation_error(&errors).contains("position"));
    }
}
