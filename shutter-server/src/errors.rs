use axum::http::StatusCode;
use log::error;
use shutter_core::{AuthError, DatabaseError, InstanceError, SessionError};
use thiserror::Error;

pub type ServerResult<T> = Result<T, ServerError>;

/// Everything that can go wrong while handling a frame. Each variant
/// maps to the status code carried by the error envelope.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid credentials")]
    Unauthorized,

    #[error("{0}")]
    Malformed(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Action not found")]
    UnknownAction,

    #[error("Something went wrong")]
    Internal,
}

impl ServerError {
    pub fn code(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Malformed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::UnknownAction => StatusCode::NOT_FOUND,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<AuthError> for ServerError {
    fn from(value: AuthError) -> Self {
        match value {
            AuthError::InvalidCredentials => Self::Unauthorized,
            AuthError::Db(e) => e.into(),
        }
    }
}

impl From<DatabaseError> for ServerError {
    fn from(value: DatabaseError) -> Self {
        match value {
            DatabaseError::NotFound { .. } => Self::NotFound(value.to_string()),
            DatabaseError::Conflict { .. } => Self::Conflict(value.to_string()),
            DatabaseError::Internal(e) => {
                error!("Database error: {e}");
                Self::Internal
            }
        }
    }
}

impl From<SessionError> for ServerError {
    fn from(value: SessionError) -> Self {
        let message = value.to_string();

        match value {
            SessionError::Auth(e) => e.into(),
            SessionError::Db(e) => e.into(),
            SessionError::DeviceNotFound => Self::NotFound(message),
            SessionError::PairingNotFound => Self::Forbidden(message),
            SessionError::AlreadyConnected => Self::Conflict(message),
        }
    }
}

impl From<InstanceError> for ServerError {
    fn from(value: InstanceError) -> Self {
        let message = value.to_string();

        match value {
            InstanceError::AlreadyInInstance | InstanceError::AlreadyJoined => {
                Self::Conflict(message)
            }
            InstanceError::InstanceNotFound
            | InstanceError::ShapeNotFound
            | InstanceError::UserNotFound(_) => Self::NotFound(message),
            InstanceError::DuplicateInvitee
            | InstanceError::SelfInvite
            | InstanceError::WrongParticipantCount { .. }
            | InstanceError::NotFriends
            | InstanceError::PositionUnavailable(_)
            | InstanceError::NotJoined => Self::BadRequest(message),
            InstanceError::NotInvited | InstanceError::NotOwner | InstanceError::NotInInstance => {
                Self::Forbidden(message)
            }
            e => {
                error!("Instance operation failed: {e}");
                Self::Internal
            }
        }
    }
}
