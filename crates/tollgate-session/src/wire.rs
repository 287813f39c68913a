//! Session dialog payloads
//!
//! JSON payload types for the `session-create` and `session-destroy`
//! topics, plus the consumer-side request helpers.

use serde::{Deserialize, Serialize};
use tollgate_crypto::Address;
use tollgate_net::Dialog;

use crate::error::{SessionError, SessionResult};
use crate::{ServiceConfiguration, SessionId};

/// Dialog topic for session creation
pub const TOPIC_SESSION_CREATE: &str = "session-create";

/// Dialog topic for session teardown
pub const TOPIC_SESSION_DESTROY: &str = "session-destroy";

/// Consumer metadata attached to a session-create request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerInfo {
    /// Identity that issues payment promises for the session
    pub issuer_id: Address,
    /// Client software version
    pub client_version: String,
}

/// Latest promise the provider has accepted from this consumer
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LastPromise {
    pub amount: u64,
    pub sequence_id: u64,
}

/// Payment bootstrap data returned with a created session
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PaymentInfo {
    pub last_promise: LastPromise,
}

/// `session-create` request payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCreateRequest {
    pub proposal_id: i64,
    /// Service-specific consumer configuration (punch endpoint, keys, ...)
    pub config: serde_json::Value,
    pub consumer_info: ConsumerInfo,
}

/// `session-create` response payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCreateResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<ServiceConfiguration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_info: Option<PaymentInfo>,
}

impl SessionCreateResponse {
    /// Successful response carrying the session and its configuration
    pub fn created(
        session_id: SessionId,
        config: ServiceConfiguration,
        payment_info: Option<PaymentInfo>,
    ) -> Self {
        Self {
            success: true,
            code: None,
            message: None,
            session_id: Some(session_id),
            config: Some(config),
            payment_info,
        }
    }

    /// Failure response built from a session error
    pub fn failed(error: &SessionError) -> Self {
        Self {
            success: false,
            code: error.code().map(str::to_string),
            message: Some(error.to_string()),
            session_id: None,
            config: None,
            payment_info: None,
        }
    }
}

/// `session-destroy` request payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDestroyRequest {
    pub session_id: SessionId,
}

/// `session-destroy` response payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDestroyResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Ask the provider on the other end of `dialog` to create a session
pub async fn request_session_create(
    dialog: &Dialog,
    proposal_id: i64,
    config: serde_json::Value,
    consumer_info: ConsumerInfo,
) -> SessionResult<(SessionId, ServiceConfiguration, Option<PaymentInfo>)> {
    let request = SessionCreateRequest {
        proposal_id,
        config,
        consumer_info,
    };
    let response: SessionCreateResponse = dialog.request(TOPIC_SESSION_CREATE, &request).await?;

    if !response.success {
        return Err(SessionError::from_code(
            response.code.as_deref(),
            response.message.unwrap_or_else(|| "session create refused".into()),
        ));
    }

    let session_id = response
        .session_id
        .ok_or_else(|| SessionError::Rejected("response missing session id".into()))?;
    let config = response
        .config
        .ok_or_else(|| SessionError::Rejected("response missing service config".into()))?;
    Ok((session_id, config, response.payment_info))
}

/// Ask the provider to destroy a session
pub async fn request_session_destroy(dialog: &Dialog, session_id: SessionId) -> SessionResult<()> {
    let request = SessionDestroyRequest { session_id };
    let response: SessionDestroyResponse = dialog.request(TOPIC_SESSION_DESTROY, &request).await?;

    if !response.success {
        return Err(SessionError::from_code(
            response.code.as_deref(),
            response.message.unwrap_or_else(|| "session destroy refused".into()),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tollgate_crypto::Identity;

    #[test]
    fn test_create_response_roundtrip() {
        let response = SessionCreateResponse::created(
            SessionId::random(),
            serde_json::json!({"remote": "10.0.0.1"}),
            Some(PaymentInfo {
                last_promise: LastPromise {
                    amount: 100,
                    sequence_id: 3,
                },
            }),
        );

        let json = serde_json::to_string(&response).unwrap();
        let restored: SessionCreateResponse = serde_json::from_str(&json).unwrap();

        assert!(restored.success);
        assert_eq!(restored.session_id, response.session_id);
        assert_eq!(restored.payment_info.unwrap().last_promise.sequence_id, 3);
    }

    #[test]
    fn test_failure_response_preserves_error_kind() {
        let response = SessionCreateResponse::failed(&SessionError::InvalidProposal);
        let json = serde_json::to_string(&response).unwrap();
        let restored: SessionCreateResponse = serde_json::from_str(&json).unwrap();

        let error = SessionError::from_code(
            restored.code.as_deref(),
            restored.message.unwrap_or_default(),
        );
        assert!(matches!(error, SessionError::InvalidProposal));
    }

    #[test]
    fn test_unknown_code_becomes_rejected() {
        let error = SessionError::from_code(Some("martian"), "weird failure".into());
        assert!(matches!(error, SessionError::Rejected(_)));
    }

    #[test]
    fn test_consumer_info_roundtrip() {
        let info = ConsumerInfo {
            issuer_id: Identity::generate().address(),
            client_version: "0.1.0".to_string(),
        };
        let json = serde_json::to_string(&info).unwrap();
        let restored: ConsumerInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.issuer_id, info.issuer_id);
    }
}
