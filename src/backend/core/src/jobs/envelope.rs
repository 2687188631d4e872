//! Job envelopes: the authorization context a job is enqueued under.
//!
//! An envelope is only a claim. Workers never trust it directly; they rebuild
//! an [`AuthorizationContext`] from it through the guard before processing.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::authz::{
    AccessRequest, AuthorizationContext, DataClassification, DataResidency, OrganizationId,
    PermissionSet, UserId,
};
use crate::error::{ErrorCode, WardenError};

/// Errors from decoding a job envelope. Always terminal for the job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    #[error("malformed job envelope: {0}")]
    Malformed(String),

    #[error("job envelope field '{0}' must not be empty")]
    EmptyField(&'static str),
}

impl From<EnvelopeError> for WardenError {
    fn from(error: EnvelopeError) -> Self {
        WardenError::with_internal(ErrorCode::InvalidEnvelope, "Invalid job envelope", error.to_string())
    }
}

/// Payload wrapped with the tenant identity it runs for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEnvelope<T> {
    pub org_id: OrganizationId,
    pub user_id: UserId,
    pub data_classification: DataClassification,
    pub data_residency: DataResidency,
    pub audit_source: String,
    #[serde(default)]
    pub correlation_id: String,
    pub payload: T,
}

impl<T> JobEnvelope<T> {
    /// Wrap `payload` with the identity of an already authorized caller.
    pub fn from_context(ctx: &AuthorizationContext, payload: T) -> Self {
        Self {
            org_id: ctx.org_id().clone(),
            user_id: ctx.user_id().clone(),
            data_classification: ctx.data_classification(),
            data_residency: ctx.data_residency(),
            audit_source: ctx.audit_source().to_string(),
            correlation_id: ctx.correlation_id().to_string(),
            payload,
        }
    }

    /// The request the guard must approve before the payload is processed.
    ///
    /// The envelope's classification and residency become expectations, so a
    /// tenant whose record changed since enqueue is rejected.
    pub fn access_request(&self, required: &PermissionSet) -> AccessRequest {
        let request = AccessRequest::new(self.org_id.clone(), self.user_id.clone())
            .with_permissions(required)
            .expect_classification(self.data_classification)
            .expect_residency(self.data_residency)
            .with_audit_source(self.audit_source.clone());
        if self.correlation_id.trim().is_empty() {
            request
        } else {
            request.with_correlation_id(self.correlation_id.clone())
        }
    }
}

impl<T: DeserializeOwned> JobEnvelope<T> {
    /// Structural decode of a stored job payload.
    pub fn decode(value: serde_json::Value) -> Result<Self, EnvelopeError> {
        let envelope: Self =
            serde_json::from_value(value).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;

        if envelope.org_id.is_blank() {
            return Err(EnvelopeError::EmptyField("orgId"));
        }
        if envelope.user_id.as_str().trim().is_empty() {
            return Err(EnvelopeError::EmptyField("userId"));
        }
        if envelope.audit_source.trim().is_empty() {
            return Err(EnvelopeError::EmptyField("auditSource"));
        }
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::context::test_context;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Accrual {
        period: String,
    }

    fn raw() -> serde_json::Value {
        json!({
            "orgId": "org-1",
            "userId": "user-1",
            "dataClassification": "OFFICIAL",
            "dataResidency": "UK_ONLY",
            "auditSource": "scheduler",
            "correlationId": "c-1",
            "payload": {"period": "2024-01"}
        })
    }

    #[test]
    fn test_decode() {
        let envelope = JobEnvelope::<Accrual>::decode(raw()).unwrap();
        assert_eq!(envelope.org_id.as_str(), "org-1");
        assert_eq!(envelope.payload.period, "2024-01");
    }

    #[test]
    fn test_decode_rejects_missing_fields() {
        let mut value = raw();
        value.as_object_mut().unwrap().remove("dataResidency");
        assert!(matches!(
            JobEnvelope::<Accrual>::decode(value),
            Err(EnvelopeError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_rejects_bad_payload() {
        let mut value = raw();
        value["payload"] = json!({"period": 7});
        assert!(JobEnvelope::<Accrual>::decode(value).is_err());
    }

    #[test]
    fn test_decode_rejects_empty_org() {
        let mut value = raw();
        value["orgId"] = json!("  ");
        assert_eq!(
            JobEnvelope::<Accrual>::decode(value).unwrap_err(),
            EnvelopeError::EmptyField("orgId")
        );
    }

    #[test]
    fn test_from_context_roundtrip_through_json() {
        let ctx = test_context("org-9", DataClassification::Secret, DataResidency::UkAndEea);
        let envelope = JobEnvelope::from_context(&ctx, Accrual { period: "2024-02".into() });
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["dataClassification"], "SECRET");

        let decoded = JobEnvelope::<Accrual>::decode(value).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_access_request_carries_expectations() {
        let envelope = JobEnvelope::<Accrual>::decode(raw()).unwrap();
        let request = envelope.access_request(&PermissionSet::new());
        assert_eq!(request.expected_classification, Some(DataClassification::Official));
        assert_eq!(request.expected_residency, Some(DataResidency::UkOnly));
        assert_eq!(request.correlation_id.as_deref(), Some("c-1"));
    }

    #[test]
    fn test_envelope_error_maps_to_invalid_envelope() {
        let error: WardenError = EnvelopeError::EmptyField("userId").into();
        assert_eq!(error.code(), ErrorCode::InvalidEnvelope);
        assert!(!error.is_retryable());
    }
}
