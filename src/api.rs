//! Request and response bodies of the flags HTTP API, shared by the server
//! and the client.

use serde::{Deserialize, Serialize};

use crate::document::{FeatureFlag, Revision};

/// Body of `POST /flags`. Exactly one operation runs, picked in the order
/// `batch`, `key`, `isMaintenance`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<Vec<FeatureFlag>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_maintenance: Option<bool>,
}

/// What a `POST /flags` body asks for, after applying the priority order.
#[derive(Debug, Clone, PartialEq)]
pub enum FlagCommand {
    Batch(Vec<FeatureFlag>),
    Upsert {
        key: String,
        enabled: Option<bool>,
        old_key: Option<String>,
    },
    SetMaintenance(bool),
    Missing,
}

impl UpsertRequest {
    pub fn into_command(self) -> FlagCommand {
        if let Some(batch) = self.batch {
            return FlagCommand::Batch(batch);
        }
        if let Some(key) = self.key {
            return FlagCommand::Upsert {
                key,
                enabled: self.enabled,
                old_key: self.old_key,
            };
        }
        match self.is_maintenance {
            Some(enabled) => FlagCommand::SetMaintenance(enabled),
            None => FlagCommand::Missing,
        }
    }
}

/// Body of `POST /flags/delete`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeleteManyRequest {
    pub keys: Vec<String>,
}

/// Success body of every mutating route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<Revision>,
}

/// Error body of every route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// An authenticated operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignInRequest {
    pub email: String,
    pub password: String,
}

/// Body of `POST /auth/sign-in` and `GET /auth/session`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionResponse {
    pub user: User,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(body: &str) -> FlagCommand {
        serde_json::from_str::<UpsertRequest>(body)
            .unwrap()
            .into_command()
    }

    #[test]
    fn batch_wins_over_key_and_maintenance() {
        let cmd = parse(r#"{"batch": [{"key": "a", "enabled": true}], "key": "b", "isMaintenance": true}"#);
        assert_eq!(
            cmd,
            FlagCommand::Batch(vec![FeatureFlag {
                key: "a".to_string(),
                enabled: true
            }])
        );
    }

    #[test]
    fn key_wins_over_maintenance() {
        let cmd = parse(r#"{"key": "b", "oldKey": "a", "isMaintenance": true}"#);
        assert_eq!(
            cmd,
            FlagCommand::Upsert {
                key: "b".to_string(),
                enabled: None,
                old_key: Some("a".to_string()),
            }
        );
    }

    #[test]
    fn maintenance_alone_and_empty_body() {
        assert_eq!(parse(r#"{"isMaintenance": false}"#), FlagCommand::SetMaintenance(false));
        assert_eq!(parse("{}"), FlagCommand::Missing);
    }

    #[test]
    fn request_serializes_camel_case_without_nulls() {
        let req = UpsertRequest {
            key: Some("b".to_string()),
            enabled: Some(true),
            old_key: Some("a".to_string()),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            serde_json::json!({"key": "b", "enabled": true, "oldKey": "a"})
        );
    }
}
