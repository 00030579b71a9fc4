use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Writability of one storage class root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ClassHealth {
    pub class: String,
    pub writable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Health report returned by `GET /storage/health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct HealthRes {
    pub ok: bool,
    pub message: String,
    #[serde(default)]
    pub classes: Vec<ClassHealth>,
}

/// Builds health reports so the service and CLI render them the same way.
#[derive(Clone, Default)]
pub struct HealthService;

impl HealthService {
    /// Summarises per-class check results. The service is healthy only if every class root
    /// is writable.
    pub fn summarise(classes: Vec<ClassHealth>) -> HealthRes {
        let unwritable: Vec<&str> = classes
            .iter()
            .filter(|c| !c.writable)
            .map(|c| c.class.as_str())
            .collect();

        let message = if unwritable.is_empty() {
            "PHI Store is alive".to_string()
        } else {
            format!("storage not writable: {}", unwritable.join(", "))
        };

        HealthRes {
            ok: unwritable.is_empty(),
            message,
            classes,
        }
    }
}
