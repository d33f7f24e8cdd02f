//! # Operation Model
//!
//! Persisted record of one lifecycle request (provision, deprovision, update, upgrade)
//! against a single target instance, together with the stage it has reached.
//!
//! `state` is the coarse status callers branch on. `stage` names the next step to
//! run and only moves while the operation is in progress; `last_transition_time`
//! records when it last moved and bounds how long a stage may go without progress.

use crate::state_machine::OperationState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

/// Globally unique operation identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(String);

impl OperationId {
    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OperationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for OperationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Kind of lifecycle action; selects the stage registry or pipeline that drives it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Provision,
    Deprovision,
    Update,
    Upgrade,
}

impl OperationKind {
    pub const ALL: [OperationKind; 4] = [
        OperationKind::Provision,
        OperationKind::Deprovision,
        OperationKind::Update,
        OperationKind::Upgrade,
    ];
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provision => write!(f, "provision"),
            Self::Deprovision => write!(f, "deprovision"),
            Self::Update => write!(f, "update"),
            Self::Upgrade => write!(f, "upgrade"),
        }
    }
}

impl std::str::FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provision" => Ok(Self::Provision),
            "deprovision" => Ok(Self::Deprovision),
            "update" => Ok(Self::Update),
            "upgrade" => Ok(Self::Upgrade),
            _ => Err(format!("Invalid operation kind: {s}")),
        }
    }
}

/// Name of the step an operation runs next
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Stage(Cow<'static, str>);

impl Stage {
    /// Distinguished terminal stage: no step runs after it
    pub const FINISHED: Stage = Stage(Cow::Borrowed("finished"));

    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_finished(&self) -> bool {
        *self == Self::FINISHED
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&'static str> for Stage {
    fn from(value: &'static str) -> Self {
        Self::from_static(value)
    }
}

impl From<String> for Stage {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Last failure recorded against an operation, surfaced through `last_operation`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    pub message: String,
    pub reason: Option<String>,
    pub component: Option<String>,
}

impl LastError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            reason: None,
            component: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }
}

/// One in-flight or completed lifecycle action against one target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    /// Identifier of the target instance this operation acts on
    pub target_id: String,
    pub kind: OperationKind,
    pub state: OperationState,
    pub stage: Stage,
    /// Human-readable progress or failure description
    pub message: String,
    pub last_error: Option<LastError>,
    /// Delay the driver asked for after its last invocation
    #[serde(default, with = "duration_millis")]
    pub requeue_delay: Option<Duration>,
    /// Intermediate results stashed by steps (e.g. a provisioner-assigned cluster id)
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_transition_time: DateTime<Utc>,
}

impl Operation {
    /// Create a pending operation positioned at `initial_stage`
    pub fn new(kind: OperationKind, target_id: impl Into<String>, initial_stage: Stage) -> Self {
        let now = Utc::now();
        Self {
            id: OperationId::generate(),
            target_id: target_id.into(),
            kind,
            state: OperationState::Pending,
            stage: initial_stage,
            message: "Operation created".to_string(),
            last_error: None,
            requeue_delay: None,
            metadata: serde_json::Value::Object(serde_json::Map::new()),
            created_at: now,
            updated_at: now,
            last_transition_time: now,
        }
    }

    pub fn with_id(mut self, id: impl Into<OperationId>) -> Self {
        self.id = id.into();
        self
    }

    /// Time spent in the current stage; zero if the clock moved backwards
    pub fn time_in_stage(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.last_transition_time)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Part of the persisted requeue delay still outstanding at `now`
    pub fn remaining_requeue_delay(&self, now: DateTime<Utc>) -> Duration {
        let Some(delay) = self.requeue_delay else {
            return Duration::ZERO;
        };
        let elapsed = now
            .signed_duration_since(self.updated_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        delay.saturating_sub(elapsed)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
