//! Wire encoding for persisted entities
//!
//! Every blob written to the coordination store is a tagged, versioned
//! envelope:
//!
//! ```json
//! { "schema": 1, "entity": "plan_status", "body": { ... } }
//! ```
//!
//! Operations are polymorphic, so plans store each operation as a
//! `{ kind, payload }` record and decode it through an [`OperationCodec`]
//! holding one registered decoder per kind.
//!
//! Identifiers, timestamps (`chrono`) and URIs (`url`) encode through their
//! serde implementations; opaque embedded wire messages use [`embedded`].

use crate::error::CodecError;
use crate::ids::{PlanId, StepId};
use crate::operation::Operation;
use crate::plan::{Plan, PlanBuilder};
use crate::scheduler::SchedulerState;
use crate::status::PlanStatus;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Newest envelope schema this build writes and understands
pub const SCHEMA_VERSION: u32 = 1;

/// Entity tag carried by every envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Entity {
    /// A frozen plan
    Plan,
    /// A plan status snapshot
    PlanStatus,
    /// Admission queues and running set
    SchedulerState,
    /// One step's checkpoint value
    Checkpoint,
}

impl Entity {
    /// Tag as written on the wire
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::PlanStatus => "plan_status",
            Self::SchedulerState => "scheduler_state",
            Self::Checkpoint => "checkpoint",
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    schema: u32,
    entity: Entity,
    body: &'a T,
}

#[derive(Deserialize)]
struct RawEnvelope {
    schema: u32,
    entity: String,
    body: Value,
}

fn seal<T: Serialize>(entity: Entity, body: &T) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(&EnvelopeRef {
        schema: SCHEMA_VERSION,
        entity,
        body,
    })?)
}

fn open<T: DeserializeOwned>(entity: Entity, bytes: &[u8]) -> Result<T, CodecError> {
    let raw: RawEnvelope = serde_json::from_slice(bytes)?;
    if raw.entity != entity.as_str() {
        return Err(CodecError::WrongEntity {
            expected: entity.as_str(),
            found: raw.entity,
        });
    }
    if raw.schema > SCHEMA_VERSION {
        return Err(CodecError::UnsupportedSchema {
            found: raw.schema,
            current: SCHEMA_VERSION,
        });
    }
    Ok(serde_json::from_value(raw.body)?)
}

/// Stored form of one operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    /// Decoder key
    pub kind: String,
    /// Operation body
    pub payload: Value,
}

#[derive(Serialize, Deserialize)]
struct StepRecord {
    id: StepId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    requires: Vec<StepId>,
    operation: OperationRecord,
}

#[derive(Serialize, Deserialize)]
struct PlanRecord {
    id: PlanId,
    created_at: DateTime<Utc>,
    steps: Vec<StepRecord>,
}

type Decoder = dyn Fn(Value) -> Result<Arc<dyn Operation>, CodecError> + Send + Sync;

/// Registry of operation decoders keyed by `Operation::kind`
#[derive(Clone, Default)]
pub struct OperationCodec {
    decoders: HashMap<String, Arc<Decoder>>,
}

impl OperationCodec {
    /// Empty codec
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` as the decoder for `kind`, replacing any previous one
    pub fn register<T>(&mut self, kind: &str) -> &mut Self
    where
        T: Operation + DeserializeOwned,
    {
        self.register_fn(kind, |payload| {
            let op: T = serde_json::from_value(payload)?;
            Ok(Arc::new(op) as Arc<dyn Operation>)
        })
    }

    /// Register a custom decoder for `kind`
    pub fn register_fn<F>(&mut self, kind: &str, decoder: F) -> &mut Self
    where
        F: Fn(Value) -> Result<Arc<dyn Operation>, CodecError> + Send + Sync + 'static,
    {
        self.decoders.insert(kind.to_string(), Arc::new(decoder));
        self
    }

    /// Builder-style [`register`](Self::register)
    #[must_use]
    pub fn with<T>(mut self, kind: &str) -> Self
    where
        T: Operation + DeserializeOwned,
    {
        self.register::<T>(kind);
        self
    }

    /// Whether a decoder exists for `kind`
    pub fn is_registered(&self, kind: &str) -> bool {
        self.decoders.contains_key(kind)
    }

    /// Encode one operation
    pub fn encode(operation: &dyn Operation) -> Result<OperationRecord, CodecError> {
        Ok(OperationRecord {
            kind: operation.kind().to_string(),
            payload: operation.payload()?,
        })
    }

    /// Decode one operation
    pub fn decode(&self, record: OperationRecord) -> Result<Arc<dyn Operation>, CodecError> {
        let decoder = self
            .decoders
            .get(&record.kind)
            .ok_or(CodecError::UnknownOperation(record.kind))?;
        decoder(record.payload)
    }
}

impl fmt::Debug for OperationCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<&String> = self.decoders.keys().collect();
        kinds.sort();
        f.debug_struct("OperationCodec").field("kinds", &kinds).finish()
    }
}

/// Encode a frozen plan
pub fn encode_plan(plan: &Plan) -> Result<Vec<u8>, CodecError> {
    let steps = plan
        .steps()
        .iter()
        .map(|step| {
            Ok(StepRecord {
                id: step.id(),
                requires: plan.prerequisites(step.id()).to_vec(),
                operation: OperationCodec::encode(step.operation().as_ref())?,
            })
        })
        .collect::<Result<Vec<_>, CodecError>>()?;

    seal(
        Entity::Plan,
        &PlanRecord {
            id: plan.id(),
            created_at: plan.created_at(),
            steps,
        },
    )
}

/// Decode a plan, re-validating its dependency graph
pub fn decode_plan(bytes: &[u8], codec: &OperationCodec) -> Result<Plan, CodecError> {
    let record: PlanRecord = open(Entity::Plan, bytes)?;
    let mut builder = PlanBuilder::with_identity(record.id, record.created_at);
    let mut edges = Vec::new();
    for step in record.steps {
        builder.insert_step(step.id, codec.decode(step.operation)?);
        edges.extend(step.requires.into_iter().map(|prereq| (step.id, prereq)));
    }
    for (step, prereq) in edges {
        builder.requires(step, prereq)?;
    }
    Ok(builder.freeze()?)
}

/// Encode a status snapshot
pub fn encode_status(status: &PlanStatus) -> Result<Vec<u8>, CodecError> {
    seal(Entity::PlanStatus, status)
}

/// Decode a status snapshot
pub fn decode_status(bytes: &[u8]) -> Result<PlanStatus, CodecError> {
    open(Entity::PlanStatus, bytes)
}

/// Encode scheduler state
pub fn encode_scheduler_state(state: &SchedulerState) -> Result<Vec<u8>, CodecError> {
    seal(Entity::SchedulerState, state)
}

/// Decode scheduler state
pub fn decode_scheduler_state(bytes: &[u8]) -> Result<SchedulerState, CodecError> {
    open(Entity::SchedulerState, bytes)
}

/// Encode a checkpoint value
pub fn encode_checkpoint(value: &Value) -> Result<Vec<u8>, CodecError> {
    seal(Entity::Checkpoint, value)
}

/// Decode a checkpoint value
pub fn decode_checkpoint(bytes: &[u8]) -> Result<Value, CodecError> {
    open(Entity::Checkpoint, bytes)
}

/// Opaque embedded wire messages as base64 strings
///
/// Use with `#[serde(with = "txnplan::codec::embedded")]` on a `Vec<u8>`
/// field holding an already-encoded protocol message.
pub mod embedded {
    use crate::error::CodecError;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    /// Encode raw bytes
    pub fn encode(bytes: &[u8]) -> String {
        STANDARD.encode(bytes)
    }

    /// Decode a base64 string
    pub fn decode(text: &str) -> Result<Vec<u8>, CodecError> {
        Ok(STANDARD.decode(text)?)
    }

    /// serde serializer
    pub fn serialize<T, S>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: AsRef<[u8]> + ?Sized,
        S: Serializer,
    {
        serializer.serialize_str(&encode(bytes.as_ref()))
    }

    /// serde deserializer
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        decode(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::PlanBuilder;
    use crate::testing::NoopOp;
    use pretty_assertions::assert_eq;

    fn codec() -> OperationCodec {
        OperationCodec::new().with::<NoopOp>(NoopOp::KIND)
    }

    #[test]
    fn test_plan_round_trip_preserves_graph() {
        let mut builder = PlanBuilder::new();
        let a = builder.step(NoopOp::locking(["pod-0"]));
        let b = builder.step(NoopOp::locking(["pod-1"]));
        let c = builder.step(NoopOp::default());
        builder.requires(b, a).unwrap();
        builder.requires(c, a).unwrap();
        builder.requires(c, b).unwrap();
        let plan = builder.freeze().unwrap();

        let decoded = decode_plan(&encode_plan(&plan).unwrap(), &codec()).unwrap();

        assert_eq!(decoded.id(), plan.id());
        assert_eq!(decoded.created_at(), plan.created_at());
        assert_eq!(decoded.step_ids().collect::<Vec<_>>(), vec![a, b, c]);
        assert_eq!(decoded.prerequisites(c), &[a, b]);
        assert_eq!(decoded.affected_task_names(), plan.affected_task_names());
    }

    #[test]
    fn test_status_round_trip() {
        let mut builder = PlanBuilder::new();
        let a = builder.step(NoopOp::default());
        builder.step(NoopOp::default());
        let plan = builder.freeze().unwrap();
        let status = PlanStatus::new(&plan).start_step(a).unwrap().rollback();

        let decoded = decode_status(&encode_status(&status).unwrap()).unwrap();
        assert_eq!(decoded, status);
    }

    #[test]
    fn test_scheduler_state_round_trip() {
        let mut state = SchedulerState::new();
        let p1 = PlanId::new();
        let p2 = PlanId::new();
        state.enqueue(p1, &["A".to_string(), "B".to_string()]);
        state.enqueue(p2, &["A".to_string()]);
        state.mark_running(p1);

        let decoded = decode_scheduler_state(&encode_scheduler_state(&state).unwrap()).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn test_wrong_entity_is_rejected() {
        let bytes = encode_checkpoint(&Value::from(3)).unwrap();
        let err = decode_status(&bytes).unwrap_err();
        assert!(matches!(err, CodecError::WrongEntity { expected: "plan_status", .. }));
    }

    #[test]
    fn test_newer_schema_is_rejected() {
        let bytes = br#"{"schema": 99, "entity": "checkpoint", "body": 1}"#;
        let err = decode_checkpoint(bytes).unwrap_err();
        assert!(matches!(err, CodecError::UnsupportedSchema { found: 99, current: SCHEMA_VERSION }));
    }

    #[test]
    fn test_unknown_operation_kind() {
        let mut builder = PlanBuilder::new();
        builder.step(NoopOp::default());
        let bytes = encode_plan(&builder.freeze().unwrap()).unwrap();

        let err = decode_plan(&bytes, &OperationCodec::new()).unwrap_err();
        assert!(matches!(err, CodecError::UnknownOperation(kind) if kind == "noop"));
    }

    #[test]
    fn test_embedded_messages_as_base64() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Launch {
            #[serde(with = "embedded")]
            task_info: Vec<u8>,
            artifact: url::Url,
        }

        let launch = Launch {
            task_info: vec![0x08, 0x96, 0x01],
            artifact: url::Url::parse("https://downloads.example.com/agent.tgz").unwrap(),
        };
        let json = serde_json::to_value(&launch).unwrap();
        assert_eq!(json["task_info"], "CJYB");
        assert_eq!(json["artifact"], "https://downloads.example.com/agent.tgz");

        let back: Launch = serde_json::from_value(json).unwrap();
        assert_eq!(back, launch);
    }
}
