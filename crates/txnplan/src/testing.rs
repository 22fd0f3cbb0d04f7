//! Operations shared by unit tests

use crate::error::CodecError;
use crate::operation::{Operation, OperationDriver, ResourceRegistry};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Does nothing, declares the given resources
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct NoopOp {
    locks: BTreeSet<String>,
}

impl NoopOp {
    pub(crate) const KIND: &'static str = "noop";

    pub(crate) fn locking<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            locks: names.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait::async_trait]
impl Operation for NoopOp {
    async fn do_action(&self, _: &ResourceRegistry, _: &dyn OperationDriver) -> anyhow::Result<()> {
        Ok(())
    }

    async fn unravel(&self, _: &ResourceRegistry, _: &dyn OperationDriver) -> anyhow::Result<()> {
        Ok(())
    }

    fn locked_tasks(&self) -> BTreeSet<String> {
        self.locks.clone()
    }

    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn payload(&self) -> Result<Value, CodecError> {
        Ok(serde_json::to_value(self)?)
    }
}

pub(crate) type Journal = Arc<Mutex<Vec<String>>>;

/// Appends `do:<name>` / `undo:<name>` to a shared journal
pub(crate) struct ScriptedOp {
    pub(crate) name: String,
    pub(crate) journal: Journal,
    pub(crate) delay: Duration,
    pub(crate) blocking: Duration,
    pub(crate) fail: bool,
    pub(crate) fail_unravel: bool,
    pub(crate) locks: BTreeSet<String>,
}

impl ScriptedOp {
    pub(crate) fn new(name: &str, journal: &Journal) -> Self {
        Self {
            name: name.to_string(),
            journal: Arc::clone(journal),
            delay: Duration::ZERO,
            blocking: Duration::ZERO,
            fail: false,
            fail_unravel: false,
            locks: BTreeSet::new(),
        }
    }

    pub(crate) fn delayed(mut self, millis: u64) -> Self {
        self.delay = Duration::from_millis(millis);
        self
    }

    /// Hold the worker thread without yielding, logging `enter:`/`exit:`
    pub(crate) fn blocking(mut self, millis: u64) -> Self {
        self.blocking = Duration::from_millis(millis);
        self
    }

    pub(crate) fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub(crate) fn failing_unravel(mut self) -> Self {
        self.fail_unravel = true;
        self
    }
}

#[async_trait::async_trait]
impl Operation for ScriptedOp {
    async fn do_action(&self, _: &ResourceRegistry, _: &dyn OperationDriver) -> anyhow::Result<()> {
        if !self.blocking.is_zero() {
            self.journal.lock().push(format!("enter:{}", self.name));
            std::thread::sleep(self.blocking);
            self.journal.lock().push(format!("exit:{}", self.name));
            tokio::task::yield_now().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.journal.lock().push(format!("do:{}", self.name));
        if self.fail {
            anyhow::bail!("{} failed", self.name);
        }
        Ok(())
    }

    async fn unravel(&self, _: &ResourceRegistry, _: &dyn OperationDriver) -> anyhow::Result<()> {
        self.journal.lock().push(format!("undo:{}", self.name));
        if self.fail_unravel {
            anyhow::bail!("{} could not be undone", self.name);
        }
        Ok(())
    }

    fn locked_tasks(&self) -> BTreeSet<String> {
        self.locks.clone()
    }

    fn kind(&self) -> &'static str {
        "scripted"
    }

    fn payload(&self) -> Result<Value, CodecError> {
        Ok(Value::String(self.name.clone()))
    }
}

pub(crate) fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}
