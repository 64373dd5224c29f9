// Copyright 2025 The Drasi Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Host-facing traits for connector components and their shared lifecycle.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, warn};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;

use crate::codec::Row;

/// Lifecycle status of a source or sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error(String),
}

impl fmt::Display for ComponentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentStatus::Stopped => f.write_str("stopped"),
            ComponentStatus::Starting => f.write_str("starting"),
            ComponentStatus::Running => f.write_str("running"),
            ComponentStatus::Stopping => f.write_str("stopping"),
            ComponentStatus::Error(e) => write!(f, "error: {e}"),
        }
    }
}

/// Where a source delivers decoded rows. A send completes once the row is
/// buffered downstream; a full buffer applies backpressure.
pub type RowSender = mpsc::Sender<Row>;

/// A table source: turns broker messages into rows.
#[async_trait]
pub trait Source: Send + Sync {
    fn id(&self) -> &str;

    fn type_name(&self) -> &str;

    fn properties(&self) -> HashMap<String, Value>;

    /// Connect, subscribe and start forwarding rows to `output`.
    async fn start(&self, output: RowSender) -> Result<()>;

    /// Stop forwarding and release the connection.
    async fn stop(&self) -> Result<()>;

    async fn status(&self) -> ComponentStatus;

    fn as_any(&self) -> &dyn Any;
}

/// A table sink: turns rows into broker messages.
#[async_trait]
pub trait Sink: Send + Sync {
    fn id(&self) -> &str;

    fn type_name(&self) -> &str;

    fn properties(&self) -> HashMap<String, Value>;

    async fn start(&self) -> Result<()>;

    /// Publish one row. Returns once the broker confirmed it at the
    /// configured QoS.
    async fn write(&self, row: &Row) -> Result<()>;

    /// Drain in-flight publishes and release the connection.
    async fn stop(&self) -> Result<()>;

    async fn status(&self) -> ComponentStatus;

    fn as_any(&self) -> &dyn Any;
}

/// Status, shutdown signal and background task shared by the components.
pub struct ComponentBase {
    pub id: String,
    status: Arc<RwLock<ComponentStatus>>,
    shutdown_tx: RwLock<Option<oneshot::Sender<()>>>,
    task: RwLock<Option<JoinHandle<()>>>,
}

impl ComponentBase {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: Arc::new(RwLock::new(ComponentStatus::Stopped)),
            shutdown_tx: RwLock::new(None),
            task: RwLock::new(None),
        }
    }

    /// Status cell for background tasks that outlive `&self`.
    pub fn status_handle(&self) -> Arc<RwLock<ComponentStatus>> {
        self.status.clone()
    }

    pub async fn set_status(&self, status: ComponentStatus) {
        *self.status.write().await = status;
    }

    pub async fn get_status(&self) -> ComponentStatus {
        self.status.read().await.clone()
    }

    /// Create the shutdown channel of a new run; the receiver goes to the task.
    pub async fn create_shutdown_channel(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        *self.shutdown_tx.write().await = Some(tx);
        rx
    }

    pub async fn set_task_handle(&self, handle: JoinHandle<()>) {
        *self.task.write().await = Some(handle);
    }

    /// Signal the background task and wait for it to finish.
    pub async fn stop_common(&self) -> Result<()> {
        let running = self.shutdown_tx.write().await.take();
        let task = self.task.write().await.take();
        if running.is_none() && task.is_none() {
            return Ok(());
        }
        {
            let mut status = self.status.write().await;
            if !matches!(*status, ComponentStatus::Error(_)) {
                *status = ComponentStatus::Stopping;
            }
        }

        if let Some(tx) = running {
            let _ = tx.send(());
        }
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("[{}] Background task ended abnormally: {e}", self.id);
            }
        }

        let mut status = self.status.write().await;
        if !matches!(*status, ComponentStatus::Error(_)) {
            *status = ComponentStatus::Stopped;
        }
        debug!("[{}] Stopped ({})", self.id, *status);
        Ok(())
    }
}
