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

//! Reads sensor readings from one topic filter and republishes the hot ones
//! as alerts, one topic per device.
//!
//! Environment:
//! - `BRIDGE_BROKER` (default `tcp://localhost:1883`)
//! - `BRIDGE_SOURCE_TOPIC` (default `sensors/#`)
//! - `BRIDGE_SINK_TOPIC` (default `alerts/{{device_id}}`)
//! - `BRIDGE_THRESHOLD` (default `30`)
//! - `BRIDGE_USERNAME` / `BRIDGE_PASSWORD` (optional)

use std::collections::HashMap;
use std::env;

use anyhow::{Context, Result};
use emqx_core::{ConnectorRegistry, Row, RowSchema, TableContext, Value};
use log::{info, warn};
use tokio::sync::mpsc;

const SCHEMA: &str = "device_id STRING NOT NULL, temperature DOUBLE";

fn var(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn table_options(topic: String, qos: &str, client_id: &str) -> HashMap<String, String> {
    let mut options = HashMap::from([
        ("connector".to_string(), emqx_connector::IDENTIFIER.to_string()),
        ("broker".to_string(), var("BRIDGE_BROKER", "tcp://localhost:1883")),
        ("topic".to_string(), topic),
        ("qos".to_string(), qos.to_string()),
        ("client-id".to_string(), client_id.to_string()),
        ("isCleanSession".to_string(), "false".to_string()),
    ]);
    if let Ok(username) = env::var("BRIDGE_USERNAME") {
        options.insert("username".into(), username);
    }
    if let Ok(password) = env::var("BRIDGE_PASSWORD") {
        options.insert("password".into(), password);
    }
    options
}

fn is_hot(row: &Row, threshold: f64) -> bool {
    matches!(row.get(1), Some(Value::Double(t)) if *t > threshold)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    info!("Starting sensor bridge...");

    let threshold: f64 = var("BRIDGE_THRESHOLD", "30")
        .parse()
        .context("BRIDGE_THRESHOLD must be a number")?;
    let schema: RowSchema = SCHEMA.parse().map_err(anyhow::Error::msg)?;

    let mut registry = ConnectorRegistry::new();
    emqx_connector::register(&mut registry);

    // 1. Source: every reading below the configured filter.
    let source = registry.create_source(&TableContext::new(
        "sensor-readings",
        schema.clone(),
        table_options(var("BRIDGE_SOURCE_TOPIC", "sensors/#"), "1", "sensor-bridge-in"),
    ))?;

    // 2. Sink: one alert topic per device.
    let sink = registry.create_sink(&TableContext::new(
        "high-temp-alerts",
        schema,
        table_options(var("BRIDGE_SINK_TOPIC", "alerts/{{device_id}}"), "2", "sensor-bridge-out"),
    ))?;

    sink.start().await?;
    let (tx, mut rx) = mpsc::channel(100);
    source.start(tx).await?;
    info!("Bridge running (threshold={threshold}). Press Ctrl-C to stop.");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            row = rx.recv() => {
                let Some(row) = row else {
                    warn!("Source ended: {}", source.status().await);
                    break;
                };
                if !is_hot(&row, threshold) {
                    continue;
                }
                if let Err(e) = sink.write(&row).await {
                    warn!("Dropping alert: {e:#}");
                }
            }
        }
    }

    source.stop().await?;
    sink.stop().await?;
    info!("Sensor bridge stopped");
    Ok(())
}
