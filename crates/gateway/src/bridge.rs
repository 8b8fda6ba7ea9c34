//! MCP bridge: per-user long-lived tool clients.
//!
//! A client registers once per user and keeps an outbound channel of tool
//! calls. Re-registration replaces the old connection without
//! deregistering its tools — the new registration re-registers them
//! atomically, so daemons never observe an empty catalog in between.
//! Outbound sends are bounded; a full channel is treated as a timeout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cortex_domain::error::{Error, Result};
use cortex_domain::event::CortexEvent;
use cortex_domain::tool::ToolDefinition;
use cortex_tools::ToolRegistry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::bus::EventBus;

const OUTBOUND_BUFFER: usize = 32;
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// A tool call forwarded to the user's client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeCall {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: Value,
}

/// What a client presents when it connects.
#[derive(Debug, Clone)]
pub struct BridgeRegistration {
    pub client_name: String,
    pub tools: Vec<ToolDefinition>,
}

struct Connection {
    client_name: String,
    outbound: mpsc::Sender<BridgeCall>,
    pending: Mutex<HashMap<String, oneshot::Sender<Result<String>>>>,
    active: AtomicBool,
}

pub struct McpBridge {
    registry: Arc<ToolRegistry>,
    bus: Arc<EventBus>,
    connections: Mutex<HashMap<String, Arc<Connection>>>,
}

impl McpBridge {
    pub fn new(registry: Arc<ToolRegistry>, bus: Arc<EventBus>) -> Self {
        Self {
            registry,
            bus,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Register (or replace) the user's client. Returns the receiver the
    /// transport layer drains to forward calls to the client.
    pub fn register_client(
        &self,
        user_id: &str,
        registration: BridgeRegistration,
    ) -> mpsc::Receiver<BridgeCall> {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let connection = Arc::new(Connection {
            client_name: registration.client_name.clone(),
            outbound: tx,
            pending: Mutex::new(HashMap::new()),
            active: AtomicBool::new(true),
        });

        let previous = {
            let mut connections = self.connections.lock();
            connections.insert(user_id.to_owned(), connection)
        };
        if let Some(old) = previous {
            // Replaced connection: mark inactive and fail its in-flight
            // calls. Its tools stay registered — the re-registration
            // below replaces them in place.
            old.active.store(false, Ordering::Release);
            let mut pending = old.pending.lock();
            for (_, reply) in pending.drain() {
                let _ = reply.send(Err(Error::Other("bridge client replaced".into())));
            }
            tracing::info!(user_id, client = %old.client_name, "replaced bridge client");
        }

        for mut def in registration.tools {
            def.user_id = Some(user_id.to_owned());
            if def.category.is_empty() {
                def.category = registration.client_name.clone();
            }
            self.registry.register_user_tool(user_id, def);
        }

        self.bus.publish(
            user_id,
            CortexEvent::BridgeStateUpdated {
                bridge_connected: true,
            },
        );
        rx
    }

    /// Forward a tool call and wait up to `timeout` for the reply. A full
    /// outbound channel means the client is not draining: treated as a
    /// timeout.
    pub async fn execute_tool_on_client(
        &self,
        user_id: &str,
        tool_name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<String> {
        let connection = self
            .connections
            .lock()
            .get(user_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("bridge client for {user_id}")))?;
        if !connection.active.load(Ordering::Acquire) {
            return Err(Error::NotFound(format!("bridge client for {user_id}")));
        }

        let call_id = Uuid::new_v4().to_string();
        let (reply_tx, reply_rx) = oneshot::channel();
        connection.pending.lock().insert(call_id.clone(), reply_tx);

        let call = BridgeCall {
            call_id: call_id.clone(),
            tool_name: tool_name.to_owned(),
            arguments,
        };
        if connection.outbound.try_send(call).is_err() {
            connection.pending.lock().remove(&call_id);
            return Err(Error::Timeout(format!(
                "bridge outbound channel unavailable for {tool_name}"
            )));
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Other("bridge connection dropped".into())),
            Err(_) => {
                connection.pending.lock().remove(&call_id);
                Err(Error::Timeout(format!(
                    "tool {tool_name} timed out after {}s",
                    timeout.as_secs()
                )))
            }
        }
    }

    /// Route a client's reply to the waiting caller. Returns whether a
    /// caller was still waiting.
    pub fn handle_reply(&self, user_id: &str, call_id: &str, result: Result<String>) -> bool {
        let Some(connection) = self.connections.lock().get(user_id).cloned() else {
            return false;
        };
        let Some(reply) = connection.pending.lock().remove(call_id) else {
            return false;
        };
        reply.send(result).is_ok()
    }

    /// Tear the user's connection down: fail in-flight calls, drop the
    /// channels, deregister the user's tools, and announce the state.
    pub fn disconnect(&self, user_id: &str) {
        let Some(connection) = self.connections.lock().remove(user_id) else {
            return;
        };
        connection.active.store(false, Ordering::Release);
        {
            let mut pending = connection.pending.lock();
            for (_, reply) in pending.drain() {
                let _ = reply.send(Err(Error::Other("bridge client disconnected".into())));
            }
        }
        let removed = self.registry.unregister_all_user_tools(user_id);
        tracing::info!(user_id, tools = removed, "bridge client disconnected");
        self.bus.publish(
            user_id,
            CortexEvent::BridgeStateUpdated {
                bridge_connected: false,
            },
        );
    }

    pub fn is_connected(&self, user_id: &str) -> bool {
        self.connections
            .lock()
            .get(user_id)
            .is_some_and(|c| c.active.load(Ordering::Acquire))
    }

    /// The connection stores only tools, so the server summary is the
    /// user's tools grouped by category.
    pub fn user_tool_groups(&self, user_id: &str) -> HashMap<String, Vec<String>> {
        self.registry.user_tool_groups(user_id)
    }
}
