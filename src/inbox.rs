//! Per-feature inboxes
//!
//! One channel for cloud-to-device messages plus one per module input, created
//! on demand when the application asks for it. All of them share the policy
//! chosen at client construction and are closed and reopened together.

use crate::channel::{ChannelPolicy, MessageChannel};
use crate::error::ClientResult;
use crate::protocol::InboundMessage;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::warn;

const C2D_CHANNEL: &str = "c2d";

#[derive(Debug)]
pub struct InboxManager {
    policy: ChannelPolicy,
    c2d: Arc<MessageChannel>,
    inputs: Mutex<HashMap<String, Arc<MessageChannel>>>,
}

impl InboxManager {
    pub fn new(policy: ChannelPolicy) -> Self {
        Self {
            policy,
            c2d: Arc::new(MessageChannel::new(C2D_CHANNEL, policy)),
            inputs: Mutex::new(HashMap::new()),
        }
    }

    pub fn c2d(&self) -> &Arc<MessageChannel> {
        &self.c2d
    }

    /// The inbox for a module input, if the application has asked for it
    pub fn input(&self, input_name: &str) -> Option<Arc<MessageChannel>> {
        self.inputs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(input_name)
            .cloned()
    }

    /// The inbox for a module input, created on first use
    ///
    /// A new inbox starts closed when the c2d inbox is closed, so it follows
    /// the same generation as the rest.
    pub fn input_or_create(&self, input_name: &str) -> Arc<MessageChannel> {
        let mut inputs = self.inputs.lock().unwrap_or_else(|e| e.into_inner());
        inputs
            .entry(input_name.to_string())
            .or_insert_with(|| {
                let channel = MessageChannel::new(format!("input:{input_name}"), self.policy);
                if self.c2d.is_closed() {
                    channel.close();
                }
                Arc::new(channel)
            })
            .clone()
    }

    /// Route a c2d message, waiting for capacity if needed
    pub async fn deliver_c2d(&self, message: InboundMessage) -> ClientResult<()> {
        self.c2d.push_wait(message).await
    }

    /// Route an input message; messages for inputs nobody asked for are dropped
    pub async fn deliver_input(&self, input_name: &str, message: InboundMessage) -> ClientResult<()> {
        match self.input(input_name) {
            Some(channel) => channel.push_wait(message).await,
            None => {
                warn!(input = %input_name, "No inbox for input, dropping message");
                Ok(())
            }
        }
    }

    fn all(&self) -> Vec<Arc<MessageChannel>> {
        let inputs = self.inputs.lock().unwrap_or_else(|e| e.into_inner());
        std::iter::once(self.c2d.clone())
            .chain(inputs.values().cloned())
            .collect()
    }

    /// Close every inbox so blocked consumers see end-of-stream
    pub fn close_all(&self) {
        for channel in self.all() {
            channel.close();
        }
    }

    /// Reopen closed inboxes for a new connection
    pub fn reopen_all(&self) {
        for channel in self.all() {
            channel.reopen();
        }
    }
}
