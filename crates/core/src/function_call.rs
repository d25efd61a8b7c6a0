//! Pass-through bookkeeping for agent function calls.
//!
//! A request is recorded when it arrives, handed to the host, and removed when
//! the host answers or the agent connection closes. Nothing is persisted.

use serde::Serialize;
use std::collections::HashMap;
use voice_protocol::ClientMessage;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingFunctionCall {
    pub id: String,
    pub name: String,
    /// JSON-encoded arguments, as sent by the agent.
    pub arguments: String,
}

impl PendingFunctionCall {
    /// Parses the arguments as JSON for hosts that want a structured value.
    pub fn arguments_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_str(&self.arguments)
    }
}

/// The host's answer to a function call.
#[derive(Debug, Clone, PartialEq)]
pub enum FunctionCallOutcome {
    Success(String),
    /// The handler failed or declined; returned on the wire as an error-flagged response.
    Failure(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FunctionCallError {
    #[error("a function call with id `{0}` is already pending")]
    Duplicate(String),
    #[error("no pending function call with id `{0}`")]
    Unknown(String),
}

#[derive(Debug, Default)]
pub struct FunctionCallRegistry {
    pending: HashMap<String, PendingFunctionCall>,
}

impl FunctionCallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn register(&mut self, call: PendingFunctionCall) -> Result<(), FunctionCallError> {
        if self.pending.contains_key(&call.id) {
            return Err(FunctionCallError::Duplicate(call.id));
        }
        self.pending.insert(call.id.clone(), call);
        Ok(())
    }

    /// Removes the call and builds the wire response for it.
    pub fn resolve(
        &mut self,
        id: &str,
        outcome: FunctionCallOutcome,
    ) -> Result<(PendingFunctionCall, ClientMessage), FunctionCallError> {
        let call = self
            .pending
            .remove(id)
            .ok_or_else(|| FunctionCallError::Unknown(id.to_string()))?;
        let (content, is_error) = match outcome {
            FunctionCallOutcome::Success(content) => (content, false),
            FunctionCallOutcome::Failure(reason) => (reason, true),
        };
        let response = ClientMessage::FunctionCallResponse {
            id: call.id.clone(),
            name: call.name.clone(),
            content,
            is_error,
        };
        Ok((call, response))
    }

    /// Drops every pending call. Returns how many were abandoned.
    pub fn abandon_all(&mut self) -> usize {
        let n = self.pending.len();
        self.pending.clear();
        n
    }
}
