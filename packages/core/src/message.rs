//! Wire message envelope and command-name parsing.
//!
//! Every frame exchanged over the multiplexed transport is a JSON object
//! with a required `command` and optional `uuid`/`token`/`parameters`. This
//! module models that envelope and the `namespace:verb[:status]` grammar
//! used to route it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A message exchanged between client and server over a virtual channel.
///
/// `parameters` and `payload` are accepted as synonyms on the wire (the
/// distilled protocol uses both spellings depending on the command); callers
/// should read through [`Message::data`] rather than matching either field
/// directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parameters: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reply: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub errorcode: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub errorstring: Option<String>,
}

impl Message {
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            uuid: None,
            token: None,
            parameters: None,
            payload: None,
            reply: None,
            errorcode: None,
            errorstring: None,
        }
    }

    #[must_use]
    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.parameters = Some(data);
        self
    }

    #[must_use]
    pub fn with_reply(mut self, reply: bool) -> Self {
        self.reply = Some(reply);
        self
    }

    /// `parameters` and `payload` are wire synonyms; this reads whichever is present.
    #[must_use]
    pub fn data(&self) -> Option<&Value> {
        self.parameters.as_ref().or(self.payload.as_ref())
    }

    /// Parses the `command` field into its namespace/verb/status parts.
    #[must_use]
    pub fn parsed_command(&self) -> ParsedCommand<'_> {
        ParsedCommand::parse(&self.command)
    }

    /// Builds the `<command>:failed` error reply sent back to the originator only.
    #[must_use]
    pub fn failed_reply(&self, errorcode: i32, errorstring: impl Into<String>) -> Self {
        Self {
            command: format!("{}:failed", self.command),
            uuid: self.uuid.clone(),
            token: None,
            parameters: None,
            payload: None,
            reply: None,
            errorcode: Some(errorcode),
            errorstring: Some(errorstring.into()),
        }
    }

    /// Builds the `<command>:success` reply sent back to the originator only.
    #[must_use]
    pub fn success_reply(&self) -> Self {
        Self::new(format!("{}:success", self.command)).with_uuid_opt(self.uuid.clone())
    }

    fn with_uuid_opt(mut self, uuid: Option<String>) -> Self {
        self.uuid = uuid;
        self
    }
}

/// A `command` string decomposed into `namespace:verb[:status]`.
///
/// Colon-separated; `namespace` is everything before the first colon,
/// `verb` the segment after it, and `status` (e.g. `success`/`failed`) any
/// remaining trailing segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedCommand<'a> {
    pub namespace: &'a str,
    pub verb: Option<&'a str>,
    pub status: Option<&'a str>,
}

impl<'a> ParsedCommand<'a> {
    #[must_use]
    pub fn parse(command: &'a str) -> Self {
        let mut parts = command.splitn(3, ':');
        let namespace = parts.next().unwrap_or("");
        let verb = parts.next();
        let status = parts.next();
        Self {
            namespace,
            verb,
            status,
        }
    }

    /// True when `namespace:verb` equals the given prefix, ignoring any status suffix.
    #[must_use]
    pub fn is(&self, namespace: &str, verb: &str) -> bool {
        self.namespace == namespace && self.verb == Some(verb)
    }
}
