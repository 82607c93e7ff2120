//! Envelope types for the CBR wire protocol.
//!
//! Every logical message exchanged between the relay and a bridge client is
//! one [`Envelope`], tagged by its `action` field. Field names follow the
//! wire format exactly; changing them is a protocol break.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol library version, reported in `login` and compared by the server
/// for a mismatch warning only.
pub const LIB_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Reply text for a successful login.
pub const LOGIN_SUCCESS: &str = "login success";
/// Reply text for a rejected login.
pub const LOGIN_FAIL: &str = "login fail";

/// Result-kind codes carried in [`CallResult::kind`].
pub mod result_kind {
    /// The responder executed the request and `result` carries its output.
    pub const SUCCESS: i32 = 0;
    /// The responder does not implement the requested command or function.
    pub const UNSUPPORTED: i32 = 1;
    /// The responder failed while executing the request.
    pub const ERROR: i32 = 2;
}

/// Keepalive direction marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PingKind {
    Ping,
    Pong,
}

/// The `result` sub-object carried by `command` and `api` envelopes.
///
/// A request always carries `responded = false`; the reply is the same
/// envelope shape with `responded = true` and the result fields populated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallResult {
    pub responded: bool,
    /// Result-kind code chosen by the responder.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl CallResult {
    /// An unanswered request slot.
    #[must_use]
    pub fn pending() -> Self {
        Self::default()
    }

    /// A populated reply.
    #[must_use]
    pub fn answered(kind: i32, result: Value) -> Self {
        Self {
            responded: true,
            kind: Some(kind),
            result: Some(result),
        }
    }
}

/// One logical protocol message, tagged by `action`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum Envelope {
    #[serde(rename = "login")]
    Login {
        name: String,
        password: String,
        lib_version: String,
        #[serde(rename = "type")]
        client_type: String,
    },

    #[serde(rename = "result")]
    Result { result: String },

    #[serde(rename = "keepAlive")]
    KeepAlive {
        #[serde(rename = "type")]
        kind: PingKind,
    },

    #[serde(rename = "message")]
    Message {
        client: String,
        player: String,
        message: String,
        /// Empty or absent means broadcast to all other clients.
        #[serde(default, skip_serializing_if = "String::is_empty")]
        receiver: String,
    },

    #[serde(rename = "stop")]
    Stop,

    #[serde(rename = "command")]
    Command {
        sender: String,
        receiver: String,
        command: String,
        result: CallResult,
    },

    #[serde(rename = "api")]
    Api {
        sender: String,
        receiver: String,
        plugin: String,
        function: String,
        keys: Vec<Value>,
        result: CallResult,
    },
}

impl Envelope {
    #[must_use]
    pub fn login(
        name: impl Into<String>,
        password: impl Into<String>,
        client_type: impl Into<String>,
    ) -> Self {
        Envelope::Login {
            name: name.into(),
            password: password.into(),
            lib_version: LIB_VERSION.to_string(),
            client_type: client_type.into(),
        }
    }

    #[must_use]
    pub fn login_result(success: bool) -> Self {
        Envelope::Result {
            result: if success { LOGIN_SUCCESS } else { LOGIN_FAIL }.to_string(),
        }
    }

    #[must_use]
    pub fn ping() -> Self {
        Envelope::KeepAlive {
            kind: PingKind::Ping,
        }
    }

    #[must_use]
    pub fn pong() -> Self {
        Envelope::KeepAlive {
            kind: PingKind::Pong,
        }
    }

    /// A chat message addressed to every other online client.
    #[must_use]
    pub fn chat(
        client: impl Into<String>,
        player: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Envelope::Message {
            client: client.into(),
            player: player.into(),
            message: message.into(),
            receiver: String::new(),
        }
    }

    /// A chat message addressed to a single client.
    #[must_use]
    pub fn direct_chat(
        client: impl Into<String>,
        player: impl Into<String>,
        message: impl Into<String>,
        receiver: impl Into<String>,
    ) -> Self {
        Envelope::Message {
            client: client.into(),
            player: player.into(),
            message: message.into(),
            receiver: receiver.into(),
        }
    }

    #[must_use]
    pub fn command_request(
        sender: impl Into<String>,
        receiver: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Envelope::Command {
            sender: sender.into(),
            receiver: receiver.into(),
            command: command.into(),
            result: CallResult::pending(),
        }
    }

    /// The reply to a `command` request: same shape, swapped endpoints,
    /// populated result.
    #[must_use]
    pub fn command_reply(
        sender: impl Into<String>,
        receiver: impl Into<String>,
        command: impl Into<String>,
        result: CallResult,
    ) -> Self {
        Envelope::Command {
            sender: sender.into(),
            receiver: receiver.into(),
            command: command.into(),
            result,
        }
    }

    #[must_use]
    pub fn api_request(
        sender: impl Into<String>,
        receiver: impl Into<String>,
        plugin: impl Into<String>,
        function: impl Into<String>,
        keys: Vec<Value>,
    ) -> Self {
        Envelope::Api {
            sender: sender.into(),
            receiver: receiver.into(),
            plugin: plugin.into(),
            function: function.into(),
            keys,
            result: CallResult::pending(),
        }
    }

    #[must_use]
    pub fn api_reply(
        sender: impl Into<String>,
        receiver: impl Into<String>,
        plugin: impl Into<String>,
        function: impl Into<String>,
        result: CallResult,
    ) -> Self {
        Envelope::Api {
            sender: sender.into(),
            receiver: receiver.into(),
            plugin: plugin.into(),
            function: function.into(),
            keys: Vec::new(),
            result,
        }
    }

    /// True for `command`/`api` envelopes carrying an answered result.
    #[must_use]
    pub fn is_reply(&self) -> bool {
        matches!(
            self,
            Envelope::Command { result, .. } | Envelope::Api { result, .. }
                if result.responded
        )
    }

    /// The wire `action` tag, for logging.
    #[must_use]
    pub fn action(&self) -> &'static str {
        match self {
            Envelope::Login { .. } => "login",
            Envelope::Result { .. } => "result",
            Envelope::KeepAlive { .. } => "keepAlive",
            Envelope::Message { .. } => "message",
            Envelope::Stop => "stop",
            Envelope::Command { .. } => "command",
            Envelope::Api { .. } => "api",
        }
    }

    /// Parse a JSON string into an `Envelope`.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed or the `action` tag is not
    /// recognized.
    pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize this envelope to JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
