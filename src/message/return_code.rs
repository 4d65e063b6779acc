//! Reply return codes.
//!
//! Codes are grouped by hundreds: 0-99 success and warnings, 100s broker
//! errors, 200s device errors, 300s message errors, 400s client errors.
//! Unknown values are carried through unchanged so that codes defined by
//! other services survive a round trip.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Numeric status carried on every reply. `0` is success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReturnCode(u32);

macro_rules! return_codes {
    ($( $(#[$doc:meta])* $konst:ident = $value:literal, $name:literal, $description:literal; )*) => {
        impl ReturnCode {
            $(
                $(#[$doc])*
                pub const $konst: ReturnCode = ReturnCode($value);
            )*

            /// Short snake_case name, or `"unknown"` for codes outside the table.
            pub fn name(&self) -> &'static str {
                match self.0 {
                    $( $value => $name, )*
                    _ => "unknown",
                }
            }

            /// Human-readable description.
            pub fn description(&self) -> &'static str {
                match self.0 {
                    $( $value => $description, )*
                    _ => "Unknown return code",
                }
            }
        }
    };
}

return_codes! {
    SUCCESS = 0, "success", "Success";
    WARNING_NO_ACTION_TAKEN = 1, "warning_no_action_taken", "No Action Taken";
    WARNING_OFFLINE = 4, "warning_offline", "Offline";

    AMQP_ERROR = 100, "amqp_error", "Generic AMQP Error";
    AMQP_ERROR_BROKER_CONNECTION = 101, "amqp_error_broker_connection", "Error Connecting to Broker";
    /// No endpoint is bound to the routing key.
    AMQP_ERROR_ROUTINGKEY_NOTFOUND = 102, "amqp_error_routingkey_notfound", "Routing Key Not Found";

    DEVICE_ERROR = 200, "device_error", "Generic Device Error";
    DEVICE_ERROR_CONNECTION = 201, "device_error_connection", "Error Connecting to Device";
    DEVICE_ERROR_NO_RESP = 202, "device_error_no_resp", "No Response from Device";

    MESSAGE_ERROR = 300, "message_error", "Generic Message Error";
    MESSAGE_ERROR_NO_ENCODING = 301, "message_error_no_encoding", "Message Encoding Not Specified";
    MESSAGE_ERROR_DECODING_FAIL = 302, "message_error_decoding_fail", "Message Decoding Failed";
    MESSAGE_ERROR_BAD_PAYLOAD = 303, "message_error_bad_payload", "Bad Payload";
    MESSAGE_ERROR_INVALID_VALUE = 304, "message_error_invalid_value", "Invalid Value";
    MESSAGE_ERROR_TIMEOUT = 305, "message_error_timeout", "Timeout Handling Message";
    /// The endpoint does not support the requested operation.
    MESSAGE_ERROR_INVALID_METHOD = 306, "message_error_invalid_method", "Invalid Method";
    MESSAGE_ERROR_ACCESS_DENIED = 307, "message_error_access_denied", "Access Denied";
    MESSAGE_ERROR_INVALID_KEY = 308, "message_error_invalid_key", "Invalid Key";
    MESSAGE_ERROR_INVALID_SPECIFIER = 310, "message_error_invalid_specifier", "Invalid Specifier";

    CLIENT_ERROR = 400, "client_error", "Generic Client Error";
    CLIENT_ERROR_INVALID_REQUEST = 401, "client_error_invalid_request", "Invalid Request";
    CLIENT_ERROR_HANDLING_REPLY = 402, "client_error_handling_reply", "Error Handling Reply";
    CLIENT_ERROR_UNABLE_TO_SEND = 403, "client_error_unable_to_send", "Unable to Send";
    CLIENT_ERROR_TIMEOUT = 404, "client_error_timeout", "Client Timeout";

    /// A handler panicked while processing the request.
    UNHANDLED_EXCEPTION = 999, "unhandled_exception", "Unhandled Exception";
}

impl ReturnCode {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn value(&self) -> u32 {
        self.0
    }

    pub const fn is_success(&self) -> bool {
        self.0 == 0
    }

    /// Warnings (1-99) indicate the request was accepted but not fully acted on.
    pub const fn is_warning(&self) -> bool {
        self.0 > 0 && self.0 < 100
    }

    pub const fn is_error(&self) -> bool {
        self.0 >= 100
    }
}

impl Default for ReturnCode {
    fn default() -> Self {
        Self::SUCCESS
    }
}

impl From<u32> for ReturnCode {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<ReturnCode> for u32 {
    fn from(code: ReturnCode) -> Self {
        code.0
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.0)
    }
}
