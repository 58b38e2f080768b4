//! Wrap and unwrap transforms applied to every frame crossing a channel.
//!
//! A wrap turns the gateway's JSON into the bytes a system understands; an
//! unwrap does the reverse. Both receive the system name as the second
//! argument so one function can serve several systems.

use std::sync::Arc;

use serde_json::Value;

use crate::error::{ChannelError, ChannelResult};

/// Error type returned by host-supplied functions.
pub type HostError = Box<dyn std::error::Error + Send + Sync>;

/// Converts outbound JSON into the bytes written to a system.
pub type WrapFn = Arc<dyn Fn(&Value, &str) -> Result<Vec<u8>, HostError> + Send + Sync>;

/// Converts bytes read from a system into JSON.
pub type UnwrapFn = Arc<dyn Fn(&[u8], &str) -> Result<Value, HostError> + Send + Sync>;

/// Default wrap: strings are written as-is, everything else as JSON text.
#[must_use]
pub fn json_wrap() -> WrapFn {
    Arc::new(|value, _system| match value {
        Value::String(text) => Ok(text.as_bytes().to_vec()),
        other => Ok(serde_json::to_vec(other)?),
    })
}

/// Default unwrap: frames are parsed as JSON, falling back to a string.
#[must_use]
pub fn json_unwrap() -> UnwrapFn {
    Arc::new(|bytes, _system| {
        Ok(serde_json::from_slice(bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned())))
    })
}

/// Check that a system name can be used as an address-book key and a URL
/// path segment.
///
/// # Errors
///
/// Returns [`ChannelError::InvalidSystemName`] for empty names and names
/// containing whitespace, `/` or control characters.
pub fn validate_system_name(name: &str) -> ChannelResult<()> {
    let bad = name.is_empty()
        || name
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || c == '/');
    if bad {
        return Err(ChannelError::InvalidSystemName(name.to_string()));
    }
    Ok(())
}
