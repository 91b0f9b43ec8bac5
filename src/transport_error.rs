use std::fmt;

use bytes::{Buf, BufMut};

use crate::coding::{self, BufExt, BufMutExt};
use crate::frame::FrameType;

/// Transport-level errors occur when a peer violates the protocol specification
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TransportError {
    /// Type of error
    pub code: TransportErrorCode,
    /// Frame type that triggered the error
    pub frame: Option<FrameType>,
    /// Human-readable explanation of the reason
    pub reason: String,
}

impl TransportError {
    pub(crate) fn new(code: TransportErrorCode, reason: String) -> Self {
        Self {
            code,
            frame: None,
            reason,
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ty = self.code.to_string();
        let frame = match self.frame {
            Some(frame) => format!(" in {frame}"),
            None => String::new(),
        };
        let reason = match self.reason.as_str() {
            "" => String::new(),
            reason => format!(": {reason}"),
        };
        write!(f, "{ty}{frame}{reason}")
    }
}

impl std::error::Error for TransportError {}

impl From<TransportErrorCode> for TransportError {
    fn from(x: TransportErrorCode) -> Self {
        Self {
            code: x,
            frame: None,
            reason: "".to_string(),
        }
    }
}

/// Transport-level error code as encoded in CONNECTION_CLOSE frames
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct TransportErrorCode(u64);

impl TransportErrorCode {
    /// Create QUIC error code from a TLS alert code
    pub fn crypto(code: u8) -> Self {
        Self(0x100 | u64::from(code))
    }
}

impl coding::Codec for TransportErrorCode {
    fn decode<B: Buf>(buf: &mut B) -> coding::Result<Self> {
        Ok(Self(buf.get_var()?))
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write_var(self.0)
    }
}

impl From<TransportErrorCode> for u64 {
    fn from(x: TransportErrorCode) -> Self {
        x.0
    }
}

macro_rules! errors {
    {$($name:ident($val:expr) $desc:expr;)*} => {
        impl TransportError {
            $(
                #[allow(non_snake_case, unused)]
                pub(crate) fn $name<T>(reason: T) -> Self where T: Into<String> {
                    Self {
                        code: TransportErrorCode::$name,
                        frame: None,
                        reason: reason.into(),
                    }
                }
            )*
        }

        impl TransportErrorCode {
            $(#[doc = $desc] pub const $name: Self = Self($val);)*
        }

        impl fmt::Debug for TransportErrorCode {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str(stringify!($name)),)*
                    x if (0x100..0x200).contains(&x) => write!(f, "TransportErrorCode::crypto({:02x})", self.0 as u8),
                    x => write!(f, "TransportErrorCode({x:04x})"),
                }
            }
        }

        impl fmt::Display for TransportErrorCode {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str($desc),)*
                    // We don't know the significance of specific TLS alerts
                    _ if (0x100..0x200).contains(&self.0) => f.write_str("the cryptographic handshake failed"),
                    _ => f.write_str("unknown error"),
                }
            }
        }
    }
}

errors! {
    NO_ERROR(0x0) "the connection is being closed abruptly in the absence of any error";
    INTERNAL_ERROR(0x1) "the endpoint encountered an internal error and cannot continue with the connection";
    CONNECTION_REFUSED(0x2) "the server refused to accept a new connection";
    FLOW_CONTROL_ERROR(0x3) "received more data than permitted in advertised data limits";
    STREAM_LIMIT_ERROR(0x4) "received a frame for a stream identifier that exceeded advertised the stream limit for the corresponding stream type";
    STREAM_STATE_ERROR(0x5) "received a frame for a stream that was not in a state that permitted that frame";
    FINAL_SIZE_ERROR(0x6) "received a STREAM frame or a RESET_STREAM frame containing a different final size to the one already established";
    FRAME_ENCODING_ERROR(0x7) "received a frame that was badly formatted";
    TRANSPORT_PARAMETER_ERROR(0x8) "received transport parameters that were badly formatted, included an invalid value, or were absent even though they are mandatory";
    CONNECTION_ID_LIMIT_ERROR(0x9) "the number of connection IDs provided by the peer exceeds the advertised active_connection_id_limit";
    PROTOCOL_VIOLATION(0xA) "detected an error with protocol compliance that was not covered by more specific error codes";
    INVALID_TOKEN(0xB) "received an invalid Retry Token in a client Initial";
    APPLICATION_ERROR(0xC) "the application or application protocol caused the connection to be closed during the handshake";
    CRYPTO_BUFFER_EXCEEDED(0xD) "received more data in CRYPTO frames than can be buffered";
    KEY_UPDATE_ERROR(0xE) "key update error";
    AEAD_LIMIT_REACHED(0xF) "the endpoint has reached the confidentiality or integrity limit for the AEAD algorithm";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_roundtrip() {
        let mut buf = Vec::new();
        use crate::coding::Codec;
        TransportErrorCode::FLOW_CONTROL_ERROR.encode(&mut buf);
        let mut r = std::io::Cursor::new(&buf[..]);
        assert_eq!(
            TransportErrorCode::decode(&mut r).unwrap(),
            TransportErrorCode::FLOW_CONTROL_ERROR
        );
    }

    #[test]
    fn crypto_range() {
        let code = TransportErrorCode::crypto(0x28);
        assert_eq!(u64::from(code), 0x128);
        assert_eq!(format!("{code}"), "the cryptographic handshake failed");
    }
}
