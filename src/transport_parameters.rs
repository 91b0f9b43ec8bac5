//! QUIC connection transport parameters
//!
//! The `TransportParameters` type is used to represent the transport
//! parameters negotiated by peers while establishing a connection. The
//! engine neither sends nor receives them itself: the embedder's TLS stack
//! carries the encoded blob in its handshake messages and hands the peer's
//! parameters back in via `Connection::set_peer_params`.

use std::{
    mem,
    net::{IpAddr, SocketAddr},
};

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::cid::{ConnectionId, ResetToken};
use crate::coding::{BufExt, BufMutExt, UnexpectedEnd};
use crate::transport_error::TransportError;
use crate::{Side, VarInt};

// Apply a given macro to a list of all the transport parameters having
// integer types, along with their codes and default values. Using this
// helps us avoid error-prone duplication of the contained information
// across decoding, encoding, and the `Default` impl.
macro_rules! apply_params {
    ($macro:ident) => {
        $macro! {
            // #[doc] name (id) = default,
            /// Milliseconds, disabled when zero
            max_idle_timeout(0x0001) = 0,
            /// Limits the size of UDP payloads that the endpoint is willing to receive
            max_udp_payload_size(0x0003) = 65527,
            /// Initial value for the maximum amount of data that can be sent on the connection
            initial_max_data(0x0004) = 0,
            /// Initial flow control limit for locally-initiated bidirectional streams
            initial_max_stream_data_bidi_local(0x0005) = 0,
            /// Initial flow control limit for peer-initiated bidirectional streams
            initial_max_stream_data_bidi_remote(0x0006) = 0,
            /// Initial flow control limit for unidirectional streams
            initial_max_stream_data_uni(0x0007) = 0,
            /// Initial maximum number of bidirectional streams the peer may initiate
            initial_max_streams_bidi(0x0008) = 0,
            /// Initial maximum number of unidirectional streams the peer may initiate
            initial_max_streams_uni(0x0009) = 0,
            /// Exponent used to decode the ACK Delay field in the ACK frame
            ack_delay_exponent(0x000a) = 3,
            /// Maximum amount of time in milliseconds by which the endpoint will delay sending acknowledgments
            max_ack_delay(0x000b) = 25,
            /// Maximum number of connection IDs from the peer that an endpoint is willing to store
            active_connection_id_limit(0x000e) = 2,
        }
    };
}

macro_rules! make_struct {
    {$($(#[$doc:meta])* $name:ident ($code:expr) = $default:expr,)*} => {
        /// Transport parameters used to negotiate connection-level preferences between peers
        #[derive(Debug, Copy, Clone, Eq, PartialEq)]
        pub struct TransportParameters {
            $($(#[$doc])* pub $name : VarInt,)*

            /// Endpoint does not support active connection migration
            pub disable_active_migration: bool,
            /// The value of the Destination Connection ID field from the first Initial packet sent by the client
            pub original_dst_cid: Option<ConnectionId>,
            /// The value that the endpoint included in the Source Connection ID field of the first Initial packet it sent
            pub initial_src_cid: Option<ConnectionId>,
            /// The value of the Source Connection ID field from the server's Retry packet
            pub retry_src_cid: Option<ConnectionId>,
            /// Token used by the client to verify a stateless reset from the server
            pub stateless_reset_token: Option<ResetToken>,
            /// The server's preferred address for communication after handshake completion
            pub preferred_address: Option<PreferredAddress>,
        }

        impl Default for TransportParameters {
            /// Standard defaults, used if the peer does not supply a given parameter.
            fn default() -> Self {
                Self {
                    $($name: VarInt::from_u32($default),)*

                    disable_active_migration: false,
                    original_dst_cid: None,
                    initial_src_cid: None,
                    retry_src_cid: None,
                    stateless_reset_token: None,
                    preferred_address: None,
                }
            }
        }
    }
}

apply_params!(make_struct);

/// A server's preferred address
///
/// This is communicated as a transport parameter during TLS session
/// establishment.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PreferredAddress {
    pub address_v4: Option<SocketAddr>,
    pub address_v6: Option<SocketAddr>,
    pub connection_id: ConnectionId,
    pub stateless_reset_token: ResetToken,
}

impl PreferredAddress {
    fn wire_size(&self) -> u16 {
        4 + 2 + 16 + 2 + 1 + self.connection_id.len() as u16 + 16
    }

    fn write<W: BufMut>(&self, w: &mut W) {
        w.put_slice(&match self.address_v4 {
            Some(SocketAddr::V4(x)) => x.ip().octets(),
            _ => [0; 4],
        });
        w.put_u16(self.address_v4.map_or(0, |x| x.port()));
        w.put_slice(&match self.address_v6 {
            Some(SocketAddr::V6(x)) => x.ip().octets(),
            _ => [0; 16],
        });
        w.put_u16(self.address_v6.map_or(0, |x| x.port()));
        w.put_u8(self.connection_id.len() as u8);
        w.put_slice(&self.connection_id);
        w.put_slice(&self.stateless_reset_token);
    }

    fn read<R: Buf>(r: &mut R) -> Result<Self, Error> {
        if r.remaining() < 4 + 2 + 16 + 2 {
            return Err(Error::Malformed);
        }
        let mut ip_v4 = [0; 4];
        r.copy_to_slice(&mut ip_v4);
        let port_v4 = r.get::<u16>()?;
        let mut ip_v6 = [0; 16];
        r.copy_to_slice(&mut ip_v6);
        let port_v6 = r.get::<u16>()?;
        let cid = ConnectionId::decode_prefixed(r)?;
        let token = ResetToken::decode(r)?;
        let address_v4 = if ip_v4 == [0; 4] && port_v4 == 0 {
            None
        } else {
            Some(SocketAddr::new(IpAddr::V4(ip_v4.into()), port_v4))
        };
        let address_v6 = if ip_v6 == [0; 16] && port_v6 == 0 {
            None
        } else {
            Some(SocketAddr::new(IpAddr::V6(ip_v6.into()), port_v6))
        };
        if address_v4.is_none() && address_v6.is_none() {
            return Err(Error::IllegalValue);
        }
        Ok(Self {
            address_v4,
            address_v6,
            connection_id: cid,
            stateless_reset_token: token,
        })
    }
}

/// Errors encountered while decoding `TransportParameters`
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub(crate) enum Error {
    /// Parameter had illegal value
    #[error("parameter had illegal value")]
    IllegalValue,
    /// Parameters were malformed
    #[error("parameters were malformed")]
    Malformed,
}

impl From<Error> for TransportError {
    fn from(e: Error) -> Self {
        match e {
            Error::IllegalValue => Self::TRANSPORT_PARAMETER_ERROR("illegal value"),
            Error::Malformed => Self::TRANSPORT_PARAMETER_ERROR("malformed"),
        }
    }
}

impl From<UnexpectedEnd> for Error {
    fn from(_: UnexpectedEnd) -> Self {
        Self::Malformed
    }
}

impl TransportParameters {
    /// Encode `TransportParameters` into buffer, as carried in the TLS
    /// extension
    pub fn write<W: BufMut>(&self, w: &mut W) {
        macro_rules! write_params {
            {$($(#[$doc:meta])* $name:ident ($code:expr) = $default:expr,)*} => {
                $(
                    if self.$name.into_inner() != $default {
                        w.write_var($code);
                        w.write(VarInt::try_from(self.$name.size()).unwrap());
                        w.write(self.$name);
                    }
                )*
            }
        }
        apply_params!(write_params);

        if let Some(ref x) = self.stateless_reset_token {
            w.write_var(0x02);
            w.write_var(16);
            w.put_slice(x);
        }

        if self.disable_active_migration {
            w.write_var(0x0c);
            w.write_var(0);
        }

        if let Some(ref x) = self.preferred_address {
            w.write_var(0x0d);
            w.write_var(x.wire_size() as u64);
            x.write(w);
        }

        for &(tag, cid) in &[
            (0x00, &self.original_dst_cid),
            (0x0f, &self.initial_src_cid),
            (0x10, &self.retry_src_cid),
        ] {
            if let Some(ref cid) = *cid {
                w.write_var(tag);
                w.write_var(cid.len() as u64);
                w.put_slice(cid);
            }
        }
    }

    /// Decode `TransportParameters` received from the given `Side` of a
    /// connection
    pub fn read<R: Buf>(side: Side, r: &mut R) -> Result<Self, TransportError> {
        Self::read_inner(side, r).map_err(Into::into)
    }

    fn read_inner<R: Buf>(side: Side, r: &mut R) -> Result<Self, Error> {
        // Initialize to protocol-specified defaults
        let mut params = Self::default();

        // State to check for duplicate transport parameters.
        macro_rules! param_state {
            {$($(#[$doc:meta])* $name:ident ($code:expr) = $default:expr,)*} => {{
                struct ParamState {
                    $($name: bool,)*
                }

                ParamState {
                    $($name: false,)*
                }
            }}
        }
        let mut got = apply_params!(param_state);

        while r.has_remaining() {
            let id = r.get_var()?;
            let len = r.get_var()?;
            if (r.remaining() as u64) < len {
                return Err(Error::Malformed);
            }
            let len = len as usize;

            match id {
                0x00 => decode_cid(len, &mut params.original_dst_cid, r)?,
                0x02 => {
                    if len != 16 || params.stateless_reset_token.is_some() {
                        return Err(Error::Malformed);
                    }
                    params.stateless_reset_token = Some(ResetToken::decode(r)?);
                }
                0x0c => {
                    if len != 0 || params.disable_active_migration {
                        return Err(Error::Malformed);
                    }
                    params.disable_active_migration = true;
                }
                0x0d => {
                    if params.preferred_address.is_some() {
                        return Err(Error::Malformed);
                    }
                    params.preferred_address = Some(PreferredAddress::read(&mut r.take(len))?);
                }
                0x0f => decode_cid(len, &mut params.initial_src_cid, r)?,
                0x10 => decode_cid(len, &mut params.retry_src_cid, r)?,
                _ => {
                    macro_rules! parse {
                        {$($(#[$doc:meta])* $name:ident ($code:expr) = $default:expr,)*} => {
                            match id {
                                $($code => {
                                    let value = r.get::<VarInt>()?;
                                    if len != value.size() || mem::replace(&mut got.$name, true) {
                                        return Err(Error::Malformed);
                                    }
                                    params.$name = value;
                                })*
                                // Ignore unknown parameters
                                _ => r.advance(len),
                            }
                        }
                    }
                    apply_params!(parse);
                }
            }
        }

        // Semantic validation
        if params.ack_delay_exponent.into_inner() > 20
            || params.max_ack_delay.into_inner() >= 1 << 14
            || params.max_udp_payload_size.into_inner() < 1200
            || params.active_connection_id_limit.into_inner() < 2
            // Server-only parameters must not be sent by clients
            || (side.is_server()
                && (params.original_dst_cid.is_some()
                    || params.preferred_address.is_some()
                    || params.retry_src_cid.is_some()
                    || params.stateless_reset_token.is_some()))
        {
            return Err(Error::IllegalValue);
        }

        Ok(params)
    }
}

fn decode_cid<R: Buf>(
    len: usize,
    value: &mut Option<ConnectionId>,
    r: &mut R,
) -> Result<(), Error> {
    if len > crate::MAX_CID_SIZE || value.is_some() || r.remaining() < len {
        return Err(Error::Malformed);
    }
    *value = Some(ConnectionId::decode_fixed(r, len)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coding() {
        let mut buf = Vec::new();
        let params = TransportParameters {
            initial_max_data: VarInt::from_u32(42),
            initial_max_streams_bidi: VarInt::from_u32(13),
            initial_src_cid: Some(ConnectionId::new(&[0xab; 8])),
            stateless_reset_token: Some(ResetToken::from([0xcd; 16])),
            preferred_address: Some(PreferredAddress {
                address_v4: Some(SocketAddr::new([127, 0, 0, 1].into(), 42)),
                address_v6: None,
                connection_id: ConnectionId::new(&[0xde, 0xad, 0xbe, 0xef]),
                stateless_reset_token: ResetToken::from([0xff; 16]),
            }),
            ..TransportParameters::default()
        };
        params.write(&mut buf);
        assert_eq!(
            TransportParameters::read(Side::Client, &mut buf.as_slice()).unwrap(),
            params
        );
    }

    #[test]
    fn read_semantic_validation() {
        #[allow(clippy::type_complexity)]
        let illegal_params_builders: Vec<Box<dyn FnMut(&mut TransportParameters)>> = vec![
            Box::new(|t| {
                // ack_delay_exponent out of range
                t.ack_delay_exponent = VarInt::from_u32(21);
            }),
            Box::new(|t| {
                // max_udp_payload_size too small
                t.max_udp_payload_size = VarInt::from_u32(1199);
            }),
            Box::new(|t| {
                // active_connection_id_limit below required floor
                t.active_connection_id_limit = VarInt::from_u32(1);
            }),
        ];

        for mut builder in illegal_params_builders {
            let mut t = TransportParameters::default();
            builder(&mut t);
            let mut buf = Vec::new();
            t.write(&mut buf);
            assert_eq!(
                TransportParameters::read(Side::Server, &mut buf.as_slice()),
                Err(Error::IllegalValue.into())
            );
        }
    }

    #[test]
    fn server_only_params_rejected_from_client() {
        let params = TransportParameters {
            stateless_reset_token: Some(ResetToken::from([0; 16])),
            ..TransportParameters::default()
        };
        let mut buf = Vec::new();
        params.write(&mut buf);
        assert!(TransportParameters::read(Side::Server, &mut buf.as_slice()).is_err());
    }

    #[test]
    fn duplicate_param_rejected() {
        let mut buf = Vec::new();
        for _ in 0..2 {
            buf.write_var(0x04);
            buf.write_var(1);
            buf.write_var(42);
        }
        assert_eq!(
            TransportParameters::read(Side::Client, &mut buf.as_slice()),
            Err(Error::Malformed.into())
        );
    }
}
