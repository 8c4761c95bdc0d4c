//! The OpenWire wire-format codec.
//!
//! [`OpenWireFormat`] converts commands to frames and back under the flags
//! negotiated at handshake. A frame is an optional four-byte big-endian
//! length, a one-byte tag, and the body; tag zero is the explicit null
//! payload. Tight encoding runs the two-pass algorithm (stream bits first,
//! body second); loose encoding is single-pass.

pub mod boolean_stream;
pub mod marshallers;
pub mod nested;
pub mod primitives;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::codec::boolean_stream::BooleanStream;
use crate::codec::marshallers::{HIGHEST_VERSION, MarshallerRegistry};
use crate::codec::nested::MarshalContext;
use crate::codec::primitives::{DataReader, WireCache};
use crate::commands::{Command, Message, WireFormatInfo, types};
use crate::error::CodecError;

/// The feature set and version this peer proposes at handshake.
#[derive(Debug, Clone)]
pub struct WireFormatOptions {
    pub version: u32,
    pub stack_trace_enabled: bool,
    pub tcp_no_delay_enabled: bool,
    pub cache_enabled: bool,
    pub tight_encoding_enabled: bool,
    pub size_prefix_disabled: bool,
    pub cache_size: u16,
    pub max_inactivity_duration: i64,
    pub max_inactivity_duration_initial_delay: i64,
}

impl Default for WireFormatOptions {
    fn default() -> Self {
        Self {
            version: HIGHEST_VERSION,
            stack_trace_enabled: true,
            tcp_no_delay_enabled: true,
            cache_enabled: true,
            tight_encoding_enabled: true,
            size_prefix_disabled: false,
            cache_size: 1024,
            max_inactivity_duration: 30_000,
            max_inactivity_duration_initial_delay: 10_000,
        }
    }
}

impl WireFormatOptions {
    /// The `WireFormatInfo` advertising these preferences.
    pub fn to_info(&self) -> WireFormatInfo {
        WireFormatInfo {
            command_id: 0,
            response_required: false,
            version: self.version,
            stack_trace_enabled: self.stack_trace_enabled,
            tcp_no_delay_enabled: self.tcp_no_delay_enabled,
            cache_enabled: self.cache_enabled,
            tight_encoding_enabled: self.tight_encoding_enabled,
            size_prefix_disabled: self.size_prefix_disabled,
            cache_size: self.cache_size,
            max_inactivity_duration: self.max_inactivity_duration,
            max_inactivity_duration_initial_delay: self.max_inactivity_duration_initial_delay,
        }
    }
}

/// The stateful codec for one connection.
///
/// Starts conservative (loose encoding, no caching) so the handshake works
/// against any peer, then switches to the negotiated feature set when
/// [`OpenWireFormat::renegotiate`] runs.
#[derive(Debug)]
pub struct OpenWireFormat {
    preferred: WireFormatInfo,
    registry: MarshallerRegistry,
    ctx: MarshalContext,
    tight_encoding_enabled: bool,
    size_prefix_disabled: bool,
    max_inactivity_duration: i64,
    max_inactivity_duration_initial_delay: i64,
}

impl OpenWireFormat {
    /// A codec proposing `options`, not yet negotiated.
    pub fn new(options: &WireFormatOptions) -> Result<Self, CodecError> {
        let registry = MarshallerRegistry::for_version(options.version)?;
        let mut ctx = MarshalContext::new(options.version);
        ctx.stack_trace_enabled = options.stack_trace_enabled;
        Ok(Self {
            preferred: options.to_info(),
            registry,
            ctx,
            tight_encoding_enabled: false,
            size_prefix_disabled: false,
            max_inactivity_duration: options.max_inactivity_duration,
            max_inactivity_duration_initial_delay: options.max_inactivity_duration_initial_delay,
        })
    }

    /// The handshake frame to send to the peer.
    pub fn preferred_info(&self) -> WireFormatInfo {
        self.preferred.clone()
    }

    /// The currently effective wire version.
    pub fn version(&self) -> u32 {
        self.registry.version()
    }

    /// Whether the tight encoding is currently in effect.
    pub fn is_tight_encoding_enabled(&self) -> bool {
        self.tight_encoding_enabled
    }

    /// Whether frames currently omit the length prefix.
    pub fn is_size_prefix_disabled(&self) -> bool {
        self.size_prefix_disabled
    }

    /// The negotiated keep-alive interval in milliseconds.
    pub fn max_inactivity_duration(&self) -> i64 {
        self.max_inactivity_duration
    }

    /// The negotiated grace period after handshake in milliseconds.
    pub fn max_inactivity_duration_initial_delay(&self) -> i64 {
        self.max_inactivity_duration_initial_delay
    }

    /// Applies the peer's `WireFormatInfo` against our preferences.
    ///
    /// Boolean features take the pairwise AND, numeric options the pairwise
    /// minimum, and the effective version is the lower proposal. The
    /// marshaller table is swapped wholesale and both string caches reset.
    pub fn renegotiate(&mut self, remote: &WireFormatInfo) -> Result<(), CodecError> {
        let version = self.preferred.version.min(remote.version);
        self.registry = MarshallerRegistry::for_version(version)?;

        let stack_trace = self.preferred.stack_trace_enabled && remote.stack_trace_enabled;
        let cache = self.preferred.cache_enabled && remote.cache_enabled;
        let cache_size = self.preferred.cache_size.min(remote.cache_size);

        self.tight_encoding_enabled =
            self.preferred.tight_encoding_enabled && remote.tight_encoding_enabled;
        self.size_prefix_disabled =
            self.preferred.size_prefix_disabled && remote.size_prefix_disabled;
        self.max_inactivity_duration = self
            .preferred
            .max_inactivity_duration
            .min(remote.max_inactivity_duration);
        self.max_inactivity_duration_initial_delay = self
            .preferred
            .max_inactivity_duration_initial_delay
            .min(remote.max_inactivity_duration_initial_delay);

        self.ctx = MarshalContext {
            version,
            cache_enabled: cache,
            stack_trace_enabled: stack_trace,
            encode_cache: WireCache::new(cache_size.max(1)),
            decode_cache: WireCache::new(cache_size.max(1)),
        };

        debug!(
            version,
            tight = self.tight_encoding_enabled,
            cache,
            cache_size,
            "wire format negotiated"
        );
        Ok(())
    }

    /// Encodes one command as a frame.
    pub fn marshal(&mut self, command: &Command) -> Result<Bytes, CodecError> {
        let tag = command.data_structure_type();
        let marshaller = self.registry.lookup(tag)?;

        let mut out = BytesMut::new();
        if self.tight_encoding_enabled {
            let mut bs = BooleanStream::new();
            let body_size = marshaller.tight_marshal1(&mut self.ctx, command, &mut bs)?;
            let frame_size = 1 + bs.marshalled_size() + body_size;

            if !self.size_prefix_disabled {
                out.put_u32(frame_size as u32);
            }
            out.put_u8(tag);
            bs.reset_read();
            bs.marshal(&mut out);
            let body_start = out.len();
            marshaller.tight_marshal2(&mut self.ctx, command, &mut out, &mut bs)?;

            let written = out.len() - body_start;
            if written != body_size {
                return Err(CodecError::InvariantViolation {
                    estimated: body_size,
                    written,
                });
            }
        } else {
            let mut body = BytesMut::new();
            body.put_u8(tag);
            marshaller.loose_marshal(&mut self.ctx, command, &mut body)?;
            if !self.size_prefix_disabled {
                out.put_u32(body.len() as u32);
            }
            out.put_slice(&body);
        }
        Ok(out.freeze())
    }

    /// Encodes the explicit null payload.
    pub fn marshal_null(&self) -> Bytes {
        let mut out = BytesMut::new();
        if !self.size_prefix_disabled {
            out.put_u32(1);
        }
        out.put_u8(types::NULL);
        out.freeze()
    }

    /// Decodes one frame; `Ok(None)` is the explicit null payload.
    pub fn unmarshal(&mut self, frame: &[u8]) -> Result<Option<Command>, CodecError> {
        let mut reader = DataReader::new(frame);
        if !self.size_prefix_disabled {
            let declared = reader.read_u32()? as usize;
            if reader.remaining() < declared {
                return Err(CodecError::TruncatedFrame {
                    needed: declared - reader.remaining(),
                });
            }
        }
        let tag = reader.read_u8()?;
        if tag == types::NULL {
            return Ok(None);
        }
        let marshaller = self.registry.lookup(tag)?;
        let command = if self.tight_encoding_enabled {
            let mut bs = BooleanStream::unmarshal(&mut reader)?;
            marshaller.tight_unmarshal(&mut self.ctx, &mut reader, &mut bs)?
        } else {
            marshaller.loose_unmarshal(&mut self.ctx, &mut reader)?
        };
        Ok(Some(command))
    }

    /// Produces the cached wire form a message can carry for re-sends.
    ///
    /// The form is a complete tight frame with a length prefix, generated
    /// cache-free so the bytes stay valid however often they are replayed.
    pub fn to_marshalled_form(&self, message: &Message) -> Result<Vec<u8>, CodecError> {
        let command = Command::Message(Box::new(message.clone()));
        let tag = command.data_structure_type();
        let marshaller = self.registry.lookup(tag)?;

        let mut form_ctx = MarshalContext::new(self.registry.version());
        form_ctx.stack_trace_enabled = self.ctx.stack_trace_enabled;

        let mut bs = BooleanStream::new();
        let body_size = marshaller.tight_marshal1(&mut form_ctx, &command, &mut bs)?;
        let frame_size = 1 + bs.marshalled_size() + body_size;

        let mut out = BytesMut::new();
        out.put_u32(frame_size as u32);
        out.put_u8(tag);
        bs.reset_read();
        bs.marshal(&mut out);
        marshaller.tight_marshal2(&mut form_ctx, &command, &mut out, &mut bs)?;
        Ok(out.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::KeepAliveInfo;

    fn negotiated(options: WireFormatOptions) -> OpenWireFormat {
        let mut wf = OpenWireFormat::new(&options).unwrap();
        let remote = options.to_info();
        wf.renegotiate(&remote).unwrap();
        wf
    }

    #[test]
    fn negotiation_takes_pairwise_minima() {
        let mut wf = OpenWireFormat::new(&WireFormatOptions {
            version: 3,
            tight_encoding_enabled: true,
            cache_size: 1024,
            max_inactivity_duration: 30_000,
            ..WireFormatOptions::default()
        })
        .unwrap();

        let remote = WireFormatInfo {
            version: 2,
            tight_encoding_enabled: false,
            cache_size: 256,
            max_inactivity_duration: 10_000,
            ..WireFormatInfo::default()
        };
        wf.renegotiate(&remote).unwrap();

        assert_eq!(wf.version(), 2);
        assert!(!wf.is_tight_encoding_enabled());
        assert_eq!(wf.max_inactivity_duration(), 10_000);
    }

    #[test]
    fn null_payload_round_trips() {
        let mut wf = negotiated(WireFormatOptions::default());
        let frame = wf.marshal_null();
        assert_eq!(wf.unmarshal(&frame).unwrap(), None);
    }

    #[test]
    fn frame_size_prefix_covers_tag_and_body() {
        let mut wf = negotiated(WireFormatOptions {
            tight_encoding_enabled: false,
            ..WireFormatOptions::default()
        });
        let frame = wf
            .marshal(&Command::KeepAliveInfo(KeepAliveInfo::default()))
            .unwrap();
        let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(declared, frame.len() - 4);
    }

    #[test]
    fn size_prefix_can_be_negotiated_off() {
        let mut wf = negotiated(WireFormatOptions {
            size_prefix_disabled: true,
            tight_encoding_enabled: false,
            ..WireFormatOptions::default()
        });
        assert!(wf.is_size_prefix_disabled());
        let frame = wf
            .marshal(&Command::KeepAliveInfo(KeepAliveInfo::default()))
            .unwrap();
        assert_eq!(frame[0], types::KEEP_ALIVE_INFO);
        let decoded = wf.unmarshal(&frame).unwrap();
        assert!(matches!(decoded, Some(Command::KeepAliveInfo(_))));
    }

    #[test]
    fn truncated_frames_are_reported() {
        let mut wf = negotiated(WireFormatOptions::default());
        let frame = wf
            .marshal(&Command::KeepAliveInfo(KeepAliveInfo {
                command_id: 7,
                response_required: false,
            }))
            .unwrap();
        let cut = &frame[..frame.len() - 1];
        assert!(matches!(
            wf.unmarshal(cut),
            Err(CodecError::TruncatedFrame { .. })
        ));
    }
}
