//! Nested data-structure encoders used inside command bodies.
//!
//! A nested object writes a presence flag (a stream bit in tight mode, a
//! full byte in loose mode), then its one-byte tag, then its body. Property
//! maps and message bodies are self-contained byte sections shared verbatim
//! by both encodings, so a body serialized once stays valid across flag
//! changes.

use bytes::{BufMut, BytesMut};

use crate::codec::boolean_stream::BooleanStream;
use crate::codec::primitives::{
    DataReader, WireCache, loose_marshal_string, loose_unmarshal_string, tight_marshal_long1,
    tight_marshal_long2, tight_marshal_string1, tight_marshal_string2, tight_unmarshal_long,
    tight_unmarshal_string,
};
use crate::commands::{
    BrokerError, ConnectionId, ConsumerId, Destination, DestinationKind, LocalTransactionId,
    MessageId, PrimitiveValue, ProducerId, RemovedObject, SessionId, types,
};
use crate::error::CodecError;

/// Flags and caches the marshallers need while walking a command tree.
#[derive(Debug)]
pub struct MarshalContext {
    pub version: u32,
    pub cache_enabled: bool,
    pub stack_trace_enabled: bool,
    pub encode_cache: WireCache,
    pub decode_cache: WireCache,
}

impl MarshalContext {
    /// A context for the given version with caching and traces off.
    pub fn new(version: u32) -> Self {
        Self {
            version,
            cache_enabled: false,
            stack_trace_enabled: true,
            encode_cache: WireCache::new(1024),
            decode_cache: WireCache::new(1024),
        }
    }
}

// ---------------------------------------------------------------------------
// Cached strings
// ---------------------------------------------------------------------------

/// Pass one for a string that may ride the negotiated cache.
///
/// With caching off this degenerates to a plain tight string. With caching
/// on, a hit costs two index bytes; a miss carries the index assignment plus
/// the inline bytes so the peer can mirror it.
pub fn tight_marshal_cached_string1(
    ctx: &mut MarshalContext,
    value: Option<&str>,
    bs: &mut BooleanStream,
) -> usize {
    if !ctx.cache_enabled {
        return tight_marshal_string1(value, bs);
    }
    bs.write_boolean(value.is_some());
    let Some(s) = value else {
        return 0;
    };
    let hit = ctx.encode_cache.index_of(s).is_some();
    bs.write_boolean(hit);
    if hit {
        2
    } else {
        let short = s.len() < u16::MAX as usize;
        bs.write_boolean(short);
        2 + if short { 2 + s.len() } else { 4 + s.len() }
    }
}

/// Pass two for a cached string; performs the assignment on a miss.
pub fn tight_marshal_cached_string2(
    ctx: &mut MarshalContext,
    value: Option<&str>,
    out: &mut BytesMut,
    bs: &mut BooleanStream,
) -> Result<(), CodecError> {
    if !ctx.cache_enabled {
        return tight_marshal_string2(value, out, bs);
    }
    if !bs.read_boolean()? {
        return Ok(());
    }
    let s = value.unwrap_or_default();
    if bs.read_boolean()? {
        let index = ctx
            .encode_cache
            .index_of(s)
            .ok_or(CodecError::UnknownCacheIndex { index: 0 })?;
        out.put_u16(index);
    } else {
        let index = ctx.encode_cache.assign(s);
        out.put_u16(index);
        if bs.read_boolean()? {
            out.put_u16(s.len() as u16);
        } else {
            out.put_u32(s.len() as u32);
        }
        out.put_slice(s.as_bytes());
    }
    Ok(())
}

/// Decodes a cached string, learning any in-band assignment.
pub fn tight_unmarshal_cached_string(
    ctx: &mut MarshalContext,
    reader: &mut DataReader<'_>,
    bs: &mut BooleanStream,
) -> Result<Option<String>, CodecError> {
    if !ctx.cache_enabled {
        return tight_unmarshal_string(reader, bs);
    }
    if !bs.read_boolean()? {
        return Ok(None);
    }
    if bs.read_boolean()? {
        let index = reader.read_u16()?;
        return Ok(Some(ctx.decode_cache.value_of(index)?.to_string()));
    }
    let index = reader.read_u16()?;
    let len = if bs.read_boolean()? {
        reader.read_u16()? as usize
    } else {
        reader.read_u32()? as usize
    };
    let value = String::from_utf8(reader.read_bytes(len)?.to_vec())
        .map_err(|_| CodecError::InvalidUtf8)?;
    ctx.decode_cache.learn(index, &value);
    Ok(Some(value))
}

// ---------------------------------------------------------------------------
// Nested ids
// ---------------------------------------------------------------------------

pub fn tight_marshal_connection_id1(
    value: Option<&ConnectionId>,
    bs: &mut BooleanStream,
) -> usize {
    bs.write_boolean(value.is_some());
    match value {
        None => 0,
        Some(id) => 1 + tight_marshal_string1(Some(id.value()), bs),
    }
}

pub fn tight_marshal_connection_id2(
    value: Option<&ConnectionId>,
    out: &mut BytesMut,
    bs: &mut BooleanStream,
) -> Result<(), CodecError> {
    if !bs.read_boolean()? {
        return Ok(());
    }
    out.put_u8(types::CONNECTION_ID);
    tight_marshal_string2(value.map(ConnectionId::value), out, bs)
}

pub fn tight_unmarshal_connection_id(
    reader: &mut DataReader<'_>,
    bs: &mut BooleanStream,
) -> Result<Option<ConnectionId>, CodecError> {
    if !bs.read_boolean()? {
        return Ok(None);
    }
    expect_tag(reader, types::CONNECTION_ID)?;
    let value = tight_unmarshal_string(reader, bs)?.unwrap_or_default();
    Ok(Some(ConnectionId::from_value(value)))
}

pub fn loose_marshal_connection_id(value: Option<&ConnectionId>, out: &mut BytesMut) {
    out.put_u8(u8::from(value.is_some()));
    if let Some(id) = value {
        out.put_u8(types::CONNECTION_ID);
        loose_marshal_string(Some(id.value()), out);
    }
}

pub fn loose_unmarshal_connection_id(
    reader: &mut DataReader<'_>,
) -> Result<Option<ConnectionId>, CodecError> {
    if !reader.read_bool()? {
        return Ok(None);
    }
    expect_tag(reader, types::CONNECTION_ID)?;
    let value = loose_unmarshal_string(reader)?.unwrap_or_default();
    Ok(Some(ConnectionId::from_value(value)))
}

pub fn tight_marshal_session_id1(value: Option<&SessionId>, bs: &mut BooleanStream) -> usize {
    bs.write_boolean(value.is_some());
    match value {
        None => 0,
        Some(id) => {
            1 + tight_marshal_string1(Some(id.connection_id.value()), bs)
                + tight_marshal_long1(id.value, bs)
        }
    }
}

pub fn tight_marshal_session_id2(
    value: Option<&SessionId>,
    out: &mut BytesMut,
    bs: &mut BooleanStream,
) -> Result<(), CodecError> {
    if !bs.read_boolean()? {
        return Ok(());
    }
    let id = value.ok_or(CodecError::BooleanStreamExhausted)?;
    out.put_u8(types::SESSION_ID);
    tight_marshal_string2(Some(id.connection_id.value()), out, bs)?;
    tight_marshal_long2(id.value, out, bs)
}

pub fn tight_unmarshal_session_id(
    reader: &mut DataReader<'_>,
    bs: &mut BooleanStream,
) -> Result<Option<SessionId>, CodecError> {
    if !bs.read_boolean()? {
        return Ok(None);
    }
    expect_tag(reader, types::SESSION_ID)?;
    let connection = tight_unmarshal_string(reader, bs)?.unwrap_or_default();
    let value = tight_unmarshal_long(reader, bs)?;
    Ok(Some(SessionId {
        connection_id: ConnectionId::from_value(connection),
        value,
    }))
}

pub fn loose_marshal_session_id(value: Option<&SessionId>, out: &mut BytesMut) {
    out.put_u8(u8::from(value.is_some()));
    if let Some(id) = value {
        out.put_u8(types::SESSION_ID);
        loose_marshal_string(Some(id.connection_id.value()), out);
        out.put_i64(id.value);
    }
}

pub fn loose_unmarshal_session_id(
    reader: &mut DataReader<'_>,
) -> Result<Option<SessionId>, CodecError> {
    if !reader.read_bool()? {
        return Ok(None);
    }
    expect_tag(reader, types::SESSION_ID)?;
    let connection = loose_unmarshal_string(reader)?.unwrap_or_default();
    let value = reader.read_i64()?;
    Ok(Some(SessionId {
        connection_id: ConnectionId::from_value(connection),
        value,
    }))
}

macro_rules! session_scoped_id_codec {
    ($ty:ident, $tag:expr, $t1:ident, $t2:ident, $tun:ident, $l:ident, $lun:ident) => {
        pub fn $t1(value: Option<&$ty>, bs: &mut BooleanStream) -> usize {
            bs.write_boolean(value.is_some());
            match value {
                None => 0,
                Some(id) => {
                    1 + tight_marshal_string1(Some(id.connection_id.value()), bs)
                        + tight_marshal_long1(id.session_id, bs)
                        + tight_marshal_long1(id.value, bs)
                }
            }
        }

        pub fn $t2(
            value: Option<&$ty>,
            out: &mut BytesMut,
            bs: &mut BooleanStream,
        ) -> Result<(), CodecError> {
            if !bs.read_boolean()? {
                return Ok(());
            }
            let id = value.ok_or(CodecError::BooleanStreamExhausted)?;
            out.put_u8($tag);
            tight_marshal_string2(Some(id.connection_id.value()), out, bs)?;
            tight_marshal_long2(id.session_id, out, bs)?;
            tight_marshal_long2(id.value, out, bs)
        }

        pub fn $tun(
            reader: &mut DataReader<'_>,
            bs: &mut BooleanStream,
        ) -> Result<Option<$ty>, CodecError> {
            if !bs.read_boolean()? {
                return Ok(None);
            }
            expect_tag(reader, $tag)?;
            let connection = tight_unmarshal_string(reader, bs)?.unwrap_or_default();
            let session_id = tight_unmarshal_long(reader, bs)?;
            let value = tight_unmarshal_long(reader, bs)?;
            Ok(Some($ty {
                connection_id: ConnectionId::from_value(connection),
                session_id,
                value,
            }))
        }

        pub fn $l(value: Option<&$ty>, out: &mut BytesMut) {
            out.put_u8(u8::from(value.is_some()));
            if let Some(id) = value {
                out.put_u8($tag);
                loose_marshal_string(Some(id.connection_id.value()), out);
                out.put_i64(id.session_id);
                out.put_i64(id.value);
            }
        }

        pub fn $lun(reader: &mut DataReader<'_>) -> Result<Option<$ty>, CodecError> {
            if !reader.read_bool()? {
                return Ok(None);
            }
            expect_tag(reader, $tag)?;
            let connection = loose_unmarshal_string(reader)?.unwrap_or_default();
            let session_id = reader.read_i64()?;
            let value = reader.read_i64()?;
            Ok(Some($ty {
                connection_id: ConnectionId::from_value(connection),
                session_id,
                value,
            }))
        }
    };
}

session_scoped_id_codec!(
    ConsumerId,
    types::CONSUMER_ID,
    tight_marshal_consumer_id1,
    tight_marshal_consumer_id2,
    tight_unmarshal_consumer_id,
    loose_marshal_consumer_id,
    loose_unmarshal_consumer_id
);

session_scoped_id_codec!(
    ProducerId,
    types::PRODUCER_ID,
    tight_marshal_producer_id1,
    tight_marshal_producer_id2,
    tight_unmarshal_producer_id,
    loose_marshal_producer_id,
    loose_unmarshal_producer_id
);

pub fn tight_marshal_message_id1(value: Option<&MessageId>, bs: &mut BooleanStream) -> usize {
    bs.write_boolean(value.is_some());
    match value {
        None => 0,
        Some(id) => {
            1 + tight_marshal_producer_id1(Some(&id.producer_id), bs)
                + tight_marshal_long1(id.producer_sequence_id, bs)
                + tight_marshal_long1(id.broker_sequence_id, bs)
        }
    }
}

pub fn tight_marshal_message_id2(
    value: Option<&MessageId>,
    out: &mut BytesMut,
    bs: &mut BooleanStream,
) -> Result<(), CodecError> {
    if !bs.read_boolean()? {
        return Ok(());
    }
    let id = value.ok_or(CodecError::BooleanStreamExhausted)?;
    out.put_u8(types::MESSAGE_ID);
    tight_marshal_producer_id2(Some(&id.producer_id), out, bs)?;
    tight_marshal_long2(id.producer_sequence_id, out, bs)?;
    tight_marshal_long2(id.broker_sequence_id, out, bs)
}

pub fn tight_unmarshal_message_id(
    reader: &mut DataReader<'_>,
    bs: &mut BooleanStream,
) -> Result<Option<MessageId>, CodecError> {
    if !bs.read_boolean()? {
        return Ok(None);
    }
    expect_tag(reader, types::MESSAGE_ID)?;
    let producer_id = tight_unmarshal_producer_id(reader, bs)?.ok_or(CodecError::InvalidField {
        field: "message id producer",
        value: 0,
    })?;
    let producer_sequence_id = tight_unmarshal_long(reader, bs)?;
    let broker_sequence_id = tight_unmarshal_long(reader, bs)?;
    Ok(Some(MessageId {
        producer_id,
        producer_sequence_id,
        broker_sequence_id,
    }))
}

pub fn loose_marshal_message_id(value: Option<&MessageId>, out: &mut BytesMut) {
    out.put_u8(u8::from(value.is_some()));
    if let Some(id) = value {
        out.put_u8(types::MESSAGE_ID);
        loose_marshal_producer_id(Some(&id.producer_id), out);
        out.put_i64(id.producer_sequence_id);
        out.put_i64(id.broker_sequence_id);
    }
}

pub fn loose_unmarshal_message_id(
    reader: &mut DataReader<'_>,
) -> Result<Option<MessageId>, CodecError> {
    if !reader.read_bool()? {
        return Ok(None);
    }
    expect_tag(reader, types::MESSAGE_ID)?;
    let producer_id = loose_unmarshal_producer_id(reader)?.ok_or(CodecError::InvalidField {
        field: "message id producer",
        value: 0,
    })?;
    let producer_sequence_id = reader.read_i64()?;
    let broker_sequence_id = reader.read_i64()?;
    Ok(Some(MessageId {
        producer_id,
        producer_sequence_id,
        broker_sequence_id,
    }))
}

pub fn tight_marshal_transaction_id1(
    value: Option<&LocalTransactionId>,
    bs: &mut BooleanStream,
) -> usize {
    bs.write_boolean(value.is_some());
    match value {
        None => 0,
        Some(id) => {
            1 + tight_marshal_string1(Some(id.connection_id.value()), bs)
                + tight_marshal_long1(id.value, bs)
        }
    }
}

pub fn tight_marshal_transaction_id2(
    value: Option<&LocalTransactionId>,
    out: &mut BytesMut,
    bs: &mut BooleanStream,
) -> Result<(), CodecError> {
    if !bs.read_boolean()? {
        return Ok(());
    }
    let id = value.ok_or(CodecError::BooleanStreamExhausted)?;
    out.put_u8(types::LOCAL_TRANSACTION_ID);
    tight_marshal_string2(Some(id.connection_id.value()), out, bs)?;
    tight_marshal_long2(id.value, out, bs)
}

pub fn tight_unmarshal_transaction_id(
    reader: &mut DataReader<'_>,
    bs: &mut BooleanStream,
) -> Result<Option<LocalTransactionId>, CodecError> {
    if !bs.read_boolean()? {
        return Ok(None);
    }
    expect_tag(reader, types::LOCAL_TRANSACTION_ID)?;
    let connection = tight_unmarshal_string(reader, bs)?.unwrap_or_default();
    let value = tight_unmarshal_long(reader, bs)?;
    Ok(Some(LocalTransactionId {
        connection_id: ConnectionId::from_value(connection),
        value,
    }))
}

pub fn loose_marshal_transaction_id(value: Option<&LocalTransactionId>, out: &mut BytesMut) {
    out.put_u8(u8::from(value.is_some()));
    if let Some(id) = value {
        out.put_u8(types::LOCAL_TRANSACTION_ID);
        loose_marshal_string(Some(id.connection_id.value()), out);
        out.put_i64(id.value);
    }
}

pub fn loose_unmarshal_transaction_id(
    reader: &mut DataReader<'_>,
) -> Result<Option<LocalTransactionId>, CodecError> {
    if !reader.read_bool()? {
        return Ok(None);
    }
    expect_tag(reader, types::LOCAL_TRANSACTION_ID)?;
    let connection = loose_unmarshal_string(reader)?.unwrap_or_default();
    let value = reader.read_i64()?;
    Ok(Some(LocalTransactionId {
        connection_id: ConnectionId::from_value(connection),
        value,
    }))
}

// ---------------------------------------------------------------------------
// Destinations
// ---------------------------------------------------------------------------

fn destination_tag(kind: DestinationKind) -> u8 {
    match kind {
        DestinationKind::Queue => types::QUEUE,
        DestinationKind::Topic => types::TOPIC,
        DestinationKind::TemporaryQueue => types::TEMP_QUEUE,
        DestinationKind::TemporaryTopic => types::TEMP_TOPIC,
    }
}

fn destination_kind(tag: u8) -> Result<DestinationKind, CodecError> {
    match tag {
        types::QUEUE => Ok(DestinationKind::Queue),
        types::TOPIC => Ok(DestinationKind::Topic),
        types::TEMP_QUEUE => Ok(DestinationKind::TemporaryQueue),
        types::TEMP_TOPIC => Ok(DestinationKind::TemporaryTopic),
        other => Err(CodecError::UnknownCommand { tag: other }),
    }
}

pub fn tight_marshal_destination1(
    ctx: &mut MarshalContext,
    value: Option<&Destination>,
    bs: &mut BooleanStream,
) -> usize {
    bs.write_boolean(value.is_some());
    match value {
        None => 0,
        Some(dest) => 1 + tight_marshal_cached_string1(ctx, Some(dest.physical_name()), bs),
    }
}

pub fn tight_marshal_destination2(
    ctx: &mut MarshalContext,
    value: Option<&Destination>,
    out: &mut BytesMut,
    bs: &mut BooleanStream,
) -> Result<(), CodecError> {
    if !bs.read_boolean()? {
        return Ok(());
    }
    let dest = value.ok_or(CodecError::BooleanStreamExhausted)?;
    out.put_u8(destination_tag(dest.kind()));
    tight_marshal_cached_string2(ctx, Some(dest.physical_name()), out, bs)
}

pub fn tight_unmarshal_destination(
    ctx: &mut MarshalContext,
    reader: &mut DataReader<'_>,
    bs: &mut BooleanStream,
) -> Result<Option<Destination>, CodecError> {
    if !bs.read_boolean()? {
        return Ok(None);
    }
    let kind = destination_kind(reader.read_u8()?)?;
    let name = tight_unmarshal_cached_string(ctx, reader, bs)?.unwrap_or_default();
    Ok(Some(Destination::from_parts(kind, name)))
}

pub fn loose_marshal_destination(value: Option<&Destination>, out: &mut BytesMut) {
    out.put_u8(u8::from(value.is_some()));
    if let Some(dest) = value {
        out.put_u8(destination_tag(dest.kind()));
        loose_marshal_string(Some(dest.physical_name()), out);
    }
}

pub fn loose_unmarshal_destination(
    reader: &mut DataReader<'_>,
) -> Result<Option<Destination>, CodecError> {
    if !reader.read_bool()? {
        return Ok(None);
    }
    let kind = destination_kind(reader.read_u8()?)?;
    let name = loose_unmarshal_string(reader)?.unwrap_or_default();
    Ok(Some(Destination::from_parts(kind, name)))
}

// ---------------------------------------------------------------------------
// Removed objects (RemoveInfo targets)
// ---------------------------------------------------------------------------

pub fn tight_marshal_removed_object1(value: &RemovedObject, bs: &mut BooleanStream) -> usize {
    match value {
        RemovedObject::Connection(id) => tight_marshal_connection_id1(Some(id), bs),
        RemovedObject::Session(id) => tight_marshal_session_id1(Some(id), bs),
        RemovedObject::Consumer(id) => tight_marshal_consumer_id1(Some(id), bs),
        RemovedObject::Producer(id) => tight_marshal_producer_id1(Some(id), bs),
    }
}

pub fn tight_marshal_removed_object2(
    value: &RemovedObject,
    out: &mut BytesMut,
    bs: &mut BooleanStream,
) -> Result<(), CodecError> {
    match value {
        RemovedObject::Connection(id) => tight_marshal_connection_id2(Some(id), out, bs),
        RemovedObject::Session(id) => tight_marshal_session_id2(Some(id), out, bs),
        RemovedObject::Consumer(id) => tight_marshal_consumer_id2(Some(id), out, bs),
        RemovedObject::Producer(id) => tight_marshal_producer_id2(Some(id), out, bs),
    }
}

pub fn tight_unmarshal_removed_object(
    reader: &mut DataReader<'_>,
    bs: &mut BooleanStream,
) -> Result<RemovedObject, CodecError> {
    if !bs.read_boolean()? {
        return Err(CodecError::InvalidField {
            field: "remove info object",
            value: 0,
        });
    }
    let tag = reader.read_u8()?;
    match tag {
        types::CONNECTION_ID => {
            let value = tight_unmarshal_string(reader, bs)?.unwrap_or_default();
            Ok(RemovedObject::Connection(ConnectionId::from_value(value)))
        }
        types::SESSION_ID => {
            let connection = tight_unmarshal_string(reader, bs)?.unwrap_or_default();
            let value = tight_unmarshal_long(reader, bs)?;
            Ok(RemovedObject::Session(SessionId {
                connection_id: ConnectionId::from_value(connection),
                value,
            }))
        }
        types::CONSUMER_ID => {
            let connection = tight_unmarshal_string(reader, bs)?.unwrap_or_default();
            let session_id = tight_unmarshal_long(reader, bs)?;
            let value = tight_unmarshal_long(reader, bs)?;
            Ok(RemovedObject::Consumer(ConsumerId {
                connection_id: ConnectionId::from_value(connection),
                session_id,
                value,
            }))
        }
        types::PRODUCER_ID => {
            let connection = tight_unmarshal_string(reader, bs)?.unwrap_or_default();
            let session_id = tight_unmarshal_long(reader, bs)?;
            let value = tight_unmarshal_long(reader, bs)?;
            Ok(RemovedObject::Producer(ProducerId {
                connection_id: ConnectionId::from_value(connection),
                session_id,
                value,
            }))
        }
        other => Err(CodecError::UnknownCommand { tag: other }),
    }
}

pub fn loose_marshal_removed_object(value: &RemovedObject, out: &mut BytesMut) {
    match value {
        RemovedObject::Connection(id) => loose_marshal_connection_id(Some(id), out),
        RemovedObject::Session(id) => loose_marshal_session_id(Some(id), out),
        RemovedObject::Consumer(id) => loose_marshal_consumer_id(Some(id), out),
        RemovedObject::Producer(id) => loose_marshal_producer_id(Some(id), out),
    }
}

pub fn loose_unmarshal_removed_object(
    reader: &mut DataReader<'_>,
) -> Result<RemovedObject, CodecError> {
    if !reader.read_bool()? {
        return Err(CodecError::InvalidField {
            field: "remove info object",
            value: 0,
        });
    }
    let tag = reader.read_u8()?;
    match tag {
        types::CONNECTION_ID => {
            let value = loose_unmarshal_string(reader)?.unwrap_or_default();
            Ok(RemovedObject::Connection(ConnectionId::from_value(value)))
        }
        types::SESSION_ID => {
            let connection = loose_unmarshal_string(reader)?.unwrap_or_default();
            let value = reader.read_i64()?;
            Ok(RemovedObject::Session(SessionId {
                connection_id: ConnectionId::from_value(connection),
                value,
            }))
        }
        types::CONSUMER_ID => {
            let connection = loose_unmarshal_string(reader)?.unwrap_or_default();
            let session_id = reader.read_i64()?;
            let value = reader.read_i64()?;
            Ok(RemovedObject::Consumer(ConsumerId {
                connection_id: ConnectionId::from_value(connection),
                session_id,
                value,
            }))
        }
        types::PRODUCER_ID => {
            let connection = loose_unmarshal_string(reader)?.unwrap_or_default();
            let session_id = reader.read_i64()?;
            let value = reader.read_i64()?;
            Ok(RemovedObject::Producer(ProducerId {
                connection_id: ConnectionId::from_value(connection),
                session_id,
                value,
            }))
        }
        other => Err(CodecError::UnknownCommand { tag: other }),
    }
}

// ---------------------------------------------------------------------------
// Broker errors
// ---------------------------------------------------------------------------

/// Pass one for a broker exception, stack trace gated by negotiation.
pub fn tight_marshal_broker_error1(
    ctx: &mut MarshalContext,
    value: Option<&BrokerError>,
    bs: &mut BooleanStream,
) -> usize {
    bs.write_boolean(value.is_some());
    let Some(err) = value else {
        return 0;
    };
    let mut size = tight_marshal_string1(Some(&err.exception_class), bs)
        + tight_marshal_string1(Some(&err.message), bs);
    if ctx.stack_trace_enabled {
        size += 2;
        for frame in &err.stack_trace {
            size += tight_marshal_string1(Some(frame), bs);
        }
        size += tight_marshal_broker_error1(ctx, err.cause.as_deref(), bs);
    }
    size
}

/// Pass two for a broker exception.
pub fn tight_marshal_broker_error2(
    ctx: &mut MarshalContext,
    value: Option<&BrokerError>,
    out: &mut BytesMut,
    bs: &mut BooleanStream,
) -> Result<(), CodecError> {
    if !bs.read_boolean()? {
        return Ok(());
    }
    let err = value.ok_or(CodecError::BooleanStreamExhausted)?;
    tight_marshal_string2(Some(&err.exception_class), out, bs)?;
    tight_marshal_string2(Some(&err.message), out, bs)?;
    if ctx.stack_trace_enabled {
        out.put_u16(err.stack_trace.len() as u16);
        for frame in &err.stack_trace {
            tight_marshal_string2(Some(frame), out, bs)?;
        }
        tight_marshal_broker_error2(ctx, err.cause.as_deref(), out, bs)?;
    }
    Ok(())
}

/// Decodes a broker exception.
pub fn tight_unmarshal_broker_error(
    ctx: &mut MarshalContext,
    reader: &mut DataReader<'_>,
    bs: &mut BooleanStream,
) -> Result<Option<BrokerError>, CodecError> {
    if !bs.read_boolean()? {
        return Ok(None);
    }
    let exception_class = tight_unmarshal_string(reader, bs)?.unwrap_or_default();
    let message = tight_unmarshal_string(reader, bs)?.unwrap_or_default();
    let mut stack_trace = Vec::new();
    let mut cause = None;
    if ctx.stack_trace_enabled {
        let frames = reader.read_u16()?;
        for _ in 0..frames {
            stack_trace.push(tight_unmarshal_string(reader, bs)?.unwrap_or_default());
        }
        cause = tight_unmarshal_broker_error(ctx, reader, bs)?.map(Box::new);
    }
    Ok(Some(BrokerError {
        exception_class,
        message,
        stack_trace,
        cause,
    }))
}

/// Loose form of a broker exception.
pub fn loose_marshal_broker_error(
    ctx: &MarshalContext,
    value: Option<&BrokerError>,
    out: &mut BytesMut,
) {
    out.put_u8(u8::from(value.is_some()));
    let Some(err) = value else {
        return;
    };
    loose_marshal_string(Some(&err.exception_class), out);
    loose_marshal_string(Some(&err.message), out);
    if ctx.stack_trace_enabled {
        out.put_u16(err.stack_trace.len() as u16);
        for frame in &err.stack_trace {
            loose_marshal_string(Some(frame), out);
        }
        loose_marshal_broker_error(ctx, err.cause.as_deref(), out);
    }
}

/// Decodes a loose broker exception.
pub fn loose_unmarshal_broker_error(
    ctx: &MarshalContext,
    reader: &mut DataReader<'_>,
) -> Result<Option<BrokerError>, CodecError> {
    if !reader.read_bool()? {
        return Ok(None);
    }
    let exception_class = loose_unmarshal_string(reader)?.unwrap_or_default();
    let message = loose_unmarshal_string(reader)?.unwrap_or_default();
    let mut stack_trace = Vec::new();
    let mut cause = None;
    if ctx.stack_trace_enabled {
        let frames = reader.read_u16()?;
        for _ in 0..frames {
            stack_trace.push(loose_unmarshal_string(reader)?.unwrap_or_default());
        }
        cause = loose_unmarshal_broker_error(ctx, reader)?.map(Box::new);
    }
    Ok(Some(BrokerError {
        exception_class,
        message,
        stack_trace,
        cause,
    }))
}

// ---------------------------------------------------------------------------
// Primitive values, maps, and sequences (self-contained byte sections)
// ---------------------------------------------------------------------------

const BOOLEAN_TYPE: u8 = 1;
const BYTE_TYPE: u8 = 2;
const SHORT_TYPE: u8 = 4;
const INTEGER_TYPE: u8 = 5;
const LONG_TYPE: u8 = 6;
const DOUBLE_TYPE: u8 = 7;
const FLOAT_TYPE: u8 = 8;
const STRING_TYPE: u8 = 9;
const BYTE_ARRAY_TYPE: u8 = 10;

/// Encoded size of one primitive value, tag byte included.
pub fn primitive_value_size(value: &PrimitiveValue) -> usize {
    1 + match value {
        PrimitiveValue::Bool(_) | PrimitiveValue::Byte(_) => 1,
        PrimitiveValue::Short(_) => 2,
        PrimitiveValue::Int(_) | PrimitiveValue::Float(_) => 4,
        PrimitiveValue::Long(_) | PrimitiveValue::Double(_) => 8,
        PrimitiveValue::String(s) => 2 + s.len(),
        PrimitiveValue::Bytes(b) => 4 + b.len(),
    }
}

/// Writes one primitive value.
pub fn marshal_primitive_value(value: &PrimitiveValue, out: &mut BytesMut) {
    match value {
        PrimitiveValue::Bool(v) => {
            out.put_u8(BOOLEAN_TYPE);
            out.put_u8(u8::from(*v));
        }
        PrimitiveValue::Byte(v) => {
            out.put_u8(BYTE_TYPE);
            out.put_i8(*v);
        }
        PrimitiveValue::Short(v) => {
            out.put_u8(SHORT_TYPE);
            out.put_i16(*v);
        }
        PrimitiveValue::Int(v) => {
            out.put_u8(INTEGER_TYPE);
            out.put_i32(*v);
        }
        PrimitiveValue::Long(v) => {
            out.put_u8(LONG_TYPE);
            out.put_i64(*v);
        }
        PrimitiveValue::Double(v) => {
            out.put_u8(DOUBLE_TYPE);
            out.put_f64(*v);
        }
        PrimitiveValue::Float(v) => {
            out.put_u8(FLOAT_TYPE);
            out.put_f32(*v);
        }
        PrimitiveValue::String(s) => {
            out.put_u8(STRING_TYPE);
            out.put_u16(s.len() as u16);
            out.put_slice(s.as_bytes());
        }
        PrimitiveValue::Bytes(b) => {
            out.put_u8(BYTE_ARRAY_TYPE);
            out.put_u32(b.len() as u32);
            out.put_slice(b);
        }
    }
}

/// Reads one primitive value.
pub fn unmarshal_primitive_value(reader: &mut DataReader<'_>) -> Result<PrimitiveValue, CodecError> {
    let tag = reader.read_u8()?;
    match tag {
        BOOLEAN_TYPE => Ok(PrimitiveValue::Bool(reader.read_bool()?)),
        BYTE_TYPE => Ok(PrimitiveValue::Byte(reader.read_u8()? as i8)),
        SHORT_TYPE => Ok(PrimitiveValue::Short(reader.read_u16()? as i16)),
        INTEGER_TYPE => Ok(PrimitiveValue::Int(reader.read_i32()?)),
        LONG_TYPE => Ok(PrimitiveValue::Long(reader.read_i64()?)),
        DOUBLE_TYPE => Ok(PrimitiveValue::Double(reader.read_f64()?)),
        FLOAT_TYPE => Ok(PrimitiveValue::Float(reader.read_f32()?)),
        STRING_TYPE => {
            let len = reader.read_u16()? as usize;
            String::from_utf8(reader.read_bytes(len)?.to_vec())
                .map(PrimitiveValue::String)
                .map_err(|_| CodecError::InvalidUtf8)
        }
        BYTE_ARRAY_TYPE => {
            let len = reader.read_u32()? as usize;
            Ok(PrimitiveValue::Bytes(reader.read_bytes(len)?.to_vec()))
        }
        other => Err(CodecError::InvalidField {
            field: "primitive type tag",
            value: i64::from(other),
        }),
    }
}

/// Encoded size of a name/value map.
pub fn primitive_map_size(map: &std::collections::BTreeMap<String, PrimitiveValue>) -> usize {
    4 + map
        .iter()
        .map(|(key, value)| 2 + key.len() + primitive_value_size(value))
        .sum::<usize>()
}

/// Writes a name/value map: entry count, then key (short UTF-8) and value.
pub fn marshal_primitive_map(
    map: &std::collections::BTreeMap<String, PrimitiveValue>,
    out: &mut BytesMut,
) {
    out.put_u32(map.len() as u32);
    for (key, value) in map {
        out.put_u16(key.len() as u16);
        out.put_slice(key.as_bytes());
        marshal_primitive_value(value, out);
    }
}

/// Reads a name/value map.
pub fn unmarshal_primitive_map(
    reader: &mut DataReader<'_>,
) -> Result<std::collections::BTreeMap<String, PrimitiveValue>, CodecError> {
    let count = reader.read_u32()?;
    let mut map = std::collections::BTreeMap::new();
    for _ in 0..count {
        let key_len = reader.read_u16()? as usize;
        let key = String::from_utf8(reader.read_bytes(key_len)?.to_vec())
            .map_err(|_| CodecError::InvalidUtf8)?;
        let value = unmarshal_primitive_value(reader)?;
        map.insert(key, value);
    }
    Ok(map)
}

fn expect_tag(reader: &mut DataReader<'_>, expected: u8) -> Result<(), CodecError> {
    let tag = reader.read_u8()?;
    if tag != expected {
        return Err(CodecError::UnknownCommand { tag });
    }
    Ok(())
}
