//! Per-command marshallers and the tag-indexed dispatch table.
//!
//! One [`DataStreamMarshaller`] exists per command tag per supported wire
//! version. The registry is an array indexed by tag; switching versions
//! replaces the whole array. Field layouts are fixed per version: later
//! versions append fields, gated on the registry's version so both peers
//! walk the same shape after negotiation.

use bytes::{BufMut, BytesMut};

use crate::codec::boolean_stream::BooleanStream;
use crate::codec::nested::{
    MarshalContext, loose_marshal_broker_error, loose_marshal_connection_id,
    loose_marshal_consumer_id, loose_marshal_destination, loose_marshal_message_id,
    loose_marshal_producer_id, loose_marshal_removed_object, loose_marshal_session_id,
    loose_marshal_transaction_id, loose_unmarshal_broker_error, loose_unmarshal_connection_id,
    loose_unmarshal_consumer_id, loose_unmarshal_destination, loose_unmarshal_message_id,
    loose_unmarshal_producer_id, loose_unmarshal_removed_object, loose_unmarshal_session_id,
    loose_unmarshal_transaction_id, marshal_primitive_map, marshal_primitive_value,
    primitive_map_size, primitive_value_size, tight_marshal_broker_error1,
    tight_marshal_broker_error2, tight_marshal_cached_string1, tight_marshal_cached_string2,
    tight_marshal_connection_id1, tight_marshal_connection_id2, tight_marshal_consumer_id1,
    tight_marshal_consumer_id2, tight_marshal_destination1, tight_marshal_destination2,
    tight_marshal_message_id1, tight_marshal_message_id2, tight_marshal_producer_id1,
    tight_marshal_producer_id2, tight_marshal_removed_object1, tight_marshal_removed_object2,
    tight_marshal_session_id1, tight_marshal_session_id2, tight_marshal_transaction_id1,
    tight_marshal_transaction_id2, tight_unmarshal_broker_error, tight_unmarshal_cached_string,
    tight_unmarshal_connection_id, tight_unmarshal_consumer_id, tight_unmarshal_destination,
    tight_unmarshal_message_id, tight_unmarshal_producer_id, tight_unmarshal_removed_object,
    tight_unmarshal_session_id, tight_unmarshal_transaction_id, unmarshal_primitive_map,
    unmarshal_primitive_value,
};
use crate::codec::primitives::{
    DataReader, loose_marshal_string, loose_unmarshal_string, tight_marshal_long1,
    tight_marshal_long2, tight_marshal_string1, tight_marshal_string2, tight_unmarshal_long,
    tight_unmarshal_string,
};
use crate::commands::{
    AckType, BrokerError, BrokerInfo, Command, ConnectionError, ConnectionInfo, ConsumerInfo,
    DestinationInfo, DestinationOperation, ExceptionResponse, KeepAliveInfo, Message, MessageAck,
    MessageBody, MessageDispatch, MessagePull, ProducerInfo, RemoveInfo, RemoveSubscriptionInfo,
    Response, SessionInfo, ShutdownInfo, TransactionInfo, TransactionType, WireFormatInfo, types,
};
use crate::error::CodecError;

/// Lowest wire version the codec speaks.
pub const LOWEST_VERSION: u32 = 1;
/// Highest (and preferred) wire version the codec speaks.
pub const HIGHEST_VERSION: u32 = 3;

const WIRE_MAGIC: &[u8; 8] = b"ActiveMQ";

/// Encodes one command type at one wire version, in both encodings.
pub trait DataStreamMarshaller: Send + Sync {
    /// The wire tag this marshaller serves.
    fn data_structure_type(&self) -> u8;

    /// Tight pass one: records stream bits, returns the body size estimate.
    fn tight_marshal1(
        &self,
        ctx: &mut MarshalContext,
        command: &Command,
        bs: &mut BooleanStream,
    ) -> Result<usize, CodecError>;

    /// Tight pass two: replays the stream bits while writing the body.
    fn tight_marshal2(
        &self,
        ctx: &mut MarshalContext,
        command: &Command,
        out: &mut BytesMut,
        bs: &mut BooleanStream,
    ) -> Result<(), CodecError>;

    /// Decodes a tight body.
    fn tight_unmarshal(
        &self,
        ctx: &mut MarshalContext,
        reader: &mut DataReader<'_>,
        bs: &mut BooleanStream,
    ) -> Result<Command, CodecError>;

    /// Single-pass loose encode.
    fn loose_marshal(
        &self,
        ctx: &mut MarshalContext,
        command: &Command,
        out: &mut BytesMut,
    ) -> Result<(), CodecError>;

    /// Decodes a loose body.
    fn loose_unmarshal(
        &self,
        ctx: &mut MarshalContext,
        reader: &mut DataReader<'_>,
    ) -> Result<Command, CodecError>;
}

fn unexpected(command: &Command) -> CodecError {
    CodecError::InvalidField {
        field: "command variant",
        value: i64::from(command.data_structure_type()),
    }
}

// Every command leads with its correlation header: the command id (a compact
// long in tight mode) and the response-required flag.

fn tight_header1(command_id: i32, response_required: bool, bs: &mut BooleanStream) -> usize {
    let size = tight_marshal_long1(i64::from(command_id), bs);
    bs.write_boolean(response_required);
    size
}

fn tight_header2(
    command_id: i32,
    out: &mut BytesMut,
    bs: &mut BooleanStream,
) -> Result<(), CodecError> {
    tight_marshal_long2(i64::from(command_id), out, bs)?;
    bs.read_boolean()?;
    Ok(())
}

fn tight_unmarshal_header(
    reader: &mut DataReader<'_>,
    bs: &mut BooleanStream,
) -> Result<(i32, bool), CodecError> {
    let command_id = tight_unmarshal_long(reader, bs)? as i32;
    let response_required = bs.read_boolean()?;
    Ok((command_id, response_required))
}

fn loose_header(command_id: i32, response_required: bool, out: &mut BytesMut) {
    out.put_i32(command_id);
    out.put_u8(u8::from(response_required));
}

fn loose_unmarshal_header(reader: &mut DataReader<'_>) -> Result<(i32, bool), CodecError> {
    let command_id = reader.read_i32()?;
    let response_required = reader.read_bool()?;
    Ok((command_id, response_required))
}

// ---------------------------------------------------------------------------
// WireFormatInfo: self-contained in both encodings
// ---------------------------------------------------------------------------

/// Marshals the negotiation frame.
///
/// Negotiation frames must decode before any flags are agreed, so the body
/// is identical under both encodings and field presence is gated on the
/// frame's own version, never the negotiated one.
struct WireFormatInfoMarshaller;

fn wire_format_info_size(info: &WireFormatInfo) -> usize {
    let mut size = 8 + 4 + 4 + 1 + 5;
    if info.version >= 2 {
        size += 8;
    }
    if info.version >= 3 {
        size += 8 + 2;
    }
    size
}

fn write_wire_format_info(info: &WireFormatInfo, out: &mut BytesMut) {
    out.put_slice(WIRE_MAGIC);
    out.put_u32(info.version);
    out.put_i32(info.command_id);
    out.put_u8(u8::from(info.response_required));
    out.put_u8(u8::from(info.stack_trace_enabled));
    out.put_u8(u8::from(info.tcp_no_delay_enabled));
    out.put_u8(u8::from(info.cache_enabled));
    out.put_u8(u8::from(info.tight_encoding_enabled));
    out.put_u8(u8::from(info.size_prefix_disabled));
    if info.version >= 2 {
        out.put_i64(info.max_inactivity_duration);
    }
    if info.version >= 3 {
        out.put_i64(info.max_inactivity_duration_initial_delay);
        out.put_u16(info.cache_size);
    }
}

fn read_wire_format_info(reader: &mut DataReader<'_>) -> Result<WireFormatInfo, CodecError> {
    let magic = reader.read_bytes(8)?;
    if magic != WIRE_MAGIC {
        return Err(CodecError::InvalidField {
            field: "wire format magic",
            value: i64::from(magic[0]),
        });
    }
    let version = reader.read_u32()?;
    let command_id = reader.read_i32()?;
    let response_required = reader.read_bool()?;
    let stack_trace_enabled = reader.read_bool()?;
    let tcp_no_delay_enabled = reader.read_bool()?;
    let cache_enabled = reader.read_bool()?;
    let tight_encoding_enabled = reader.read_bool()?;
    let size_prefix_disabled = reader.read_bool()?;
    let mut info = WireFormatInfo {
        command_id,
        response_required,
        version,
        stack_trace_enabled,
        tcp_no_delay_enabled,
        cache_enabled,
        tight_encoding_enabled,
        size_prefix_disabled,
        cache_size: 0,
        max_inactivity_duration: 0,
        max_inactivity_duration_initial_delay: 0,
    };
    if version >= 2 {
        info.max_inactivity_duration = reader.read_i64()?;
    }
    if version >= 3 {
        info.max_inactivity_duration_initial_delay = reader.read_i64()?;
        info.cache_size = reader.read_u16()?;
    }
    Ok(info)
}

impl DataStreamMarshaller for WireFormatInfoMarshaller {
    fn data_structure_type(&self) -> u8 {
        types::WIREFORMAT_INFO
    }

    fn tight_marshal1(
        &self,
        _ctx: &mut MarshalContext,
        command: &Command,
        _bs: &mut BooleanStream,
    ) -> Result<usize, CodecError> {
        let Command::WireFormatInfo(info) = command else {
            return Err(unexpected(command));
        };
        Ok(wire_format_info_size(info))
    }

    fn tight_marshal2(
        &self,
        _ctx: &mut MarshalContext,
        command: &Command,
        out: &mut BytesMut,
        _bs: &mut BooleanStream,
    ) -> Result<(), CodecError> {
        let Command::WireFormatInfo(info) = command else {
            return Err(unexpected(command));
        };
        write_wire_format_info(info, out);
        Ok(())
    }

    fn tight_unmarshal(
        &self,
        _ctx: &mut MarshalContext,
        reader: &mut DataReader<'_>,
        _bs: &mut BooleanStream,
    ) -> Result<Command, CodecError> {
        Ok(Command::WireFormatInfo(read_wire_format_info(reader)?))
    }

    fn loose_marshal(
        &self,
        _ctx: &mut MarshalContext,
        command: &Command,
        out: &mut BytesMut,
    ) -> Result<(), CodecError> {
        let Command::WireFormatInfo(info) = command else {
            return Err(unexpected(command));
        };
        write_wire_format_info(info, out);
        Ok(())
    }

    fn loose_unmarshal(
        &self,
        _ctx: &mut MarshalContext,
        reader: &mut DataReader<'_>,
    ) -> Result<Command, CodecError> {
        Ok(Command::WireFormatInfo(read_wire_format_info(reader)?))
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

fn message_body_size(body: &MessageBody) -> usize {
    match body {
        MessageBody::Empty => 0,
        MessageBody::Text(text) => 4 + text.len(),
        MessageBody::Bytes(bytes) | MessageBody::Object(bytes) => 4 + bytes.len(),
        MessageBody::Map(map) => primitive_map_size(map),
        MessageBody::Stream(values) => {
            4 + values.iter().map(primitive_value_size).sum::<usize>()
        }
    }
}

fn marshal_message_body(body: &MessageBody, out: &mut BytesMut) {
    match body {
        MessageBody::Empty => {}
        MessageBody::Text(text) => {
            out.put_u32(text.len() as u32);
            out.put_slice(text.as_bytes());
        }
        MessageBody::Bytes(bytes) | MessageBody::Object(bytes) => {
            out.put_u32(bytes.len() as u32);
            out.put_slice(bytes);
        }
        MessageBody::Map(map) => marshal_primitive_map(map, out),
        MessageBody::Stream(values) => {
            out.put_u32(values.len() as u32);
            for value in values {
                marshal_primitive_value(value, out);
            }
        }
    }
}

fn unmarshal_message_body(tag: u8, reader: &mut DataReader<'_>) -> Result<MessageBody, CodecError> {
    match tag {
        types::MESSAGE => Ok(MessageBody::Empty),
        types::TEXT_MESSAGE => {
            let len = reader.read_u32()? as usize;
            String::from_utf8(reader.read_bytes(len)?.to_vec())
                .map(MessageBody::Text)
                .map_err(|_| CodecError::InvalidUtf8)
        }
        types::BYTES_MESSAGE => {
            let len = reader.read_u32()? as usize;
            Ok(MessageBody::Bytes(reader.read_bytes(len)?.to_vec()))
        }
        types::OBJECT_MESSAGE => {
            let len = reader.read_u32()? as usize;
            Ok(MessageBody::Object(reader.read_bytes(len)?.to_vec()))
        }
        types::MAP_MESSAGE => Ok(MessageBody::Map(unmarshal_primitive_map(reader)?)),
        types::STREAM_MESSAGE => {
            let count = reader.read_u32()?;
            let mut values = Vec::with_capacity(count as usize);
            for _ in 0..count {
                values.push(unmarshal_primitive_value(reader)?);
            }
            Ok(MessageBody::Stream(values))
        }
        other => Err(CodecError::UnknownCommand { tag: other }),
    }
}

pub(crate) fn message_tight1(
    ctx: &mut MarshalContext,
    message: &Message,
    bs: &mut BooleanStream,
) -> Result<usize, CodecError> {
    let mut size = tight_marshal_message_id1(Some(&message.message_id).and_then(Option::as_ref), bs)
        + tight_marshal_destination1(ctx, message.destination.as_ref(), bs)
        + tight_marshal_transaction_id1(message.transaction_id.as_ref(), bs)
        + tight_marshal_string1(message.correlation_id.as_deref(), bs)
        + tight_marshal_destination1(ctx, message.reply_to.as_ref(), bs);
    bs.write_boolean(message.persistent);
    bs.write_boolean(message.redelivered);
    size += 1; // priority
    size += tight_marshal_long1(message.timestamp, bs);
    size += tight_marshal_long1(message.expiration, bs);
    size += tight_marshal_long1(i64::from(message.redelivery_counter), bs);
    if ctx.version >= 2 {
        size += tight_marshal_string1(message.message_type.as_deref(), bs);
    }
    size += primitive_map_size(&message.properties);
    size += message_body_size(&message.body);
    Ok(size)
}

pub(crate) fn message_tight2(
    ctx: &mut MarshalContext,
    message: &Message,
    out: &mut BytesMut,
    bs: &mut BooleanStream,
) -> Result<(), CodecError> {
    tight_marshal_message_id2(message.message_id.as_ref(), out, bs)?;
    tight_marshal_destination2(ctx, message.destination.as_ref(), out, bs)?;
    tight_marshal_transaction_id2(message.transaction_id.as_ref(), out, bs)?;
    tight_marshal_string2(message.correlation_id.as_deref(), out, bs)?;
    tight_marshal_destination2(ctx, message.reply_to.as_ref(), out, bs)?;
    bs.read_boolean()?;
    bs.read_boolean()?;
    out.put_u8(message.priority);
    tight_marshal_long2(message.timestamp, out, bs)?;
    tight_marshal_long2(message.expiration, out, bs)?;
    tight_marshal_long2(i64::from(message.redelivery_counter), out, bs)?;
    if ctx.version >= 2 {
        tight_marshal_string2(message.message_type.as_deref(), out, bs)?;
    }
    marshal_primitive_map(&message.properties, out);
    marshal_message_body(&message.body, out);
    Ok(())
}

pub(crate) fn message_tight_unmarshal(
    ctx: &mut MarshalContext,
    tag: u8,
    reader: &mut DataReader<'_>,
    bs: &mut BooleanStream,
) -> Result<Message, CodecError> {
    let message_id = tight_unmarshal_message_id(reader, bs)?;
    let destination = tight_unmarshal_destination(ctx, reader, bs)?;
    let transaction_id = tight_unmarshal_transaction_id(reader, bs)?;
    let correlation_id = tight_unmarshal_string(reader, bs)?;
    let reply_to = tight_unmarshal_destination(ctx, reader, bs)?;
    let persistent = bs.read_boolean()?;
    let redelivered = bs.read_boolean()?;
    let priority = reader.read_u8()?;
    let timestamp = tight_unmarshal_long(reader, bs)?;
    let expiration = tight_unmarshal_long(reader, bs)?;
    let redelivery_counter = tight_unmarshal_long(reader, bs)? as i32;
    let message_type = if ctx.version >= 2 {
        tight_unmarshal_string(reader, bs)?
    } else {
        None
    };
    let properties = unmarshal_primitive_map(reader)?;
    let body = unmarshal_message_body(tag, reader)?;
    Ok(Message {
        message_id,
        destination,
        transaction_id,
        correlation_id,
        reply_to,
        persistent,
        priority,
        timestamp,
        expiration,
        redelivered,
        redelivery_counter,
        message_type,
        properties,
        body,
        marshalled_form: None,
    })
}

pub(crate) fn message_loose_marshal(
    ctx: &mut MarshalContext,
    message: &Message,
    out: &mut BytesMut,
) -> Result<(), CodecError> {
    loose_marshal_message_id(message.message_id.as_ref(), out);
    loose_marshal_destination(message.destination.as_ref(), out);
    loose_marshal_transaction_id(message.transaction_id.as_ref(), out);
    loose_marshal_string(message.correlation_id.as_deref(), out);
    loose_marshal_destination(message.reply_to.as_ref(), out);
    out.put_u8(u8::from(message.persistent));
    out.put_u8(u8::from(message.redelivered));
    out.put_u8(message.priority);
    out.put_i64(message.timestamp);
    out.put_i64(message.expiration);
    out.put_i32(message.redelivery_counter);
    if ctx.version >= 2 {
        loose_marshal_string(message.message_type.as_deref(), out);
    }
    marshal_primitive_map(&message.properties, out);
    marshal_message_body(&message.body, out);
    Ok(())
}

pub(crate) fn message_loose_unmarshal(
    ctx: &mut MarshalContext,
    tag: u8,
    reader: &mut DataReader<'_>,
) -> Result<Message, CodecError> {
    let message_id = loose_unmarshal_message_id(reader)?;
    let destination = loose_unmarshal_destination(reader)?;
    let transaction_id = loose_unmarshal_transaction_id(reader)?;
    let correlation_id = loose_unmarshal_string(reader)?;
    let reply_to = loose_unmarshal_destination(reader)?;
    let persistent = reader.read_bool()?;
    let redelivered = reader.read_bool()?;
    let priority = reader.read_u8()?;
    let timestamp = reader.read_i64()?;
    let expiration = reader.read_i64()?;
    let redelivery_counter = reader.read_i32()?;
    let message_type = if ctx.version >= 2 {
        loose_unmarshal_string(reader)?
    } else {
        None
    };
    let properties = unmarshal_primitive_map(reader)?;
    let body = unmarshal_message_body(tag, reader)?;
    Ok(Message {
        message_id,
        destination,
        transaction_id,
        correlation_id,
        reply_to,
        persistent,
        priority,
        timestamp,
        expiration,
        redelivered,
        redelivery_counter,
        message_type,
        properties,
        body,
        marshalled_form: None,
    })
}

fn message_tag(message: &Message) -> u8 {
    match message.body {
        MessageBody::Empty => types::MESSAGE,
        MessageBody::Text(_) => types::TEXT_MESSAGE,
        MessageBody::Bytes(_) => types::BYTES_MESSAGE,
        MessageBody::Map(_) => types::MAP_MESSAGE,
        MessageBody::Stream(_) => types::STREAM_MESSAGE,
        MessageBody::Object(_) => types::OBJECT_MESSAGE,
    }
}

/// Nested message pass one, honoring a cached pre-marshalled form.
fn tight_marshal_nested_message1(
    ctx: &mut MarshalContext,
    message: Option<&Message>,
    bs: &mut BooleanStream,
) -> Result<usize, CodecError> {
    bs.write_boolean(message.is_some());
    let Some(msg) = message else {
        return Ok(0);
    };
    match &msg.marshalled_form {
        Some(form) => {
            bs.write_boolean(true);
            Ok(1 + form.len())
        }
        None => {
            bs.write_boolean(false);
            Ok(1 + message_tight1(ctx, msg, bs)?)
        }
    }
}

fn tight_marshal_nested_message2(
    ctx: &mut MarshalContext,
    message: Option<&Message>,
    out: &mut BytesMut,
    bs: &mut BooleanStream,
) -> Result<(), CodecError> {
    if !bs.read_boolean()? {
        return Ok(());
    }
    let msg = message.ok_or(CodecError::BooleanStreamExhausted)?;
    out.put_u8(message_tag(msg));
    if bs.read_boolean()? {
        let form = msg
            .marshalled_form
            .as_ref()
            .ok_or(CodecError::BooleanStreamExhausted)?;
        out.put_slice(form);
        Ok(())
    } else {
        message_tight2(ctx, msg, out, bs)
    }
}

fn tight_unmarshal_nested_message(
    ctx: &mut MarshalContext,
    reader: &mut DataReader<'_>,
    bs: &mut BooleanStream,
) -> Result<Option<Message>, CodecError> {
    if !bs.read_boolean()? {
        return Ok(None);
    }
    let tag = reader.read_u8()?;
    if bs.read_boolean()? {
        // Pre-marshalled form: a full frame follows, with its own stream.
        // Forms are produced cache-free so replaying the bytes later cannot
        // desynchronize the negotiated cache.
        let _frame_size = reader.read_u32()?;
        let inner_tag = reader.read_u8()?;
        let mut inner_bs = BooleanStream::unmarshal(reader)?;
        let mut form_ctx = MarshalContext::new(ctx.version);
        form_ctx.stack_trace_enabled = ctx.stack_trace_enabled;
        message_tight_unmarshal(&mut form_ctx, inner_tag, reader, &mut inner_bs).map(Some)
    } else {
        message_tight_unmarshal(ctx, tag, reader, bs).map(Some)
    }
}

fn loose_marshal_nested_message(
    ctx: &mut MarshalContext,
    message: Option<&Message>,
    out: &mut BytesMut,
) -> Result<(), CodecError> {
    out.put_u8(u8::from(message.is_some()));
    if let Some(msg) = message {
        out.put_u8(message_tag(msg));
        message_loose_marshal(ctx, msg, out)?;
    }
    Ok(())
}

fn loose_unmarshal_nested_message(
    ctx: &mut MarshalContext,
    reader: &mut DataReader<'_>,
) -> Result<Option<Message>, CodecError> {
    if !reader.read_bool()? {
        return Ok(None);
    }
    let tag = reader.read_u8()?;
    message_loose_unmarshal(ctx, tag, reader).map(Some)
}

/// Marshals standalone messages; registered once per body tag.
struct MessageMarshaller {
    tag: u8,
}

impl DataStreamMarshaller for MessageMarshaller {
    fn data_structure_type(&self) -> u8 {
        self.tag
    }

    fn tight_marshal1(
        &self,
        ctx: &mut MarshalContext,
        command: &Command,
        bs: &mut BooleanStream,
    ) -> Result<usize, CodecError> {
        let Command::Message(message) = command else {
            return Err(unexpected(command));
        };
        message_tight1(ctx, message, bs)
    }

    fn tight_marshal2(
        &self,
        ctx: &mut MarshalContext,
        command: &Command,
        out: &mut BytesMut,
        bs: &mut BooleanStream,
    ) -> Result<(), CodecError> {
        let Command::Message(message) = command else {
            return Err(unexpected(command));
        };
        message_tight2(ctx, message, out, bs)
    }

    fn tight_unmarshal(
        &self,
        ctx: &mut MarshalContext,
        reader: &mut DataReader<'_>,
        bs: &mut BooleanStream,
    ) -> Result<Command, CodecError> {
        message_tight_unmarshal(ctx, self.tag, reader, bs)
            .map(|message| Command::Message(Box::new(message)))
    }

    fn loose_marshal(
        &self,
        ctx: &mut MarshalContext,
        command: &Command,
        out: &mut BytesMut,
    ) -> Result<(), CodecError> {
        let Command::Message(message) = command else {
            return Err(unexpected(command));
        };
        message_loose_marshal(ctx, message, out)
    }

    fn loose_unmarshal(
        &self,
        ctx: &mut MarshalContext,
        reader: &mut DataReader<'_>,
    ) -> Result<Command, CodecError> {
        message_loose_unmarshal(ctx, self.tag, reader)
            .map(|message| Command::Message(Box::new(message)))
    }
}

// ---------------------------------------------------------------------------
// Remaining command marshallers
// ---------------------------------------------------------------------------

struct BrokerInfoMarshaller;

impl DataStreamMarshaller for BrokerInfoMarshaller {
    fn data_structure_type(&self) -> u8 {
        types::BROKER_INFO
    }

    fn tight_marshal1(
        &self,
        _ctx: &mut MarshalContext,
        command: &Command,
        bs: &mut BooleanStream,
    ) -> Result<usize, CodecError> {
        let Command::BrokerInfo(info) = command else {
            return Err(unexpected(command));
        };
        Ok(tight_header1(info.command_id, info.response_required, bs)
            + tight_marshal_string1(info.broker_id.as_deref(), bs)
            + tight_marshal_string1(info.broker_url.as_deref(), bs)
            + tight_marshal_string1(info.broker_name.as_deref(), bs))
    }

    fn tight_marshal2(
        &self,
        _ctx: &mut MarshalContext,
        command: &Command,
        out: &mut BytesMut,
        bs: &mut BooleanStream,
    ) -> Result<(), CodecError> {
        let Command::BrokerInfo(info) = command else {
            return Err(unexpected(command));
        };
        tight_header2(info.command_id, out, bs)?;
        tight_marshal_string2(info.broker_id.as_deref(), out, bs)?;
        tight_marshal_string2(info.broker_url.as_deref(), out, bs)?;
        tight_marshal_string2(info.broker_name.as_deref(), out, bs)
    }

    fn tight_unmarshal(
        &self,
        _ctx: &mut MarshalContext,
        reader: &mut DataReader<'_>,
        bs: &mut BooleanStream,
    ) -> Result<Command, CodecError> {
        let (command_id, response_required) = tight_unmarshal_header(reader, bs)?;
        Ok(Command::BrokerInfo(BrokerInfo {
            command_id,
            response_required,
            broker_id: tight_unmarshal_string(reader, bs)?,
            broker_url: tight_unmarshal_string(reader, bs)?,
            broker_name: tight_unmarshal_string(reader, bs)?,
        }))
    }

    fn loose_marshal(
        &self,
        _ctx: &mut MarshalContext,
        command: &Command,
        out: &mut BytesMut,
    ) -> Result<(), CodecError> {
        let Command::BrokerInfo(info) = command else {
            return Err(unexpected(command));
        };
        loose_header(info.command_id, info.response_required, out);
        loose_marshal_string(info.broker_id.as_deref(), out);
        loose_marshal_string(info.broker_url.as_deref(), out);
        loose_marshal_string(info.broker_name.as_deref(), out);
        Ok(())
    }

    fn loose_unmarshal(
        &self,
        _ctx: &mut MarshalContext,
        reader: &mut DataReader<'_>,
    ) -> Result<Command, CodecError> {
        let (command_id, response_required) = loose_unmarshal_header(reader)?;
        Ok(Command::BrokerInfo(BrokerInfo {
            command_id,
            response_required,
            broker_id: loose_unmarshal_string(reader)?,
            broker_url: loose_unmarshal_string(reader)?,
            broker_name: loose_unmarshal_string(reader)?,
        }))
    }
}

struct ConnectionInfoMarshaller;

impl DataStreamMarshaller for ConnectionInfoMarshaller {
    fn data_structure_type(&self) -> u8 {
        types::CONNECTION_INFO
    }

    fn tight_marshal1(
        &self,
        _ctx: &mut MarshalContext,
        command: &Command,
        bs: &mut BooleanStream,
    ) -> Result<usize, CodecError> {
        let Command::ConnectionInfo(info) = command else {
            return Err(unexpected(command));
        };
        Ok(tight_header1(info.command_id, info.response_required, bs)
            + tight_marshal_connection_id1(Some(&info.connection_id), bs)
            + tight_marshal_string1(info.client_id.as_deref(), bs)
            + tight_marshal_string1(info.user_name.as_deref(), bs)
            + tight_marshal_string1(info.password.as_deref(), bs))
    }

    fn tight_marshal2(
        &self,
        _ctx: &mut MarshalContext,
        command: &Command,
        out: &mut BytesMut,
        bs: &mut BooleanStream,
    ) -> Result<(), CodecError> {
        let Command::ConnectionInfo(info) = command else {
            return Err(unexpected(command));
        };
        tight_header2(info.command_id, out, bs)?;
        tight_marshal_connection_id2(Some(&info.connection_id), out, bs)?;
        tight_marshal_string2(info.client_id.as_deref(), out, bs)?;
        tight_marshal_string2(info.user_name.as_deref(), out, bs)?;
        tight_marshal_string2(info.password.as_deref(), out, bs)
    }

    fn tight_unmarshal(
        &self,
        _ctx: &mut MarshalContext,
        reader: &mut DataReader<'_>,
        bs: &mut BooleanStream,
    ) -> Result<Command, CodecError> {
        let (command_id, response_required) = tight_unmarshal_header(reader, bs)?;
        let connection_id =
            tight_unmarshal_connection_id(reader, bs)?.ok_or(CodecError::InvalidField {
                field: "connection info id",
                value: 0,
            })?;
        Ok(Command::ConnectionInfo(ConnectionInfo {
            command_id,
            response_required,
            connection_id,
            client_id: tight_unmarshal_string(reader, bs)?,
            user_name: tight_unmarshal_string(reader, bs)?,
            password: tight_unmarshal_string(reader, bs)?,
        }))
    }

    fn loose_marshal(
        &self,
        _ctx: &mut MarshalContext,
        command: &Command,
        out: &mut BytesMut,
    ) -> Result<(), CodecError> {
        let Command::ConnectionInfo(info) = command else {
            return Err(unexpected(command));
        };
        loose_header(info.command_id, info.response_required, out);
        loose_marshal_connection_id(Some(&info.connection_id), out);
        loose_marshal_string(info.client_id.as_deref(), out);
        loose_marshal_string(info.user_name.as_deref(), out);
        loose_marshal_string(info.password.as_deref(), out);
        Ok(())
    }

    fn loose_unmarshal(
        &self,
        _ctx: &mut MarshalContext,
        reader: &mut DataReader<'_>,
    ) -> Result<Command, CodecError> {
        let (command_id, response_required) = loose_unmarshal_header(reader)?;
        let connection_id =
            loose_unmarshal_connection_id(reader)?.ok_or(CodecError::InvalidField {
                field: "connection info id",
                value: 0,
            })?;
        Ok(Command::ConnectionInfo(ConnectionInfo {
            command_id,
            response_required,
            connection_id,
            client_id: loose_unmarshal_string(reader)?,
            user_name: loose_unmarshal_string(reader)?,
            password: loose_unmarshal_string(reader)?,
        }))
    }
}

struct SessionInfoMarshaller;

impl DataStreamMarshaller for SessionInfoMarshaller {
    fn data_structure_type(&self) -> u8 {
        types::SESSION_INFO
    }

    fn tight_marshal1(
        &self,
        _ctx: &mut MarshalContext,
        command: &Command,
        bs: &mut BooleanStream,
    ) -> Result<usize, CodecError> {
        let Command::SessionInfo(info) = command else {
            return Err(unexpected(command));
        };
        Ok(tight_header1(info.command_id, info.response_required, bs)
            + tight_marshal_session_id1(Some(&info.session_id), bs))
    }

    fn tight_marshal2(
        &self,
        _ctx: &mut MarshalContext,
        command: &Command,
        out: &mut BytesMut,
        bs: &mut BooleanStream,
    ) -> Result<(), CodecError> {
        let Command::SessionInfo(info) = command else {
            return Err(unexpected(command));
        };
        tight_header2(info.command_id, out, bs)?;
        tight_marshal_session_id2(Some(&info.session_id), out, bs)
    }

    fn tight_unmarshal(
        &self,
        _ctx: &mut MarshalContext,
        reader: &mut DataReader<'_>,
        bs: &mut BooleanStream,
    ) -> Result<Command, CodecError> {
        let (command_id, response_required) = tight_unmarshal_header(reader, bs)?;
        let session_id = tight_unmarshal_session_id(reader, bs)?.ok_or(CodecError::InvalidField {
            field: "session info id",
            value: 0,
        })?;
        Ok(Command::SessionInfo(SessionInfo {
            command_id,
            response_required,
            session_id,
        }))
    }

    fn loose_marshal(
        &self,
        _ctx: &mut MarshalContext,
        command: &Command,
        out: &mut BytesMut,
    ) -> Result<(), CodecError> {
        let Command::SessionInfo(info) = command else {
            return Err(unexpected(command));
        };
        loose_header(info.command_id, info.response_required, out);
        loose_marshal_session_id(Some(&info.session_id), out);
        Ok(())
    }

    fn loose_unmarshal(
        &self,
        _ctx: &mut MarshalContext,
        reader: &mut DataReader<'_>,
    ) -> Result<Command, CodecError> {
        let (command_id, response_required) = loose_unmarshal_header(reader)?;
        let session_id = loose_unmarshal_session_id(reader)?.ok_or(CodecError::InvalidField {
            field: "session info id",
            value: 0,
        })?;
        Ok(Command::SessionInfo(SessionInfo {
            command_id,
            response_required,
            session_id,
        }))
    }
}

struct ConsumerInfoMarshaller {
    version: u32,
}

impl DataStreamMarshaller for ConsumerInfoMarshaller {
    fn data_structure_type(&self) -> u8 {
        types::CONSUMER_INFO
    }

    fn tight_marshal1(
        &self,
        ctx: &mut MarshalContext,
        command: &Command,
        bs: &mut BooleanStream,
    ) -> Result<usize, CodecError> {
        let Command::ConsumerInfo(info) = command else {
            return Err(unexpected(command));
        };
        let size = tight_header1(info.command_id, info.response_required, bs)
            + tight_marshal_consumer_id1(Some(&info.consumer_id), bs)
            + tight_marshal_destination1(ctx, Some(&info.destination), bs)
            + tight_marshal_cached_string1(ctx, info.selector.as_deref(), bs)
            + tight_marshal_string1(info.subscription_name.as_deref(), bs)
            + tight_marshal_long1(i64::from(info.prefetch_size), bs)
            + tight_marshal_long1(i64::from(info.maximum_pending_message_limit), bs)
            + 1; // priority
        bs.write_boolean(info.no_local);
        bs.write_boolean(info.browser);
        bs.write_boolean(info.dispatch_async);
        bs.write_boolean(info.exclusive);
        bs.write_boolean(info.retroactive);
        if self.version >= 2 {
            bs.write_boolean(info.network_subscription);
        }
        Ok(size)
    }

    fn tight_marshal2(
        &self,
        ctx: &mut MarshalContext,
        command: &Command,
        out: &mut BytesMut,
        bs: &mut BooleanStream,
    ) -> Result<(), CodecError> {
        let Command::ConsumerInfo(info) = command else {
            return Err(unexpected(command));
        };
        tight_header2(info.command_id, out, bs)?;
        tight_marshal_consumer_id2(Some(&info.consumer_id), out, bs)?;
        tight_marshal_destination2(ctx, Some(&info.destination), out, bs)?;
        tight_marshal_cached_string2(ctx, info.selector.as_deref(), out, bs)?;
        tight_marshal_string2(info.subscription_name.as_deref(), out, bs)?;
        tight_marshal_long2(i64::from(info.prefetch_size), out, bs)?;
        tight_marshal_long2(i64::from(info.maximum_pending_message_limit), out, bs)?;
        out.put_u8(info.priority);
        for _ in 0..5 {
            bs.read_boolean()?;
        }
        if self.version >= 2 {
            bs.read_boolean()?;
        }
        Ok(())
    }

    fn tight_unmarshal(
        &self,
        ctx: &mut MarshalContext,
        reader: &mut DataReader<'_>,
        bs: &mut BooleanStream,
    ) -> Result<Command, CodecError> {
        let (command_id, response_required) = tight_unmarshal_header(reader, bs)?;
        let consumer_id =
            tight_unmarshal_consumer_id(reader, bs)?.ok_or(CodecError::InvalidField {
                field: "consumer info id",
                value: 0,
            })?;
        let destination =
            tight_unmarshal_destination(ctx, reader, bs)?.ok_or(CodecError::InvalidField {
                field: "consumer info destination",
                value: 0,
            })?;
        let selector = tight_unmarshal_cached_string(ctx, reader, bs)?;
        let subscription_name = tight_unmarshal_string(reader, bs)?;
        let prefetch_size = tight_unmarshal_long(reader, bs)? as i32;
        let maximum_pending_message_limit = tight_unmarshal_long(reader, bs)? as i32;
        let priority = reader.read_u8()?;
        let no_local = bs.read_boolean()?;
        let browser = bs.read_boolean()?;
        let dispatch_async = bs.read_boolean()?;
        let exclusive = bs.read_boolean()?;
        let retroactive = bs.read_boolean()?;
        let network_subscription = if self.version >= 2 {
            bs.read_boolean()?
        } else {
            false
        };
        Ok(Command::ConsumerInfo(ConsumerInfo {
            command_id,
            response_required,
            consumer_id,
            destination,
            selector,
            subscription_name,
            prefetch_size,
            maximum_pending_message_limit,
            no_local,
            browser,
            dispatch_async,
            exclusive,
            retroactive,
            priority,
            network_subscription,
        }))
    }

    fn loose_marshal(
        &self,
        _ctx: &mut MarshalContext,
        command: &Command,
        out: &mut BytesMut,
    ) -> Result<(), CodecError> {
        let Command::ConsumerInfo(info) = command else {
            return Err(unexpected(command));
        };
        loose_header(info.command_id, info.response_required, out);
        loose_marshal_consumer_id(Some(&info.consumer_id), out);
        loose_marshal_destination(Some(&info.destination), out);
        loose_marshal_string(info.selector.as_deref(), out);
        loose_marshal_string(info.subscription_name.as_deref(), out);
        out.put_i32(info.prefetch_size);
        out.put_i32(info.maximum_pending_message_limit);
        out.put_u8(info.priority);
        out.put_u8(u8::from(info.no_local));
        out.put_u8(u8::from(info.browser));
        out.put_u8(u8::from(info.dispatch_async));
        out.put_u8(u8::from(info.exclusive));
        out.put_u8(u8::from(info.retroactive));
        if self.version >= 2 {
            out.put_u8(u8::from(info.network_subscription));
        }
        Ok(())
    }

    fn loose_unmarshal(
        &self,
        _ctx: &mut MarshalContext,
        reader: &mut DataReader<'_>,
    ) -> Result<Command, CodecError> {
        let (command_id, response_required) = loose_unmarshal_header(reader)?;
        let consumer_id = loose_unmarshal_consumer_id(reader)?.ok_or(CodecError::InvalidField {
            field: "consumer info id",
            value: 0,
        })?;
        let destination = loose_unmarshal_destination(reader)?.ok_or(CodecError::InvalidField {
            field: "consumer info destination",
            value: 0,
        })?;
        let selector = loose_unmarshal_string(reader)?;
        let subscription_name = loose_unmarshal_string(reader)?;
        let prefetch_size = reader.read_i32()?;
        let maximum_pending_message_limit = reader.read_i32()?;
        let priority = reader.read_u8()?;
        let no_local = reader.read_bool()?;
        let browser = reader.read_bool()?;
        let dispatch_async = reader.read_bool()?;
        let exclusive = reader.read_bool()?;
        let retroactive = reader.read_bool()?;
        let network_subscription = if self.version >= 2 {
            reader.read_bool()?
        } else {
            false
        };
        Ok(Command::ConsumerInfo(ConsumerInfo {
            command_id,
            response_required,
            consumer_id,
            destination,
            selector,
            subscription_name,
            prefetch_size,
            maximum_pending_message_limit,
            no_local,
            browser,
            dispatch_async,
            exclusive,
            retroactive,
            priority,
            network_subscription,
        }))
    }
}

struct ProducerInfoMarshaller;

impl DataStreamMarshaller for ProducerInfoMarshaller {
    fn data_structure_type(&self) -> u8 {
        types::PRODUCER_INFO
    }

    fn tight_marshal1(
        &self,
        ctx: &mut MarshalContext,
        command: &Command,
        bs: &mut BooleanStream,
    ) -> Result<usize, CodecError> {
        let Command::ProducerInfo(info) = command else {
            return Err(unexpected(command));
        };
        Ok(tight_header1(info.command_id, info.response_required, bs)
            + tight_marshal_producer_id1(Some(&info.producer_id), bs)
            + tight_marshal_destination1(ctx, info.destination.as_ref(), bs))
    }

    fn tight_marshal2(
        &self,
        ctx: &mut MarshalContext,
        command: &Command,
        out: &mut BytesMut,
        bs: &mut BooleanStream,
    ) -> Result<(), CodecError> {
        let Command::ProducerInfo(info) = command else {
            return Err(unexpected(command));
        };
        tight_header2(info.command_id, out, bs)?;
        tight_marshal_producer_id2(Some(&info.producer_id), out, bs)?;
        tight_marshal_destination2(ctx, info.destination.as_ref(), out, bs)
    }

    fn tight_unmarshal(
        &self,
        ctx: &mut MarshalContext,
        reader: &mut DataReader<'_>,
        bs: &mut BooleanStream,
    ) -> Result<Command, CodecError> {
        let (command_id, response_required) = tight_unmarshal_header(reader, bs)?;
        let producer_id =
            tight_unmarshal_producer_id(reader, bs)?.ok_or(CodecError::InvalidField {
                field: "producer info id",
                value: 0,
            })?;
        Ok(Command::ProducerInfo(ProducerInfo {
            command_id,
            response_required,
            producer_id,
            destination: tight_unmarshal_destination(ctx, reader, bs)?,
        }))
    }

    fn loose_marshal(
        &self,
        _ctx: &mut MarshalContext,
        command: &Command,
        out: &mut BytesMut,
    ) -> Result<(), CodecError> {
        let Command::ProducerInfo(info) = command else {
            return Err(unexpected(command));
        };
        loose_header(info.command_id, info.response_required, out);
        loose_marshal_producer_id(Some(&info.producer_id), out);
        loose_marshal_destination(info.destination.as_ref(), out);
        Ok(())
    }

    fn loose_unmarshal(
        &self,
        _ctx: &mut MarshalContext,
        reader: &mut DataReader<'_>,
    ) -> Result<Command, CodecError> {
        let (command_id, response_required) = loose_unmarshal_header(reader)?;
        let producer_id = loose_unmarshal_producer_id(reader)?.ok_or(CodecError::InvalidField {
            field: "producer info id",
            value: 0,
        })?;
        Ok(Command::ProducerInfo(ProducerInfo {
            command_id,
            response_required,
            producer_id,
            destination: loose_unmarshal_destination(reader)?,
        }))
    }
}

struct RemoveInfoMarshaller {
    version: u32,
}

impl DataStreamMarshaller for RemoveInfoMarshaller {
    fn data_structure_type(&self) -> u8 {
        types::REMOVE_INFO
    }

    fn tight_marshal1(
        &self,
        _ctx: &mut MarshalContext,
        command: &Command,
        bs: &mut BooleanStream,
    ) -> Result<usize, CodecError> {
        let Command::RemoveInfo(info) = command else {
            return Err(unexpected(command));
        };
        let mut size = tight_header1(info.command_id, info.response_required, bs)
            + tight_marshal_removed_object1(&info.object_id, bs);
        if self.version >= 2 {
            size += tight_marshal_long1(info.last_delivered_sequence_id, bs);
        }
        Ok(size)
    }

    fn tight_marshal2(
        &self,
        _ctx: &mut MarshalContext,
        command: &Command,
        out: &mut BytesMut,
        bs: &mut BooleanStream,
    ) -> Result<(), CodecError> {
        let Command::RemoveInfo(info) = command else {
            return Err(unexpected(command));
        };
        tight_header2(info.command_id, out, bs)?;
        tight_marshal_removed_object2(&info.object_id, out, bs)?;
        if self.version >= 2 {
            tight_marshal_long2(info.last_delivered_sequence_id, out, bs)?;
        }
        Ok(())
    }

    fn tight_unmarshal(
        &self,
        _ctx: &mut MarshalContext,
        reader: &mut DataReader<'_>,
        bs: &mut BooleanStream,
    ) -> Result<Command, CodecError> {
        let (command_id, response_required) = tight_unmarshal_header(reader, bs)?;
        let object_id = tight_unmarshal_removed_object(reader, bs)?;
        let last_delivered_sequence_id = if self.version >= 2 {
            tight_unmarshal_long(reader, bs)?
        } else {
            0
        };
        Ok(Command::RemoveInfo(RemoveInfo {
            command_id,
            response_required,
            object_id,
            last_delivered_sequence_id,
        }))
    }

    fn loose_marshal(
        &self,
        _ctx: &mut MarshalContext,
        command: &Command,
        out: &mut BytesMut,
    ) -> Result<(), CodecError> {
        let Command::RemoveInfo(info) = command else {
            return Err(unexpected(command));
        };
        loose_header(info.command_id, info.response_required, out);
        loose_marshal_removed_object(&info.object_id, out);
        if self.version >= 2 {
            out.put_i64(info.last_delivered_sequence_id);
        }
        Ok(())
    }

    fn loose_unmarshal(
        &self,
        _ctx: &mut MarshalContext,
        reader: &mut DataReader<'_>,
    ) -> Result<Command, CodecError> {
        let (command_id, response_required) = loose_unmarshal_header(reader)?;
        let object_id = loose_unmarshal_removed_object(reader)?;
        let last_delivered_sequence_id = if self.version >= 2 {
            reader.read_i64()?
        } else {
            0
        };
        Ok(Command::RemoveInfo(RemoveInfo {
            command_id,
            response_required,
            object_id,
            last_delivered_sequence_id,
        }))
    }
}

struct RemoveSubscriptionInfoMarshaller;

impl DataStreamMarshaller for RemoveSubscriptionInfoMarshaller {
    fn data_structure_type(&self) -> u8 {
        types::REMOVE_SUBSCRIPTION_INFO
    }

    fn tight_marshal1(
        &self,
        _ctx: &mut MarshalContext,
        command: &Command,
        bs: &mut BooleanStream,
    ) -> Result<usize, CodecError> {
        let Command::RemoveSubscriptionInfo(info) = command else {
            return Err(unexpected(command));
        };
        Ok(tight_header1(info.command_id, info.response_required, bs)
            + tight_marshal_connection_id1(Some(&info.connection_id), bs)
            + tight_marshal_string1(info.client_id.as_deref(), bs)
            + tight_marshal_string1(Some(&info.subscription_name), bs))
    }

    fn tight_marshal2(
        &self,
        _ctx: &mut MarshalContext,
        command: &Command,
        out: &mut BytesMut,
        bs: &mut BooleanStream,
    ) -> Result<(), CodecError> {
        let Command::RemoveSubscriptionInfo(info) = command else {
            return Err(unexpected(command));
        };
        tight_header2(info.command_id, out, bs)?;
        tight_marshal_connection_id2(Some(&info.connection_id), out, bs)?;
        tight_marshal_string2(info.client_id.as_deref(), out, bs)?;
        tight_marshal_string2(Some(&info.subscription_name), out, bs)
    }

    fn tight_unmarshal(
        &self,
        _ctx: &mut MarshalContext,
        reader: &mut DataReader<'_>,
        bs: &mut BooleanStream,
    ) -> Result<Command, CodecError> {
        let (command_id, response_required) = tight_unmarshal_header(reader, bs)?;
        let connection_id =
            tight_unmarshal_connection_id(reader, bs)?.ok_or(CodecError::InvalidField {
                field: "remove subscription connection",
                value: 0,
            })?;
        Ok(Command::RemoveSubscriptionInfo(RemoveSubscriptionInfo {
            command_id,
            response_required,
            connection_id,
            client_id: tight_unmarshal_string(reader, bs)?,
            subscription_name: tight_unmarshal_string(reader, bs)?.unwrap_or_default(),
        }))
    }

    fn loose_marshal(
        &self,
        _ctx: &mut MarshalContext,
        command: &Command,
        out: &mut BytesMut,
    ) -> Result<(), CodecError> {
        let Command::RemoveSubscriptionInfo(info) = command else {
            return Err(unexpected(command));
        };
        loose_header(info.command_id, info.response_required, out);
        loose_marshal_connection_id(Some(&info.connection_id), out);
        loose_marshal_string(info.client_id.as_deref(), out);
        loose_marshal_string(Some(&info.subscription_name), out);
        Ok(())
    }

    fn loose_unmarshal(
        &self,
        _ctx: &mut MarshalContext,
        reader: &mut DataReader<'_>,
    ) -> Result<Command, CodecError> {
        let (command_id, response_required) = loose_unmarshal_header(reader)?;
        let connection_id =
            loose_unmarshal_connection_id(reader)?.ok_or(CodecError::InvalidField {
                field: "remove subscription connection",
                value: 0,
            })?;
        Ok(Command::RemoveSubscriptionInfo(RemoveSubscriptionInfo {
            command_id,
            response_required,
            connection_id,
            client_id: loose_unmarshal_string(reader)?,
            subscription_name: loose_unmarshal_string(reader)?.unwrap_or_default(),
        }))
    }
}

struct DestinationInfoMarshaller;

impl DataStreamMarshaller for DestinationInfoMarshaller {
    fn data_structure_type(&self) -> u8 {
        types::DESTINATION_INFO
    }

    fn tight_marshal1(
        &self,
        ctx: &mut MarshalContext,
        command: &Command,
        bs: &mut BooleanStream,
    ) -> Result<usize, CodecError> {
        let Command::DestinationInfo(info) = command else {
            return Err(unexpected(command));
        };
        Ok(tight_header1(info.command_id, info.response_required, bs)
            + tight_marshal_connection_id1(Some(&info.connection_id), bs)
            + tight_marshal_destination1(ctx, Some(&info.destination), bs)
            + 1
            + tight_marshal_long1(info.timeout, bs))
    }

    fn tight_marshal2(
        &self,
        ctx: &mut MarshalContext,
        command: &Command,
        out: &mut BytesMut,
        bs: &mut BooleanStream,
    ) -> Result<(), CodecError> {
        let Command::DestinationInfo(info) = command else {
            return Err(unexpected(command));
        };
        tight_header2(info.command_id, out, bs)?;
        tight_marshal_connection_id2(Some(&info.connection_id), out, bs)?;
        tight_marshal_destination2(ctx, Some(&info.destination), out, bs)?;
        out.put_u8(info.operation as u8);
        tight_marshal_long2(info.timeout, out, bs)
    }

    fn tight_unmarshal(
        &self,
        ctx: &mut MarshalContext,
        reader: &mut DataReader<'_>,
        bs: &mut BooleanStream,
    ) -> Result<Command, CodecError> {
        let (command_id, response_required) = tight_unmarshal_header(reader, bs)?;
        let connection_id =
            tight_unmarshal_connection_id(reader, bs)?.ok_or(CodecError::InvalidField {
                field: "destination info connection",
                value: 0,
            })?;
        let destination =
            tight_unmarshal_destination(ctx, reader, bs)?.ok_or(CodecError::InvalidField {
                field: "destination info destination",
                value: 0,
            })?;
        let operation = match reader.read_u8()? {
            0 => DestinationOperation::Add,
            1 => DestinationOperation::Remove,
            other => {
                return Err(CodecError::InvalidField {
                    field: "destination operation",
                    value: i64::from(other),
                });
            }
        };
        let timeout = tight_unmarshal_long(reader, bs)?;
        Ok(Command::DestinationInfo(DestinationInfo {
            command_id,
            response_required,
            connection_id,
            destination,
            operation,
            timeout,
        }))
    }

    fn loose_marshal(
        &self,
        _ctx: &mut MarshalContext,
        command: &Command,
        out: &mut BytesMut,
    ) -> Result<(), CodecError> {
        let Command::DestinationInfo(info) = command else {
            return Err(unexpected(command));
        };
        loose_header(info.command_id, info.response_required, out);
        loose_marshal_connection_id(Some(&info.connection_id), out);
        loose_marshal_destination(Some(&info.destination), out);
        out.put_u8(info.operation as u8);
        out.put_i64(info.timeout);
        Ok(())
    }

    fn loose_unmarshal(
        &self,
        _ctx: &mut MarshalContext,
        reader: &mut DataReader<'_>,
    ) -> Result<Command, CodecError> {
        let (command_id, response_required) = loose_unmarshal_header(reader)?;
        let connection_id =
            loose_unmarshal_connection_id(reader)?.ok_or(CodecError::InvalidField {
                field: "destination info connection",
                value: 0,
            })?;
        let destination = loose_unmarshal_destination(reader)?.ok_or(CodecError::InvalidField {
            field: "destination info destination",
            value: 0,
        })?;
        let operation = match reader.read_u8()? {
            0 => DestinationOperation::Add,
            1 => DestinationOperation::Remove,
            other => {
                return Err(CodecError::InvalidField {
                    field: "destination operation",
                    value: i64::from(other),
                });
            }
        };
        let timeout = reader.read_i64()?;
        Ok(Command::DestinationInfo(DestinationInfo {
            command_id,
            response_required,
            connection_id,
            destination,
            operation,
            timeout,
        }))
    }
}

struct MessageDispatchMarshaller;

impl DataStreamMarshaller for MessageDispatchMarshaller {
    fn data_structure_type(&self) -> u8 {
        types::MESSAGE_DISPATCH
    }

    fn tight_marshal1(
        &self,
        ctx: &mut MarshalContext,
        command: &Command,
        bs: &mut BooleanStream,
    ) -> Result<usize, CodecError> {
        let Command::MessageDispatch(dispatch) = command else {
            return Err(unexpected(command));
        };
        Ok(
            tight_header1(dispatch.command_id, dispatch.response_required, bs)
                + tight_marshal_consumer_id1(Some(&dispatch.consumer_id), bs)
                + tight_marshal_destination1(ctx, dispatch.destination.as_ref(), bs)
                + tight_marshal_nested_message1(ctx, dispatch.message.as_deref(), bs)?
                + tight_marshal_long1(i64::from(dispatch.redelivery_counter), bs),
        )
    }

    fn tight_marshal2(
        &self,
        ctx: &mut MarshalContext,
        command: &Command,
        out: &mut BytesMut,
        bs: &mut BooleanStream,
    ) -> Result<(), CodecError> {
        let Command::MessageDispatch(dispatch) = command else {
            return Err(unexpected(command));
        };
        tight_header2(dispatch.command_id, out, bs)?;
        tight_marshal_consumer_id2(Some(&dispatch.consumer_id), out, bs)?;
        tight_marshal_destination2(ctx, dispatch.destination.as_ref(), out, bs)?;
        tight_marshal_nested_message2(ctx, dispatch.message.as_deref(), out, bs)?;
        tight_marshal_long2(i64::from(dispatch.redelivery_counter), out, bs)
    }

    fn tight_unmarshal(
        &self,
        ctx: &mut MarshalContext,
        reader: &mut DataReader<'_>,
        bs: &mut BooleanStream,
    ) -> Result<Command, CodecError> {
        let (command_id, response_required) = tight_unmarshal_header(reader, bs)?;
        let consumer_id =
            tight_unmarshal_consumer_id(reader, bs)?.ok_or(CodecError::InvalidField {
                field: "dispatch consumer id",
                value: 0,
            })?;
        let destination = tight_unmarshal_destination(ctx, reader, bs)?;
        let message = tight_unmarshal_nested_message(ctx, reader, bs)?.map(Box::new);
        let redelivery_counter = tight_unmarshal_long(reader, bs)? as i32;
        Ok(Command::MessageDispatch(Box::new(MessageDispatch {
            command_id,
            response_required,
            consumer_id,
            destination,
            message,
            redelivery_counter,
        })))
    }

    fn loose_marshal(
        &self,
        ctx: &mut MarshalContext,
        command: &Command,
        out: &mut BytesMut,
    ) -> Result<(), CodecError> {
        let Command::MessageDispatch(dispatch) = command else {
            return Err(unexpected(command));
        };
        loose_header(dispatch.command_id, dispatch.response_required, out);
        loose_marshal_consumer_id(Some(&dispatch.consumer_id), out);
        loose_marshal_destination(dispatch.destination.as_ref(), out);
        loose_marshal_nested_message(ctx, dispatch.message.as_deref(), out)?;
        out.put_i32(dispatch.redelivery_counter);
        Ok(())
    }

    fn loose_unmarshal(
        &self,
        ctx: &mut MarshalContext,
        reader: &mut DataReader<'_>,
    ) -> Result<Command, CodecError> {
        let (command_id, response_required) = loose_unmarshal_header(reader)?;
        let consumer_id = loose_unmarshal_consumer_id(reader)?.ok_or(CodecError::InvalidField {
            field: "dispatch consumer id",
            value: 0,
        })?;
        let destination = loose_unmarshal_destination(reader)?;
        let message = loose_unmarshal_nested_message(ctx, reader)?.map(Box::new);
        let redelivery_counter = reader.read_i32()?;
        Ok(Command::MessageDispatch(Box::new(MessageDispatch {
            command_id,
            response_required,
            consumer_id,
            destination,
            message,
            redelivery_counter,
        })))
    }
}

struct MessageAckMarshaller;

impl DataStreamMarshaller for MessageAckMarshaller {
    fn data_structure_type(&self) -> u8 {
        types::MESSAGE_ACK
    }

    fn tight_marshal1(
        &self,
        ctx: &mut MarshalContext,
        command: &Command,
        bs: &mut BooleanStream,
    ) -> Result<usize, CodecError> {
        let Command::MessageAck(ack) = command else {
            return Err(unexpected(command));
        };
        Ok(tight_header1(ack.command_id, ack.response_required, bs)
            + 1 // ack type
            + tight_marshal_consumer_id1(Some(&ack.consumer_id), bs)
            + tight_marshal_destination1(ctx, ack.destination.as_ref(), bs)
            + tight_marshal_transaction_id1(ack.transaction_id.as_ref(), bs)
            + tight_marshal_message_id1(ack.first_message_id.as_ref(), bs)
            + tight_marshal_message_id1(ack.last_message_id.as_ref(), bs)
            + 4)
    }

    fn tight_marshal2(
        &self,
        ctx: &mut MarshalContext,
        command: &Command,
        out: &mut BytesMut,
        bs: &mut BooleanStream,
    ) -> Result<(), CodecError> {
        let Command::MessageAck(ack) = command else {
            return Err(unexpected(command));
        };
        tight_header2(ack.command_id, out, bs)?;
        out.put_u8(ack.ack_type as u8);
        tight_marshal_consumer_id2(Some(&ack.consumer_id), out, bs)?;
        tight_marshal_destination2(ctx, ack.destination.as_ref(), out, bs)?;
        tight_marshal_transaction_id2(ack.transaction_id.as_ref(), out, bs)?;
        tight_marshal_message_id2(ack.first_message_id.as_ref(), out, bs)?;
        tight_marshal_message_id2(ack.last_message_id.as_ref(), out, bs)?;
        out.put_i32(ack.message_count);
        Ok(())
    }

    fn tight_unmarshal(
        &self,
        ctx: &mut MarshalContext,
        reader: &mut DataReader<'_>,
        bs: &mut BooleanStream,
    ) -> Result<Command, CodecError> {
        let (command_id, response_required) = tight_unmarshal_header(reader, bs)?;
        let raw_type = reader.read_u8()?;
        let ack_type = AckType::from_wire(raw_type).ok_or(CodecError::InvalidField {
            field: "ack type",
            value: i64::from(raw_type),
        })?;
        let consumer_id =
            tight_unmarshal_consumer_id(reader, bs)?.ok_or(CodecError::InvalidField {
                field: "ack consumer id",
                value: 0,
            })?;
        Ok(Command::MessageAck(MessageAck {
            command_id,
            response_required,
            ack_type,
            consumer_id,
            destination: tight_unmarshal_destination(ctx, reader, bs)?,
            transaction_id: tight_unmarshal_transaction_id(reader, bs)?,
            first_message_id: tight_unmarshal_message_id(reader, bs)?,
            last_message_id: tight_unmarshal_message_id(reader, bs)?,
            message_count: reader.read_i32()?,
        }))
    }

    fn loose_marshal(
        &self,
        _ctx: &mut MarshalContext,
        command: &Command,
        out: &mut BytesMut,
    ) -> Result<(), CodecError> {
        let Command::MessageAck(ack) = command else {
            return Err(unexpected(command));
        };
        loose_header(ack.command_id, ack.response_required, out);
        out.put_u8(ack.ack_type as u8);
        loose_marshal_consumer_id(Some(&ack.consumer_id), out);
        loose_marshal_destination(ack.destination.as_ref(), out);
        loose_marshal_transaction_id(ack.transaction_id.as_ref(), out);
        loose_marshal_message_id(ack.first_message_id.as_ref(), out);
        loose_marshal_message_id(ack.last_message_id.as_ref(), out);
        out.put_i32(ack.message_count);
        Ok(())
    }

    fn loose_unmarshal(
        &self,
        _ctx: &mut MarshalContext,
        reader: &mut DataReader<'_>,
    ) -> Result<Command, CodecError> {
        let (command_id, response_required) = loose_unmarshal_header(reader)?;
        let raw_type = reader.read_u8()?;
        let ack_type = AckType::from_wire(raw_type).ok_or(CodecError::InvalidField {
            field: "ack type",
            value: i64::from(raw_type),
        })?;
        let consumer_id = loose_unmarshal_consumer_id(reader)?.ok_or(CodecError::InvalidField {
            field: "ack consumer id",
            value: 0,
        })?;
        Ok(Command::MessageAck(MessageAck {
            command_id,
            response_required,
            ack_type,
            consumer_id,
            destination: loose_unmarshal_destination(reader)?,
            transaction_id: loose_unmarshal_transaction_id(reader)?,
            first_message_id: loose_unmarshal_message_id(reader)?,
            last_message_id: loose_unmarshal_message_id(reader)?,
            message_count: reader.read_i32()?,
        }))
    }
}

struct MessagePullMarshaller;

impl DataStreamMarshaller for MessagePullMarshaller {
    fn data_structure_type(&self) -> u8 {
        types::MESSAGE_PULL
    }

    fn tight_marshal1(
        &self,
        ctx: &mut MarshalContext,
        command: &Command,
        bs: &mut BooleanStream,
    ) -> Result<usize, CodecError> {
        let Command::MessagePull(pull) = command else {
            return Err(unexpected(command));
        };
        Ok(tight_header1(pull.command_id, pull.response_required, bs)
            + tight_marshal_consumer_id1(Some(&pull.consumer_id), bs)
            + tight_marshal_destination1(ctx, pull.destination.as_ref(), bs)
            + tight_marshal_long1(pull.timeout, bs))
    }

    fn tight_marshal2(
        &self,
        ctx: &mut MarshalContext,
        command: &Command,
        out: &mut BytesMut,
        bs: &mut BooleanStream,
    ) -> Result<(), CodecError> {
        let Command::MessagePull(pull) = command else {
            return Err(unexpected(command));
        };
        tight_header2(pull.command_id, out, bs)?;
        tight_marshal_consumer_id2(Some(&pull.consumer_id), out, bs)?;
        tight_marshal_destination2(ctx, pull.destination.as_ref(), out, bs)?;
        tight_marshal_long2(pull.timeout, out, bs)
    }

    fn tight_unmarshal(
        &self,
        ctx: &mut MarshalContext,
        reader: &mut DataReader<'_>,
        bs: &mut BooleanStream,
    ) -> Result<Command, CodecError> {
        let (command_id, response_required) = tight_unmarshal_header(reader, bs)?;
        let consumer_id =
            tight_unmarshal_consumer_id(reader, bs)?.ok_or(CodecError::InvalidField {
                field: "pull consumer id",
                value: 0,
            })?;
        Ok(Command::MessagePull(MessagePull {
            command_id,
            response_required,
            consumer_id,
            destination: tight_unmarshal_destination(ctx, reader, bs)?,
            timeout: tight_unmarshal_long(reader, bs)?,
        }))
    }

    fn loose_marshal(
        &self,
        _ctx: &mut MarshalContext,
        command: &Command,
        out: &mut BytesMut,
    ) -> Result<(), CodecError> {
        let Command::MessagePull(pull) = command else {
            return Err(unexpected(command));
        };
        loose_header(pull.command_id, pull.response_required, out);
        loose_marshal_consumer_id(Some(&pull.consumer_id), out);
        loose_marshal_destination(pull.destination.as_ref(), out);
        out.put_i64(pull.timeout);
        Ok(())
    }

    fn loose_unmarshal(
        &self,
        _ctx: &mut MarshalContext,
        reader: &mut DataReader<'_>,
    ) -> Result<Command, CodecError> {
        let (command_id, response_required) = loose_unmarshal_header(reader)?;
        let consumer_id = loose_unmarshal_consumer_id(reader)?.ok_or(CodecError::InvalidField {
            field: "pull consumer id",
            value: 0,
        })?;
        Ok(Command::MessagePull(MessagePull {
            command_id,
            response_required,
            consumer_id,
            destination: loose_unmarshal_destination(reader)?,
            timeout: reader.read_i64()?,
        }))
    }
}

struct TransactionInfoMarshaller;

impl DataStreamMarshaller for TransactionInfoMarshaller {
    fn data_structure_type(&self) -> u8 {
        types::TRANSACTION_INFO
    }

    fn tight_marshal1(
        &self,
        _ctx: &mut MarshalContext,
        command: &Command,
        bs: &mut BooleanStream,
    ) -> Result<usize, CodecError> {
        let Command::TransactionInfo(info) = command else {
            return Err(unexpected(command));
        };
        Ok(tight_header1(info.command_id, info.response_required, bs)
            + tight_marshal_connection_id1(Some(&info.connection_id), bs)
            + tight_marshal_transaction_id1(info.transaction_id.as_ref(), bs)
            + 1)
    }

    fn tight_marshal2(
        &self,
        _ctx: &mut MarshalContext,
        command: &Command,
        out: &mut BytesMut,
        bs: &mut BooleanStream,
    ) -> Result<(), CodecError> {
        let Command::TransactionInfo(info) = command else {
            return Err(unexpected(command));
        };
        tight_header2(info.command_id, out, bs)?;
        tight_marshal_connection_id2(Some(&info.connection_id), out, bs)?;
        tight_marshal_transaction_id2(info.transaction_id.as_ref(), out, bs)?;
        out.put_u8(info.transaction_type as u8);
        Ok(())
    }

    fn tight_unmarshal(
        &self,
        _ctx: &mut MarshalContext,
        reader: &mut DataReader<'_>,
        bs: &mut BooleanStream,
    ) -> Result<Command, CodecError> {
        let (command_id, response_required) = tight_unmarshal_header(reader, bs)?;
        let connection_id =
            tight_unmarshal_connection_id(reader, bs)?.ok_or(CodecError::InvalidField {
                field: "transaction connection",
                value: 0,
            })?;
        let transaction_id = tight_unmarshal_transaction_id(reader, bs)?;
        let raw_type = reader.read_u8()?;
        let transaction_type =
            TransactionType::from_wire(raw_type).ok_or(CodecError::InvalidField {
                field: "transaction type",
                value: i64::from(raw_type),
            })?;
        Ok(Command::TransactionInfo(TransactionInfo {
            command_id,
            response_required,
            connection_id,
            transaction_id,
            transaction_type,
        }))
    }

    fn loose_marshal(
        &self,
        _ctx: &mut MarshalContext,
        command: &Command,
        out: &mut BytesMut,
    ) -> Result<(), CodecError> {
        let Command::TransactionInfo(info) = command else {
            return Err(unexpected(command));
        };
        loose_header(info.command_id, info.response_required, out);
        loose_marshal_connection_id(Some(&info.connection_id), out);
        loose_marshal_transaction_id(info.transaction_id.as_ref(), out);
        out.put_u8(info.transaction_type as u8);
        Ok(())
    }

    fn loose_unmarshal(
        &self,
        _ctx: &mut MarshalContext,
        reader: &mut DataReader<'_>,
    ) -> Result<Command, CodecError> {
        let (command_id, response_required) = loose_unmarshal_header(reader)?;
        let connection_id =
            loose_unmarshal_connection_id(reader)?.ok_or(CodecError::InvalidField {
                field: "transaction connection",
                value: 0,
            })?;
        let transaction_id = loose_unmarshal_transaction_id(reader)?;
        let raw_type = reader.read_u8()?;
        let transaction_type =
            TransactionType::from_wire(raw_type).ok_or(CodecError::InvalidField {
                field: "transaction type",
                value: i64::from(raw_type),
            })?;
        Ok(Command::TransactionInfo(TransactionInfo {
            command_id,
            response_required,
            connection_id,
            transaction_id,
            transaction_type,
        }))
    }
}

/// Marshals the two header-only commands.
struct BareCommandMarshaller {
    tag: u8,
}

impl BareCommandMarshaller {
    fn build(&self, command_id: i32, response_required: bool) -> Command {
        if self.tag == types::SHUTDOWN_INFO {
            Command::ShutdownInfo(ShutdownInfo {
                command_id,
                response_required,
            })
        } else {
            Command::KeepAliveInfo(KeepAliveInfo {
                command_id,
                response_required,
            })
        }
    }

    fn fields(command: &Command) -> Result<(i32, bool), CodecError> {
        match command {
            Command::ShutdownInfo(info) => Ok((info.command_id, info.response_required)),
            Command::KeepAliveInfo(info) => Ok((info.command_id, info.response_required)),
            other => Err(unexpected(other)),
        }
    }
}

impl DataStreamMarshaller for BareCommandMarshaller {
    fn data_structure_type(&self) -> u8 {
        self.tag
    }

    fn tight_marshal1(
        &self,
        _ctx: &mut MarshalContext,
        command: &Command,
        bs: &mut BooleanStream,
    ) -> Result<usize, CodecError> {
        let (command_id, response_required) = Self::fields(command)?;
        Ok(tight_header1(command_id, response_required, bs))
    }

    fn tight_marshal2(
        &self,
        _ctx: &mut MarshalContext,
        command: &Command,
        out: &mut BytesMut,
        bs: &mut BooleanStream,
    ) -> Result<(), CodecError> {
        let (command_id, _) = Self::fields(command)?;
        tight_header2(command_id, out, bs)
    }

    fn tight_unmarshal(
        &self,
        _ctx: &mut MarshalContext,
        reader: &mut DataReader<'_>,
        bs: &mut BooleanStream,
    ) -> Result<Command, CodecError> {
        let (command_id, response_required) = tight_unmarshal_header(reader, bs)?;
        Ok(self.build(command_id, response_required))
    }

    fn loose_marshal(
        &self,
        _ctx: &mut MarshalContext,
        command: &Command,
        out: &mut BytesMut,
    ) -> Result<(), CodecError> {
        let (command_id, response_required) = Self::fields(command)?;
        loose_header(command_id, response_required, out);
        Ok(())
    }

    fn loose_unmarshal(
        &self,
        _ctx: &mut MarshalContext,
        reader: &mut DataReader<'_>,
    ) -> Result<Command, CodecError> {
        let (command_id, response_required) = loose_unmarshal_header(reader)?;
        Ok(self.build(command_id, response_required))
    }
}

struct ResponseMarshaller;

impl DataStreamMarshaller for ResponseMarshaller {
    fn data_structure_type(&self) -> u8 {
        types::RESPONSE
    }

    fn tight_marshal1(
        &self,
        _ctx: &mut MarshalContext,
        command: &Command,
        bs: &mut BooleanStream,
    ) -> Result<usize, CodecError> {
        let Command::Response(response) = command else {
            return Err(unexpected(command));
        };
        Ok(tight_header1(response.command_id, response.response_required, bs) + 4)
    }

    fn tight_marshal2(
        &self,
        _ctx: &mut MarshalContext,
        command: &Command,
        out: &mut BytesMut,
        bs: &mut BooleanStream,
    ) -> Result<(), CodecError> {
        let Command::Response(response) = command else {
            return Err(unexpected(command));
        };
        tight_header2(response.command_id, out, bs)?;
        out.put_i32(response.correlation_id);
        Ok(())
    }

    fn tight_unmarshal(
        &self,
        _ctx: &mut MarshalContext,
        reader: &mut DataReader<'_>,
        bs: &mut BooleanStream,
    ) -> Result<Command, CodecError> {
        let (command_id, response_required) = tight_unmarshal_header(reader, bs)?;
        Ok(Command::Response(Response {
            command_id,
            response_required,
            correlation_id: reader.read_i32()?,
        }))
    }

    fn loose_marshal(
        &self,
        _ctx: &mut MarshalContext,
        command: &Command,
        out: &mut BytesMut,
    ) -> Result<(), CodecError> {
        let Command::Response(response) = command else {
            return Err(unexpected(command));
        };
        loose_header(response.command_id, response.response_required, out);
        out.put_i32(response.correlation_id);
        Ok(())
    }

    fn loose_unmarshal(
        &self,
        _ctx: &mut MarshalContext,
        reader: &mut DataReader<'_>,
    ) -> Result<Command, CodecError> {
        let (command_id, response_required) = loose_unmarshal_header(reader)?;
        Ok(Command::Response(Response {
            command_id,
            response_required,
            correlation_id: reader.read_i32()?,
        }))
    }
}

struct ExceptionResponseMarshaller;

impl DataStreamMarshaller for ExceptionResponseMarshaller {
    fn data_structure_type(&self) -> u8 {
        types::EXCEPTION_RESPONSE
    }

    fn tight_marshal1(
        &self,
        ctx: &mut MarshalContext,
        command: &Command,
        bs: &mut BooleanStream,
    ) -> Result<usize, CodecError> {
        let Command::ExceptionResponse(response) = command else {
            return Err(unexpected(command));
        };
        Ok(
            tight_header1(response.command_id, response.response_required, bs)
                + 4
                + tight_marshal_broker_error1(ctx, Some(&response.exception), bs),
        )
    }

    fn tight_marshal2(
        &self,
        ctx: &mut MarshalContext,
        command: &Command,
        out: &mut BytesMut,
        bs: &mut BooleanStream,
    ) -> Result<(), CodecError> {
        let Command::ExceptionResponse(response) = command else {
            return Err(unexpected(command));
        };
        tight_header2(response.command_id, out, bs)?;
        out.put_i32(response.correlation_id);
        tight_marshal_broker_error2(ctx, Some(&response.exception), out, bs)
    }

    fn tight_unmarshal(
        &self,
        ctx: &mut MarshalContext,
        reader: &mut DataReader<'_>,
        bs: &mut BooleanStream,
    ) -> Result<Command, CodecError> {
        let (command_id, response_required) = tight_unmarshal_header(reader, bs)?;
        let correlation_id = reader.read_i32()?;
        let exception = tight_unmarshal_broker_error(ctx, reader, bs)?.unwrap_or_default();
        Ok(Command::ExceptionResponse(ExceptionResponse {
            command_id,
            response_required,
            correlation_id,
            exception,
        }))
    }

    fn loose_marshal(
        &self,
        ctx: &mut MarshalContext,
        command: &Command,
        out: &mut BytesMut,
    ) -> Result<(), CodecError> {
        let Command::ExceptionResponse(response) = command else {
            return Err(unexpected(command));
        };
        loose_header(response.command_id, response.response_required, out);
        out.put_i32(response.correlation_id);
        loose_marshal_broker_error(ctx, Some(&response.exception), out);
        Ok(())
    }

    fn loose_unmarshal(
        &self,
        ctx: &mut MarshalContext,
        reader: &mut DataReader<'_>,
    ) -> Result<Command, CodecError> {
        let (command_id, response_required) = loose_unmarshal_header(reader)?;
        let correlation_id = reader.read_i32()?;
        let exception = loose_unmarshal_broker_error(ctx, reader)?.unwrap_or_default();
        Ok(Command::ExceptionResponse(ExceptionResponse {
            command_id,
            response_required,
            correlation_id,
            exception,
        }))
    }
}

struct ConnectionErrorMarshaller;

impl DataStreamMarshaller for ConnectionErrorMarshaller {
    fn data_structure_type(&self) -> u8 {
        types::CONNECTION_ERROR
    }

    fn tight_marshal1(
        &self,
        ctx: &mut MarshalContext,
        command: &Command,
        bs: &mut BooleanStream,
    ) -> Result<usize, CodecError> {
        let Command::ConnectionError(error) = command else {
            return Err(unexpected(command));
        };
        Ok(tight_header1(error.command_id, error.response_required, bs)
            + tight_marshal_connection_id1(error.connection_id.as_ref(), bs)
            + tight_marshal_broker_error1(ctx, Some(&error.exception), bs))
    }

    fn tight_marshal2(
        &self,
        ctx: &mut MarshalContext,
        command: &Command,
        out: &mut BytesMut,
        bs: &mut BooleanStream,
    ) -> Result<(), CodecError> {
        let Command::ConnectionError(error) = command else {
            return Err(unexpected(command));
        };
        tight_header2(error.command_id, out, bs)?;
        tight_marshal_connection_id2(error.connection_id.as_ref(), out, bs)?;
        tight_marshal_broker_error2(ctx, Some(&error.exception), out, bs)
    }

    fn tight_unmarshal(
        &self,
        ctx: &mut MarshalContext,
        reader: &mut DataReader<'_>,
        bs: &mut BooleanStream,
    ) -> Result<Command, CodecError> {
        let (command_id, response_required) = tight_unmarshal_header(reader, bs)?;
        let connection_id = tight_unmarshal_connection_id(reader, bs)?;
        let exception = tight_unmarshal_broker_error(ctx, reader, bs)?.unwrap_or_default();
        Ok(Command::ConnectionError(ConnectionError {
            command_id,
            response_required,
            connection_id,
            exception,
        }))
    }

    fn loose_marshal(
        &self,
        ctx: &mut MarshalContext,
        command: &Command,
        out: &mut BytesMut,
    ) -> Result<(), CodecError> {
        let Command::ConnectionError(error) = command else {
            return Err(unexpected(command));
        };
        loose_header(error.command_id, error.response_required, out);
        loose_marshal_connection_id(error.connection_id.as_ref(), out);
        loose_marshal_broker_error(ctx, Some(&error.exception), out);
        Ok(())
    }

    fn loose_unmarshal(
        &self,
        ctx: &mut MarshalContext,
        reader: &mut DataReader<'_>,
    ) -> Result<Command, CodecError> {
        let (command_id, response_required) = loose_unmarshal_header(reader)?;
        let connection_id = loose_unmarshal_connection_id(reader)?;
        let exception = loose_unmarshal_broker_error(ctx, reader)?.unwrap_or_default();
        Ok(Command::ConnectionError(ConnectionError {
            command_id,
            response_required,
            connection_id,
            exception,
        }))
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// The tag-indexed marshaller table for one wire version.
pub struct MarshallerRegistry {
    version: u32,
    table: Vec<Option<Box<dyn DataStreamMarshaller>>>,
}

impl std::fmt::Debug for MarshallerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarshallerRegistry")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl MarshallerRegistry {
    /// Builds the full table for one supported version.
    pub fn for_version(version: u32) -> Result<Self, CodecError> {
        if !(LOWEST_VERSION..=HIGHEST_VERSION).contains(&version) {
            return Err(CodecError::UnsupportedVersion { version });
        }

        let mut table: Vec<Option<Box<dyn DataStreamMarshaller>>> = Vec::with_capacity(256);
        table.resize_with(256, || None);

        let marshallers: Vec<Box<dyn DataStreamMarshaller>> = vec![
            Box::new(WireFormatInfoMarshaller),
            Box::new(BrokerInfoMarshaller),
            Box::new(ConnectionInfoMarshaller),
            Box::new(SessionInfoMarshaller),
            Box::new(ConsumerInfoMarshaller { version }),
            Box::new(ProducerInfoMarshaller),
            Box::new(RemoveInfoMarshaller { version }),
            Box::new(RemoveSubscriptionInfoMarshaller),
            Box::new(DestinationInfoMarshaller),
            Box::new(MessageDispatchMarshaller),
            Box::new(MessageAckMarshaller),
            Box::new(MessagePullMarshaller),
            Box::new(TransactionInfoMarshaller),
            Box::new(BareCommandMarshaller {
                tag: types::SHUTDOWN_INFO,
            }),
            Box::new(BareCommandMarshaller {
                tag: types::KEEP_ALIVE_INFO,
            }),
            Box::new(ResponseMarshaller),
            Box::new(ExceptionResponseMarshaller),
            Box::new(ConnectionErrorMarshaller),
            Box::new(MessageMarshaller { tag: types::MESSAGE }),
            Box::new(MessageMarshaller {
                tag: types::TEXT_MESSAGE,
            }),
            Box::new(MessageMarshaller {
                tag: types::BYTES_MESSAGE,
            }),
            Box::new(MessageMarshaller {
                tag: types::MAP_MESSAGE,
            }),
            Box::new(MessageMarshaller {
                tag: types::STREAM_MESSAGE,
            }),
            Box::new(MessageMarshaller {
                tag: types::OBJECT_MESSAGE,
            }),
        ];
        for marshaller in marshallers {
            let tag = marshaller.data_structure_type() as usize;
            table[tag] = Some(marshaller);
        }

        Ok(Self { version, table })
    }

    /// The version this table was built for.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Looks up the marshaller for a tag.
    pub fn lookup(&self, tag: u8) -> Result<&dyn DataStreamMarshaller, CodecError> {
        self.table[tag as usize]
            .as_deref()
            .ok_or(CodecError::UnknownCommand { tag })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_rejects_unsupported_versions() {
        assert!(MarshallerRegistry::for_version(0).is_err());
        assert!(MarshallerRegistry::for_version(9).is_err());
        for version in LOWEST_VERSION..=HIGHEST_VERSION {
            assert!(MarshallerRegistry::for_version(version).is_ok());
        }
    }

    #[test]
    fn unknown_tags_have_no_marshaller() {
        let registry = MarshallerRegistry::for_version(HIGHEST_VERSION).unwrap();
        assert!(matches!(
            registry.lookup(200),
            Err(CodecError::UnknownCommand { tag: 200 })
        ));
        assert!(registry.lookup(types::MESSAGE_DISPATCH).is_ok());
    }
}
