// Message codec. Every message starts with a one-byte type tag and the
// tenant id; fields are varints, length-prefixed strings, or raw byte runs.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use petrel_common::{MsgId, SequenceNumber, TenantId};

use crate::{
    get_bytes, get_string, get_varint, put_bytes, put_string, put_varint, Error, Result, StreamId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Subscribe = 1,
    Unsubscribe = 2,
    DeliverData = 3,
    DeliverGap = 4,
    DeliverBatch = 5,
    Goodbye = 6,
    Heartbeat = 7,
    Publish = 8,
    DataAck = 9,
    FindTailSeqno = 10,
    TailSeqno = 11,
    Ping = 12,
}

impl MessageType {
    fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            1 => MessageType::Subscribe,
            2 => MessageType::Unsubscribe,
            3 => MessageType::DeliverData,
            4 => MessageType::DeliverGap,
            5 => MessageType::DeliverBatch,
            6 => MessageType::Goodbye,
            7 => MessageType::Heartbeat,
            8 => MessageType::Publish,
            9 => MessageType::DataAck,
            10 => MessageType::FindTailSeqno,
            11 => MessageType::TailSeqno,
            12 => MessageType::Ping,
            other => return Err(Error::UnknownMessageType(other)),
        })
    }
}

/// Why a subscription was terminated by the remote end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UnsubscribeReason {
    /// Matching an explicit unsubscribe, or denying an unknown subscription.
    Requested = 0,
    /// The server cannot serve the subscription now; resubscribe later.
    BackOff = 1,
    /// The subscription parameters were rejected.
    Invalid = 2,
}

impl UnsubscribeReason {
    fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            0 => UnsubscribeReason::Requested,
            1 => UnsubscribeReason::BackOff,
            2 => UnsubscribeReason::Invalid,
            _ => return Err(Error::Malformed("unsubscribe reason")),
        })
    }
}

/// End-of-stream marker reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GoodbyeCode {
    Graceful = 0,
    SocketError = 1,
}

impl GoodbyeCode {
    fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            0 => GoodbyeCode::Graceful,
            1 => GoodbyeCode::SocketError,
            _ => return Err(Error::Malformed("goodbye code")),
        })
    }
}

/// Classifies a range of sequence numbers that will not be delivered as data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GapType {
    /// Nothing was lost; the numbers were simply not for this subscription.
    Benign = 0,
    /// Acknowledged data is gone.
    DataLoss = 1,
    /// The retention window moved past the requested position.
    Retention = 2,
}

impl GapType {
    fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            0 => GapType::Benign,
            1 => GapType::DataLoss,
            2 => GapType::Retention,
            _ => return Err(Error::Malformed("gap type")),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AckStatus {
    Success = 0,
    Failure = 1,
}

impl AckStatus {
    fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            0 => AckStatus::Success,
            1 => AckStatus::Failure,
            _ => return Err(Error::Malformed("ack status")),
        })
    }
}

/// One acknowledged publish inside a `DataAck`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub msg_id: MsgId,
    pub status: AckStatus,
    pub seqno: SequenceNumber,
}

/// One data delivery inside a `DeliverBatch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub sub_id: u64,
    pub prev_seqno: SequenceNumber,
    pub seqno: SequenceNumber,
    pub msg_id: MsgId,
    pub payload: Bytes,
}

/// All message kinds that travel on a stream.
///
/// A delivery carries both the record's sequence number and the previous one
/// delivered on the subscription; the receiver treats `[prev+1, seqno-1]` as
/// accounted for without data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Subscribe {
        tenant: TenantId,
        namespace: String,
        topic: String,
        start_seqno: SequenceNumber,
        sub_id: u64,
    },
    Unsubscribe {
        tenant: TenantId,
        sub_id: u64,
        reason: UnsubscribeReason,
    },
    DeliverData {
        tenant: TenantId,
        sub_id: u64,
        prev_seqno: SequenceNumber,
        seqno: SequenceNumber,
        msg_id: MsgId,
        payload: Bytes,
    },
    DeliverGap {
        tenant: TenantId,
        sub_id: u64,
        prev_seqno: SequenceNumber,
        seqno: SequenceNumber,
        gap_type: GapType,
    },
    DeliverBatch {
        tenant: TenantId,
        deliveries: Vec<Delivery>,
    },
    Goodbye {
        tenant: TenantId,
        code: GoodbyeCode,
    },
    Heartbeat {
        tenant: TenantId,
        healthy_streams: Vec<StreamId>,
    },
    Publish {
        tenant: TenantId,
        namespace: String,
        topic: String,
        msg_id: MsgId,
        payload: Bytes,
    },
    DataAck {
        tenant: TenantId,
        acks: Vec<Ack>,
    },
    FindTailSeqno {
        tenant: TenantId,
        namespace: String,
        topic: String,
    },
    TailSeqno {
        tenant: TenantId,
        namespace: String,
        topic: String,
        seqno: SequenceNumber,
    },
    Ping {
        tenant: TenantId,
        cookie: Bytes,
    },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Subscribe { .. } => MessageType::Subscribe,
            Message::Unsubscribe { .. } => MessageType::Unsubscribe,
            Message::DeliverData { .. } => MessageType::DeliverData,
            Message::DeliverGap { .. } => MessageType::DeliverGap,
            Message::DeliverBatch { .. } => MessageType::DeliverBatch,
            Message::Goodbye { .. } => MessageType::Goodbye,
            Message::Heartbeat { .. } => MessageType::Heartbeat,
            Message::Publish { .. } => MessageType::Publish,
            Message::DataAck { .. } => MessageType::DataAck,
            Message::FindTailSeqno { .. } => MessageType::FindTailSeqno,
            Message::TailSeqno { .. } => MessageType::TailSeqno,
            Message::Ping { .. } => MessageType::Ping,
        }
    }

    pub fn tenant(&self) -> TenantId {
        match self {
            Message::Subscribe { tenant, .. }
            | Message::Unsubscribe { tenant, .. }
            | Message::DeliverData { tenant, .. }
            | Message::DeliverGap { tenant, .. }
            | Message::DeliverBatch { tenant, .. }
            | Message::Goodbye { tenant, .. }
            | Message::Heartbeat { tenant, .. }
            | Message::Publish { tenant, .. }
            | Message::DataAck { tenant, .. }
            | Message::FindTailSeqno { tenant, .. }
            | Message::TailSeqno { tenant, .. }
            | Message::Ping { tenant, .. } => *tenant,
        }
    }

    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u8(self.message_type() as u8);
        buf.put_u16_le(self.tenant().0);
        match self {
            Message::Subscribe {
                namespace,
                topic,
                start_seqno,
                sub_id,
                ..
            } => {
                put_string(buf, namespace);
                put_string(buf, topic);
                put_varint(buf, *start_seqno);
                put_varint(buf, *sub_id);
            }
            Message::Unsubscribe { sub_id, reason, .. } => {
                put_varint(buf, *sub_id);
                buf.put_u8(*reason as u8);
            }
            Message::DeliverData {
                sub_id,
                prev_seqno,
                seqno,
                msg_id,
                payload,
                ..
            } => {
                put_varint(buf, *sub_id);
                put_varint(buf, *prev_seqno);
                put_varint(buf, *seqno);
                buf.extend_from_slice(&msg_id.0);
                put_bytes(buf, payload);
            }
            Message::DeliverGap {
                sub_id,
                prev_seqno,
                seqno,
                gap_type,
                ..
            } => {
                put_varint(buf, *sub_id);
                put_varint(buf, *prev_seqno);
                put_varint(buf, *seqno);
                buf.put_u8(*gap_type as u8);
            }
            Message::DeliverBatch { deliveries, .. } => {
                put_varint(buf, deliveries.len() as u64);
                for delivery in deliveries {
                    put_varint(buf, delivery.sub_id);
                    put_varint(buf, delivery.prev_seqno);
                    put_varint(buf, delivery.seqno);
                    buf.extend_from_slice(&delivery.msg_id.0);
                    put_bytes(buf, &delivery.payload);
                }
            }
            Message::Goodbye { code, .. } => {
                buf.put_u8(*code as u8);
            }
            Message::Heartbeat {
                healthy_streams, ..
            } => {
                put_varint(buf, healthy_streams.len() as u64);
                for stream in healthy_streams {
                    put_varint(buf, *stream);
                }
            }
            Message::Publish {
                namespace,
                topic,
                msg_id,
                payload,
                ..
            } => {
                put_string(buf, namespace);
                put_string(buf, topic);
                buf.extend_from_slice(&msg_id.0);
                put_bytes(buf, payload);
            }
            Message::DataAck { acks, .. } => {
                put_varint(buf, acks.len() as u64);
                for ack in acks {
                    buf.extend_from_slice(&ack.msg_id.0);
                    buf.put_u8(ack.status as u8);
                    put_varint(buf, ack.seqno);
                }
            }
            Message::FindTailSeqno {
                namespace, topic, ..
            } => {
                put_string(buf, namespace);
                put_string(buf, topic);
            }
            Message::TailSeqno {
                namespace,
                topic,
                seqno,
                ..
            } => {
                put_string(buf, namespace);
                put_string(buf, topic);
                put_varint(buf, *seqno);
            }
            Message::Ping { cookie, .. } => {
                put_bytes(buf, cookie);
            }
        }
        Ok(())
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        if buf.remaining() < 3 {
            return Err(Error::Incomplete);
        }
        let message_type = MessageType::from_u8(buf.get_u8())?;
        let tenant = TenantId(buf.get_u16_le());
        Ok(match message_type {
            MessageType::Subscribe => Message::Subscribe {
                tenant,
                namespace: get_string(buf)?,
                topic: get_string(buf)?,
                start_seqno: get_varint(buf)?,
                sub_id: get_varint(buf)?,
            },
            MessageType::Unsubscribe => Message::Unsubscribe {
                tenant,
                sub_id: get_varint(buf)?,
                reason: UnsubscribeReason::from_u8(get_u8(buf)?)?,
            },
            MessageType::DeliverData => Message::DeliverData {
                tenant,
                sub_id: get_varint(buf)?,
                prev_seqno: get_varint(buf)?,
                seqno: get_varint(buf)?,
                msg_id: get_msg_id(buf)?,
                payload: get_bytes(buf)?,
            },
            MessageType::DeliverGap => Message::DeliverGap {
                tenant,
                sub_id: get_varint(buf)?,
                prev_seqno: get_varint(buf)?,
                seqno: get_varint(buf)?,
                gap_type: GapType::from_u8(get_u8(buf)?)?,
            },
            MessageType::DeliverBatch => {
                let count = get_varint(buf)? as usize;
                let mut deliveries = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    deliveries.push(Delivery {
                        sub_id: get_varint(buf)?,
                        prev_seqno: get_varint(buf)?,
                        seqno: get_varint(buf)?,
                        msg_id: get_msg_id(buf)?,
                        payload: get_bytes(buf)?,
                    });
                }
                Message::DeliverBatch { tenant, deliveries }
            }
            MessageType::Goodbye => Message::Goodbye {
                tenant,
                code: GoodbyeCode::from_u8(get_u8(buf)?)?,
            },
            MessageType::Heartbeat => {
                let count = get_varint(buf)? as usize;
                let mut healthy_streams = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    healthy_streams.push(get_varint(buf)?);
                }
                Message::Heartbeat {
                    tenant,
                    healthy_streams,
                }
            }
            MessageType::Publish => Message::Publish {
                tenant,
                namespace: get_string(buf)?,
                topic: get_string(buf)?,
                msg_id: get_msg_id(buf)?,
                payload: get_bytes(buf)?,
            },
            MessageType::DataAck => {
                let count = get_varint(buf)? as usize;
                let mut acks = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    acks.push(Ack {
                        msg_id: get_msg_id(buf)?,
                        status: AckStatus::from_u8(get_u8(buf)?)?,
                        seqno: get_varint(buf)?,
                    });
                }
                Message::DataAck { tenant, acks }
            }
            MessageType::FindTailSeqno => Message::FindTailSeqno {
                tenant,
                namespace: get_string(buf)?,
                topic: get_string(buf)?,
            },
            MessageType::TailSeqno => Message::TailSeqno {
                tenant,
                namespace: get_string(buf)?,
                topic: get_string(buf)?,
                seqno: get_varint(buf)?,
            },
            MessageType::Ping => Message::Ping {
                tenant,
                cookie: get_bytes(buf)?,
            },
        })
    }
}

fn get_u8(buf: &mut Bytes) -> Result<u8> {
    if !buf.has_remaining() {
        return Err(Error::Incomplete);
    }
    Ok(buf.get_u8())
}

fn get_msg_id(buf: &mut Bytes) -> Result<MsgId> {
    if buf.remaining() < 16 {
        return Err(Error::Incomplete);
    }
    let mut bytes = [0u8; 16];
    buf.copy_to_slice(&mut bytes);
    Ok(MsgId::from_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: Message) {
        let mut buf = BytesMut::new();
        message.encode_into(&mut buf).expect("encode");
        let mut bytes = buf.freeze();
        let decoded = Message::decode(&mut bytes).expect("decode");
        assert_eq!(decoded, message);
        assert!(bytes.is_empty(), "trailing bytes after {decoded:?}");
    }

    #[test]
    fn subscribe_round_trip() {
        round_trip(Message::Subscribe {
            tenant: TenantId(200),
            namespace: "guest".into(),
            topic: "orders".into(),
            start_seqno: 42,
            sub_id: 7,
        });
    }

    #[test]
    fn unsubscribe_round_trip_all_reasons() {
        for reason in [
            UnsubscribeReason::Requested,
            UnsubscribeReason::BackOff,
            UnsubscribeReason::Invalid,
        ] {
            round_trip(Message::Unsubscribe {
                tenant: TenantId::GUEST,
                sub_id: 99,
                reason,
            });
        }
    }

    #[test]
    fn deliver_data_round_trip() {
        round_trip(Message::DeliverData {
            tenant: TenantId(200),
            sub_id: 3,
            prev_seqno: 5,
            seqno: 7,
            msg_id: MsgId::generate(),
            payload: Bytes::from_static(b"hi"),
        });
    }

    #[test]
    fn deliver_gap_round_trip() {
        round_trip(Message::DeliverGap {
            tenant: TenantId(200),
            sub_id: 3,
            prev_seqno: 5,
            seqno: 9,
            gap_type: GapType::Retention,
        });
    }

    #[test]
    fn batch_round_trip() {
        round_trip(Message::DeliverBatch {
            tenant: TenantId(200),
            deliveries: vec![
                Delivery {
                    sub_id: 1,
                    prev_seqno: 0,
                    seqno: 1,
                    msg_id: MsgId::generate(),
                    payload: Bytes::from_static(b"a"),
                },
                Delivery {
                    sub_id: 1,
                    prev_seqno: 1,
                    seqno: 2,
                    msg_id: MsgId::generate(),
                    payload: Bytes::from_static(b"b"),
                },
            ],
        });
    }

    #[test]
    fn control_messages_round_trip() {
        round_trip(Message::Goodbye {
            tenant: TenantId::GUEST,
            code: GoodbyeCode::SocketError,
        });
        round_trip(Message::Heartbeat {
            tenant: TenantId::SYSTEM,
            healthy_streams: vec![1, 5, 900],
        });
        round_trip(Message::Ping {
            tenant: TenantId::GUEST,
            cookie: Bytes::from_static(b"cookie"),
        });
    }

    #[test]
    fn publish_and_ack_round_trip() {
        round_trip(Message::Publish {
            tenant: TenantId(200),
            namespace: "guest".into(),
            topic: "t1".into(),
            msg_id: MsgId::generate(),
            payload: Bytes::from_static(b"payload"),
        });
        round_trip(Message::DataAck {
            tenant: TenantId(200),
            acks: vec![Ack {
                msg_id: MsgId::generate(),
                status: AckStatus::Success,
                seqno: 12,
            }],
        });
    }

    #[test]
    fn tail_seqno_round_trip() {
        round_trip(Message::FindTailSeqno {
            tenant: TenantId(200),
            namespace: "guest".into(),
            topic: "t1".into(),
        });
        round_trip(Message::TailSeqno {
            tenant: TenantId(200),
            namespace: "guest".into(),
            topic: "t1".into(),
            seqno: 31337,
        });
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut bytes = Bytes::from_static(&[0xee, 0x01, 0x00]);
        assert_eq!(Message::decode(&mut bytes), Err(Error::UnknownMessageType(0xee)));
    }

    #[test]
    fn truncated_message_is_incomplete() {
        let message = Message::Publish {
            tenant: TenantId(200),
            namespace: "guest".into(),
            topic: "t1".into(),
            msg_id: MsgId::generate(),
            payload: Bytes::from_static(b"payload"),
        };
        let mut buf = BytesMut::new();
        message.encode_into(&mut buf).expect("encode");
        let full = buf.freeze();
        for cut in 0..full.len() {
            let mut truncated = full.slice(0..cut);
            assert!(
                Message::decode(&mut truncated).is_err(),
                "cut at {cut} decoded"
            );
        }
    }
}
