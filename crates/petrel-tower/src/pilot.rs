// Publish acceptance: append to the owning log, acknowledge with the
// assigned seqno, and refuse duplicate message ids for the lifetime of the
// broker.
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use petrel_common::MsgId;
use petrel_io::{LoopCtx, Stream};
use petrel_wire::{Ack, AckStatus, Message};

use crate::TowerEnv;

#[allow(clippy::too_many_arguments)]
pub(crate) fn handle_publish(
    ctx: &LoopCtx,
    env: &Arc<TowerEnv>,
    stream: &Stream,
    tenant: petrel_common::TenantId,
    namespace: String,
    topic: String,
    msg_id: MsgId,
    payload: Bytes,
) {
    if namespace.is_empty() || msg_id.is_empty() {
        send_ack(stream, tenant, msg_id, AckStatus::Failure, 0);
        return;
    }
    // At-most-once ack per message id: a duplicate never succeeds again in
    // this broker's lifetime. Reserve before the append so a concurrent
    // duplicate cannot slip in while storage runs.
    {
        let mut seen = env.dedupe.lock().expect("dedupe lock");
        if !seen.insert(msg_id) {
            send_ack(stream, tenant, msg_id, AckStatus::Failure, 0);
            return;
        }
    }

    let log_id = env.log_router.get_log_id(&namespace, &topic);
    let entry = {
        let mut buf = BytesMut::with_capacity(payload.len() + 64);
        let message = Message::Publish {
            tenant,
            namespace,
            topic,
            msg_id,
            payload,
        };
        if message.encode_into(&mut buf).is_err() {
            send_ack(stream, tenant, msg_id, AckStatus::Failure, 0);
            return;
        }
        buf.freeze()
    };

    let env = Arc::clone(env);
    let stream = stream.clone();
    ctx.spawn(async move {
        match env.storage.append(log_id, entry).await {
            Ok(seqno) => {
                send_ack(&stream, tenant, msg_id, AckStatus::Success, seqno);
            }
            Err(err) => {
                tracing::error!(log_id, error = %err, "append failed");
                // The publish never happened; let the id be retried.
                env.dedupe.lock().expect("dedupe lock").remove(&msg_id);
                send_ack(&stream, tenant, msg_id, AckStatus::Failure, 0);
            }
        }
    });
}

fn send_ack(
    stream: &Stream,
    tenant: petrel_common::TenantId,
    msg_id: MsgId,
    status: AckStatus,
    seqno: u64,
) {
    stream.send(&Message::DataAck {
        tenant,
        acks: vec![Ack {
            msg_id,
            status,
            seqno,
        }],
    });
}
