use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use teamwire_core::{Caller, CoreError, RealtimeService};
use teamwire_models::gateway::*;
use teamwire_models::presence::PresenceStatus;

/// What to send back after an op succeeded.
#[derive(Debug)]
pub(crate) enum Reply {
    /// Request/ack op: always answered.
    Ack(Value),
    /// Fire-and-forget op: answered only when the client set a `requestId`.
    Fire(Value),
}

fn decode<T: DeserializeOwned>(op: &str, d: Option<Value>) -> Result<T, CoreError> {
    serde_json::from_value(d.unwrap_or(Value::Null))
        .map_err(|e| CoreError::BadRequest(format!("malformed {op} payload: {e}")))
}

fn encode<T: Serialize>(value: &T) -> Result<Value, CoreError> {
    serde_json::to_value(value).map_err(|e| CoreError::BadRequest(format!("unencodable reply: {e}")))
}

/// Run one inbound op of an identified connection.
pub(crate) async fn dispatch(
    service: &RealtimeService,
    caller: Caller,
    op: &str,
    d: Option<Value>,
) -> Result<Reply, CoreError> {
    let signaling = &service.signaling;
    match op {
        OP_SET_STATUS => {
            let SetStatus { status } = decode(op, d)?;
            let status = PresenceStatus::parse(&status)
                .ok_or_else(|| CoreError::BadRequest(format!("unknown status '{status}'")))?;
            service.set_status(caller, status)?;
            Ok(Reply::Ack(json!({ "status": status })))
        }
        OP_JOIN_ROOM => {
            let RoomRequest { room_id } = decode(op, d)?;
            let joined = service.join_room(caller, room_id).await?;
            Ok(Reply::Ack(json!({ "roomId": room_id, "joined": joined })))
        }
        OP_LEAVE_ROOM => {
            let RoomRequest { room_id } = decode(op, d)?;
            let left = service.leave_room(caller, &room_id);
            Ok(Reply::Ack(json!({ "roomId": room_id, "left": left })))
        }
        OP_PUBLISH_MESSAGE => {
            let request: PublishMessage = decode(op, d)?;
            let published = service.publish_message(caller, request).await?;
            Ok(Reply::Fire(encode(&published)?))
        }
        OP_MARK_READ => {
            let MarkRead { room_id, read_at } = decode(op, d)?;
            let state = service.mark_read(caller, room_id, read_at).await?;
            Ok(Reply::Ack(json!({
                "roomId": room_id,
                "cursor": state.cursor,
                "unread": state.unread,
                "advanced": state.advanced,
            })))
        }
        OP_THREAD_TYPING => {
            let ThreadTypingRequest {
                thread_parent_id,
                is_typing,
            } = decode(op, d)?;
            let receipt = service
                .thread_typing(caller, thread_parent_id, is_typing)
                .await?;
            Ok(Reply::Fire(json!({ "delivered": receipt.delivered })))
        }
        OP_SFU_JOIN => {
            let SfuChannel { channel_id } = decode(op, d)?;
            Ok(Reply::Ack(encode(&signaling.join(caller, channel_id).await?)?))
        }
        OP_SFU_LEAVE => {
            let SfuChannel { channel_id } = decode(op, d)?;
            Ok(Reply::Ack(encode(&signaling.leave(caller, channel_id).await?)?))
        }
        OP_SFU_CREATE_TRANSPORT => {
            let SfuCreateTransport {
                channel_id,
                direction,
            } = decode(op, d)?;
            let created = signaling
                .create_transport(caller, channel_id, direction)
                .await?;
            Ok(Reply::Ack(encode(&created)?))
        }
        OP_SFU_CONNECT_TRANSPORT => {
            let request: SfuConnectTransport = decode(op, d)?;
            signaling
                .connect_transport(
                    caller,
                    request.channel_id,
                    request.transport_id,
                    request.dtls_parameters,
                )
                .await?;
            Ok(Reply::Ack(json!({
                "channelId": request.channel_id.to_string(),
                "transportId": request.transport_id.to_string(),
                "state": "connected",
            })))
        }
        OP_SFU_PRODUCE => {
            let request: SfuProduce = decode(op, d)?;
            let created = signaling
                .produce(
                    caller,
                    request.channel_id,
                    request.transport_id,
                    request.kind,
                    request.rtp_parameters,
                    request.app_data,
                )
                .await?;
            Ok(Reply::Ack(encode(&created)?))
        }
        OP_SFU_CONSUME => {
            let request: SfuConsume = decode(op, d)?;
            let created = signaling
                .consume(
                    caller,
                    request.channel_id,
                    request.transport_id,
                    request.producer_id,
                    request.rtp_capabilities,
                )
                .await?;
            Ok(Reply::Ack(encode(&created)?))
        }
        OP_SFU_CLOSE_PRODUCER => {
            let SfuCloseProducer {
                channel_id,
                producer_id,
            } = decode(op, d)?;
            signaling
                .close_producer(caller, channel_id, producer_id)
                .await?;
            Ok(Reply::Ack(json!({ "producerId": producer_id.to_string() })))
        }
        OP_SFU_HOST_ACTION => {
            let SfuHostAction {
                channel_id,
                target_user_id,
                action,
            } = decode(op, d)?;
            signaling
                .host_action(caller, channel_id, target_user_id, action)
                .await?;
            Ok(Reply::Ack(json!({
                "targetUserId": target_user_id.to_string(),
                "action": action,
            })))
        }
        OP_IDENTIFY => Err(CoreError::State("connection is already identified".into())),
        other => Err(CoreError::BadRequest(format!("unknown op '{other}'"))),
    }
}
