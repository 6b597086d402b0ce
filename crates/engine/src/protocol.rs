// Wire framing helpers.
//
// Frames are the Yjs v1 binary encoding: a varint message type followed
// by the payload. Type 0 carries sync messages (step-1 state vector,
// step-2 update set, raw update), type 1 carries awareness deltas. The
// engine speaks binary only; there is no JSON envelope.

use yrs::sync::{AwarenessUpdate, Message, SyncMessage};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::StateVector;

/// Sync step 1: advertise our state vector so the peer can diff.
pub fn encode_sync_step1(state_vector: StateVector) -> Vec<u8> {
    Message::Sync(SyncMessage::SyncStep1(state_vector)).encode_v1()
}

/// Sync step 2: the update set covering everything the peer is missing.
pub fn encode_sync_step2(update: Vec<u8>) -> Vec<u8> {
    Message::Sync(SyncMessage::SyncStep2(update)).encode_v1()
}

/// An incremental document update.
pub fn encode_sync_update(update: Vec<u8>) -> Vec<u8> {
    Message::Sync(SyncMessage::Update(update)).encode_v1()
}

pub fn encode_awareness(update: AwarenessUpdate) -> Vec<u8> {
    Message::Awareness(update).encode_v1()
}

pub fn decode_message(bytes: &[u8]) -> Result<Message, yrs::encoding::read::Error> {
    Message::decode_v1(bytes)
}

#[cfg(test)]
mod tests {
    use yrs::sync::{Message, SyncMessage};
    use yrs::StateVector;

    use super::{decode_message, encode_sync_step1, encode_sync_update};

    #[test]
    fn sync_frames_carry_type_tag_zero() {
        let frame = encode_sync_step1(StateVector::default());
        assert_eq!(frame[0], 0);

        let decoded = decode_message(&frame).expect("frame should decode");
        assert!(matches!(decoded, Message::Sync(SyncMessage::SyncStep1(_))));
    }

    #[test]
    fn update_frames_round_trip_payload() {
        let payload = vec![1, 2, 3, 4];
        let frame = encode_sync_update(payload.clone());
        match decode_message(&frame).expect("frame should decode") {
            Message::Sync(SyncMessage::Update(update)) => assert_eq!(update, payload),
            other => panic!("expected update message, got {other:?}"),
        }
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let mut frame = encode_sync_step1(StateVector::default());
        frame.truncate(1);
        assert!(decode_message(&frame).is_err());
    }
}
