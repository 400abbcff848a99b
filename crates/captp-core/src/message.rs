//! Wire messages.
//!
//! Every slot in a message is written in the sender's view. The receiver
//! calls [`Message::flipped`] once, before looking anything up, and from then
//! on works in its own view.

use serde::{Deserialize, Serialize};

use crate::marshal::CapData;
use crate::slot::Slot;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    #[serde(rename = "CTP_BOOTSTRAP")]
    Bootstrap {
        epoch: u64,
        #[serde(rename = "questionID")]
        question_id: Slot,
    },

    #[serde(rename = "CTP_CALL")]
    Call {
        epoch: u64,
        #[serde(rename = "questionID")]
        question_id: Slot,
        target: Slot,
        method: CapData,
        #[serde(default, skip_serializing_if = "is_false")]
        trap: bool,
    },

    #[serde(rename = "CTP_RETURN")]
    Return {
        epoch: u64,
        #[serde(rename = "answerID")]
        answer_id: Slot,
        #[serde(flatten)]
        answer: Answer,
    },

    #[serde(rename = "CTP_RESOLVE")]
    Resolve {
        epoch: u64,
        #[serde(rename = "promiseID")]
        promise_id: Slot,
        #[serde(flatten)]
        resolution: Resolution,
    },

    #[serde(rename = "CTP_DROP")]
    Drop {
        epoch: u64,
        #[serde(rename = "slotID")]
        slot_id: Slot,
        #[serde(rename = "decRefs", default)]
        dec_refs: u64,
    },

    #[serde(rename = "CTP_TRAP_ITERATE")]
    TrapIterate {
        epoch: u64,
        #[serde(rename = "questionID")]
        question_id: Slot,
        serialized: CapData,
    },

    #[serde(rename = "CTP_DISCONNECT")]
    Disconnect {
        epoch: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<CapData>,
    },
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Payload of a `CTP_RETURN`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Answer {
    Result(CapData),
    Exception(CapData),
}

/// Payload of a `CTP_RESOLVE`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "res")]
    Fulfilled(CapData),
    #[serde(rename = "rej")]
    Rejected(CapData),
}

impl Answer {
    pub fn new(is_reject: bool, data: CapData) -> Self {
        if is_reject {
            Answer::Exception(data)
        } else {
            Answer::Result(data)
        }
    }

    pub fn into_parts(self) -> (bool, CapData) {
        match self {
            Answer::Result(data) => (false, data),
            Answer::Exception(data) => (true, data),
        }
    }

    fn data_mut(&mut self) -> &mut CapData {
        match self {
            Answer::Result(data) | Answer::Exception(data) => data,
        }
    }

    fn data(&self) -> &CapData {
        match self {
            Answer::Result(data) | Answer::Exception(data) => data,
        }
    }
}

impl Resolution {
    pub fn new(is_reject: bool, data: CapData) -> Self {
        if is_reject {
            Resolution::Rejected(data)
        } else {
            Resolution::Fulfilled(data)
        }
    }

    pub fn into_parts(self) -> (bool, CapData) {
        match self {
            Resolution::Fulfilled(data) => (false, data),
            Resolution::Rejected(data) => (true, data),
        }
    }

    fn data_mut(&mut self) -> &mut CapData {
        match self {
            Resolution::Fulfilled(data) | Resolution::Rejected(data) => data,
        }
    }

    fn data(&self) -> &CapData {
        match self {
            Resolution::Fulfilled(data) | Resolution::Rejected(data) => data,
        }
    }
}

/// The message kinds, for stats and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKind {
    Bootstrap,
    Call,
    Return,
    Resolve,
    Drop,
    TrapIterate,
    Disconnect,
}

impl MessageKind {
    pub const ALL: [MessageKind; 7] = [
        MessageKind::Bootstrap,
        MessageKind::Call,
        MessageKind::Return,
        MessageKind::Resolve,
        MessageKind::Drop,
        MessageKind::TrapIterate,
        MessageKind::Disconnect,
    ];

    /// The `type` tag on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Bootstrap => "CTP_BOOTSTRAP",
            MessageKind::Call => "CTP_CALL",
            MessageKind::Return => "CTP_RETURN",
            MessageKind::Resolve => "CTP_RESOLVE",
            MessageKind::Drop => "CTP_DROP",
            MessageKind::TrapIterate => "CTP_TRAP_ITERATE",
            MessageKind::Disconnect => "CTP_DISCONNECT",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Bootstrap { .. } => MessageKind::Bootstrap,
            Message::Call { .. } => MessageKind::Call,
            Message::Return { .. } => MessageKind::Return,
            Message::Resolve { .. } => MessageKind::Resolve,
            Message::Drop { .. } => MessageKind::Drop,
            Message::TrapIterate { .. } => MessageKind::TrapIterate,
            Message::Disconnect { .. } => MessageKind::Disconnect,
        }
    }

    pub fn epoch(&self) -> u64 {
        match self {
            Message::Bootstrap { epoch, .. }
            | Message::Call { epoch, .. }
            | Message::Return { epoch, .. }
            | Message::Resolve { epoch, .. }
            | Message::Drop { epoch, .. }
            | Message::TrapIterate { epoch, .. }
            | Message::Disconnect { epoch, .. } => *epoch,
        }
    }

    /// The same message in the peer's view: every slot changes direction.
    pub fn flipped(mut self) -> Self {
        fn flip_data(data: &mut CapData) {
            for slot in &mut data.slots {
                *slot = slot.flip();
            }
        }
        match &mut self {
            Message::Bootstrap { question_id, .. } => *question_id = question_id.flip(),
            Message::Call {
                question_id,
                target,
                method,
                ..
            } => {
                *question_id = question_id.flip();
                *target = target.flip();
                flip_data(method);
            }
            Message::Return {
                answer_id, answer, ..
            } => {
                *answer_id = answer_id.flip();
                flip_data(answer.data_mut());
            }
            Message::Resolve {
                promise_id,
                resolution,
                ..
            } => {
                *promise_id = promise_id.flip();
                flip_data(resolution.data_mut());
            }
            Message::Drop { slot_id, .. } => *slot_id = slot_id.flip(),
            Message::TrapIterate {
                question_id,
                serialized,
                ..
            } => {
                *question_id = question_id.flip();
                flip_data(serialized);
            }
            Message::Disconnect { reason, .. } => {
                if let Some(reason) = reason {
                    flip_data(reason);
                }
            }
        }
        self
    }

    /// Slots this message holds a reference through, in the current view.
    ///
    /// The slot a `CTP_DROP` releases is not a reference and is left out.
    pub fn referenced_slots(&self) -> impl Iterator<Item = Slot> + '_ {
        let (header, data): ([Option<Slot>; 2], Option<&CapData>) = match self {
            Message::Bootstrap { question_id, .. } => ([Some(*question_id), None], None),
            Message::Call {
                question_id,
                target,
                method,
                ..
            } => ([Some(*question_id), Some(*target)], Some(method)),
            Message::Return {
                answer_id, answer, ..
            } => ([Some(*answer_id), None], Some(answer.data())),
            Message::Resolve {
                promise_id,
                resolution,
                ..
            } => ([Some(*promise_id), None], Some(resolution.data())),
            Message::Drop { .. } => ([None, None], None),
            Message::TrapIterate {
                question_id,
                serialized,
                ..
            } => ([Some(*question_id), None], Some(serialized)),
            Message::Disconnect { reason, .. } => ([None, None], reason.as_ref()),
        };
        header
            .into_iter()
            .flatten()
            .chain(data.into_iter().flat_map(|d| d.slots.iter().copied()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::SlotKind;

    fn data(slots: Vec<Slot>) -> CapData {
        CapData {
            body: "null".to_owned(),
            slots,
        }
    }

    #[test]
    fn wire_shapes_use_protocol_field_names() {
        let call = Message::Call {
            epoch: 0,
            question_id: Slot::remote(SlotKind::Question, 1),
            target: Slot::remote(SlotKind::Object, 2),
            method: data(vec![]),
            trap: false,
        };
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "CTP_CALL",
                "epoch": 0,
                "questionID": "q-1",
                "target": "o-2",
                "method": {"body": "null", "slots": []},
            })
        );

        let ret = Message::Return {
            epoch: 3,
            answer_id: Slot::local(SlotKind::Question, 1),
            answer: Answer::Exception(data(vec![])),
        };
        let json = serde_json::to_value(&ret).unwrap();
        assert_eq!(json["answerID"], "q+1");
        assert!(json.get("exception").is_some());
        assert!(json.get("result").is_none());
        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back, ret);

        let drop: Message =
            serde_json::from_str(r#"{"type":"CTP_DROP","epoch":0,"slotID":"o-4","decRefs":2}"#)
                .unwrap();
        assert_eq!(
            drop,
            Message::Drop {
                epoch: 0,
                slot_id: Slot::remote(SlotKind::Object, 4),
                dec_refs: 2,
            }
        );
    }

    #[test]
    fn resolve_and_trap_flag_round_trip() {
        let msg = Message::Resolve {
            epoch: 0,
            promise_id: Slot::local(SlotKind::Promise, 1),
            resolution: Resolution::Rejected(data(vec![])),
        };
        let text = serde_json::to_string(&msg).unwrap();
        assert!(text.contains(r#""rej":"#));
        assert_eq!(serde_json::from_str::<Message>(&text).unwrap(), msg);

        let trap: Message = serde_json::from_str(
            r#"{"type":"CTP_CALL","epoch":0,"questionID":"q-1","target":"t-1","method":{"body":"[]","slots":[]},"trap":true}"#,
        )
        .unwrap();
        assert!(matches!(trap, Message::Call { trap: true, .. }));
    }

    #[test]
    fn flipping_changes_every_slot() {
        let msg = Message::Call {
            epoch: 0,
            question_id: Slot::remote(SlotKind::Question, 1),
            target: Slot::local(SlotKind::Question, 7),
            method: data(vec![Slot::local(SlotKind::Object, 2)]),
            trap: false,
        };
        let flipped = msg.clone().flipped();
        assert_eq!(
            flipped.referenced_slots().collect::<Vec<_>>(),
            vec![
                Slot::local(SlotKind::Question, 1),
                Slot::remote(SlotKind::Question, 7),
                Slot::remote(SlotKind::Object, 2),
            ]
        );
        assert_eq!(flipped.flipped(), msg);
    }

    #[test]
    fn drop_slot_is_not_a_reference() {
        let msg = Message::Drop {
            epoch: 0,
            slot_id: Slot::remote(SlotKind::Object, 1),
            dec_refs: 1,
        };
        assert_eq!(msg.referenced_slots().count(), 0);
        assert_eq!(msg.kind().as_str(), "CTP_DROP");
    }
}
