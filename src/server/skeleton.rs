//! Request dispatching onto the persistent table.

use crate::message::{Content, Message, Opcode};
use crate::server::PersistentTable;

/// Executes one request message against the table and builds its reply.
/// Malformed requests and persistence failures yield `99 50 -1`.
pub(crate) async fn invoke(
    table: &mut PersistentTable,
    req: Message,
) -> Message {
    let reply_op = match req.opcode.reply() {
        Some(op) => op,
        None => {
            pf_warn!("not a request opcode {:?}", req.opcode);
            return Message::error();
        }
    };

    let content = match (req.opcode, req.content) {
        (Opcode::Put, Content::Entry { key, payload, ts }) => {
            match table.put(&key, &payload, ts).await {
                Ok(_) => Content::Result(0),
                Err(e) => {
                    pf_error!("put '{}' failed: {}", key, e);
                    return Message::error();
                }
            }
        }

        (Opcode::Get, Content::Key(key)) => match table.get(&key) {
            Some(record) => Content::Value {
                payload: record.payload,
                ts: record.ts,
            },
            None => Content::Value {
                payload: vec![],
                ts: 0,
            },
        },

        (Opcode::Del, Content::Key(key)) => match table.del(&key).await {
            Ok(true) => Content::Result(0),
            Ok(false) => Content::Result(-1),
            Err(e) => {
                pf_error!("del '{}' failed: {}", key, e);
                return Message::error();
            }
        },

        (Opcode::Size, Content::Result(_)) => {
            Content::Result(table.size() as i32)
        }

        (Opcode::GetKeys, Content::Result(_)) => Content::Keys(table.keys()),

        (Opcode::GetTs, Content::Key(key)) => {
            Content::Timestamp(table.get_timestamp(&key))
        }

        (opcode, content) => {
            pf_warn!(
                "unexpected content type {} for {:?}",
                content.c_type(),
                opcode
            );
            return Message::error();
        }
    };

    Message::new(reply_op, content)
}
