//! Property tests for the framed transport: anything written comes back
//! byte-identical through a read, singly and in sequence.

use proptest::prelude::*;
use serde_json::{Value, json};

use rass::transport::{MessageReader, MessageWriter};

fn arb_json() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| json!(n)),
        // Includes non-ASCII so Content-Length counting in bytes is
        // actually exercised.
        "[a-zA-Z0-9 _/.éü世界-]{0,24}".prop_map(Value::String),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,8}", inner, 0..4)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

/// A structurally valid JSON-RPC 2.0 message value.
fn arb_message() -> impl Strategy<Value = Value> {
    let id = prop_oneof![
        any::<i64>().prop_map(|n| json!(n)),
        "[a-z0-9-]{1,12}".prop_map(|s| json!(s)),
    ];
    let method = "[a-zA-Z][a-zA-Z/$-]{0,24}";
    prop_oneof![
        // request
        (id.clone(), method.prop_map(Value::String), arb_json()).prop_map(|(id, m, p)| {
            json!({"jsonrpc": "2.0", "id": id, "method": m, "params": p})
        }),
        // notification
        (method.prop_map(Value::String), arb_json())
            .prop_map(|(m, p)| json!({"jsonrpc": "2.0", "method": m, "params": p})),
        // response
        (id, arb_json()).prop_map(|(id, r)| json!({"jsonrpc": "2.0", "id": id, "result": r})),
    ]
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap()
}

proptest! {
    #[test]
    fn single_message_round_trips(message in arb_message()) {
        runtime().block_on(async {
            let mut buf = Vec::new();
            MessageWriter::new(std::io::Cursor::new(&mut buf))
                .write_message(&message)
                .await
                .unwrap();
            let back = MessageReader::new(buf.as_slice())
                .read_message()
                .await
                .unwrap()
                .unwrap();
            prop_assert_eq!(back, message);
            Ok(())
        })?;
    }

    #[test]
    fn message_sequences_round_trip(messages in prop::collection::vec(arb_message(), 1..6)) {
        runtime().block_on(async {
            let mut buf = Vec::new();
            {
                let mut writer = MessageWriter::new(std::io::Cursor::new(&mut buf));
                for message in &messages {
                    writer.write_message(message).await.unwrap();
                }
            }

            let mut reader = MessageReader::new(buf.as_slice());
            for message in &messages {
                let back = reader.read_message().await.unwrap().unwrap();
                prop_assert_eq!(&back, message);
            }
            prop_assert!(reader.read_message().await.unwrap().is_none());
            Ok(())
        })?;
    }

    #[test]
    fn truncated_streams_never_parse(message in arb_message(), cut in 0usize..64) {
        runtime().block_on(async {
            let mut buf = Vec::new();
            MessageWriter::new(std::io::Cursor::new(&mut buf))
                .write_message(&message)
                .await
                .unwrap();
            // Cut somewhere strictly inside the frame.
            let cut = cut % buf.len().max(1);
            if cut == 0 {
                return Ok(());
            }
            buf.truncate(cut);
            let result = MessageReader::new(buf.as_slice()).read_message().await;
            prop_assert!(result.is_err(), "truncated frame parsed: {:?}", result);
            Ok(())
        })?;
    }
}
