//! Property-based tests for the streaming wire decoder
//!
//! A streamed completion must decode to the same fragments no matter how
//! the transport splits the bytes.

use super::openai::completion_stream;
use super::{LlmError, StreamChunk};
use futures::StreamExt;
use proptest::prelude::*;

fn encode(fragments: &[String]) -> Vec<u8> {
    let mut out = String::new();
    for fragment in fragments {
        let chunk = serde_json::json!({"choices": [{"delta": {"content": fragment}}]});
        out.push_str(&format!("data: {chunk}\n\n"));
    }
    out.push_str("data: [DONE]\n\n");
    out.into_bytes()
}

fn decode(bytes: &[u8], cuts: &[usize]) -> Vec<StreamChunk> {
    let mut points: Vec<usize> = cuts.iter().map(|c| c % (bytes.len() + 1)).collect();
    points.sort_unstable();
    points.push(bytes.len());

    let mut pieces: Vec<Result<Vec<u8>, std::io::Error>> = Vec::new();
    let mut start = 0;
    for end in points {
        pieces.push(Ok(bytes[start..end].to_vec()));
        start = end;
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async move {
        completion_stream(futures::stream::iter(pieces), |e: &std::io::Error| {
            LlmError::network(e.to_string())
        })
        .map(Result::unwrap)
        .collect()
        .await
    })
}

proptest! {
    #[test]
    fn prop_split_points_do_not_change_fragments(
        fragments in prop::collection::vec("[a-zA-Z0-9 .,!]{1,12}", 0..8),
        cuts in prop::collection::vec(any::<usize>(), 0..10),
    ) {
        let bytes = encode(&fragments);
        let decoded = decode(&bytes, &cuts);

        let mut expected: Vec<StreamChunk> = fragments.iter().cloned().map(StreamChunk::Delta).collect();
        expected.push(StreamChunk::Done);
        prop_assert_eq!(decoded, expected);
    }

    #[test]
    fn prop_done_marker_is_last(fragments in prop::collection::vec("[a-z]{1,5}", 0..5)) {
        let decoded = decode(&encode(&fragments), &[]);
        prop_assert_eq!(decoded.last(), Some(&StreamChunk::Done));
        prop_assert_eq!(decoded.iter().filter(|c| **c == StreamChunk::Done).count(), 1);
    }
}
