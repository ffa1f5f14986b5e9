//! End-to-end tests for preprocessing and chunking.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use sift_chunking::{
    SentenceChunker, SentenceChunkerConfig, TextPreprocessor, Tokenizer, WhitespaceTokenizer,
};

fn whitespace_chunker(max: usize, overlap: usize) -> SentenceChunker {
    SentenceChunker::with_tokenizer(
        SentenceChunkerConfig::new(max, overlap),
        Arc::new(WhitespaceTokenizer),
    )
    .unwrap()
}

#[test]
fn test_three_sentence_scenario() {
    let chunker = whitespace_chunker(6, 2);
    let text = "This is sentence one. This is sentence two. This is sentence three.";
    let chunks = chunker.chunk(text);

    // Every sentence costs 4 tokens, so two never fit in 6 and a 4-token
    // tail never fits in an overlap of 2.
    let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
    assert_eq!(
        texts,
        vec![
            "This is sentence one.",
            "This is sentence two.",
            "This is sentence three."
        ]
    );
    for (i, chunk) in chunks.iter().enumerate() {
        assert!(chunk.token_count <= 6);
        assert_eq!(chunk.start_sentence_index, i);
        assert_eq!(chunk.end_sentence_index, i);
    }
}

#[test]
fn test_three_sentence_scenario_with_room_for_overlap() {
    let chunker = whitespace_chunker(10, 4);
    let text = "This is sentence one. This is sentence two. This is sentence three.";
    let chunks = chunker.chunk(text);

    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].text, "This is sentence one. This is sentence two.");
    assert_eq!(chunks[1].text, "This is sentence two. This is sentence three.");
    assert_eq!(chunks[1].start_sentence_index, 1);
    assert_eq!(chunks[1].end_sentence_index, 2);
}

#[test]
fn test_chunks_respect_budget() {
    let tokenizer = WhitespaceTokenizer;
    let text = "Retrieval systems split documents. Each chunk must stay small! \
                Overlap keeps context between neighbours. 42 is a number that starts a sentence. \
                A very long sentence follows that has many many words and keeps going past any sensible limit for a chunk.";
    for max in [3, 5, 8, 13] {
        for overlap in [0, 1, 2, max] {
            let chunker = whitespace_chunker(max, overlap);
            for chunk in chunker.chunk(text) {
                assert!(
                    tokenizer.count(&chunk.text) <= max,
                    "chunk {:?} over budget {max}",
                    chunk.text
                );
            }
        }
    }
}

#[test]
fn test_no_shared_sentences_without_overlap() {
    let chunker = whitespace_chunker(7, 0);
    let text = "Alpha beta gamma. Delta epsilon zeta. Eta theta. Iota kappa lambda mu.";
    let chunks = chunker.chunk(text);
    for pair in chunks.windows(2) {
        assert!(pair[0].end_sentence_index < pair[1].start_sentence_index);
    }
}

#[test]
fn test_single_token_budget_yields_one_word_per_chunk() {
    let chunker = whitespace_chunker(1, 0);
    let chunks = chunker.chunk("tiny supercalifragilistic");
    let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
    assert_eq!(texts, vec!["tiny", "supercalifragilistic"]);
}

#[test]
fn test_preprocess_then_chunk() {
    let raw = "Quarterly Report 2024\n\nThe team co-\noperated on the\nlaunch. It went well.\n\nQuarterly Report 2024\n\n• Revenue grew\n• Costs fell";
    let clean = TextPreprocessor::new().preprocess(raw);
    assert_eq!(
        clean,
        "The team cooperated on the launch. It went well.\n\n- Revenue grew\n- Costs fell"
    );

    let chunker = whitespace_chunker(50, 0);
    let sentences = chunker.sentences(&clean);
    assert_eq!(
        sentences,
        vec![
            "The team cooperated on the launch.",
            "It went well.",
            "Revenue grew",
            "Costs fell"
        ]
    );
    assert_eq!(chunker.chunk(&clean).len(), 1);
}
