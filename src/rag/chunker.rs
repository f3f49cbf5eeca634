//! Narrative text chunking
//!
//! Splits prose on blank-line paragraph boundaries and greedy-packs
//! paragraphs into overlapping chunks. All sizes are Unicode scalar counts,
//! not bytes, so CJK manuscripts chunk the same as ASCII ones.

use std::collections::VecDeque;

/// Leading excerpt length carried on every chunk
pub const SNIPPET_CHARS: usize = 240;

/// One chunk of narrative text plus its leading excerpt
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkedText {
    pub text: String,
    pub snippet: String,
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn split_at_chars(s: &str, n: usize) -> (String, String) {
    match s.char_indices().nth(n) {
        Some((byte_idx, _)) => (s[..byte_idx].to_string(), s[byte_idx..].to_string()),
        None => (s.to_string(), String::new()),
    }
}

fn split_paragraphs(text: &str) -> VecDeque<String> {
    let cleaned = text.replace("\r\n", "\n").replace('\r', "\n");
    cleaned
        .trim()
        .split("\n\n")
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(|p| p.to_string())
        .collect()
}

/// Split narrative text into overlapping, paragraph-bounded chunks.
///
/// Paragraphs are greedy-packed until the next one would push the chunk past
/// `max_chars` (a two-char join separator is counted). A single paragraph
/// longer than `max_chars` is hard-cut and its remainder re-queued. After a
/// chunk is emitted, tail paragraphs are carried into the next chunk until
/// their combined length reaches `max_chars * overlap_ratio`; when the
/// carried tail leaves no room for any further paragraph, it is dropped so
/// the walk always advances.
///
/// Deterministic in its inputs; empty input yields an empty vec.
pub fn chunk_novel_text(
    text: &str,
    max_chars: usize,
    overlap_ratio: f32,
    snippet_chars: usize,
) -> Vec<ChunkedText> {
    let mut paragraphs = split_paragraphs(text);
    if paragraphs.is_empty() {
        return Vec::new();
    }

    let overlap_target = (max_chars as f32 * overlap_ratio) as usize;
    let mut chunks: Vec<String> = Vec::new();
    let mut carry: Vec<String> = Vec::new();

    while !paragraphs.is_empty() {
        let mut buf: Vec<String> = Vec::new();
        let mut total = 0usize;

        let seeded = !carry.is_empty();
        for p in carry.drain(..) {
            total += char_len(&p) + 2;
            buf.push(p);
        }

        let mut consumed = 0usize;
        pack(&mut paragraphs, &mut buf, &mut total, max_chars, &mut consumed);

        if seeded && consumed == 0 {
            // the overlap seed crowded out all remaining paragraphs
            buf.clear();
            total = 0;
            pack(&mut paragraphs, &mut buf, &mut total, max_chars, &mut consumed);
        }

        if buf.is_empty() {
            // single paragraph longer than max_chars: hard cut
            let p = paragraphs.pop_front().expect("non-empty queue");
            let (head, rest) = split_at_chars(&p, max_chars);
            buf.push(head);
            if !rest.trim().is_empty() {
                paragraphs.push_front(rest);
            }
        }

        chunks.push(buf.join("\n\n").trim().to_string());

        if !paragraphs.is_empty() && overlap_ratio > 0.0 {
            let mut tail: Vec<String> = Vec::new();
            let mut tail_len = 0usize;
            for p in buf.iter().rev() {
                if tail_len >= overlap_target {
                    break;
                }
                tail.insert(0, p.clone());
                tail_len += char_len(p) + 2;
            }
            carry = tail;
        }
    }

    chunks
        .into_iter()
        .map(|c| {
            let snippet = if char_len(&c) > snippet_chars {
                let (head, _) = split_at_chars(&c, snippet_chars);
                format!("{}…", head)
            } else {
                c.clone()
            };
            ChunkedText { text: c, snippet }
        })
        .collect()
}

fn pack(
    paragraphs: &mut VecDeque<String>,
    buf: &mut Vec<String>,
    total: &mut usize,
    max_chars: usize,
    consumed: &mut usize,
) {
    while let Some(next) = paragraphs.front() {
        let join = if buf.is_empty() { 0 } else { 2 };
        if *total + char_len(next) + join > max_chars {
            break;
        }
        let p = paragraphs.pop_front().expect("front checked");
        *total += char_len(&p) + 2;
        buf.push(p);
        *consumed += 1;
    }
}
