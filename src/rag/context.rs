//! Context assembly from selected chunks
//!
//! Groups the retriever's selection by document type and renders a
//! fixed-order, labelled context document for the writer prompt. World
//! chunks inform the critic's constraints but are not rendered here.

use crate::rag::types::Chunk;

fn section(title: &str, chunks: &[&Chunk], max_items: usize) -> String {
    if chunks.is_empty() {
        return String::new();
    }
    let body = chunks
        .iter()
        .take(max_items)
        .map(|c| format!("- ({}#{} score={:.3}) {}", c.doc_type, c.id, c.score, c.text.trim()))
        .collect::<Vec<_>>()
        .join("\n\n");
    format!("## {}\n{}", title, body)
}

/// Render the selected chunks as the writer-facing context document.
/// Empty sections are omitted; callers append the user instruction as a
/// trailing section of their own.
pub fn build_context(selected: &[Chunk]) -> String {
    let of_type = |t: &str| -> Vec<&Chunk> { selected.iter().filter(|c| c.doc_type == t).collect() };

    let mut hot: Vec<&Chunk> = of_type("facts");
    hot.extend(of_type("foreshadowing"));

    let parts = [
        section("style_guide (rules/taboos)", &of_type("style_guide"), 1),
        section("outline (beats / goal)", &of_type("outline"), 2),
        section("characters (principal notes)", &of_type("characters"), 3),
        section("facts & foreshadowing (hot)", &hot, 6),
        section("relevant chapter summaries", &of_type("chapter_summary"), 3),
        section("relevant chapter raw snippets", &of_type("chapter"), 4),
    ];

    parts
        .iter()
        .filter(|p| !p.trim().is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join("\n\n")
        .trim()
        .to_string()
}
