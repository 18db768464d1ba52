//! Grounded prompt assembly.

use crate::generation::{PASSAGE_END, PASSAGE_START};
use std::fmt::Write;

const INSTRUCTIONS: &str = "Answer the question using only the context passages below. \
Cite passages by their number. If the context does not contain the answer, say so.";

/// Retrieved chunk carried from retrieval into the prompt.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ContextPassage {
    pub chunk_id: String,
    pub document_id: String,
    pub category: String,
    pub text: String,
    pub score: f32,
}

/// Render passages in the given order, each tagged with its document and category.
pub(crate) fn build_prompt(query: &str, passages: &[ContextPassage]) -> String {
    let mut prompt = String::with_capacity(
        INSTRUCTIONS.len() + query.len() + passages.iter().map(|p| p.text.len() + 96).sum::<usize>(),
    );
    prompt.push_str(INSTRUCTIONS);
    prompt.push_str("\n\nContext:\n");
    for (index, passage) in passages.iter().enumerate() {
        // Writing into a String cannot fail.
        let _ = write!(
            prompt,
            "{PASSAGE_START}\n[{}] document={} category={} score={:.3}\n{}\n{PASSAGE_END}\n",
            index + 1,
            passage.document_id,
            passage.category,
            passage.score,
            passage.text.trim(),
        );
    }
    let _ = write!(prompt, "\nQuestion: {}\nAnswer:", query.trim());
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::{ExtractiveGenerator, GenerationParams, Generator};

    fn passage(id: &str, document: &str, text: &str, score: f32) -> ContextPassage {
        ContextPassage {
            chunk_id: id.into(),
            document_id: document.into(),
            category: "web".into(),
            text: text.into(),
            score,
        }
    }

    #[test]
    fn numbers_passages_in_order_with_citation_tags() {
        let prompt = build_prompt(
            "What is XSS?",
            &[
                passage("c1", "doc-a", "Cross-site scripting injects script.", 0.9),
                passage("c2", "doc-b", "Escaping output prevents it.", 0.5),
            ],
        );
        let first = prompt.find("[1] document=doc-a category=web score=0.900").expect("first");
        let second = prompt.find("[2] document=doc-b category=web score=0.500").expect("second");
        assert!(first < second);
        assert!(prompt.ends_with("Question: What is XSS?\nAnswer:"));
        assert_eq!(prompt.matches(PASSAGE_START).count(), 2);
    }

    #[tokio::test]
    async fn extractive_generator_reads_back_the_top_passage() {
        let prompt = build_prompt(
            "q",
            &[passage("c1", "doc-a", "  Use parameterized queries.  ", 0.7)],
        );
        let answer = ExtractiveGenerator
            .generate(&prompt, &GenerationParams::default())
            .await
            .expect("answer");
        assert_eq!(answer, "Use parameterized queries.");
    }
}
