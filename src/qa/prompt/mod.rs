//! Prompt assembly under a token budget.


use serde::Serialize;
use tracing::debug;

use crate::retriever::{RetrievalResult, RetrievedEmail};

pub const SYSTEM_PROMPT: &str = "You are a helpful assistant that answers questions about emails based on the provided context.";

pub const GENERAL_KNOWLEDGE_SYSTEM_PROMPT: &str = "You are a helpful assistant. None of the user's emails matched their question, so answer from general knowledge and say clearly that no supporting emails were found.";

const ENTRY_SEPARATOR: &str = "\n\n---\n\n";

const INSTRUCTIONS: &str = "Important instructions:
1. Only use information clearly present in the provided emails
2. If the emails don't contain information to answer the question, say \"I don't have enough information in the provided emails to answer this question\"
3. Focus on the user's specific question and provide a direct, concise answer
4. Include key details from the emails that support your answer
5. If multiple emails contain relevant information, synthesize them into a coherent answer
6. Don't make assumptions about content not shown in the emails
7. If the question is ambiguous, address the most likely interpretation based on the emails";

/// The prompt actually sent, and which retrieved emails made it in.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssembledContext {
    pub question: String,
    pub prompt: String,
    /// Hits whose full text is in the prompt, in rank order
    pub included: Vec<RetrievedEmail>,
    /// Hits left out because the budget ran out
    pub dropped_ids: Vec<String>,
    pub estimated_tokens: usize,
}

impl AssembledContext {
    /// True when no email made it into the prompt.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.included.is_empty()
    }

    #[inline]
    pub fn included_ids(&self) -> Vec<&str> {
        self.included.iter().map(|hit| hit.id.as_str()).collect()
    }
}

/// Rough token count: words / 0.75 plus a tenth of a token per punctuation mark.
#[inline]
pub fn estimate_tokens(text: &str) -> usize {
    let words = text.split_whitespace().count();
    let punctuation = text.chars().filter(char::is_ascii_punctuation).count();
    (punctuation as f64).mul_add(0.1, words as f64 / 0.75).ceil() as usize
}

/// Build the prompt from the highest-ranked hits that fit in `budget_tokens`.
///
/// Entries are either included whole or left out entirely. Once one entry does
/// not fit, it and every lower-ranked entry are dropped.
#[inline]
pub fn assemble_context(
    question: &str,
    retrieval: &RetrievalResult,
    budget_tokens: usize,
) -> AssembledContext {
    let mut blocks: Vec<String> = Vec::new();
    let mut included = Vec::new();
    let mut dropped_ids = Vec::new();
    let mut prompt = no_context_prompt(question);

    for hit in retrieval.hits() {
        if !dropped_ids.is_empty() {
            dropped_ids.push(hit.id.clone());
            continue;
        }

        blocks.push(format_entry(blocks.len() + 1, hit));
        let candidate = grounded_prompt(question, &blocks);
        if estimate_tokens(&candidate) <= budget_tokens {
            prompt = candidate;
            included.push(hit.clone());
        } else {
            blocks.pop();
            dropped_ids.push(hit.id.clone());
        }
    }

    if !dropped_ids.is_empty() {
        debug!(
            "Prompt budget of {} tokens dropped {} of {} emails",
            budget_tokens,
            dropped_ids.len(),
            retrieval.len()
        );
    }

    AssembledContext {
        question: question.to_string(),
        estimated_tokens: estimate_tokens(&prompt),
        prompt,
        included,
        dropped_ids,
    }
}

/// One email as it appears in the prompt; `position` is 1-based.
#[inline]
pub fn format_entry(position: usize, hit: &RetrievedEmail) -> String {
    let date = hit
        .metadata
        .timestamp
        .map_or_else(|| "Unknown date".to_string(), |ts| ts.to_rfc2822());

    format!(
        "Email {}:\nFrom: {}\nDate: {}\nSubject: {}\n\n{}",
        position, hit.metadata.sender, date, hit.metadata.subject, hit.normalized_text
    )
}

#[inline]
pub fn no_context_prompt(question: &str) -> String {
    format!(
        "No emails in the user's inbox are relevant to this question: \"{question}\"\n\nAnswer from general knowledge if you can, and state that no supporting emails were found."
    )
}

fn grounded_prompt(question: &str, blocks: &[String]) -> String {
    format!(
        "You are an email assistant that provides precise, accurate answers to questions about emails.\n\nAnalyze the following emails from the user's inbox to answer their question: \"{}\"\n\n{}\n\n{}\n\nGive a precise, helpful answer based solely on the emails provided.",
        question,
        blocks.join(ENTRY_SEPARATOR),
        INSTRUCTIONS
    )
}
