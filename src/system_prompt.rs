//! System prompts for the generative steps
//!
//! Retrieved chunks are injected as an XML `<documents>` block so the model
//! can tell knowledge-base text from conversation.

use crate::state_machine::{format_docs, Document};
use std::fmt::Write;

/// Base prompt establishing the assistant's role
const BASE_PROMPT: &str = r"You are a company information assistant. Keep responses clear, professional and helpful. Answer only from the company documents provided; if they do not cover something, say so.";

const OVERVIEW_INSTRUCTIONS: &str = r"Greet the user and give a brief overview of the company in no more than two sentences, based on the product information below. Be engaging and informative.

After the overview, ask the user whether they would like to learn more about the product in detail.";

const RESEARCH_INSTRUCTIONS: &str = r"Give the user a detailed overview of the company and its products based on the documents below. Present the details directly; do not open with filler such as 'sure' or 'okay'. Use bullet points where they help.

After the detailed overview, always ask the user whether they would like to receive a comprehensive company profile by email.";

/// Retrieval query for the opening overview
pub const OVERVIEW_QUERY: &str = "product overview";

/// Retrieval query for the detailed follow-up
pub const RESEARCH_QUERY: &str = "Provide comprehensive details about the product";

pub fn overview_prompt(docs: &[Document]) -> String {
    build(OVERVIEW_INSTRUCTIONS, docs)
}

pub fn research_prompt(docs: &[Document]) -> String {
    build(RESEARCH_INSTRUCTIONS, docs)
}

fn build(instructions: &str, docs: &[Document]) -> String {
    let mut prompt = String::from(BASE_PROMPT);
    let _ = write!(prompt, "\n\n{instructions}\n\n{}", format_docs(docs));
    prompt
}
