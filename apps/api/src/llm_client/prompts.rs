#![allow(dead_code)]

// Cross-cutting prompt fragments shared by all pipeline phases.
// Phase-specific templates live in pipeline::prompts.

/// Appended to every system prompt that expects machine-readable output.
pub const JSON_ONLY_INSTRUCTION: &str = "You MUST respond with valid JSON only. \
    Do NOT include any text outside the JSON object. \
    Do NOT use markdown code fences. \
    Do NOT include explanations or apologies.";

/// Shared grounding rule: quotes must be literal substrings of the source.
pub const QUOTE_FIDELITY_INSTRUCTION: &str = "Every quote you return MUST be copied \
    verbatim from the source document. Do NOT paraphrase, shorten, or merge quotes. \
    If no verbatim quote supports a key behavior, omit it entirely rather than inventing one.";

/// Shared scope rule: the model judges only what it was given.
pub const SCOPE_INSTRUCTION: &str = "Base your answer ONLY on the material provided in \
    this prompt. Do NOT rely on outside knowledge about the candidate, the organization, \
    or typical assessment outcomes.";
