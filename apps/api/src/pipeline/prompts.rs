// All LLM prompt constants for the generation pipeline.
// Reuses cross-cutting fragments from llm_client::prompts.

/// Sampling temperatures per step. Judgment runs cold; prose runs warmer.
pub const EVIDENCE_TEMPERATURE: f32 = 0.2;
pub const JUDGMENT_TEMPERATURE: f32 = 0.1;
pub const NARRATIVE_TEMPERATURE: f32 = 0.4;
pub const SUMMARY_TEMPERATURE: f32 = 0.4;

/// System prompt for Phase 1 evidence extraction.
pub const EVIDENCE_SYSTEM: &str = "You are an experienced assessment-center observer. \
    You find literal quotes in a transcript that demonstrate specific key behaviors. \
    You MUST respond with valid JSON only. \
    Do NOT include any text outside the JSON object. \
    Do NOT use markdown code fences.";

/// Evidence extraction prompt. Replace: {quote_fidelity}, {scope}, {competency},
/// {level}, {definition}, {key_behaviors}, {source_tag}, {document_text},
/// {extra_context}
pub const EVIDENCE_PROMPT_TEMPLATE: &str = r#"{quote_fidelity}

{scope}

You are scanning ONE source document for evidence of ONE competency at ONE level.

COMPETENCY: {competency}
LEVEL: {level}
LEVEL DEFINITION: {definition}

KEY BEHAVIORS defined at this level (echo these texts back EXACTLY as written):
{key_behaviors}

SOURCE DOCUMENT ({source_tag}):
{document_text}
{extra_context}
Return a JSON object with this EXACT schema:
{
  "evidence": [
    {
      "key_behavior": "the exact key behavior text from the list above",
      "quote": "a verbatim quote from the source document",
      "reasoning": "one or two sentences on why this quote demonstrates the key behavior"
    }
  ]
}

RULES:
1. Only use key behaviors from the list above — never invent new ones
2. A key behavior may appear multiple times if multiple independent quotes support it
3. A key behavior with no supporting quote is simply omitted
4. If the document contains no evidence for this competency at this level, return {"evidence": []}"#;

/// System prompt for Phase 2 per-level judgment.
pub const JUDGMENT_SYSTEM: &str = "You are a strict assessment-center evaluator. \
    You judge whether collected evidence fulfills defined key behaviors. \
    You MUST respond with valid JSON only. \
    Do NOT include any text outside the JSON object. \
    Do NOT use markdown code fences.";

/// Judgment prompt. Replace: {scope}, {competency}, {level}, {definition},
/// {key_behaviors}, {evidence_json}
pub const JUDGMENT_PROMPT_TEMPLATE: &str = r#"{scope}

Judge, for EVERY key behavior listed below, whether the collected evidence fulfills it.

COMPETENCY: {competency}
LEVEL: {level}
LEVEL DEFINITION: {definition}

KEY BEHAVIORS to judge (echo these texts back EXACTLY as written):
{key_behaviors}

COLLECTED EVIDENCE for this competency at this level:
{evidence_json}

Return a JSON object with this EXACT schema:
{
  "evaluations": [
    {
      "key_behavior": "the exact key behavior text",
      "fulfilled": true,
      "reasoning": "why the evidence does or does not fulfill this key behavior",
      "quotes": ["the quotes you relied on, copied from the evidence"]
    }
  ]
}

RULES:
1. Return exactly one evaluation per key behavior listed above — no more, no fewer
2. `fulfilled` is true only when at least one quote concretely demonstrates the behavior
3. An empty evidence list means every key behavior is unfulfilled
4. `quotes` must be copied from the evidence above — never invented"#;

/// System prompt for the Phase 2 narrative step.
pub const NARRATIVE_SYSTEM: &str = "You are a senior assessor writing the competency section \
    of an assessment report. You write clear, professional prose in complete sentences. \
    You MUST respond with valid JSON only. \
    Do NOT include any text outside the JSON object. \
    Do NOT use markdown code fences.";

/// Narrative prompt. Replace: {competency}, {target_level}, {level_achieved},
/// {anomaly_note}, {trail_json}
pub const NARRATIVE_PROMPT_TEMPLATE: &str = r#"Write the narrative for one competency based on the full judgment trail below.

COMPETENCY: {competency}
TARGET LEVEL: {target_level}
LEVEL ACHIEVED: {level_achieved}
{anomaly_note}
JUDGMENT TRAIL (per level, per key behavior):
{trail_json}

Return a JSON object with this EXACT schema:
{
  "explanation": "a cohesive narrative explaining the achieved level, grounded in the trail",
  "development_recommendations": {
    "personal_development": ["recommendation the candidate can pursue alone"],
    "assignment": ["on-the-job assignment that would develop this competency"],
    "training": ["formal training or coaching suggestion"]
  }
}

RULES:
1. The explanation must reference concrete judged behaviors, not generic praise
2. development_recommendations MUST contain exactly the three categories shown — each with at least one entry
3. Do not mention levels that were never evaluated"#;

/// Extra line spliced into the narrative prompt when lower-level failures
/// coexist with higher-level passes.
pub const ANOMALY_NOTE: &str = "NOTE: the judgment trail is inconsistent — at least one level \
    below a passed level did not meet its threshold. Address this inconsistency explicitly \
    in the explanation.\n";

/// System prompt for the Phase 3 draft pass.
pub const SUMMARY_DRAFT_SYSTEM: &str = "You are a lead assessor writing the executive summary \
    of a competency-assessment report. \
    You MUST respond with valid JSON only. \
    Do NOT include any text outside the JSON object. \
    Do NOT use markdown code fences.";

/// Draft prompt. Replace: {analyses_json}
pub const SUMMARY_DRAFT_TEMPLATE: &str = r#"Draft an executive summary from the competency analyses below.

COMPETENCY ANALYSES:
{analyses_json}

Return a JSON object with this EXACT schema:
{
  "overview": "a narrative overview that interleaves strengths and weaknesses — NOT two separate lists glued together",
  "strengths": ["a concrete strength grounded in the analyses"],
  "weaknesses": ["a concrete development area grounded in the analyses"],
  "recommendations": ["an overall recommendation"]
}

RULES:
1. The overview must read as one continuous narrative weaving strengths and weaknesses together
2. Every strength and weakness must be traceable to a specific competency analysis
3. Do not introduce competencies that are not in the analyses"#;

/// System prompt for the Phase 3 critique pass.
pub const SUMMARY_CRITIQUE_SYSTEM: &str = "You are a meticulous editor reviewing an executive \
    summary for internal consistency before it reaches the client. \
    You MUST respond with valid JSON only. \
    Do NOT include any text outside the JSON object. \
    Do NOT use markdown code fences.";

/// Critique prompt. Replace: {draft_json}, {analyses_json}
pub const SUMMARY_CRITIQUE_TEMPLATE: &str = r#"Review the draft executive summary below against the underlying analyses.

Check specifically for self-contradiction: claims in the overview that conflict with the
strengths or weaknesses lists, strengths that the analyses do not support, and weaknesses
the overview silently omits. Rewrite whatever is inconsistent.

DRAFT:
{draft_json}

COMPETENCY ANALYSES:
{analyses_json}

Return the refined summary as a JSON object with the SAME schema as the draft:
{
  "overview": "...",
  "strengths": ["..."],
  "weaknesses": ["..."],
  "recommendations": ["..."]
}"#;
