//! Prompt templates for rubric grading.
//!
//! Domain logic for rendering grading prompts. Backend-agnostic.
//!
//! Every template renders to exactly two messages: a system message holding the
//! grading persona and the output contract, and a user message holding the
//! delimited context, the entity names and the grading instructions.

use crate::gateway::Message;
use crate::rubric::Dimension;

// =============================================================================
// Prompt input
// =============================================================================

/// Everything a template needs to render.
#[derive(Debug, Clone, Copy)]
pub struct PromptInput<'a> {
    /// Entity under evaluation (instructor, resume, submission label).
    pub subject_name: &'a str,
    /// Further entities the subject is compared with (e.g. a job description).
    pub extra_names: &'a [String],
    /// Retrieved context passage, already joined.
    pub context: &'a str,
    /// Criteria to grade. Single-dimension templates use the first one.
    pub criteria: &'a [Dimension],
}

impl<'a> PromptInput<'a> {
    pub fn dimension(subject_name: &'a str, context: &'a str, dimension: &'a Dimension) -> Self {
        Self {
            subject_name,
            extra_names: &[],
            context,
            criteria: std::slice::from_ref(dimension),
        }
    }

    pub fn criteria(subject_name: &'a str, context: &'a str, criteria: &'a [Dimension]) -> Self {
        Self {
            subject_name,
            extra_names: &[],
            context,
            criteria,
        }
    }

    pub fn with_extra_names(mut self, extra_names: &'a [String]) -> Self {
        self.extra_names = extra_names;
        self
    }
}

// =============================================================================
// Prompt templates
// =============================================================================

/// Rendered prompt ready for the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptInstance {
    pub template_slug: String,
    pub system: String,
    pub user: String,
}

impl PromptInstance {
    pub fn to_messages(&self) -> Vec<Message> {
        vec![Message::system(&self.system), Message::user(&self.user)]
    }
}

/// Escape characters that could break the context delimiters.
pub fn escape_xml_chars(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// A prompt template with placeholders.
///
/// Placeholders: `{subject}`, `{extra_names}`, `{criterion}`, `{rubric}`,
/// `{scale_min}`, `{scale_max}`, `{context}`, `{output_contract}`.
#[derive(Debug, Clone, Copy)]
pub struct PromptTemplate {
    pub slug: &'static str,
    pub system: &'static str,
    pub user: &'static str,
}

impl PromptTemplate {
    pub fn render(&self, input: &PromptInput<'_>) -> PromptInstance {
        // Subject, names and context are caller-supplied; catalog fields are operator config.
        let subject = escape_xml_chars(input.subject_name);
        let extra_names = input
            .extra_names
            .iter()
            .map(|n| escape_xml_chars(n))
            .collect::<Vec<_>>()
            .join(", ");
        let context = escape_xml_chars(input.context.trim());

        let criterion = input
            .criteria
            .iter()
            .map(|d| d.name())
            .collect::<Vec<_>>()
            .join(", ");
        let rubric = render_rubric(input.criteria);
        let contract = render_output_contract(input.criteria);
        let (scale_min, scale_max) = input
            .criteria
            .first()
            .map(|d| (d.scale_min(), d.scale_max()))
            .unwrap_or((0, 0));

        let scale_min = scale_min.to_string();
        let scale_max = scale_max.to_string();
        let values = [
            ("subject", subject.as_str()),
            ("extra_names", extra_names.as_str()),
            ("criterion", criterion.as_str()),
            ("scale_min", scale_min.as_str()),
            ("scale_max", scale_max.as_str()),
            ("output_contract", contract.as_str()),
            ("rubric", rubric.as_str()),
            ("context", context.as_str()),
        ];
        let fill = |tpl: &str| fill_placeholders(tpl, &values);

        PromptInstance {
            template_slug: self.slug.to_string(),
            system: fill(self.system).trim().to_string(),
            user: fill(self.user).trim().to_string(),
        }
    }

    /// Stable hash of the template text, used in cache keys.
    pub fn template_hash(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.slug.as_bytes());
        hasher.update(b"|");
        hasher.update(self.system.as_bytes());
        hasher.update(b"|");
        hasher.update(self.user.as_bytes());
        hasher.finalize().to_hex().to_string()
    }
}

/// Substitute `{name}` placeholders in a single pass. Substituted text is never
/// rescanned, so braces inside caller values stay literal.
fn fill_placeholders(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let value = after.find('}').and_then(|close| {
            let key = &after[..close];
            values
                .iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| (close, *value))
        });
        match value {
            Some((close, value)) => {
                out.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn render_rubric(criteria: &[Dimension]) -> String {
    criteria
        .iter()
        .map(|d| {
            format!(
                "- {} (scale {} to {}): {}",
                d.name(),
                d.scale_min(),
                d.scale_max(),
                d.description().trim()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_output_contract(criteria: &[Dimension]) -> String {
    criteria
        .iter()
        .map(|d| {
            format!(
                "{name}:\n-Score: <whole number from {min} to {max}, or N/A>\n-Explanation: <justification with quoted excerpts>",
                name = d.name(),
                min = d.scale_min(),
                max = d.scale_max()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// =============================================================================
// Standard prompts
// =============================================================================

pub const INSTRUCTOR_V1: PromptTemplate = PromptTemplate {
    slug: "instructor_v1",
    system: r#"You are an impartial judge of teaching quality. You read lecture transcripts and grade one instructor on one criterion, giving detailed, polite and constructive suggestions for improvement.

Grade strictly on a scale of {scale_min} to {scale_max} using whole numbers only. If the transcript lacks sufficient information to judge {criterion}, answer N/A and explain why.

Output format (plain text, no bold or italics on the score line):
{output_contract}"#,
    user: r#"<transcript>
{context}
</transcript>

Evaluate the instructor named "{subject}" on the criterion "{criterion}".

Rubric:
{rubric}

Instructions:
- Use only the transcript above, and only passages where "{subject}" is the instructor.
- Ignore students joining or leaving, meeting notifications and other meta noise.
- Justify any score below {scale_max} with at least one quoted excerpt from the transcript.
- Include both positive and negative examples, and consider the context around each quote."#,
};

pub const DOCUMENT_V1: PromptTemplate = PromptTemplate {
    slug: "document_v1",
    system: r#"You are an impartial judge comparing documents. You grade how well "{subject}" satisfies "{extra_names}" on one criterion, giving detailed, polite and constructive suggestions for improvement.

Grade strictly on a scale of {scale_min} to {scale_max} using whole numbers only. If the documents lack sufficient information to judge {criterion}, answer N/A and explain why.

Output format (plain text):
{output_contract}"#,
    user: r#"<documents>
{context}
</documents>

Evaluate "{subject}" in comparison to "{extra_names}" on the criterion "{criterion}".

Rubric:
{rubric}

Instructions:
- Use only the documents above.
- Ignore headers, footers and other meta noise.
- Justify any score below {scale_max} with at least one quoted excerpt from the documents.
- Include both positive and negative examples."#,
};

pub const QA_PAIR_V1: PromptTemplate = PromptTemplate {
    slug: "qa_pair_v1",
    system: r#"You are an impartial judge grading an answer to a question against a reference context. Grade every criterion below, each on its own scale, using whole numbers only. If the context lacks sufficient information to judge a criterion, answer N/A for it and explain why.

Rubric:
{rubric}

Output format (plain text, one block per criterion, in this order):
{output_contract}"#,
    user: r#"<reference_context>
{context}
</reference_context>

<submission>
{subject}
</submission>

Grade the submission using the rubric and the reference context only. Ignore formatting noise. Justify any score below the top of its scale with at least one quoted excerpt from the answer."#,
};

pub const PROMPTS: &[PromptTemplate] = &[INSTRUCTOR_V1, DOCUMENT_V1, QA_PAIR_V1];
pub const DEFAULT_PROMPT: PromptTemplate = INSTRUCTOR_V1;

pub fn prompt_by_slug(slug: &str) -> Option<PromptTemplate> {
    PROMPTS.iter().find(|t| t.slug == slug).copied()
}

/// Template for single-dimension evaluation: comparisons get `document_v1`.
pub fn template_for(extra_names: &[String]) -> PromptTemplate {
    if extra_names.is_empty() {
        INSTRUCTOR_V1
    } else {
        DOCUMENT_V1
    }
}

// =============================================================================
// TESTS
// =============================================================================
