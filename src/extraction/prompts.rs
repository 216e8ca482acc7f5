/// Prompt templates for digest and keyconcept extraction

use super::{ChatMessage, Role};

/// Instruction used when feeding malformed output back to the model.
pub const FORMAT_REPAIR_INSTRUCTION: &str = "Format the INPUT content in JSON format";

/// Instruction, task statement and one worked example for a structured-output call.
#[derive(Debug, Clone, Copy)]
pub struct PromptTemplate {
    pub instruction: &'static str,
    pub task: &'static str,
    pub sample_input: &'static str,
    pub sample_output: &'static str,
}

impl PromptTemplate {
    /// System prompt, the sample exchange, then the fenced input.
    pub fn messages(&self, instruction: &str, schema: &str, input: &str) -> Vec<ChatMessage> {
        let system = format!(
            "CONTEXT:\n{}\n\nOUTPUT FORMAT: a JSON object matching this schema\n```\n{}\n```\n\nTASK:\n{}",
            instruction, schema, self.task
        );
        vec![
            ChatMessage::new(Role::System, system),
            ChatMessage::new(Role::User, fenced_input(self.sample_input)),
            ChatMessage::new(Role::Assistant, format!("```json\n{}\n```", self.sample_output)),
            ChatMessage::new(Role::User, fenced_input(input)),
        ]
    }
}

fn fenced_input(input: &str) -> String {
    format!("INPUT:\n```\n{}\n```", input)
}

pub const DIGEST: PromptTemplate = PromptTemplate {
    instruction: "You are a news editor. The INPUT is the text of a news article, blog post or social media post.",
    task: "Write a summary of the INPUT in no more than three sentences and name its single main topic. \
           Respond with JSON only.",
    sample_input: "The European Central Bank held interest rates steady on Thursday, citing easing inflation \
                   across the eurozone. President Christine Lagarde said future decisions would depend on incoming \
                   data, and markets trimmed bets on a cut before summer.",
    sample_output: r#"{"summary": "The European Central Bank left interest rates unchanged as eurozone inflation eased. Christine Lagarde said future moves depend on incoming data, and markets reduced expectations of an early cut.", "topic": "ECB interest rate decision"}"#,
};

pub const KEYCONCEPTS: PromptTemplate = PromptTemplate {
    instruction: "You are a news analyst. The INPUT holds one or more news articles or posts separated by ``` lines.",
    task: "For each newsworthy development in the INPUT, extract the keyphrase (the person, organization, product \
           or technology at its center), the event involving it, and a one sentence description. \
           Skip content with nothing newsworthy. Respond with JSON only.",
    sample_input: "Nvidia reported record quarterly revenue driven by demand for its data center chips.\n```\n\
                   OpenAI released a new reasoning model to paying ChatGPT subscribers on Tuesday.",
    sample_output: r#"{"concepts": [{"keyphrase": "Nvidia", "event": "record quarterly revenue", "description": "Nvidia posted record revenue on strong data center chip demand."}, {"keyphrase": "OpenAI", "event": "new reasoning model release", "description": "OpenAI made a new reasoning model available to paying ChatGPT subscribers."}]}"#,
};
