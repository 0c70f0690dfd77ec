//! Prompt selection for the two decision nodes.
//!
//! [`select_variant`] is a pure function of the branch, the attachment,
//! recognizer availability and the kind of the last message; [`render`] turns
//! the chosen variant into the message list sent to the model.

use crate::config::{Language, PromptConfig};
use crate::llm::{ChatMessage, ChatRole};

use super::state::Attachment;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Branch {
    /// Answer the user's message.
    Respond,
    /// Comment on the attachment and propose follow-up questions.
    Suggest,
}

impl Branch {
    pub fn node_name(&self) -> &'static str {
        match self {
            Self::Respond => "respond",
            Self::Suggest => "suggest_questions",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Human,
    ToolResult,
    Other,
}

impl MessageKind {
    pub fn of(message: Option<&ChatMessage>) -> Self {
        match message.map(|m| m.role) {
            Some(ChatRole::User) => Self::Human,
            Some(ChatRole::Tool) => Self::ToolResult,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixedReply {
    RecognizerUnavailable,
    ProcessingError,
}

impl FixedReply {
    pub fn sentence(&self) -> &'static str {
        match self {
            Self::RecognizerUnavailable => {
                "I cannot recognize the attachment. Because I have not been configured the image recognizer yet."
            }
            Self::ProcessingError => "An error occurred while processing the attachment.",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptVariant {
    /// The model is told to repeat one sentence; no tools are offered.
    Fixed(FixedReply),
    /// Identify the attachment type and call the matching recognition tool.
    RecognizeAttachment,
    /// Work from the tool result without restating it.
    SummarizeToolResult,
    /// Configured respond prompt plus history.
    Converse,
}

impl PromptVariant {
    pub fn offers_tools(&self) -> bool {
        !matches!(self, Self::Fixed(_))
    }
}

/// Pick the prompt for a node. Cases are checked in a fixed order; on the
/// respond branch an attachment wins over a trailing tool result, and the
/// recognition result reaches the model through the history.
pub fn select_variant(
    branch: Branch,
    has_attachment: bool,
    recognizer_available: bool,
    last: MessageKind,
) -> PromptVariant {
    match branch {
        Branch::Respond => {
            if has_attachment && !recognizer_available {
                PromptVariant::Fixed(FixedReply::RecognizerUnavailable)
            } else if has_attachment {
                PromptVariant::RecognizeAttachment
            } else if last == MessageKind::ToolResult {
                PromptVariant::SummarizeToolResult
            } else {
                PromptVariant::Converse
            }
        }
        Branch::Suggest => {
            if !has_attachment {
                PromptVariant::Fixed(FixedReply::ProcessingError)
            } else if !recognizer_available {
                PromptVariant::Fixed(FixedReply::RecognizerUnavailable)
            } else if last == MessageKind::ToolResult {
                PromptVariant::SummarizeToolResult
            } else {
                PromptVariant::RecognizeAttachment
            }
        }
    }
}

const NO_REPEAT_INSTRUCTION: &str = "You should not repeat the received tool result, \
     you just need to extract related information to doing your tasks.";

fn attachment_instruction(attachment: &Attachment) -> String {
    let info = serde_json::to_string(attachment).unwrap_or_else(|_| attachment.name.clone());
    format!(
        "You are given an attachment. There is the attachment information {}.\n\
         You must do the following steps:\n\
         Step 1. Specify what attachment type you have by looking at a value of `mime_type` field of the attachment information.\n\
         Step 2. Select the correct recognition tool to use based on the attachment type.\n\
         Step 3. Call the selected recognition tool.",
        info
    )
}

/// Everything a node needs to build its prompt.
pub struct PromptContext<'a> {
    pub language: Language,
    pub prompts: &'a PromptConfig,
    pub attachment: Option<&'a Attachment>,
    pub history: &'a [ChatMessage],
}

/// Messages sent to the model. Every variant starts with the two language directives.
pub fn render(branch: Branch, variant: PromptVariant, ctx: &PromptContext<'_>) -> Vec<ChatMessage> {
    let language = ctx.language.display_name();
    let mut messages = vec![
        ChatMessage::system(format!("You must answer in {}.", language)),
        ChatMessage::system(format!("Queries for using tools purpose must be in {}.", language)),
    ];

    match variant {
        PromptVariant::Fixed(reply) => {
            messages.push(ChatMessage::user(format!(
                "You must only say the following sentence: {}",
                reply.sentence()
            )));
        }
        PromptVariant::RecognizeAttachment => {
            let system_prompt = match branch {
                Branch::Respond => &ctx.prompts.respond_prompt,
                Branch::Suggest => &ctx.prompts.suggest_questions_prompt,
            };
            messages.push(ChatMessage::system(system_prompt.as_str()));
            messages.extend_from_slice(ctx.history);
            if let Some(attachment) = ctx.attachment {
                messages.push(ChatMessage::user(attachment_instruction(attachment)));
            }
        }
        PromptVariant::SummarizeToolResult => {
            messages.extend_from_slice(ctx.history);
            messages.push(ChatMessage::system(NO_REPEAT_INSTRUCTION));
            let ask = match (branch, ctx.attachment.is_some()) {
                (Branch::Suggest, _) => {
                    "Based on the received recognition result, you must do the following things:\n\
                     1. Tell me what you think about the attachment.\n\
                     2. Suggest some questions about the attachment."
                }
                (Branch::Respond, true) => {
                    "Tell me what you think about the attachment based on the received recognition result \
                     and the provided questions."
                }
                (Branch::Respond, false) => "Answer my latest question based on the received tool results.",
            };
            messages.push(ChatMessage::user(ask));
        }
        PromptVariant::Converse => {
            messages.push(ChatMessage::system(ctx.prompts.respond_prompt.as_str()));
            messages.extend_from_slice(ctx.history);
        }
    }
    messages
}

#[cfg(test)]
mod tests {
    use super::*;

    const KINDS: [MessageKind; 3] = [MessageKind::Human, MessageKind::ToolResult, MessageKind::Other];

    fn prompts() -> PromptConfig {
        PromptConfig {
            respond_prompt: "RESPOND".into(),
            suggest_questions_prompt: "SUGGEST".into(),
        }
    }

    fn attachment() -> Attachment {
        Attachment {
            id: "a1".into(),
            name: "pump.png".into(),
            mime_type: "image/png".into(),
            url: "/files/a1".into(),
        }
    }

    #[test]
    fn test_attachment_without_recognizer_is_fixed_refusal() {
        for branch in [Branch::Respond, Branch::Suggest] {
            for kind in KINDS {
                assert_eq!(
                    select_variant(branch, true, false, kind),
                    PromptVariant::Fixed(FixedReply::RecognizerUnavailable)
                );
            }
        }
    }

    #[test]
    fn test_suggest_without_attachment_is_processing_error() {
        for recognizer in [true, false] {
            for kind in KINDS {
                assert_eq!(
                    select_variant(Branch::Suggest, false, recognizer, kind),
                    PromptVariant::Fixed(FixedReply::ProcessingError)
                );
            }
        }
    }

    #[test]
    fn test_respond_cases() {
        assert_eq!(
            select_variant(Branch::Respond, true, true, MessageKind::Human),
            PromptVariant::RecognizeAttachment
        );
        assert_eq!(
            select_variant(Branch::Respond, false, false, MessageKind::Human),
            PromptVariant::Converse
        );
        assert_eq!(
            select_variant(Branch::Respond, false, false, MessageKind::ToolResult),
            PromptVariant::SummarizeToolResult
        );
        assert_eq!(
            select_variant(Branch::Respond, false, true, MessageKind::Human),
            PromptVariant::Converse
        );
        assert_eq!(
            select_variant(Branch::Suggest, true, true, MessageKind::Other),
            PromptVariant::RecognizeAttachment
        );
    }

    #[test]
    fn test_respond_attachment_precedes_tool_result() {
        for kind in KINDS {
            assert_eq!(
                select_variant(Branch::Respond, true, true, kind),
                PromptVariant::RecognizeAttachment
            );
        }
    }

    #[test]
    fn test_render_respond_summary_without_attachment() {
        let prompts = prompts();
        let history = vec![ChatMessage::user("Which pump?"), ChatMessage::tool_result("c1", "lexical_search", "P-100")];
        let ctx = PromptContext {
            language: Language::En,
            prompts: &prompts,
            attachment: None,
            history: &history,
        };
        let variant = select_variant(Branch::Respond, false, true, MessageKind::of(history.last()));
        assert_eq!(variant, PromptVariant::SummarizeToolResult);
        let messages = render(Branch::Respond, variant, &ctx);
        assert_eq!(
            messages.last().unwrap().text(),
            "Answer my latest question based on the received tool results."
        );
    }

    #[test]
    fn test_render_prepends_language_directives() {
        let prompts = prompts();
        let history = vec![ChatMessage::user("What is this?")];
        let a = attachment();
        let ctx = PromptContext {
            language: Language::Vi,
            prompts: &prompts,
            attachment: Some(&a),
            history: &history,
        };

        for variant in [
            PromptVariant::Fixed(FixedReply::ProcessingError),
            PromptVariant::RecognizeAttachment,
            PromptVariant::SummarizeToolResult,
            PromptVariant::Converse,
        ] {
            let messages = render(Branch::Respond, variant, &ctx);
            assert_eq!(messages[0].text(), "You must answer in Vietnamese.");
            assert_eq!(messages[1].text(), "Queries for using tools purpose must be in Vietnamese.");
        }
    }

    #[test]
    fn test_render_recognize_uses_branch_prompt_and_attachment() {
        let prompts = prompts();
        let history = vec![ChatMessage::user("")];
        let a = attachment();
        let ctx = PromptContext {
            language: Language::En,
            prompts: &prompts,
            attachment: Some(&a),
            history: &history,
        };
        let messages = render(Branch::Suggest, PromptVariant::RecognizeAttachment, &ctx);
        assert_eq!(messages[2].text(), "SUGGEST");
        let last = messages.last().unwrap();
        assert!(last.text().contains("\"mime_type\":\"image/png\""));
        assert!(last.text().contains("Step 3."));
    }

    #[test]
    fn test_render_fixed_omits_history() {
        let prompts = prompts();
        let history = vec![ChatMessage::user("secret question")];
        let ctx = PromptContext {
            language: Language::En,
            prompts: &prompts,
            attachment: None,
            history: &history,
        };
        let messages = render(
            Branch::Suggest,
            PromptVariant::Fixed(FixedReply::ProcessingError),
            &ctx,
        );
        assert_eq!(messages.len(), 3);
        assert!(messages[2].text().ends_with("An error occurred while processing the attachment."));
        assert!(!PromptVariant::Fixed(FixedReply::ProcessingError).offers_tools());
    }
}
