//! Chat templates as a closed set of tagged variants.
//!
//! Each backend model expects its own instruction wrapper. Rather than
//! free-form format strings, the known formats are enum variants with a
//! render function — exactly one insertion point each, so a malformed
//! template cannot be constructed at runtime. Unknown models fall back to
//! [`ChatTemplate::ChatMl`].

/// Substring-keyed routing table from model names to templates.
///
/// Matched in order against the lowercased model name reported by the
/// backend; the first hit wins.
const MODEL_ROUTES: [(&str, ChatTemplate); 4] = [
    ("mistral", ChatTemplate::Mistral),
    ("mixtral", ChatTemplate::Mistral),
    ("qwen", ChatTemplate::Qwen3Instruct),
    ("gemma", ChatTemplate::Gemma),
];

/// A chat prompt format with exactly one insertion point.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChatTemplate {
    /// No wrapper at all — the prompt is submitted verbatim. For raw
    /// completion models.
    Plain,
    /// ChatML with a generic system line. The default.
    ChatMl,
    /// Instruction tags used by Mistral and Mixtral instruct models.
    Mistral,
    /// ChatML without a system turn, as Qwen3 instruct models prefer.
    Qwen3Instruct,
    /// Gemma turn markers.
    Gemma,
}

impl ChatTemplate {
    /// Wrap `prompt` in this template's chat format.
    pub fn render(&self, prompt: &str) -> String {
        match self {
            ChatTemplate::Plain => prompt.to_string(),
            ChatTemplate::ChatMl => format!(
                "<|im_start|>system\nYou are a helpful assistant.<|im_end|>\n\
                 <|im_start|>user\n{prompt}<|im_end|>\n<|im_start|>assistant\n"
            ),
            ChatTemplate::Mistral => format!("[INST] {prompt}[/INST]"),
            ChatTemplate::Qwen3Instruct => {
                format!("<|im_start|>user\n{prompt}<|im_end|>\n<|im_start|>assistant\n")
            }
            ChatTemplate::Gemma => format!(
                "<start_of_turn>user\n{prompt}<end_of_turn>\n<start_of_turn>model\n"
            ),
        }
    }

    /// Resolve the template for a backend-reported model name.
    ///
    /// Case-insensitive substring match against [`MODEL_ROUTES`]; no match
    /// falls back to [`ChatTemplate::ChatMl`].
    pub fn for_model_name(model_name: &str) -> ChatTemplate {
        let lowered = model_name.to_lowercase();
        MODEL_ROUTES
            .iter()
            .find(|(needle, _)| lowered.contains(needle))
            .map(|(_, template)| *template)
            .unwrap_or(ChatTemplate::ChatMl)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ChatTemplate::Plain => "plain",
            ChatTemplate::ChatMl => "chatml",
            ChatTemplate::Mistral => "mistral",
            ChatTemplate::Qwen3Instruct => "qwen3-instruct",
            ChatTemplate::Gemma => "gemma",
        }
    }
}
