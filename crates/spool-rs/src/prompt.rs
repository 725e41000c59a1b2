//! Instruction-header composition from titled sections.
//!
//! The document body is co-written with the model; everything ahead of it —
//! free instructions, title, genre, cast, setting — is assembled here into
//! the header that [`GenerationRequest`](crate::GenerationRequest) carries.
//! Empty sections are skipped; the story heading is always present so the
//! body lands under it even when the document is still blank.

/// Optional labeled sections rendered ahead of the story body.
///
/// # Example
///
/// ```
/// use spool_rs::prompt::PromptSections;
///
/// let header = PromptSections::default()
///     .with_instructions("Continue the story in the same voice.")
///     .with_title("The Lighthouse")
///     .header();
/// assert!(header.starts_with("[Instructions]"));
/// assert!(header.ends_with("[Story]\n"));
/// ```
#[derive(Clone, Debug, Default)]
pub struct PromptSections {
    pub instructions: String,
    pub title: String,
    pub genre: String,
    pub characters: String,
    pub setting: String,
    pub addendum: String,
}

impl PromptSections {
    pub fn with_instructions(mut self, text: impl Into<String>) -> Self {
        self.instructions = text.into();
        self
    }

    pub fn with_title(mut self, text: impl Into<String>) -> Self {
        self.title = text.into();
        self
    }

    pub fn with_genre(mut self, text: impl Into<String>) -> Self {
        self.genre = text.into();
        self
    }

    pub fn with_characters(mut self, text: impl Into<String>) -> Self {
        self.characters = text.into();
        self
    }

    pub fn with_setting(mut self, text: impl Into<String>) -> Self {
        self.setting = text.into();
        self
    }

    pub fn with_addendum(mut self, text: impl Into<String>) -> Self {
        self.addendum = text.into();
        self
    }

    /// Render the header: every non-empty section in fixed order, each under
    /// its bracketed label, blank-line separated, ending with the story
    /// heading the body is appended to.
    pub fn header(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        for (label, text) in [
            ("Instructions", &self.instructions),
            ("Title", &self.title),
            ("Genre", &self.genre),
            ("Characters", &self.characters),
            ("Setting", &self.setting),
            ("Notes", &self.addendum),
        ] {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                parts.push(format!("[{label}]\n{trimmed}"));
            }
        }
        parts.push("[Story]\n".to_string());
        parts.join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_sections_are_skipped() {
        let header = PromptSections::default().with_title("A Title").header();
        assert!(header.contains("[Title]\nA Title"));
        assert!(!header.contains("[Genre]"));
        assert!(!header.contains("[Characters]"));
    }

    #[test]
    fn story_heading_always_present() {
        let header = PromptSections::default().header();
        assert_eq!(header, "[Story]\n");
    }

    #[test]
    fn sections_keep_fixed_order() {
        let header = PromptSections::default()
            .with_genre("mystery")
            .with_instructions("keep it terse")
            .header();
        let instructions_at = header.find("[Instructions]").unwrap();
        let genre_at = header.find("[Genre]").unwrap();
        assert!(instructions_at < genre_at);
    }

    #[test]
    fn whitespace_only_sections_are_skipped() {
        let header = PromptSections::default().with_characters("   \n  ").header();
        assert!(!header.contains("[Characters]"));
    }
}
