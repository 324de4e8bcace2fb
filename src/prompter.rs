//! Builds per-file model requests for metadata generation.

use std::fs;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use thiserror::Error;

use crate::provider::types::{ContentBlock, Message, MessagesRequest};
use crate::store::{BatchFileEntry, BatchKind};

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("could not read media file {path}: {source}")]
    ReadMedia {
        path: String,
        source: std::io::Error,
    },

    #[error("unsupported media type for {0}")]
    UnsupportedMedia(String),
}

/// Builds the provider request for one enrolled file.
///
/// Split out as a trait so orchestrator tests can skip the filesystem and
/// image encoding entirely.
pub trait RequestBuilder {
    fn build_request(&self, entry: &BatchFileEntry) -> Result<MessagesRequest, PromptError>;
}

/// The production builder: attaches the image as base64 and asks for
/// marketplace metadata as strict JSON.
pub struct MetadataPrompter {
    pub model: String,
    pub max_tokens: u32,
    pub marketplaces: Vec<String>,
}

impl MetadataPrompter {
    fn instruction(&self, entry: &BatchFileEntry) -> String {
        let mut prompt = String::from(
            "Generate stock-marketplace metadata for the attached photo.\n\n",
        );

        if let BatchKind::Effect { name } = &entry.kind {
            prompt.push_str(&format!(
                "The photo will be published as an alternative version processed \
                 with the \"{name}\" effect. Describe the processed variant, and \
                 make the title clearly distinct from the original photo's title.\n\n"
            ));
        }

        if let Some(notes) = entry.user_description.as_deref().filter(|s| !s.is_empty()) {
            prompt.push_str(&format!("Photographer notes: {notes}\n\n"));
        }

        if entry.editorial {
            prompt.push_str("This is an editorial photo. ");
            match &entry.editorial_data {
                Some(data) => prompt.push_str(&format!(
                    "Start the description with the editorial dateline \
                     \"{}, {} - {}:\".\n\n",
                    data.city, data.country, data.date
                )),
                None => prompt.push_str(
                    "Write the description in a factual, news-caption style.\n\n",
                ),
            }
        }

        let marketplaces = self.marketplaces.join(", ");
        prompt.push_str(&format!(
            "Respond with ONLY valid JSON, no other text:\n\
             {{\n  \"title\": \"...\",\n  \"description\": \"...\",\n  \
             \"keywords\": [\"...\"],\n  \"categories\": {{\"marketplace\": \"category\"}}\n}}\n\n\
             Rules:\n\
             - title: at most 70 characters, no filename, no quotes\n\
             - description: one or two sentences, at most 200 characters\n\
             - keywords: 25 to 45 entries, most relevant first, lowercase\n\
             - categories: one entry per marketplace from: {marketplaces}\n"
        ));
        prompt
    }
}

impl RequestBuilder for MetadataPrompter {
    fn build_request(&self, entry: &BatchFileEntry) -> Result<MessagesRequest, PromptError> {
        let media_type = mime_guess::from_path(&entry.file_path)
            .first()
            .filter(|mime| mime.type_() == mime_guess::mime::IMAGE)
            .ok_or_else(|| PromptError::UnsupportedMedia(entry.file_path.clone()))?;

        let bytes = fs::read(&entry.file_path).map_err(|source| PromptError::ReadMedia {
            path: entry.file_path.clone(),
            source,
        })?;

        Ok(MessagesRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            messages: vec![Message::user(vec![
                ContentBlock::base64_image(media_type.essence_str(), STANDARD.encode(&bytes)),
                ContentBlock::text(self.instruction(entry)),
            ])],
        })
    }
}
