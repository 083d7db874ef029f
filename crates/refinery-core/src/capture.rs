//! Capture batches submitted by the collection agents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::validate::{require_non_empty, Validate, ValidationError};

/// Upper bound on posts accepted in one capture batch.
pub const MAX_POSTS_PER_CAPTURE: usize = 500;

/// Upper bound on the character length of a single post body.
pub const MAX_POST_CONTENT_CHARS: usize = 10_000;

/// One captured post. Immutable once captured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostRecord {
    pub post_id: String,
    pub author_handle: String,
    pub author_name: String,
    pub author_followers: u64,
    pub author_verified: bool,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub likes: u64,
    pub reposts: u64,
    pub replies: u64,
    pub quotes: u64,
    #[serde(default)]
    pub media_urls: Vec<String>,
    #[serde(default)]
    pub is_thread: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_position: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_post_id: Option<String>,
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub hashtags: Vec<String>,
}

/// Agent-side details about how a batch was collected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureMetadata {
    pub scroll_depth: f64,
    pub capture_duration_ms: f64,
    pub total_extracted: u64,
}

fn default_source_type() -> String {
    "x".to_string()
}

/// The ingest payload: one batch of posts from one source feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCapture {
    pub capture_id: Uuid,
    pub source_feed: String,
    #[serde(default = "default_source_type")]
    pub source_type: String,
    pub captured_at: DateTime<Utc>,
    pub agent_version: String,
    pub posts: Vec<PostRecord>,
    pub metadata: CaptureMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

text_enum!(CaptureStatus {
    Pending => "pending",
    Processing => "processing",
    Processed => "processed",
    Failed => "failed",
});

/// A stored capture together with its processing state.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRecord {
    pub capture: RawCapture,
    pub status: CaptureStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Validate for PostRecord {
    fn validate(&self) -> Result<(), ValidationError> {
        require_non_empty("post_id", &self.post_id)?;
        require_non_empty("author_handle", &self.author_handle)?;

        let chars = self.content.chars().count();
        if chars > MAX_POST_CONTENT_CHARS {
            return Err(ValidationError::new(
                "content",
                format!("post {} has {chars} characters (max {MAX_POST_CONTENT_CHARS})", self.post_id),
            ));
        }

        if let Some(bad) = self
            .media_urls
            .iter()
            .find(|u| !(u.starts_with("https://") || u.starts_with("http://")))
        {
            return Err(ValidationError::new(
                "media_urls",
                format!("post {} has a non-http media url '{bad}'", self.post_id),
            ));
        }

        Ok(())
    }
}

impl Validate for RawCapture {
    fn validate(&self) -> Result<(), ValidationError> {
        require_non_empty("source_feed", &self.source_feed)?;
        require_non_empty("agent_version", &self.agent_version)?;

        if self.posts.len() > MAX_POSTS_PER_CAPTURE {
            return Err(ValidationError::new(
                "posts",
                format!(
                    "{} posts in one capture (max {MAX_POSTS_PER_CAPTURE})",
                    self.posts.len()
                ),
            ));
        }

        for post in &self.posts {
            post.validate()?;
        }

        Ok(())
    }
}
