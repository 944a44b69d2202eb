//! Direct Document Processing
//!
//! Certain attachment formats are handled by an external document service
//! instead of registered workers. When a submission carries one, the
//! orchestrator skips classification and node selection entirely: a single
//! synthetic subtask runs against the [`DirectProcessor`] and its chunks
//! flow straight into the task's stream. No reputation events are recorded
//! for registered nodes on this path.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::protocol::FileAttachment;

/// External processor answering prompts over document attachments.
#[async_trait]
pub trait DirectProcessor: Send + Sync {
    /// Human-readable backend name for logs.
    fn name(&self) -> &str;

    /// Produce the final answer for a prompt plus attachments.
    ///
    /// Partial output may be streamed through `chunks` as it is generated;
    /// the returned string is the complete answer.
    async fn process(
        &self,
        prompt: &str,
        files: &[FileAttachment],
        chunks: mpsc::Sender<String>,
    ) -> anyhow::Result<String>;
}

/// First attachment whose format is in the direct-process set, if any.
#[must_use]
pub fn bypass_attachment<'a>(
    files: &'a [FileAttachment],
    formats: &[String],
) -> Option<&'a FileAttachment> {
    files.iter().find(|file| {
        let by_extension = file
            .extension()
            .is_some_and(|ext| formats.iter().any(|f| f == &ext));
        let by_media_type = file
            .media_type
            .rsplit_once('/')
            .is_some_and(|(_, subtype)| formats.iter().any(|f| f.as_str() == subtype));
        by_extension || by_media_type
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attachment(name: &str, media_type: &str) -> FileAttachment {
        FileAttachment {
            name: name.to_string(),
            media_type: media_type.to_string(),
            size_bytes: 1,
            content_base64: String::new(),
        }
    }

    #[test]
    fn test_pdf_matches_by_extension() {
        let files = vec![attachment("report.pdf", "application/octet-stream")];
        let formats = vec!["pdf".to_string()];
        assert!(bypass_attachment(&files, &formats).is_some());
    }

    #[test]
    fn test_pdf_matches_by_media_type() {
        let files = vec![attachment("report", "application/pdf")];
        let formats = vec!["pdf".to_string()];
        assert!(bypass_attachment(&files, &formats).is_some());
    }

    #[test]
    fn test_images_do_not_bypass() {
        let files = vec![attachment("photo.png", "image/png")];
        let formats = vec!["pdf".to_string()];
        assert!(bypass_attachment(&files, &formats).is_none());
    }

    #[test]
    fn test_no_attachments_no_bypass() {
        let formats = vec!["pdf".to_string()];
        assert!(bypass_attachment(&[], &formats).is_none());
    }
}
