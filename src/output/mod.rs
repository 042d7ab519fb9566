use anyhow::Result;
use std::path::Path;

use crate::cli::OutputFormat;
use crate::client::TranscriptionResult;

/// Render the result in the requested format.
pub fn format_result(result: &TranscriptionResult, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Text => Ok(format_as_text(result)),
        OutputFormat::Json => Ok(serde_json::to_string_pretty(result)?),
    }
}

fn format_as_text(result: &TranscriptionResult) -> String {
    let mut lines = Vec::new();
    if let Some(language) = &result.language {
        lines.push(format!("Language: {}", language));
    }
    if let Some(confidence) = result.confidence {
        lines.push(format!("Confidence: {:.1}%", confidence * 100.0));
    }
    if let Some(duration) = result.duration_seconds {
        lines.push(format!("Duration: {:.1}s", duration));
    }
    if !lines.is_empty() {
        lines.push(String::new());
    }
    lines.push(result.transcript.clone());
    lines.join("\n")
}

/// Save transcription result to file
pub fn save_to_file(
    result: &TranscriptionResult,
    path: &Path,
    format: OutputFormat,
) -> Result<()> {
    let content = format_result(result, format)?;
    fs_err::write(path, content)?;
    Ok(())
}

/// Print transcription result to console
pub fn print_to_console(result: &TranscriptionResult, format: OutputFormat) -> Result<()> {
    println!("{}", format_result(result, format)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result() -> TranscriptionResult {
        TranscriptionResult {
            transcript: "Hello world".to_string(),
            confidence: Some(0.97),
            language: Some("en".to_string()),
            duration_seconds: Some(12.5),
        }
    }

    #[test]
    fn text_format_includes_transcript_and_metadata() {
        let text = format_result(&result(), OutputFormat::Text).expect("format");
        assert!(text.contains("Hello world"));
        assert!(text.contains("Confidence: 97.0%"));
        assert!(text.contains("Language: en"));
    }

    #[test]
    fn text_format_is_bare_when_metadata_missing() {
        let bare = TranscriptionResult {
            transcript: "Just text".to_string(),
            confidence: None,
            language: None,
            duration_seconds: None,
        };
        let text = format_result(&bare, OutputFormat::Text).expect("format");
        assert_eq!(text, "Just text");
    }

    #[test]
    fn json_format_round_trips() {
        let json = format_result(&result(), OutputFormat::Json).expect("format");
        let parsed: TranscriptionResult = serde_json::from_str(&json).expect("parse");
        assert_eq!(parsed.transcript, "Hello world");
    }

    #[test]
    fn save_writes_the_rendered_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.txt");
        save_to_file(&result(), &path, OutputFormat::Text).expect("save");
        let content = fs_err::read_to_string(&path).expect("read");
        assert!(content.contains("Hello world"));
    }
}
