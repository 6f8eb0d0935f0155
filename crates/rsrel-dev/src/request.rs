//! The sandbox request envelope.

use rsrel_domain::model::Relationship;

use crate::config::LimitSettings;
use crate::error::{DevError, DevResult, DeveloperError, ErrorKind, ErrorSource};

/// Schema text plus the test relationships to load.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DevRequest {
    pub schema: String,
    pub relationships: Vec<Relationship>,
}

impl DevRequest {
    pub fn new(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            relationships: Vec::new(),
        }
    }

    pub fn with_relationships(mut self, relationships: Vec<Relationship>) -> Self {
        self.relationships = relationships;
        self
    }

    /// Builds a request from relationships in text form, one per line.
    ///
    /// Blank lines and `//` comments are skipped. Lines that do not parse are
    /// reported as `PARSE_ERROR`s with their line number.
    pub fn from_text(
        schema: impl Into<String>,
        relationships: &str,
    ) -> Result<Self, Vec<DeveloperError>> {
        let mut parsed = Vec::new();
        let mut errors = Vec::new();

        for (index, line) in relationships.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with("//") {
                continue;
            }
            match Relationship::parse(trimmed) {
                Ok(relationship) => parsed.push(relationship),
                Err(err) => {
                    let column = line.len() - line.trim_start().len() + 1;
                    errors.push(
                        DeveloperError::new(
                            err.to_string(),
                            ErrorSource::Relationship,
                            ErrorKind::ParseError,
                        )
                        .with_location(Some(index as u32 + 1), Some(column as u32))
                        .with_context(trimmed),
                    );
                }
            }
        }

        if errors.is_empty() {
            Ok(Self::new(schema).with_relationships(parsed))
        } else {
            Err(errors)
        }
    }

    /// Checks the request as a whole against `limits`.
    ///
    /// Repeated relationships are allowed; loading touches each one, so the
    /// last occurrence wins.
    pub fn validate(&self, limits: &LimitSettings) -> DevResult<()> {
        if self.schema.len() > limits.max_schema_bytes {
            return Err(DevError::InvalidRequest {
                message: format!(
                    "schema is {} bytes, the limit is {}",
                    self.schema.len(),
                    limits.max_schema_bytes
                ),
            });
        }

        if self.relationships.len() > limits.max_relationships {
            return Err(DevError::InvalidRequest {
                message: format!(
                    "request has {} relationships, the limit is {}",
                    self.relationships.len(),
                    limits.max_relationships
                ),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max_relationships: usize, max_schema_bytes: usize) -> LimitSettings {
        LimitSettings {
            max_relationships,
            max_schema_bytes,
        }
    }

    #[test]
    fn test_from_text_skips_blank_lines_and_comments() {
        let request = DevRequest::from_text(
            "type user",
            "\n// owners\ndocument:readme#owner@user:alice\n\n  document:readme#viewer@user:*\n",
        )
        .unwrap();
        assert_eq!(request.relationships.len(), 2);
        assert_eq!(request.schema, "type user");
    }

    #[test]
    fn test_from_text_reports_every_bad_line() {
        let errors = DevRequest::from_text(
            "type user",
            "document:readme#owner@user:alice\n  document:readme@user:bob\nnonsense\n",
        )
        .unwrap_err();

        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].line, Some(2));
        assert_eq!(errors[0].column, Some(3));
        assert_eq!(errors[0].context.as_deref(), Some("document:readme@user:bob"));
        assert_eq!(errors[1].line, Some(3));
        assert!(errors
            .iter()
            .all(|e| e.kind == ErrorKind::ParseError && e.source == ErrorSource::Relationship));
    }

    #[test]
    fn test_validate_enforces_limits() {
        let request = DevRequest::from_text(
            "type user",
            "document:a#viewer@user:alice\ndocument:b#viewer@user:alice",
        )
        .unwrap();

        assert!(request.validate(&LimitSettings::default()).is_ok());
        assert!(matches!(
            request.validate(&limits(1, 1024)),
            Err(DevError::InvalidRequest { message }) if message.contains("2 relationships")
        ));
        assert!(matches!(
            request.validate(&limits(10, 4)),
            Err(DevError::InvalidRequest { message }) if message.contains("schema")
        ));
    }

    #[test]
    fn test_validate_accepts_repeated_relationships() {
        let request = DevRequest::from_text(
            "type user",
            "document:a#viewer@user:alice\ndocument:a#viewer@user:alice[on_network]",
        )
        .unwrap();
        assert!(request.validate(&LimitSettings::default()).is_ok());
    }
}
