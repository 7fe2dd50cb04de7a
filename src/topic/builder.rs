use thiserror::Error;

/// Namespace root used when a deployment does not configure its own.
pub const DEFAULT_NAMESPACE_ROOT: &str = "uns-infra";

const BASE_SEGMENT_COUNT: usize = 4;

/// Error raised when a topic cannot be composed or decomposed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopicError {
    /// A base-topic segment was empty after sanitization.
    #[error("topic segment '{segment}' must not be empty")]
    EmptySegment { segment: &'static str },
    /// A base-topic segment contained a path separator.
    #[error("topic segment '{segment}' must not contain '/'")]
    SegmentContainsSeparator { segment: &'static str },
    /// A derived topic had fewer than the four base segments.
    #[error("expected at least four segments in topic '{topic}'")]
    MalformedTopic { topic: String },
}

/// Derives the canonical topic family for one process instance.
///
/// The base takes the shape `<root>/<package>/<version>/<process>/`; the
/// status, liveness, and handover topics all hang off that base so the
/// layout only has to change in one place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicBuilder {
    base: String,
    root: String,
    package_name: String,
}

impl TopicBuilder {
    /// Composes and validates the base topic from its four segments.
    pub fn new(
        root: &str,
        package_name: &str,
        version: &str,
        process_name: &str,
    ) -> Result<Self, TopicError> {
        let root = checked_segment(root, "root")?;
        let package_name = checked_segment(package_name, "package_name")?;
        let version = checked_segment(version, "version")?;
        let process_name = checked_segment(process_name, "process_name")?;
        let base = format!("{root}/{package_name}/{version}/{process_name}/");
        Ok(Self {
            base,
            root,
            package_name,
        })
    }

    /// Rebuilds a builder from an existing base topic, e.g. one recovered
    /// via [`TopicBuilder::extract_base_topic`].
    pub fn from_base(base: &str) -> Result<Self, TopicError> {
        let segments: Vec<&str> = base.split('/').collect();
        if segments.len() < BASE_SEGMENT_COUNT
            || segments[..BASE_SEGMENT_COUNT].iter().any(|s| s.is_empty())
        {
            return Err(TopicError::MalformedTopic {
                topic: base.to_string(),
            });
        }
        Self::new(segments[0], segments[1], segments[2], segments[3])
    }

    /// The process status topic, which is the base topic itself.
    pub fn status_topic(&self) -> &str {
        &self.base
    }

    /// Topic carrying the retained active-liveness heartbeat.
    pub fn active_topic(&self) -> String {
        format!("{}active", self.base)
    }

    /// Topic carrying takeover requests for this process.
    pub fn handover_topic(&self) -> String {
        format!("{}handover", self.base)
    }

    /// Filter matching the active topic of every version and process name
    /// under the same package, used for fleet-wide discovery.
    pub fn wildcard_active_topic(&self) -> String {
        format!("{}/{}/+/+/active", self.root, self.package_name)
    }

    /// Status sub-tree owned by one proxy instance of this process.
    pub fn instance_status_topic(&self, instance_name: &str) -> String {
        format!("{}{}/", self.base, sanitize_segment(instance_name))
    }

    /// Recovers the base topic from any topic derived from it.
    ///
    /// Takes the first four segments and re-appends the trailing separator,
    /// so `extract_base_topic(b.active_topic())` equals `b.status_topic()`.
    pub fn extract_base_topic(full_topic: &str) -> Result<String, TopicError> {
        let segments: Vec<&str> = full_topic.split('/').collect();
        if segments.len() < BASE_SEGMENT_COUNT
            || segments[..BASE_SEGMENT_COUNT].iter().any(|s| s.is_empty())
        {
            return Err(TopicError::MalformedTopic {
                topic: full_topic.to_string(),
            });
        }
        Ok(format!("{}/", segments[..BASE_SEGMENT_COUNT].join("/")))
    }
}

/// Replaces characters that are not safe inside a topic segment with `-`.
///
/// Wildcards, separators, and whitespace in process or package names would
/// otherwise leak into the composed topic.
pub fn sanitize_segment(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

fn checked_segment(raw: &str, segment: &'static str) -> Result<String, TopicError> {
    if raw.contains('/') {
        return Err(TopicError::SegmentContainsSeparator { segment });
    }
    let sanitized = sanitize_segment(raw);
    if sanitized.is_empty() {
        return Err(TopicError::EmptySegment { segment });
    }
    Ok(sanitized)
}
