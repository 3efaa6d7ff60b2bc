//! Artifact names.
//!
//! `<KIND>__<YYYY-MM-DD>__<HH-MM-SS-mmm>__host-<host>.<ext>`, e.g.
//! `FULL__2026-10-19__14-03-22-481__host-vault01.pack.zst`. The name is the
//! artifact's identity on every destination, so it never changes after the
//! build.

use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

const SEPARATOR: &str = "__";
const HOST_PREFIX: &str = "host-";
const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H-%M-%S-%3f";

/// Extensions an artifact may carry; anything else next to it is a sidecar.
pub const ARTIFACT_EXTENSIONS: [&str; 2] = ["pack", "pack.zst"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactKind {
    Full,
    Incremental,
}

impl ArtifactKind {
    /// Tag used in artifact names.
    pub fn tag(&self) -> &'static str {
        match self {
            ArtifactKind::Full => "FULL",
            ArtifactKind::Incremental => "INCR",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "FULL" => Some(ArtifactKind::Full),
            "INCR" => Some(ArtifactKind::Incremental),
            _ => None,
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactKind::Full => f.write_str("full"),
            ArtifactKind::Incremental => f.write_str("incremental"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactName {
    pub kind: ArtifactKind,
    pub created_at: DateTime<Utc>,
    pub host: String,
    pub extension: String,
}

impl ArtifactName {
    pub fn new(kind: ArtifactKind, created_at: DateTime<Utc>, host: &str, extension: &str) -> Self {
        Self {
            kind,
            created_at,
            host: sanitize_host(host),
            extension: extension.to_string(),
        }
    }

    pub fn parse(name: &str) -> Result<Self> {
        let invalid = || EngineError::Archive(format!("not an artifact name: {name}"));

        let parts: Vec<&str> = name.split(SEPARATOR).collect();
        let [kind, date, time, host_ext] = parts.as_slice() else {
            return Err(invalid());
        };

        let kind = ArtifactKind::from_tag(kind).ok_or_else(invalid)?;
        let host_ext = host_ext.strip_prefix(HOST_PREFIX).ok_or_else(invalid)?;
        let (host, extension) = host_ext.split_once('.').ok_or_else(invalid)?;
        if host.is_empty() || !ARTIFACT_EXTENSIONS.contains(&extension) {
            return Err(invalid());
        }

        let stamp = format!("{date} {time}");
        let naive = NaiveDateTime::parse_from_str(&stamp, &format!("{DATE_FORMAT} {TIME_FORMAT}"))
            .map_err(|_| invalid())?;

        Ok(Self {
            kind,
            created_at: naive.and_utc(),
            host: host.to_string(),
            extension: extension.to_string(),
        })
    }

    pub fn is_artifact_name(name: &str) -> bool {
        Self::parse(name).is_ok()
    }
}

impl fmt::Display for ArtifactName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{kind}{sep}{date}{sep}{time}{sep}{prefix}{host}.{ext}",
            kind = self.kind.tag(),
            sep = SEPARATOR,
            date = self.created_at.format(DATE_FORMAT),
            time = self.created_at.format(TIME_FORMAT),
            prefix = HOST_PREFIX,
            host = self.host,
            ext = self.extension,
        )
    }
}

/// Host ids may only contain ASCII alphanumerics and `-`.
pub fn sanitize_host(host: &str) -> String {
    let cleaned: String = host
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    let cleaned = cleaned.trim_matches('-').to_string();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn stamp() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 14, 3, 22).unwrap() + chrono::Duration::milliseconds(481)
    }

    #[test]
    fn test_format() {
        let name = ArtifactName::new(ArtifactKind::Full, stamp(), "vault01", "pack.zst");
        assert_eq!(
            name.to_string(),
            "FULL__2026-10-19__14-03-22-481__host-vault01.pack.zst"
        );
    }

    #[test]
    fn test_parse() {
        let parsed = ArtifactName::parse("INCR__2026-10-19__14-03-22-481__host-vault01.pack").unwrap();
        assert_eq!(parsed.kind, ArtifactKind::Incremental);
        assert_eq!(parsed.created_at, stamp());
        assert_eq!(parsed.host, "vault01");
        assert_eq!(parsed.extension, "pack");
    }

    #[test]
    fn test_host_is_sanitized() {
        let name = ArtifactName::new(ArtifactKind::Incremental, stamp(), "my_host.lan", "pack");
        assert_eq!(name.host, "my-host-lan");
        assert!(ArtifactName::is_artifact_name(&name.to_string()));
        assert_eq!(sanitize_host("__"), "unknown");
    }

    #[test]
    fn test_rejects_foreign_names() {
        assert!(ArtifactName::is_artifact_name("FULL__2026-10-19__14-03-22-481__host-a.pack.zst"));
        assert!(!ArtifactName::is_artifact_name("FULL__2026-10-19__14-03-22-481__host-a.pack.zst.sha256"));
        assert!(!ArtifactName::is_artifact_name("notes.txt"));
        assert!(!ArtifactName::is_artifact_name("DIFF__2026-10-19__14-03-22-481__host-a.pack"));
        assert!(!ArtifactName::is_artifact_name("FULL__2026-13-19__14-03-22-481__host-a.pack"));
        assert!(!ArtifactName::is_artifact_name("FULL__2026-10-19__14-03-22-481__a.pack"));
    }
}
