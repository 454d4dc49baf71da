//! Progress projection.
//!
//! Pure transformation from the latest status snapshot into a renderable
//! model shared by the TUI and text mode. Content is preserved verbatim; only
//! timestamps are reformatted for display.

use crate::model::SessionSnapshot;
use time::format_description::BorrowedFormatItem;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

// The server emits naive ISO-8601 timestamps, with or without fractional
// seconds depending on the code path.
const TS_IN_FRAC: &[BorrowedFormatItem<'_>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]");
const TS_IN: &[BorrowedFormatItem<'_>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
const TS_OUT: &[BorrowedFormatItem<'_>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderModel {
    pub session_id: Option<String>,
    pub status: Option<String>,
    pub entries: Vec<RenderEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderEntry {
    pub timestamp: String,
    pub kind: String,
    pub content: String,
}

/// Project a snapshot into its display model.
///
/// An absent snapshot yields the empty placeholder model. Entries keep the
/// server's order and their content byte-for-byte.
pub fn project(snapshot: Option<&SessionSnapshot>) -> RenderModel {
    let Some(snap) = snapshot else {
        return RenderModel::default();
    };
    RenderModel {
        session_id: Some(snap.session_id.clone()),
        status: Some(snap.status.clone()),
        entries: snap
            .iterations
            .iter()
            .map(|r| RenderEntry {
                timestamp: format_timestamp(&r.timestamp),
                kind: r.kind.clone(),
                content: r.content.clone(),
            })
            .collect(),
    }
}

/// Reformat a server timestamp for display, passing it through untouched when
/// it does not parse.
fn format_timestamp(raw: &str) -> String {
    let parsed = PrimitiveDateTime::parse(raw, TS_IN_FRAC)
        .or_else(|_| PrimitiveDateTime::parse(raw, TS_IN))
        .or_else(|_| {
            OffsetDateTime::parse(raw, &Rfc3339)
                .map(|odt| PrimitiveDateTime::new(odt.date(), odt.time()))
        });
    match parsed {
        Ok(dt) => dt.format(TS_OUT).unwrap_or_else(|_| raw.to_string()),
        Err(_) => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::IterationRecord;

    fn snapshot_with(records: Vec<IterationRecord>) -> SessionSnapshot {
        SessionSnapshot {
            session_id: "abc123".into(),
            status: "in_progress".into(),
            iterations: records,
        }
    }

    #[test]
    fn project_none_is_placeholder() {
        let model = project(None);
        assert_eq!(model, RenderModel::default());
        assert!(model.session_id.is_none());
        assert!(model.status.is_none());
        assert!(model.entries.is_empty());
    }

    #[test]
    fn project_preserves_order_and_content() {
        let contents = ["first\nline two", "  leading spaces ", "третий — unicode ✓"];
        let records: Vec<IterationRecord> = contents
            .iter()
            .enumerate()
            .map(|(i, c)| IterationRecord {
                timestamp: format!("2024-05-01T10:00:0{i}"),
                kind: "analysis".into(),
                content: c.to_string(),
            })
            .collect();
        let model = project(Some(&snapshot_with(records)));

        assert_eq!(model.session_id.as_deref(), Some("abc123"));
        assert_eq!(model.status.as_deref(), Some("in_progress"));
        assert_eq!(model.entries.len(), 3);
        for (entry, content) in model.entries.iter().zip(contents) {
            assert_eq!(entry.content, content);
            assert_eq!(entry.kind, "analysis");
        }
        assert_eq!(model.entries[0].timestamp, "2024-05-01 10:00:00");
        assert_eq!(model.entries[2].timestamp, "2024-05-01 10:00:02");
    }

    #[test]
    fn timestamp_with_fractional_seconds() {
        assert_eq!(
            format_timestamp("2024-05-01T10:15:12.345678"),
            "2024-05-01 10:15:12"
        );
    }

    #[test]
    fn timestamp_rfc3339() {
        assert_eq!(
            format_timestamp("2024-05-01T10:15:12Z"),
            "2024-05-01 10:15:12"
        );
    }

    #[test]
    fn unparseable_timestamp_passes_through() {
        assert_eq!(format_timestamp("not-a-date"), "not-a-date");
        assert_eq!(format_timestamp(""), "");
    }
}
