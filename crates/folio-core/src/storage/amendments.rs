//! Amendment log
//!
//! Append-only audit trail of decisions on prompt amendment proposals.

use rusqlite::{params, Connection, Row};

use crate::models::{AmendmentAction, AmendmentFilter, AmendmentLogEntry, AmendmentStats};
use crate::storage::error::StorageResult;
use crate::storage::{from_millis, json_column, to_millis};

const ENTRY_COLUMNS: &str =
    "id, timestamp, chapter_id, proposal, action, final_prompt_change, notes";

fn map_entry(row: &Row<'_>) -> rusqlite::Result<AmendmentLogEntry> {
    let action: String = row.get(4)?;
    let action = action.parse::<AmendmentAction>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, e.into())
    })?;
    Ok(AmendmentLogEntry {
        id: row.get(0)?,
        timestamp: from_millis(row.get(1)?),
        chapter_id: row.get(2)?,
        proposal: json_column(row, 3)?,
        action,
        final_prompt_change: row.get(5)?,
        notes: row.get(6)?,
    })
}

/// Insert or replace an entry by ID
pub fn upsert(conn: &Connection, entry: &AmendmentLogEntry) -> StorageResult<()> {
    conn.execute(
        r#"
        INSERT INTO amendment_logs (id, timestamp, chapter_id, proposal, action, final_prompt_change, notes)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(id) DO UPDATE SET
            timestamp = excluded.timestamp,
            chapter_id = excluded.chapter_id,
            proposal = excluded.proposal,
            action = excluded.action,
            final_prompt_change = excluded.final_prompt_change,
            notes = excluded.notes
        "#,
        params![
            entry.id,
            to_millis(&entry.timestamp),
            entry.chapter_id,
            serde_json::to_string(&entry.proposal)?,
            entry.action.as_str(),
            entry.final_prompt_change,
            entry.notes,
        ],
    )?;
    Ok(())
}

/// Entries newest first, optionally filtered and limited
pub fn list(
    conn: &Connection,
    filter: Option<&AmendmentFilter>,
    limit: Option<usize>,
) -> StorageResult<Vec<AmendmentLogEntry>> {
    let (clause, value) = match filter {
        Some(AmendmentFilter::Action(action)) => ("WHERE action = ?1", Some(action.as_str().to_string())),
        Some(AmendmentFilter::Chapter(chapter_id)) => ("WHERE chapter_id = ?1", Some(chapter_id.clone())),
        None => ("", None),
    };
    let limit = limit.map(|n| n as i64).unwrap_or(-1);
    let sql = format!(
        "SELECT {} FROM amendment_logs {} ORDER BY timestamp DESC, id LIMIT {}",
        ENTRY_COLUMNS, clause, limit
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows = match value {
        Some(value) => stmt.query_map(params![value], map_entry)?.collect::<Result<Vec<_>, _>>()?,
        None => stmt.query_map([], map_entry)?.collect::<Result<Vec<_>, _>>()?,
    };
    Ok(rows)
}

pub fn stats(conn: &Connection) -> StorageResult<AmendmentStats> {
    let mut stmt = conn.prepare("SELECT action, COUNT(*) FROM amendment_logs GROUP BY action")?;
    let mut stats = AmendmentStats::default();
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
    for row in rows {
        let (action, n) = row?;
        let n = n as u64;
        match action.parse::<AmendmentAction>() {
            Ok(AmendmentAction::Accepted) => stats.accepted += n,
            Ok(AmendmentAction::Rejected) => stats.rejected += n,
            Ok(AmendmentAction::Modified) => stats.modified += n,
            Err(_) => {}
        }
        stats.total += n;
    }
    Ok(stats)
}

pub fn delete(conn: &Connection, id: &str) -> StorageResult<bool> {
    Ok(conn.execute("DELETE FROM amendment_logs WHERE id = ?", params![id])? > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AmendmentProposal;
    use crate::storage::test_support::conn;

    fn entry(id: &str, ts: i64, action: AmendmentAction, chapter: Option<&str>) -> AmendmentLogEntry {
        let mut entry = AmendmentLogEntry::new(
            AmendmentProposal {
                observation: "Honorifics dropped".to_string(),
                proposed_change: "Keep -san".to_string(),
                ..Default::default()
            },
            action,
        );
        entry.id = id.to_string();
        entry.timestamp = from_millis(ts);
        entry.chapter_id = chapter.map(str::to_string);
        entry
    }

    #[test]
    fn test_list_newest_first_with_filters() {
        let conn = conn();
        upsert(&conn, &entry("a", 100, AmendmentAction::Accepted, Some("ch1"))).unwrap();
        upsert(&conn, &entry("b", 300, AmendmentAction::Rejected, Some("ch2"))).unwrap();
        upsert(&conn, &entry("c", 200, AmendmentAction::Accepted, None)).unwrap();

        let ids = |rows: Vec<AmendmentLogEntry>| rows.into_iter().map(|e| e.id).collect::<Vec<_>>();

        assert_eq!(ids(list(&conn, None, None).unwrap()), vec!["b", "c", "a"]);
        assert_eq!(ids(list(&conn, None, Some(2)).unwrap()), vec!["b", "c"]);
        assert_eq!(
            ids(list(&conn, Some(&AmendmentFilter::Action(AmendmentAction::Accepted)), None).unwrap()),
            vec!["c", "a"]
        );
        assert_eq!(
            ids(list(&conn, Some(&AmendmentFilter::Chapter("ch2".to_string())), None).unwrap()),
            vec!["b"]
        );
    }

    #[test]
    fn test_round_trip_preserves_proposal() {
        let conn = conn();
        let original = entry("x", 5, AmendmentAction::Modified, Some("ch9"))
            .with_final_change("Keep honorifics")
            .with_notes("reviewed");
        upsert(&conn, &original).unwrap();

        let loaded = list(&conn, None, None).unwrap();
        assert_eq!(loaded, vec![original]);
    }

    #[test]
    fn test_stats_and_delete() {
        let conn = conn();
        upsert(&conn, &entry("a", 1, AmendmentAction::Accepted, None)).unwrap();
        upsert(&conn, &entry("b", 2, AmendmentAction::Accepted, None)).unwrap();
        upsert(&conn, &entry("c", 3, AmendmentAction::Modified, None)).unwrap();

        assert_eq!(
            stats(&conn).unwrap(),
            AmendmentStats { total: 3, accepted: 2, rejected: 0, modified: 1 }
        );

        assert!(delete(&conn, "a").unwrap());
        assert!(!delete(&conn, "a").unwrap());
        assert_eq!(stats(&conn).unwrap().total, 2);
    }
}
