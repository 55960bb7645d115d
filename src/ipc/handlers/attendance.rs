use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::stats::{attendance_stats, AttendanceStats};

use super::shared::{
    group_exists, is_active_member, now_ts, opt_str, opt_u64, required_bool, required_str,
    HandlerErr,
};

const DEFAULT_LOOKBACK: u64 = 30;

fn attendance_record(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let session_id = required_str(params, "sessionId")?;
    let member_id = required_str(params, "memberId")?;
    let present = required_bool(params, "present")?;
    let notes = opt_str(params, "notes")?;

    let session: Option<(Option<String>, String)> = conn
        .query_row(
            "SELECT group_id, date FROM sessions WHERE id = ?",
            [&session_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    let Some((group_id, date)) = session else {
        return Err(HandlerErr::not_found("session not found"));
    };
    let Some(group_id) = group_id else {
        return Err(HandlerErr::invalid_input(
            "session has no group; attendance is tracked per group",
        ));
    };
    if !is_active_member(conn, &group_id, &member_id)? {
        return Err(HandlerErr::invalid_input(
            "member is not an active member of the session's group",
        ));
    }

    conn.execute(
        "INSERT INTO attendance_records(session_id, member_id, present, notes, date, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(session_id, member_id) DO UPDATE SET
           present = excluded.present,
           notes = excluded.notes,
           updated_at = excluded.updated_at",
        (
            &session_id,
            &member_id,
            present as i64,
            &notes,
            &date,
            now_ts(),
        ),
    )
    .map_err(|e| HandlerErr::db_write(e, "attendance_records"))?;

    Ok(json!({ "ok": true }))
}

/// Presence flags for a member's recorded group sessions, most recent first.
/// `limit` of `None` means the full history.
fn presence_newest_first(
    conn: &Connection,
    group_id: &str,
    member_id: &str,
    limit: Option<u64>,
) -> Result<Vec<bool>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT a.present
             FROM attendance_records a
             JOIN sessions s ON s.id = a.session_id
             WHERE s.group_id = ?1 AND a.member_id = ?2
             ORDER BY s.date DESC, s.rowid DESC
             LIMIT ?3",
        )
        .map_err(HandlerErr::db_query)?;
    let cap = limit.map(|v| v as i64).unwrap_or(-1);
    stmt.query_map((group_id, member_id, cap), |r| {
        Ok(r.get::<_, i64>(0)? != 0)
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerErr::db_query)
}

fn stats_json(member_id: &str, s: &AttendanceStats) -> serde_json::Value {
    json!({
        "memberId": member_id,
        "considered": s.considered,
        "presentCount": s.present_count,
        "absentCount": s.absent_count,
        "attendanceRate": s.attendance_rate,
        "streak": s.streak
    })
}

fn attendance_member_stats(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let group_id = required_str(params, "groupId")?;
    let member_id = required_str(params, "memberId")?;
    let lookback = opt_u64(params, "lookbackLimit")?.unwrap_or(DEFAULT_LOOKBACK);
    if !group_exists(conn, &group_id)? {
        return Err(HandlerErr::not_found("group not found"));
    }

    let presence = presence_newest_first(conn, &group_id, &member_id, Some(lookback))?;
    let s = attendance_stats(&presence);
    Ok(stats_json(&member_id, &s))
}

fn attendance_group_summary(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let group_id = required_str(params, "groupId")?;
    let lookback = opt_u64(params, "lookbackLimit")?;
    if !group_exists(conn, &group_id)? {
        return Err(HandlerErr::not_found("group not found"));
    }

    // Roster order (membership creation, then rowid) doubles as the
    // most-absences tie-break.
    let mut stmt = conn
        .prepare(
            "SELECT member_id FROM memberships
             WHERE group_id = ? AND active = 1
             ORDER BY created_at, rowid",
        )
        .map_err(HandlerErr::db_query)?;
    let members: Vec<String> = stmt
        .query_map([&group_id], |r| r.get(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    let mut rows = Vec::with_capacity(members.len());
    let mut rate_sum: i64 = 0;
    let mut most_absent: Option<(String, i64)> = None;
    for member_id in &members {
        let presence = presence_newest_first(conn, &group_id, member_id, lookback)?;
        let s = attendance_stats(&presence);
        rate_sum += s.attendance_rate;
        // Strict comparison keeps the earliest member on ties.
        if most_absent
            .as_ref()
            .map(|(_, count)| s.absent_count > *count)
            .unwrap_or(true)
        {
            most_absent = Some((member_id.clone(), s.absent_count));
        }
        rows.push(stats_json(member_id, &s));
    }

    let mean_rate = if members.is_empty() {
        0
    } else {
        ((rate_sum as f64) / (members.len() as f64)).round() as i64
    };

    Ok(json!({
        "groupId": group_id,
        "members": rows,
        "meanAttendanceRate": mean_rate,
        "mostAbsent": most_absent
            .map(|(member_id, absences)| json!({ "memberId": member_id, "absences": absences }))
    }))
}

fn with_conn(
    state: &AppState,
    req: &Request,
    f: impl FnOnce(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.record" => Some(with_conn(state, req, attendance_record)),
        "attendance.memberStats" => Some(with_conn(state, req, attendance_member_stats)),
        "attendance.groupSummary" => Some(with_conn(state, req, attendance_group_summary)),
        _ => None,
    }
}

// Shared with the stats facade, which reuses the summary payload wholesale.
pub(super) fn group_summary_payload(
    conn: &Connection,
    group_id: &str,
) -> Result<serde_json::Value, HandlerErr> {
    attendance_group_summary(conn, &json!({ "groupId": group_id }))
}
