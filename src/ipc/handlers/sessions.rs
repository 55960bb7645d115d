use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::calendar::month_bounds;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};

use super::shared::{
    caller, group_exists, now_ts, opt_str, required_bool, required_date, required_month,
    required_str, unique_violation, Caller, HandlerErr, DATE_FMT,
};

#[derive(Debug, Clone)]
struct SessionRow {
    id: String,
    owner_id: String,
    group_id: Option<String>,
    date: String,
    time_label: Option<String>,
    subject: String,
    completed: bool,
    notes: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl SessionRow {
    fn to_json(&self) -> serde_json::Value {
        json!({
            "sessionId": self.id,
            "ownerId": self.owner_id,
            "groupId": self.group_id,
            "date": self.date,
            "timeLabel": self.time_label,
            "subject": self.subject,
            "completed": self.completed,
            "notes": self.notes,
            "createdAt": self.created_at,
            "updatedAt": self.updated_at
        })
    }
}

const SESSION_COLS: &str =
    "id, owner_id, group_id, date, time_label, subject, completed, notes, created_at, updated_at";

fn row_to_session(r: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        id: r.get(0)?,
        owner_id: r.get(1)?,
        group_id: r.get(2)?,
        date: r.get(3)?,
        time_label: r.get(4)?,
        subject: r.get(5)?,
        completed: r.get::<_, i64>(6)? != 0,
        notes: r.get(7)?,
        created_at: r.get(8)?,
        updated_at: r.get(9)?,
    })
}

/// Ownership is folded into existence: callers learn nothing about sessions
/// they do not own. Admin callers see everything.
fn load_owned_session(
    conn: &Connection,
    session_id: &str,
    who: &Caller,
) -> Result<SessionRow, HandlerErr> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM sessions WHERE id = ?", SESSION_COLS),
            [session_id],
            |r| row_to_session(r),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    match row {
        Some(s) if s.owner_id == who.id || who.admin => Ok(s),
        _ => Err(HandlerErr::not_found("session not found")),
    }
}

fn conflict_for(conn: &Connection, group_id: &str, date: &str) -> HandlerErr {
    // The failed insert is the source of truth; this lookup only enriches the
    // message and may miss if the winner was deleted in between.
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM sessions WHERE group_id = ? AND date = ?",
            (group_id, date),
            |r| r.get(0),
        )
        .optional()
        .unwrap_or(None);
    HandlerErr::conflict(
        format!("this group already has a session on {}", date),
        json!({ "existingSessionId": existing, "date": date }),
    )
}

fn sessions_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let who = caller(params)?;
    let date = required_date(params, "date")?;
    let subject = required_str(params, "subject")?;
    let group_id = opt_str(params, "groupId")?;
    let time_label = opt_str(params, "timeLabel")?;
    let notes = opt_str(params, "notes")?;

    if let Some(gid) = group_id.as_deref() {
        if !group_exists(conn, gid)? {
            return Err(HandlerErr::not_found("group not found"));
        }
    }

    let session_id = Uuid::new_v4().to_string();
    let date_str = date.format(DATE_FMT).to_string();
    let ts = now_ts();
    // No existence pre-check: the partial unique index on (group_id, date)
    // decides, so concurrent creates cannot both win.
    let inserted = conn.execute(
        "INSERT INTO sessions(id, owner_id, group_id, date, time_label, subject, completed, notes, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, 0, ?, ?, ?)",
        (
            &session_id,
            &who.id,
            &group_id,
            &date_str,
            &time_label,
            &subject,
            &notes,
            ts,
            ts,
        ),
    );
    if let Err(e) = inserted {
        if unique_violation(&e) {
            // group_id must be present here; sessions without one are exempt
            // from the index.
            let gid = group_id.as_deref().unwrap_or_default();
            return Err(conflict_for(conn, gid, &date_str));
        }
        return Err(HandlerErr::db_write(e, "sessions"));
    }

    let row = load_owned_session(conn, &session_id, &who)?;
    Ok(json!({ "session": row.to_json() }))
}

fn sessions_list_month(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let who = caller(params)?;
    let (year, month) = required_month(params)?;
    let (first, next) = month_bounds(year, month)
        .ok_or_else(|| HandlerErr::invalid_input("year out of range"))?;

    // Dates are stored as YYYY-MM-DD text, so the range scan is lexicographic.
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM sessions
             WHERE owner_id = ? AND date >= ? AND date < ?
             ORDER BY date, created_at, rowid",
            SESSION_COLS
        ))
        .map_err(HandlerErr::db_query)?;
    let rows = stmt
        .query_map(
            (
                &who.id,
                first.format(DATE_FMT).to_string(),
                next.format(DATE_FMT).to_string(),
            ),
            |r| row_to_session(r),
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    let sessions: Vec<serde_json::Value> = rows.iter().map(|s| s.to_json()).collect();
    Ok(json!({ "sessions": sessions }))
}

fn sessions_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let who = caller(params)?;
    let session_id = required_str(params, "sessionId")?;
    let current = load_owned_session(conn, &session_id, &who)?;

    let subject = match params.get("subject") {
        Some(_) => required_str(params, "subject")?,
        None => current.subject.clone(),
    };
    let date_str = match params.get("date") {
        Some(_) => required_date(params, "date")?.format(DATE_FMT).to_string(),
        None => current.date.clone(),
    };
    let group_id = match params.get("groupId") {
        Some(v) if v.is_null() => None,
        Some(_) => {
            let gid = required_str(params, "groupId")?;
            if !group_exists(conn, &gid)? {
                return Err(HandlerErr::not_found("group not found"));
            }
            Some(gid)
        }
        None => current.group_id.clone(),
    };
    let time_label = match params.get("timeLabel") {
        Some(_) => opt_str(params, "timeLabel")?,
        None => current.time_label.clone(),
    };
    let notes = match params.get("notes") {
        Some(_) => opt_str(params, "notes")?,
        None => current.notes.clone(),
    };

    let updated = conn.execute(
        "UPDATE sessions
         SET subject = ?, date = ?, group_id = ?, time_label = ?, notes = ?, updated_at = ?
         WHERE id = ?",
        (
            &subject,
            &date_str,
            &group_id,
            &time_label,
            &notes,
            now_ts(),
            &session_id,
        ),
    );
    if let Err(e) = updated {
        if unique_violation(&e) {
            let gid = group_id.as_deref().unwrap_or_default();
            return Err(conflict_for(conn, gid, &date_str));
        }
        return Err(HandlerErr::db_write(e, "sessions"));
    }

    let row = load_owned_session(conn, &session_id, &who)?;
    Ok(json!({ "session": row.to_json() }))
}

fn sessions_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let who = caller(params)?;
    let session_id = required_str(params, "sessionId")?;
    let _ = load_owned_session(conn, &session_id, &who)?;

    let tx = conn.unchecked_transaction().map_err(HandlerErr::db_tx)?;
    // Attendance goes with the session; score history stays for rankings,
    // detached from the deleted session (see DESIGN.md).
    tx.execute(
        "DELETE FROM attendance_records WHERE session_id = ?",
        [&session_id],
    )
    .map_err(|e| HandlerErr::db_write(e, "attendance_records"))?;
    tx.execute(
        "UPDATE score_records SET session_id = NULL WHERE session_id = ?",
        [&session_id],
    )
    .map_err(|e| HandlerErr::db_write(e, "score_records"))?;
    tx.execute("DELETE FROM sessions WHERE id = ?", [&session_id])
        .map_err(|e| HandlerErr::db_write(e, "sessions"))?;
    tx.commit().map_err(HandlerErr::db_commit)?;

    Ok(json!({ "ok": true }))
}

fn sessions_set_completed(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let who = caller(params)?;
    let session_id = required_str(params, "sessionId")?;
    let completed = required_bool(params, "completed")?;
    let _ = load_owned_session(conn, &session_id, &who)?;

    conn.execute(
        "UPDATE sessions SET completed = ?, updated_at = ? WHERE id = ?",
        (completed as i64, now_ts(), &session_id),
    )
    .map_err(|e| HandlerErr::db_write(e, "sessions"))?;

    let row = load_owned_session(conn, &session_id, &who)?;
    Ok(json!({ "session": row.to_json() }))
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
        "sessions.create" => Some(with_conn(state, req, sessions_create)),
        "sessions.listMonth" => Some(with_conn(state, req, sessions_list_month)),
        "sessions.update" => Some(with_conn(state, req, sessions_update)),
        "sessions.delete" => Some(with_conn(state, req, sessions_delete)),
        "sessions.setCompleted" => Some(with_conn(state, req, sessions_set_completed)),
        _ => None,
    }
}
