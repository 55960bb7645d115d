use rusqlite::Connection;
use serde_json::json;

use crate::calendar::month_bounds;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::stats::percent_rounded;

use super::attendance::group_summary_payload;
use super::scores::group_ranking;
use super::shared::{caller, group_exists, required_month, required_str, HandlerErr, DATE_FMT};

const DASHBOARD_TOP_RANKS: usize = 3;

/// Read-only composition over the session, attendance, and score stores.
fn stats_group_dashboard(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let group_id = required_str(params, "groupId")?;
    if !group_exists(conn, &group_id)? {
        return Err(HandlerErr::not_found("group not found"));
    }

    let (total, completed): (i64, i64) = conn
        .query_row(
            "SELECT COUNT(*), COALESCE(SUM(completed), 0)
             FROM sessions WHERE group_id = ?",
            [&group_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .map_err(HandlerErr::db_query)?;

    let attendance = group_summary_payload(conn, &group_id)?;
    let ranking = group_ranking(conn, &group_id)?;
    let top: Vec<serde_json::Value> = ranking
        .iter()
        .take(DASHBOARD_TOP_RANKS)
        .map(|e| {
            json!({
                "position": e.position,
                "memberId": e.member_id,
                "totalScore": e.total_score
            })
        })
        .collect();

    Ok(json!({
        "groupId": group_id,
        "sessions": {
            "total": total,
            "completed": completed,
            "completionRate": percent_rounded(completed, total)
        },
        "attendance": attendance,
        "topRanking": top
    }))
}

fn stats_owner_overview(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let who = caller(params)?;
    let (year, month) = required_month(params)?;
    let (first, next) = month_bounds(year, month)
        .ok_or_else(|| HandlerErr::invalid_input("year out of range"))?;

    let mut stmt = conn
        .prepare(
            "SELECT group_id, COUNT(*), COALESCE(SUM(completed), 0)
             FROM sessions
             WHERE owner_id = ? AND date >= ? AND date < ?
             GROUP BY group_id
             ORDER BY group_id",
        )
        .map_err(HandlerErr::db_query)?;
    let rows = stmt
        .query_map(
            (
                &who.id,
                first.format(DATE_FMT).to_string(),
                next.format(DATE_FMT).to_string(),
            ),
            |r| {
                Ok((
                    r.get::<_, Option<String>>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, i64>(2)?,
                ))
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    let mut total: i64 = 0;
    let mut completed: i64 = 0;
    let groups: Vec<serde_json::Value> = rows
        .into_iter()
        .map(|(group_id, t, c)| {
            total += t;
            completed += c;
            json!({
                "groupId": group_id,
                "total": t,
                "completed": c,
                "completionRate": percent_rounded(c, t)
            })
        })
        .collect();

    Ok(json!({
        "ownerId": who.id,
        "year": year,
        "month": month,
        "groups": groups,
        "totalSessions": total,
        "completedSessions": completed,
        "completionRate": percent_rounded(completed, total)
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
        "stats.groupDashboard" => Some(with_conn(state, req, stats_group_dashboard)),
        "stats.ownerOverview" => Some(with_conn(state, req, stats_owner_overview)),
        _ => None,
    }
}
