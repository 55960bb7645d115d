use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::stats::{average_rounded, rank_members, MemberTotals, RankedMember};

use super::shared::{
    group_exists, is_active_member, now_ts, opt_str, opt_u64, required_str, HandlerErr,
};

const DEFAULT_LEADERBOARD_LIMIT: u64 = 50;

fn required_score(params: &serde_json::Value) -> Result<f64, HandlerErr> {
    let score = params
        .get("score")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| HandlerErr::invalid_input("missing score"))?;
    if !score.is_finite() || score < 0.0 {
        return Err(HandlerErr::invalid_input("score must be >= 0"));
    }
    Ok(score)
}

fn scores_record(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let session_id = required_str(params, "sessionId")?;
    let member_id = required_str(params, "memberId")?;
    let category_id = required_str(params, "categoryId")?;
    let score = required_score(params)?;
    let notes = opt_str(params, "notes")?;

    let group_id: Option<Option<String>> = conn
        .query_row(
            "SELECT group_id FROM sessions WHERE id = ?",
            [&session_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    let Some(group_id) = group_id else {
        return Err(HandlerErr::not_found("session not found"));
    };
    let Some(group_id) = group_id else {
        return Err(HandlerErr::invalid_input(
            "session has no group; scores are ranked per group",
        ));
    };
    if !is_active_member(conn, &group_id, &member_id)? {
        return Err(HandlerErr::invalid_input(
            "member is not an active member of the session's group",
        ));
    }

    // Append-only: history is the aggregate's input, never overwritten.
    let record_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO score_records(id, session_id, group_id, member_id, category_id, score, notes, recorded_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &record_id,
            &session_id,
            &group_id,
            &member_id,
            &category_id,
            score,
            &notes,
            now_ts(),
        ),
    )
    .map_err(|e| HandlerErr::db_write(e, "score_records"))?;

    Ok(json!({ "recordId": record_id }))
}

fn scores_member_category_aggregate(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let member_id = required_str(params, "memberId")?;
    let category_id = required_str(params, "categoryId")?;

    let (total, count): (f64, i64) = conn
        .query_row(
            "SELECT COALESCE(SUM(score), 0), COUNT(*)
             FROM score_records
             WHERE member_id = ? AND category_id = ?",
            (&member_id, &category_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .map_err(HandlerErr::db_query)?;

    Ok(json!({
        "memberId": member_id,
        "categoryId": category_id,
        "totalScore": total,
        "sessionCount": count,
        "averageScore": average_rounded(total, count)
    }))
}

struct ScoreTotalsRow {
    total: f64,
    count: i64,
    first_recorded: (i64, i64),
}

fn ranked_json(entries: &[RankedMember]) -> Vec<serde_json::Value> {
    entries
        .iter()
        .map(|e| {
            json!({
                "position": e.position,
                "memberId": e.member_id,
                "totalScore": e.total_score,
                "recordCount": e.record_count
            })
        })
        .collect()
}

fn scores_group_ranking(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let group_id = required_str(params, "groupId")?;
    if !group_exists(conn, &group_id)? {
        return Err(HandlerErr::not_found("group not found"));
    }
    Ok(json!({ "groupId": group_id, "ranking": ranked_json(&group_ranking(conn, &group_id)?) }))
}

pub(super) fn group_ranking(
    conn: &Connection,
    group_id: &str,
) -> Result<Vec<RankedMember>, HandlerErr> {
    let mut totals: HashMap<String, ScoreTotalsRow> = HashMap::new();
    let mut stmt = conn
        .prepare(
            "SELECT member_id, COALESCE(SUM(score), 0), COUNT(*), MIN(recorded_at), MIN(rowid)
             FROM score_records
             WHERE group_id = ?
             GROUP BY member_id",
        )
        .map_err(HandlerErr::db_query)?;
    let rows = stmt
        .query_map([group_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                ScoreTotalsRow {
                    total: r.get(1)?,
                    count: r.get(2)?,
                    first_recorded: (r.get(3)?, r.get(4)?),
                },
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;
    for (member_id, row) in rows {
        totals.insert(member_id, row);
    }
    // No score history at all means no standings, not a roster of zeros.
    if totals.is_empty() {
        return Ok(Vec::new());
    }

    // Ranking covers the current active roster; departed members' history
    // stays in the table but drops out of the standings.
    let mut stmt = conn
        .prepare(
            "SELECT member_id, created_at, rowid
             FROM memberships
             WHERE group_id = ? AND active = 1
             ORDER BY created_at, rowid",
        )
        .map_err(HandlerErr::db_query)?;
    let members = stmt
        .query_map([group_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, i64>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    let entries: Vec<MemberTotals> = members
        .into_iter()
        .map(|(member_id, created_at, rowid)| {
            let row = totals.get(&member_id);
            MemberTotals {
                total_score: row.map(|r| r.total).unwrap_or(0.0),
                record_count: row.map(|r| r.count).unwrap_or(0),
                first_recorded: row.map(|r| r.first_recorded),
                roster_order: (created_at, rowid),
                member_id,
            }
        })
        .collect();

    Ok(rank_members(entries))
}

fn scores_category_leaderboard(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let category_id = required_str(params, "categoryId")?;
    let limit = opt_u64(params, "limit")?.unwrap_or(DEFAULT_LEADERBOARD_LIMIT) as usize;
    let offset = opt_u64(params, "offset")?.unwrap_or(0) as usize;

    let mut stmt = conn
        .prepare(
            "SELECT member_id, COALESCE(SUM(score), 0), COUNT(*), MIN(recorded_at), MIN(rowid)
             FROM score_records
             WHERE category_id = ?
             GROUP BY member_id
             ORDER BY member_id",
        )
        .map_err(HandlerErr::db_query)?;
    let entries = stmt
        .query_map([&category_id], |r| {
            Ok(MemberTotals {
                member_id: r.get(0)?,
                total_score: r.get(1)?,
                record_count: r.get(2)?,
                first_recorded: Some((r.get(3)?, r.get(4)?)),
                roster_order: (0, 0),
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    // Positions are assigned over the full board, then the page is cut.
    let ranked = rank_members(entries);
    let page: Vec<RankedMember> = ranked.into_iter().skip(offset).take(limit).collect();
    Ok(json!({ "categoryId": category_id, "leaderboard": ranked_json(&page) }))
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
        "scores.record" => Some(with_conn(state, req, scores_record)),
        "scores.memberCategoryAggregate" => {
            Some(with_conn(state, req, scores_member_category_aggregate))
        }
        "scores.groupRanking" => Some(with_conn(state, req, scores_group_ranking)),
        "scores.categoryLeaderboard" => Some(with_conn(state, req, scores_category_leaderboard)),
        _ => None,
    }
}
