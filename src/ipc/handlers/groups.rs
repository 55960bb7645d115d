use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use super::shared::{
    caller, group_exists, now_ts, opt_bool, opt_str, required_bool, required_str, HandlerErr,
};

fn group_row_json(
    id: &str,
    name: &str,
    description: Option<&str>,
    school: Option<&str>,
    grade: Option<&str>,
    owner_id: &str,
    member_count: i64,
) -> serde_json::Value {
    json!({
        "groupId": id,
        "name": name,
        "description": description,
        "school": school,
        "grade": grade,
        "ownerId": owner_id,
        "memberCount": member_count
    })
}

fn groups_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = required_str(params, "name")?;
    let owner_id = required_str(params, "ownerId")?;
    let school = opt_str(params, "school")?;
    let grade = opt_str(params, "grade")?;
    let description = opt_str(params, "description")?;
    let institution_id = opt_str(params, "institutionId")?;

    let group_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO groups(id, name, description, school, grade, owner_id, institution_id, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &group_id,
            &name,
            &description,
            &school,
            &grade,
            &owner_id,
            &institution_id,
            now_ts(),
        ),
    )
    .map_err(|e| HandlerErr::db_write(e, "groups"))?;

    Ok(json!({ "groupId": group_id, "name": name }))
}

fn groups_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let group_id = required_str(params, "groupId")?;
    if !group_exists(conn, &group_id)? {
        return Err(HandlerErr::not_found("group not found"));
    }
    // Identity (owner, school, grade) is immutable; only name/description move.
    // name stays required when supplied: a blank value is an error, not a skip.
    if params.get("name").is_some() {
        let name = required_str(params, "name")?;
        conn.execute("UPDATE groups SET name = ? WHERE id = ?", (&name, &group_id))
            .map_err(|e| HandlerErr::db_write(e, "groups"))?;
    }
    if params.get("description").is_some() {
        let description = opt_str(params, "description")?;
        conn.execute(
            "UPDATE groups SET description = ? WHERE id = ?",
            (&description, &group_id),
        )
        .map_err(|e| HandlerErr::db_write(e, "groups"))?;
    }
    Ok(json!({ "ok": true }))
}

fn groups_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let owner_filter = opt_str(params, "ownerId")?;
    let sql = "SELECT
                 g.id, g.name, g.description, g.school, g.grade, g.owner_id,
                 (SELECT COUNT(*) FROM memberships m WHERE m.group_id = g.id AND m.active = 1)
               FROM groups g
               WHERE (?1 IS NULL OR g.owner_id = ?1)
               ORDER BY g.name";
    let mut stmt = conn.prepare(sql).map_err(HandlerErr::db_query)?;
    let rows = stmt
        .query_map([&owner_filter], |r| {
            Ok(group_row_json(
                &r.get::<_, String>(0)?,
                &r.get::<_, String>(1)?,
                r.get::<_, Option<String>>(2)?.as_deref(),
                r.get::<_, Option<String>>(3)?.as_deref(),
                r.get::<_, Option<String>>(4)?.as_deref(),
                &r.get::<_, String>(5)?,
                r.get::<_, i64>(6)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;
    Ok(json!({ "groups": rows }))
}

fn groups_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let who = caller(params)?;
    let group_id = required_str(params, "groupId")?;
    let owner: Option<String> = conn
        .query_row("SELECT owner_id FROM groups WHERE id = ?", [&group_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::db_query)?;
    let Some(owner) = owner else {
        return Err(HandlerErr::not_found("group not found"));
    };
    if owner != who.id && !who.admin {
        return Err(HandlerErr::forbidden("only the owner or an admin may delete a group"));
    }

    let tx = conn.unchecked_transaction().map_err(HandlerErr::db_tx)?;
    // Sessions survive as orphaned history; only the group reference clears.
    tx.execute(
        "UPDATE sessions SET group_id = NULL WHERE group_id = ?",
        [&group_id],
    )
    .map_err(|e| HandlerErr::db_write(e, "sessions"))?;
    tx.execute("DELETE FROM memberships WHERE group_id = ?", [&group_id])
        .map_err(|e| HandlerErr::db_write(e, "memberships"))?;
    tx.execute("DELETE FROM groups WHERE id = ?", [&group_id])
        .map_err(|e| HandlerErr::db_write(e, "groups"))?;
    tx.commit().map_err(HandlerErr::db_commit)?;

    Ok(json!({ "ok": true }))
}

fn groups_set_member(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let group_id = required_str(params, "groupId")?;
    let member_id = required_str(params, "memberId")?;
    let active = required_bool(params, "active")?;
    if !group_exists(conn, &group_id)? {
        return Err(HandlerErr::not_found("group not found"));
    }

    // created_at survives reactivation; it feeds the most-absences tie-break.
    conn.execute(
        "INSERT INTO memberships(group_id, member_id, active, created_at)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(group_id, member_id) DO UPDATE SET
           active = excluded.active",
        (&group_id, &member_id, active as i64, now_ts()),
    )
    .map_err(|e| HandlerErr::db_write(e, "memberships"))?;

    Ok(json!({ "ok": true }))
}

fn groups_list_members(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let group_id = required_str(params, "groupId")?;
    let active_only = opt_bool(params, "activeOnly")?.unwrap_or(true);
    if !group_exists(conn, &group_id)? {
        return Err(HandlerErr::not_found("group not found"));
    }

    let mut stmt = conn
        .prepare(
            "SELECT member_id, active, created_at
             FROM memberships
             WHERE group_id = ?1 AND (?2 = 0 OR active = 1)
             ORDER BY created_at, rowid",
        )
        .map_err(HandlerErr::db_query)?;
    let rows = stmt
        .query_map((&group_id, active_only as i64), |r| {
            Ok(json!({
                "memberId": r.get::<_, String>(0)?,
                "active": r.get::<_, i64>(1)? != 0,
                "createdAt": r.get::<_, i64>(2)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;
    Ok(json!({ "members": rows }))
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
        "groups.create" => Some(with_conn(state, req, groups_create)),
        "groups.update" => Some(with_conn(state, req, groups_update)),
        "groups.list" => Some(with_conn(state, req, groups_list)),
        "groups.delete" => Some(with_conn(state, req, groups_delete)),
        "groups.setMember" => Some(with_conn(state, req, groups_set_member)),
        "groups.listMembers" => Some(with_conn(state, req, groups_list_members)),
        _ => None,
    }
}
