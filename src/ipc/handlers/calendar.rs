use rusqlite::Connection;
use serde_json::json;
use std::collections::HashMap;

use crate::calendar::{month_grid, DayCell, FirstDayOfWeek};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};

use super::shared::{caller, required_month, HandlerErr, DATE_FMT};

fn parse_first_day(params: &serde_json::Value) -> Result<FirstDayOfWeek, HandlerErr> {
    match params.get("firstDayOfWeek").and_then(|v| v.as_str()) {
        None => Ok(FirstDayOfWeek::Sunday),
        Some(raw) => FirstDayOfWeek::parse(raw)
            .ok_or_else(|| HandlerErr::invalid_input("firstDayOfWeek must be sunday or monday")),
    }
}

fn grid_cells(params: &serde_json::Value) -> Result<Vec<DayCell>, HandlerErr> {
    let (year, month) = required_month(params)?;
    let first_day = parse_first_day(params)?;
    month_grid(year, month, first_day).ok_or_else(|| HandlerErr::invalid_input("year out of range"))
}

fn cell_json(cell: &DayCell, session_ids: Option<&[String]>) -> serde_json::Value {
    let mut v = json!({
        "date": cell.date.format(DATE_FMT).to_string(),
        "day": cell.day,
        "inTargetMonth": cell.in_target_month
    });
    if let Some(ids) = session_ids {
        v["sessionIds"] = json!(ids);
    }
    v
}

fn calendar_month_grid(params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let cells = grid_cells(params)?;
    let out: Vec<serde_json::Value> = cells.iter().map(|c| cell_json(c, None)).collect();
    Ok(json!({ "cells": out }))
}

/// Grid plus the caller's sessions joined onto each day, including the
/// out-of-month cells at the edges.
fn calendar_month_open(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let who = caller(params)?;
    let cells = grid_cells(params)?;
    let lo = cells[0].date.format(DATE_FMT).to_string();
    let hi = cells[cells.len() - 1].date.format(DATE_FMT).to_string();

    let mut by_date: HashMap<String, Vec<String>> = HashMap::new();
    let mut stmt = conn
        .prepare(
            "SELECT date, id FROM sessions
             WHERE owner_id = ? AND date >= ? AND date <= ?
             ORDER BY date, created_at, rowid",
        )
        .map_err(HandlerErr::db_query)?;
    let rows = stmt
        .query_map((&who.id, &lo, &hi), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;
    for (date, id) in rows {
        by_date.entry(date).or_default().push(id);
    }

    let empty: Vec<String> = Vec::new();
    let out: Vec<serde_json::Value> = cells
        .iter()
        .map(|c| {
            let key = c.date.format(DATE_FMT).to_string();
            let ids = by_date.get(&key).unwrap_or(&empty);
            cell_json(c, Some(ids.as_slice()))
        })
        .collect();
    Ok(json!({ "cells": out }))
}

fn handle_month_grid(req: &Request) -> serde_json::Value {
    // Pure computation; no workspace needed.
    match calendar_month_grid(&req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_month_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match calendar_month_open(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "calendar.monthGrid" => Some(handle_month_grid(req)),
        "calendar.monthOpen" => Some(handle_month_open(state, req)),
        _ => None,
    }
}
