use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::ipc::error::err;

pub const DATE_FMT: &str = "%Y-%m-%d";

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        HandlerErr {
            code: "invalid_input",
            message: message.into(),
            details: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        HandlerErr {
            code: "not_found",
            message: message.into(),
            details: None,
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        HandlerErr {
            code: "forbidden",
            message: message.into(),
            details: None,
        }
    }

    pub fn conflict(message: impl Into<String>, details: serde_json::Value) -> Self {
        HandlerErr {
            code: "conflict",
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn db_query(e: rusqlite::Error) -> Self {
        HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        }
    }

    pub fn db_write(e: rusqlite::Error, table: &str) -> Self {
        HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": table })),
        }
    }

    pub fn db_tx(e: rusqlite::Error) -> Self {
        HandlerErr {
            code: "db_tx_failed",
            message: e.to_string(),
            details: None,
        }
    }

    pub fn db_commit(e: rusqlite::Error) -> Self {
        HandlerErr {
            code: "db_commit_failed",
            message: e.to_string(),
            details: None,
        }
    }
}

/// Authenticated caller context supplied by the auth collaborator. Trusted
/// as-is; the core only enforces ownership with it.
pub struct Caller {
    pub id: String,
    pub admin: bool,
}

pub fn caller(params: &serde_json::Value) -> Result<Caller, HandlerErr> {
    let id = required_str(params, "callerId")?;
    let admin = match params.get("callerRole").and_then(|v| v.as_str()) {
        None => false,
        Some("instructor") => false,
        Some("admin") => true,
        Some(other) => {
            return Err(HandlerErr::invalid_input(format!(
                "unknown callerRole: {}",
                other
            )))
        }
    };
    Ok(Caller { id, admin })
}

pub fn required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::invalid_input(format!("missing {}", key)))
}

pub fn opt_str(params: &serde_json::Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let s = v
                .as_str()
                .ok_or_else(|| HandlerErr::invalid_input(format!("{} must be string or null", key)))?
                .trim()
                .to_string();
            Ok(if s.is_empty() { None } else { Some(s) })
        }
    }
}

pub fn required_bool(params: &serde_json::Value, key: &str) -> Result<bool, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_bool())
        .ok_or_else(|| HandlerErr::invalid_input(format!("missing {}", key)))
}

pub fn opt_bool(params: &serde_json::Value, key: &str) -> Result<Option<bool>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| HandlerErr::invalid_input(format!("{} must be boolean", key))),
    }
}

pub fn opt_u64(params: &serde_json::Value, key: &str) -> Result<Option<u64>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| HandlerErr::invalid_input(format!("{} must be a non-negative integer", key))),
    }
}

pub fn required_date(params: &serde_json::Value, key: &str) -> Result<NaiveDate, HandlerErr> {
    let raw = required_str(params, key)?;
    parse_date(&raw, key)
}

pub fn parse_date(raw: &str, key: &str) -> Result<NaiveDate, HandlerErr> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FMT)
        .map_err(|_| HandlerErr::invalid_input(format!("{} must be YYYY-MM-DD", key)))
}

/// Month/year pair as used by the listing and calendar surfaces. Months are
/// 1-based on the wire.
pub fn required_month(params: &serde_json::Value) -> Result<(i32, u32), HandlerErr> {
    let year = params
        .get("year")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::invalid_input("missing year"))?;
    // Range-check before narrowing so oversized wire values cannot wrap into
    // a plausible year. Four digits is what the date format carries.
    if !(1..=9999).contains(&year) {
        return Err(HandlerErr::invalid_input("year must be between 1 and 9999"));
    }
    let month = params
        .get("month")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| HandlerErr::invalid_input("missing month"))?;
    if !(1..=12).contains(&month) {
        return Err(HandlerErr::invalid_input("month must be between 1 and 12"));
    }
    Ok((year as i32, month as u32))
}

pub fn now_ts() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub fn group_exists(conn: &Connection, group_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM groups WHERE id = ?", [group_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::db_query)
}

pub fn is_active_member(
    conn: &Connection,
    group_id: &str,
    member_id: &str,
) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT 1 FROM memberships WHERE group_id = ? AND member_id = ? AND active = 1",
        (group_id, member_id),
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::db_query)
}

pub fn unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _) if f.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
