use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_coachd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn coachd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

struct Harness {
    _child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    seq: u64,
}

impl Harness {
    fn start(prefix: &str) -> Self {
        let workspace = temp_dir(prefix);
        let (child, stdin, reader) = spawn_sidecar();
        let mut h = Harness {
            _child: child,
            stdin,
            reader,
            seq: 0,
        };
        let _ = h.call_ok(
            "workspace.select",
            json!({ "path": workspace.to_string_lossy() }),
        );
        h
    }

    fn call_ok(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        self.seq += 1;
        let id = self.seq.to_string();
        let payload = json!({ "id": id, "method": method, "params": params });
        writeln!(self.stdin, "{}", payload).expect("write request");
        self.stdin.flush().expect("flush request");

        let mut line = String::new();
        self.reader.read_line(&mut line).expect("read response line");
        let value: serde_json::Value =
            serde_json::from_str(line.trim()).expect("parse response json");
        assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id.as_str()));
        assert!(
            value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
            "{} failed: {}",
            method,
            value
        );
        value.get("result").cloned().unwrap_or_else(|| json!({}))
    }
}

#[test]
fn dashboard_composes_sessions_attendance_and_ranking() {
    let mut h = Harness::start("coachd-dashboard");

    let group = h
        .call_ok("groups.create", json!({ "name": "G", "ownerId": "coach-1" }))
        .get("groupId")
        .and_then(|v| v.as_str())
        .expect("groupId")
        .to_string();
    for m in ["member-a", "member-b"] {
        let _ = h.call_ok(
            "groups.setMember",
            json!({ "groupId": group, "memberId": m, "active": true }),
        );
    }

    let mut sessions = Vec::new();
    for date in ["2024-03-01", "2024-03-08"] {
        let s = h
            .call_ok(
                "sessions.create",
                json!({ "callerId": "coach-1", "groupId": group, "date": date, "subject": "Practice" }),
            )
            .get("session")
            .and_then(|v| v.get("sessionId"))
            .and_then(|v| v.as_str())
            .expect("sessionId")
            .to_string();
        sessions.push(s);
    }
    let _ = h.call_ok(
        "sessions.setCompleted",
        json!({ "callerId": "coach-1", "sessionId": sessions[0], "completed": true }),
    );

    let _ = h.call_ok(
        "attendance.record",
        json!({ "sessionId": sessions[0], "memberId": "member-a", "present": true }),
    );
    let _ = h.call_ok(
        "attendance.record",
        json!({ "sessionId": sessions[0], "memberId": "member-b", "present": false }),
    );
    let _ = h.call_ok(
        "scores.record",
        json!({ "sessionId": sessions[0], "memberId": "member-a", "categoryId": "volleyball", "score": 80 }),
    );
    let _ = h.call_ok(
        "scores.record",
        json!({ "sessionId": sessions[0], "memberId": "member-b", "categoryId": "volleyball", "score": 95 }),
    );

    let dash = h.call_ok("stats.groupDashboard", json!({ "groupId": group }));

    let sess = dash.get("sessions").expect("sessions block");
    assert_eq!(sess.get("total").and_then(|v| v.as_i64()), Some(2));
    assert_eq!(sess.get("completed").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(sess.get("completionRate").and_then(|v| v.as_i64()), Some(50));

    let attendance = dash.get("attendance").expect("attendance block");
    assert_eq!(
        attendance
            .get("mostAbsent")
            .and_then(|m| m.get("memberId"))
            .and_then(|v| v.as_str()),
        Some("member-b")
    );
    assert_eq!(
        attendance
            .get("meanAttendanceRate")
            .and_then(|v| v.as_i64()),
        Some(50)
    );

    let top = dash
        .get("topRanking")
        .and_then(|v| v.as_array())
        .expect("topRanking");
    assert_eq!(top.len(), 2);
    assert_eq!(top[0].get("memberId").and_then(|v| v.as_str()), Some("member-b"));
    assert_eq!(top[0].get("position").and_then(|v| v.as_u64()), Some(1));
}

#[test]
fn owner_overview_rolls_up_the_month_per_group() {
    let mut h = Harness::start("coachd-overview");

    let mut groups = Vec::new();
    for name in ["G1", "G2"] {
        let g = h
            .call_ok("groups.create", json!({ "name": name, "ownerId": "coach-1" }))
            .get("groupId")
            .and_then(|v| v.as_str())
            .expect("groupId")
            .to_string();
        groups.push(g);
    }

    let s1 = h
        .call_ok(
            "sessions.create",
            json!({ "callerId": "coach-1", "groupId": groups[0], "date": "2024-03-04", "subject": "A" }),
        )
        .get("session")
        .and_then(|v| v.get("sessionId"))
        .and_then(|v| v.as_str())
        .expect("sessionId")
        .to_string();
    let _ = h.call_ok(
        "sessions.create",
        json!({ "callerId": "coach-1", "groupId": groups[1], "date": "2024-03-04", "subject": "B" }),
    );
    // Outside the requested month; must not count.
    let _ = h.call_ok(
        "sessions.create",
        json!({ "callerId": "coach-1", "groupId": groups[0], "date": "2024-04-01", "subject": "C" }),
    );
    let _ = h.call_ok(
        "sessions.setCompleted",
        json!({ "callerId": "coach-1", "sessionId": s1, "completed": true }),
    );

    let overview = h.call_ok(
        "stats.ownerOverview",
        json!({ "callerId": "coach-1", "year": 2024, "month": 3 }),
    );
    assert_eq!(
        overview.get("totalSessions").and_then(|v| v.as_i64()),
        Some(2)
    );
    assert_eq!(
        overview.get("completedSessions").and_then(|v| v.as_i64()),
        Some(1)
    );
    assert_eq!(
        overview.get("completionRate").and_then(|v| v.as_i64()),
        Some(50)
    );
    let per_group = overview
        .get("groups")
        .and_then(|v| v.as_array())
        .expect("groups");
    assert_eq!(per_group.len(), 2);
}
