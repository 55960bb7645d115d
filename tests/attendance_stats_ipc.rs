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

    fn call(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
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
        value
    }

    fn call_ok(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let value = self.call(method, params);
        assert!(
            value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
            "{} failed: {}",
            method,
            value
        );
        value.get("result").cloned().unwrap_or_else(|| json!({}))
    }

    fn call_err(&mut self, method: &str, params: serde_json::Value) -> String {
        let value = self.call(method, params);
        assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false));
        value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string()
    }

    fn create_group(&mut self, name: &str) -> String {
        self.call_ok("groups.create", json!({ "name": name, "ownerId": "coach-1" }))
            .get("groupId")
            .and_then(|v| v.as_str())
            .expect("groupId")
            .to_string()
    }

    fn add_member(&mut self, group: &str, member: &str) {
        let _ = self.call_ok(
            "groups.setMember",
            json!({ "groupId": group, "memberId": member, "active": true }),
        );
    }

    fn create_session(&mut self, group: &str, date: &str) -> String {
        self.call_ok(
            "sessions.create",
            json!({ "callerId": "coach-1", "groupId": group, "date": date, "subject": "Practice" }),
        )
        .get("session")
        .and_then(|v| v.get("sessionId"))
        .and_then(|v| v.as_str())
        .expect("sessionId")
        .to_string()
    }

    fn record(&mut self, session: &str, member: &str, present: bool) {
        let _ = self.call_ok(
            "attendance.record",
            json!({ "sessionId": session, "memberId": member, "present": present }),
        );
    }
}

#[test]
fn rate_is_seventy_for_seven_of_ten() {
    let mut h = Harness::start("coachd-att-rate");
    let group = h.create_group("G");
    h.add_member(&group, "m-1");

    for day in 1..=10 {
        let session = h.create_session(&group, &format!("2024-03-{:02}", day));
        h.record(&session, "m-1", day <= 7);
    }

    let stats = h.call_ok(
        "attendance.memberStats",
        json!({ "groupId": group, "memberId": "m-1" }),
    );
    assert_eq!(stats.get("considered").and_then(|v| v.as_i64()), Some(10));
    assert_eq!(stats.get("presentCount").and_then(|v| v.as_i64()), Some(7));
    assert_eq!(stats.get("absentCount").and_then(|v| v.as_i64()), Some(3));
    assert_eq!(stats.get("attendanceRate").and_then(|v| v.as_i64()), Some(70));
}

#[test]
fn member_with_no_records_gets_zeroes_not_errors() {
    let mut h = Harness::start("coachd-att-zero");
    let group = h.create_group("G");
    h.add_member(&group, "m-1");

    let stats = h.call_ok(
        "attendance.memberStats",
        json!({ "groupId": group, "memberId": "m-1" }),
    );
    assert_eq!(stats.get("considered").and_then(|v| v.as_i64()), Some(0));
    assert_eq!(stats.get("attendanceRate").and_then(|v| v.as_i64()), Some(0));
    assert_eq!(stats.get("streak").and_then(|v| v.as_i64()), Some(0));
}

#[test]
fn streak_counts_back_from_most_recent_until_first_absence() {
    let mut h = Harness::start("coachd-att-streak");
    let group = h.create_group("G");
    h.add_member(&group, "m-1");

    // Oldest to newest: present, absent, present, present.
    // Newest-first that reads [true, true, false, true] -> streak 2.
    let presence = [
        ("2024-03-01", true),
        ("2024-03-02", false),
        ("2024-03-03", true),
        ("2024-03-04", true),
    ];
    for (date, present) in presence {
        let session = h.create_session(&group, date);
        h.record(&session, "m-1", present);
    }

    let stats = h.call_ok(
        "attendance.memberStats",
        json!({ "groupId": group, "memberId": "m-1" }),
    );
    assert_eq!(stats.get("streak").and_then(|v| v.as_i64()), Some(2));
    assert_eq!(stats.get("attendanceRate").and_then(|v| v.as_i64()), Some(75));
}

#[test]
fn lookback_limit_bounds_the_scan() {
    let mut h = Harness::start("coachd-att-lookback");
    let group = h.create_group("G");
    h.add_member(&group, "m-1");

    // Five absences followed by five attendances; a lookback of 5 only sees
    // the recent attendances.
    for day in 1..=10 {
        let session = h.create_session(&group, &format!("2024-03-{:02}", day));
        h.record(&session, "m-1", day > 5);
    }

    let stats = h.call_ok(
        "attendance.memberStats",
        json!({ "groupId": group, "memberId": "m-1", "lookbackLimit": 5 }),
    );
    assert_eq!(stats.get("considered").and_then(|v| v.as_i64()), Some(5));
    assert_eq!(stats.get("attendanceRate").and_then(|v| v.as_i64()), Some(100));
    assert_eq!(stats.get("streak").and_then(|v| v.as_i64()), Some(5));
}

#[test]
fn recording_is_an_upsert_per_session_and_member() {
    let mut h = Harness::start("coachd-att-upsert");
    let group = h.create_group("G");
    h.add_member(&group, "m-1");
    let session = h.create_session(&group, "2024-03-01");

    h.record(&session, "m-1", false);
    h.record(&session, "m-1", true);

    let stats = h.call_ok(
        "attendance.memberStats",
        json!({ "groupId": group, "memberId": "m-1" }),
    );
    // One record, not two, and it carries the latest flag.
    assert_eq!(stats.get("considered").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(stats.get("presentCount").and_then(|v| v.as_i64()), Some(1));
}

#[test]
fn group_summary_flags_most_absent_member() {
    let mut h = Harness::start("coachd-att-summary");
    let group = h.create_group("G");
    h.add_member(&group, "member-a");
    h.add_member(&group, "member-b");

    let session = h.create_session(&group, "2024-03-01");
    h.record(&session, "member-a", true);
    h.record(&session, "member-b", false);

    let summary = h.call_ok("attendance.groupSummary", json!({ "groupId": group }));
    let members = summary
        .get("members")
        .and_then(|v| v.as_array())
        .expect("members");
    assert_eq!(members.len(), 2);

    let rate_of = |id: &str| {
        members
            .iter()
            .find(|m| m.get("memberId").and_then(|v| v.as_str()) == Some(id))
            .and_then(|m| m.get("attendanceRate"))
            .and_then(|v| v.as_i64())
            .expect("rate")
    };
    assert_eq!(rate_of("member-a"), 100);
    assert_eq!(rate_of("member-b"), 0);
    assert_eq!(
        summary.get("meanAttendanceRate").and_then(|v| v.as_i64()),
        Some(50)
    );

    let most_absent = summary.get("mostAbsent").expect("mostAbsent");
    assert_eq!(
        most_absent.get("memberId").and_then(|v| v.as_str()),
        Some("member-b")
    );
    assert_eq!(most_absent.get("absences").and_then(|v| v.as_i64()), Some(1));
}

#[test]
fn most_absent_tie_goes_to_earliest_membership() {
    let mut h = Harness::start("coachd-att-tie");
    let group = h.create_group("G");
    h.add_member(&group, "first-joined");
    h.add_member(&group, "second-joined");

    let session = h.create_session(&group, "2024-03-01");
    h.record(&session, "first-joined", false);
    h.record(&session, "second-joined", false);

    let summary = h.call_ok("attendance.groupSummary", json!({ "groupId": group }));
    assert_eq!(
        summary
            .get("mostAbsent")
            .and_then(|m| m.get("memberId"))
            .and_then(|v| v.as_str()),
        Some("first-joined")
    );
}

#[test]
fn attendance_rejects_non_members_and_ghost_sessions() {
    let mut h = Harness::start("coachd-att-errors");
    let group = h.create_group("G");
    h.add_member(&group, "m-1");
    let session = h.create_session(&group, "2024-03-01");

    let code = h.call_err(
        "attendance.record",
        json!({ "sessionId": session, "memberId": "stranger", "present": true }),
    );
    assert_eq!(code, "invalid_input");

    // Deactivated members are rejected the same way.
    let _ = h.call_ok(
        "groups.setMember",
        json!({ "groupId": group, "memberId": "m-1", "active": false }),
    );
    let code = h.call_err(
        "attendance.record",
        json!({ "sessionId": session, "memberId": "m-1", "present": true }),
    );
    assert_eq!(code, "invalid_input");

    let code = h.call_err(
        "attendance.record",
        json!({ "sessionId": "ghost", "memberId": "m-1", "present": true }),
    );
    assert_eq!(code, "not_found");

    let code = h.call_err(
        "attendance.groupSummary",
        json!({ "groupId": "ghost-group" }),
    );
    assert_eq!(code, "not_found");
}
