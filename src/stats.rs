use std::cmp::Ordering;

/// round(part / total * 100), with 0 for an empty total so "no sessions yet"
/// never turns into a division error.
pub fn percent_rounded(part: i64, total: i64) -> i64 {
    if total <= 0 {
        return 0;
    }
    ((part as f64) * 100.0 / (total as f64)).round() as i64
}

pub fn average_rounded(total: f64, count: i64) -> i64 {
    if count <= 0 {
        return 0;
    }
    (total / count as f64).round() as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttendanceStats {
    pub considered: i64,
    pub present_count: i64,
    pub absent_count: i64,
    pub attendance_rate: i64,
    pub streak: i64,
}

/// `presence` is ordered most-recent-first. The streak walks from the front
/// and stops at the first absence.
pub fn attendance_stats(presence: &[bool]) -> AttendanceStats {
    let considered = presence.len() as i64;
    let present_count = presence.iter().filter(|p| **p).count() as i64;
    let streak = presence.iter().take_while(|p| **p).count() as i64;
    AttendanceStats {
        considered,
        present_count,
        absent_count: considered - present_count,
        attendance_rate: percent_rounded(present_count, considered),
        streak,
    }
}

/// One member's raw totals before ranking. `first_recorded` is the
/// (recorded_at, rowid) of the member's earliest score row; members with no
/// rows at all sort after those who have one. `roster_order` (membership
/// creation, then rowid) settles whatever remains.
#[derive(Debug, Clone)]
pub struct MemberTotals {
    pub member_id: String,
    pub total_score: f64,
    pub record_count: i64,
    pub first_recorded: Option<(i64, i64)>,
    pub roster_order: (i64, i64),
}

#[derive(Debug, Clone)]
pub struct RankedMember {
    pub position: usize,
    pub member_id: String,
    pub total_score: f64,
    pub record_count: i64,
}

fn ranking_cmp(a: &MemberTotals, b: &MemberTotals) -> Ordering {
    b.total_score
        .total_cmp(&a.total_score)
        .then_with(|| match (a.first_recorded, b.first_recorded) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.roster_order.cmp(&b.roster_order))
}

/// Sort and assign 1-based positions. Positions are a derived view; callers
/// must never persist them.
pub fn rank_members(mut entries: Vec<MemberTotals>) -> Vec<RankedMember> {
    entries.sort_by(ranking_cmp);
    entries
        .into_iter()
        .enumerate()
        .map(|(i, e)| RankedMember {
            position: i + 1,
            member_id: e.member_id,
            total_score: e.total_score,
            record_count: e.record_count,
        })
        .collect()
}
