//! Developer guardrails and invariants
//!
//! Debug assertions for detecting impossible states during development.
//! These checks are compiled out in release builds.

use crate::models::{Member, Poll};

/// Validate the single-admin invariant: a non-empty room has exactly one
/// member with admin authority.
pub fn assert_room_invariants(room: &str, members: &[Member]) {
    let admin_count = members.iter().filter(|m| m.is_admin).count();
    debug_assert!(
        members.is_empty() || admin_count == 1,
        "Room {} has {} admins across {} members, expected exactly 1",
        room,
        admin_count,
        members.len()
    );
}

/// Validate that a poll's vote bookkeeping is consistent: no duplicate
/// voters, and option counts match the recorded choices.
pub fn assert_poll_invariants(poll: &Poll) {
    for (i, voter) in poll.voted.iter().enumerate() {
        debug_assert!(
            !poll.voted[..i].contains(voter),
            "Poll {} has duplicate voter {}",
            poll.id,
            voter
        );
    }

    let recorded: usize = poll.votes_by_voter.values().map(Vec::len).sum();
    let counted: u32 = poll.options.iter().map(|o| o.count).sum();
    debug_assert!(
        recorded as u32 == counted,
        "Poll {} counts {} choices but options sum to {}",
        poll.id,
        recorded,
        counted
    );
}
