// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Print status transition table.
//
// Every mutation of `print_status` is checked here before it reaches the
// store. Normal workers and operators share one table; operator-only edges
// are tagged with `Authority::Admin` instead of being special-cased at the
// call sites.

use crate::types::PrintStatus;

/// Who is asking for a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authority {
    /// A worker acting through the atomic job operations.
    Worker,
    /// An operator override (reprint, force-complete).
    Admin,
}

/// Outcome of a transition check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionCheck {
    pub allowed: bool,
    /// Why the transition was rejected. `None` when allowed.
    pub reason: Option<String>,
}

impl TransitionCheck {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn reject(reason: String) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

/// `(from, to, minimum authority)`. `from = None` is job creation.
const TRANSITIONS: &[(Option<PrintStatus>, PrintStatus, Authority)] = &[
    (None, PrintStatus::Pending, Authority::Worker),
    (Some(PrintStatus::Pending), PrintStatus::Printing, Authority::Worker),
    (Some(PrintStatus::Printing), PrintStatus::Printed, Authority::Worker),
    (Some(PrintStatus::Printing), PrintStatus::Pending, Authority::Worker),
    // Reprint.
    (Some(PrintStatus::Printed), PrintStatus::Pending, Authority::Admin),
    // Force-complete a job some other worker still owns.
    (Some(PrintStatus::Printing), PrintStatus::Printed, Authority::Admin),
];

/// Check a worker transition.
pub fn validate(from: Option<PrintStatus>, to: PrintStatus) -> TransitionCheck {
    check(from, to, Authority::Worker)
}

/// Check an operator transition. Admits every worker edge plus the
/// operator-only ones.
pub fn validate_admin(from: Option<PrintStatus>, to: PrintStatus) -> TransitionCheck {
    check(from, to, Authority::Admin)
}

fn check(from: Option<PrintStatus>, to: PrintStatus, authority: Authority) -> TransitionCheck {
    let permitted = TRANSITIONS.iter().any(|(f, t, required)| {
        *f == from
            && *t == to
            && (*required == Authority::Worker || authority == Authority::Admin)
    });
    if permitted {
        return TransitionCheck::allow();
    }

    let from_label = from.map(|s| s.as_str()).unwrap_or("(new)");
    let needs_admin = authority == Authority::Worker
        && TRANSITIONS
            .iter()
            .any(|(f, t, required)| *f == from && *t == to && *required == Authority::Admin);
    if needs_admin {
        TransitionCheck::reject(format!(
            "{from_label} -> {to} requires an admin override"
        ))
    } else {
        TransitionCheck::reject(format!("{from_label} -> {to} is not a legal transition"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Option<PrintStatus>; 4] = [
        None,
        Some(PrintStatus::Pending),
        Some(PrintStatus::Printing),
        Some(PrintStatus::Printed),
    ];

    #[test]
    fn worker_edges_are_exactly_the_legal_set() {
        let mut allowed = Vec::new();
        for from in ALL {
            for to in [PrintStatus::Pending, PrintStatus::Printing, PrintStatus::Printed] {
                if validate(from, to).allowed {
                    allowed.push((from, to));
                }
            }
        }
        assert_eq!(
            allowed,
            vec![
                (None, PrintStatus::Pending),
                (Some(PrintStatus::Pending), PrintStatus::Printing),
                (Some(PrintStatus::Printing), PrintStatus::Pending),
                (Some(PrintStatus::Printing), PrintStatus::Printed),
            ]
        );
    }

    #[test]
    fn admin_adds_reprint() {
        assert!(!validate(Some(PrintStatus::Printed), PrintStatus::Pending).allowed);
        assert!(validate_admin(Some(PrintStatus::Printed), PrintStatus::Pending).allowed);
        assert!(validate_admin(Some(PrintStatus::Printing), PrintStatus::Printed).allowed);
    }

    #[test]
    fn admin_does_not_open_other_edges() {
        assert!(!validate_admin(Some(PrintStatus::Pending), PrintStatus::Printed).allowed);
        assert!(!validate_admin(Some(PrintStatus::Printed), PrintStatus::Printing).allowed);
        assert!(!validate_admin(None, PrintStatus::Printing).allowed);
    }

    #[test]
    fn rejection_carries_reason() {
        let check = validate(Some(PrintStatus::Printed), PrintStatus::Pending);
        assert!(check.reason.unwrap().contains("admin override"));

        let check = validate(Some(PrintStatus::Pending), PrintStatus::Printed);
        assert!(check.reason.unwrap().contains("not a legal transition"));
    }
}
