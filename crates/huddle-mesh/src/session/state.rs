//! Role assignment and negotiation phases.

use std::fmt;

use huddle_common::ParticipantId;

/// Which side of a pair sends the offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Offerer,
    Answerer,
}

impl Role {
    /// The lexically smaller identity always offers, so both sides agree
    /// without exchanging anything and glare cannot happen.
    pub fn for_pair(local: &ParticipantId, remote: &ParticipantId) -> Self {
        if local < remote {
            Self::Offerer
        } else {
            Self::Answerer
        }
    }
}

/// Negotiation progress of one session.
///
/// Offerer: `Idle → Offering → OfferSent → AnswerReceived → Connected`.
/// Answerer: `Idle → OfferReceived → AnswerSent → Connected`.
/// `Failed` and `Closed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Offering,
    OfferSent,
    OfferReceived,
    AnswerReceived,
    AnswerSent,
    Connected,
    Failed,
    Closed,
}

impl SessionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Offering => "offering",
            Self::OfferSent => "offer_sent",
            Self::OfferReceived => "offer_received",
            Self::AnswerReceived => "answer_received",
            Self::AnswerSent => "answer_sent",
            Self::Connected => "connected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exactly_one_side_offers() {
        let ids = ["alice", "bob", "carol", "4f1c", "Zed", "zed"];
        for a in ids {
            for b in ids {
                if a == b {
                    continue;
                }
                let a = ParticipantId::from(a);
                let b = ParticipantId::from(b);
                let ab = Role::for_pair(&a, &b);
                let ba = Role::for_pair(&b, &a);
                assert_ne!(ab, ba, "{a} / {b}");
                // Reproducible for the same identities.
                assert_eq!(ab, Role::for_pair(&a, &b));
            }
        }
    }

    #[test]
    fn smaller_identity_offers() {
        let a = ParticipantId::from("a");
        let b = ParticipantId::from("b");
        assert_eq!(Role::for_pair(&a, &b), Role::Offerer);
        assert_eq!(Role::for_pair(&b, &a), Role::Answerer);
    }

    #[test]
    fn terminal_phases() {
        assert!(SessionPhase::Failed.is_terminal());
        assert!(SessionPhase::Closed.is_terminal());
        assert!(!SessionPhase::Connected.is_terminal());
        assert_eq!(SessionPhase::OfferSent.to_string(), "offer_sent");
    }
}
