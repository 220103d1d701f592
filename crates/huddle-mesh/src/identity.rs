use huddle_common::{new_id, ParticipantId};
use serde::{Deserialize, Serialize};

/// The local user as supplied by the identity collaborator. Treated as
/// already authenticated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub display_name: String,
}

impl Participant {
    pub fn new(id: impl Into<ParticipantId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }

    /// A fresh anonymous participant, named after the host.
    pub fn generate(hostname: &str) -> Self {
        Self {
            id: ParticipantId::new(new_id()),
            display_name: hostname.to_string(),
        }
    }
}
