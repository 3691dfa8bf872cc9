use serde::{Deserialize, Serialize};

/// A poll as submitted by the instructor, before any votes exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollDraft {
    pub question: String,
    pub options: Vec<String>,
}

/// The active poll of a room with its running tally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Poll {
    pub question: String,
    pub options: Vec<String>,
    /// One count per option, same order as `options`.
    pub votes: Vec<u32>,
    /// User ids that have voted, in voting order.
    pub voters: Vec<String>,
}

impl Poll {
    pub fn launch(draft: PollDraft) -> Self {
        let votes = vec![0; draft.options.len()];
        Self {
            question: draft.question,
            options: draft.options,
            votes,
            voters: Vec::new(),
        }
    }

    pub fn has_voted(&self, user_id: &str) -> bool {
        self.voters.iter().any(|v| v == user_id)
    }
}
