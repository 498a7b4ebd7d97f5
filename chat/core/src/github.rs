//! GitHub URL Detection
//!
//! Recognises pull-request and commit links in typed text so the input can
//! show what the backend is about to analyze. Detection is purely cosmetic:
//! the message is always sent unchanged and the backend does its own parsing.
//!
//! ```text
//! https://github.com/<owner>/<repo>/pull/<number>
//! https://github.com/<owner>/<repo>/commit/<sha>     (7-40 hex digits)
//! ```

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

static PR_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https?://(?:www\.)?github\.com/([\w.-]+)/([\w.-]+)/pull/(\d+)")
        .expect("invalid PR url regex")
});

static COMMIT_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https?://(?:www\.)?github\.com/([\w.-]+)/([\w.-]+)/commit/([0-9a-fA-F]{7,40})\b")
        .expect("invalid commit url regex")
});

/// Kind of GitHub link found in a message
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UrlKind {
    /// A pull request
    PullRequest,
    /// A single commit
    Commit,
}

impl fmt::Display for UrlKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PullRequest => write!(f, "PR"),
            Self::Commit => write!(f, "commit"),
        }
    }
}

/// A pull request link
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrUrl {
    /// Repository owner
    pub owner: String,
    /// Repository name
    pub repo: String,
    /// Pull request number
    pub number: u64,
    /// The link as it appeared in the text
    pub url: String,
}

/// A commit link
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitUrl {
    /// Repository owner
    pub owner: String,
    /// Repository name
    pub repo: String,
    /// Commit SHA (possibly abbreviated)
    pub sha: String,
    /// The link as it appeared in the text
    pub url: String,
}

/// First pull request link in `text`
#[must_use]
pub fn find_pr_url(text: &str) -> Option<PrUrl> {
    let caps = PR_URL.captures(text)?;
    Some(PrUrl {
        owner: caps[1].to_string(),
        repo: caps[2].to_string(),
        number: caps[3].parse().ok()?,
        url: caps[0].to_string(),
    })
}

/// First commit link in `text`
#[must_use]
pub fn find_commit_url(text: &str) -> Option<CommitUrl> {
    let caps = COMMIT_URL.captures(text)?;
    Some(CommitUrl {
        owner: caps[1].to_string(),
        repo: caps[2].to_string(),
        sha: caps[3].to_string(),
        url: caps[0].to_string(),
    })
}

/// Which kind of link `text` contains; commits win when both are present
#[must_use]
pub fn detect_url_kind(text: &str) -> Option<UrlKind> {
    if COMMIT_URL.is_match(text) {
        Some(UrlKind::Commit)
    } else if PR_URL.is_match(text) {
        Some(UrlKind::PullRequest)
    } else {
        None
    }
}

/// Placeholder and status texts for a message input
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InputAffordance {
    /// Link detected in the current draft
    pub detected: Option<UrlKind>,
    /// Whether a conversation is selected
    pub has_chat: bool,
    /// Whether a reply is in flight
    pub loading: bool,
}

impl InputAffordance {
    /// Affordance for a draft
    #[must_use]
    pub fn for_draft(draft: &str, has_chat: bool, loading: bool) -> Self {
        Self {
            detected: detect_url_kind(draft),
            has_chat,
            loading,
        }
    }

    /// Placeholder shown in the empty input
    #[must_use]
    pub fn placeholder(&self) -> &'static str {
        if !self.has_chat {
            return "Select or create a chat to start";
        }
        match self.detected {
            Some(UrlKind::Commit) => "Commit URL detected - will analyze commit...",
            Some(UrlKind::PullRequest) => "PR URL detected - will analyze PR...",
            None => "Type a message or paste a GitHub PR/Commit URL...",
        }
    }

    /// Status line under the input
    #[must_use]
    pub fn status(&self) -> &'static str {
        if !self.loading {
            return "Press Enter to send, Shift+Enter for new line";
        }
        match self.detected {
            Some(UrlKind::Commit) => "Analyzing commit...",
            Some(UrlKind::PullRequest) => "Analyzing PR...",
            None => "AI is thinking...",
        }
    }
}
