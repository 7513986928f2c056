// Core domain types shared between the client pipeline and the relay.

use serde::{Deserialize, Serialize};

/// The closed set of write operations the pipeline knows how to queue.
///
/// Matched exhaustively wherever requests are built or responses are
/// interpreted, so adding a kind is a compile-time-checked change.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    DocumentUpdate,
    ThreadCreate,
    CommentCreate,
    ThreadResolve,
    ThreadReopen,
}

impl OperationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DocumentUpdate => "document_update",
            Self::ThreadCreate => "thread_create",
            Self::CommentCreate => "comment_create",
            Self::ThreadResolve => "thread_resolve",
            Self::ThreadReopen => "thread_reopen",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "document_update" => Some(Self::DocumentUpdate),
            "thread_create" => Some(Self::ThreadCreate),
            "comment_create" => Some(Self::CommentCreate),
            "thread_resolve" => Some(Self::ThreadResolve),
            "thread_reopen" => Some(Self::ThreadReopen),
            _ => None,
        }
    }

    /// Whether consecutive writes of this kind to the same resource
    /// collapse into a single queued entry.
    ///
    /// Only document updates merge: each one carries the full desired
    /// state, so the latest body supersedes earlier ones. Creates and
    /// thread state flips are independent effects and must never merge.
    pub const fn merges_by_target(self) -> bool {
        matches!(self, Self::DocumentUpdate)
    }
}

/// HTTP methods a queued mutation may use on replay.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Post,
    Put,
    Patch,
}

impl HttpMethod {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "POST" => Some(Self::Post),
            "PUT" => Some(Self::Put),
            "PATCH" => Some(Self::Patch),
            _ => None,
        }
    }
}
