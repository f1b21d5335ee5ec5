//! Inbound messages, conversation identity, authority and responses.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Conversation identity ────────────────────────────────────────────────────

/// The `(channel, sub-channel, user)` tuple identifying one ongoing exchange.
///
/// Two identities match only when all three parts are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId {
    pub channel: String,
    pub sub_channel: Option<String>,
    pub user: String,
}

impl ConversationId {
    pub fn new(channel: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            sub_channel: None,
            user: user.into(),
        }
    }

    pub fn with_sub_channel(mut self, sub_channel: impl Into<String>) -> Self {
        self.sub_channel = Some(sub_channel.into());
        self
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sub_channel {
            Some(sub) => write!(f, "{}/{}:{}", self.channel, sub, self.user),
            None => write!(f, "{}:{}", self.channel, self.user),
        }
    }
}

// ─── Authority ────────────────────────────────────────────────────────────────

/// Privilege level of an invoking context, ordered from lowest to highest.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Authority {
    #[default]
    Unspecified,
    Public,
    Admin,
    Root,
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unspecified => "unspecified",
            Self::Public => "public",
            Self::Admin => "admin",
            Self::Root => "root",
        };
        f.write_str(s)
    }
}

impl FromStr for Authority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "unspecified" => Ok(Self::Unspecified),
            "public" => Ok(Self::Public),
            "admin" => Ok(Self::Admin),
            "root" => Ok(Self::Root),
            other => Err(format!("unknown authority '{other}'")),
        }
    }
}

// ─── Roster data ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    #[default]
    Member,
    Admin,
    Owner,
}

/// A user as known to the contacts roster of one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub channel: String,
    pub sub_channel: Option<String>,
    pub user: String,
    pub nickname: Option<String>,
    pub role: MemberRole,
}

/// A channel (group, guild, private chat) as known to the contacts roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub channel: String,
    pub sub_channel: Option<String>,
    pub name: String,
}

// ─── Inbound ──────────────────────────────────────────────────────────────────

/// A message event delivered by a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub message_id: String,
    pub text: String,
    pub sender: String,
    pub conversation: ConversationId,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    /// Builds a message received now, with a random id.
    pub fn new(conversation: ConversationId, text: impl Into<String>) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            text: text.into(),
            sender: conversation.user.clone(),
            conversation,
            received_at: Utc::now(),
        }
    }
}

/// An inbound message enriched with roster information and the computed
/// authority of its sender.
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub message: InboundMessage,
    pub authority: Authority,
    pub member: Option<MemberInfo>,
    pub channel: Option<ChannelInfo>,
}

impl MessageContext {
    /// A context with no roster data and `Public` authority.
    pub fn public(message: InboundMessage) -> Self {
        Self {
            message,
            authority: Authority::Public,
            member: None,
            channel: None,
        }
    }

    pub fn with_authority(mut self, authority: Authority) -> Self {
        self.authority = authority;
        self
    }

    pub fn conversation(&self) -> &ConversationId {
        &self.message.conversation
    }

    pub fn text(&self) -> &str {
        &self.message.text
    }
}

// ─── Outbound ─────────────────────────────────────────────────────────────────

/// One response value produced by a handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub text: String,
    /// Id of the message this response quotes, if any.
    pub reply_to: Option<String>,
}

impl Response {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            reply_to: None,
        }
    }

    /// A response quoting the given message.
    pub fn reply(text: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            reply_to: Some(message_id.into()),
        }
    }
}

impl From<&str> for Response {
    fn from(text: &str) -> Self {
        Self::text(text)
    }
}

impl From<String> for Response {
    fn from(text: String) -> Self {
        Self::text(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authority_ordering() {
        assert!(Authority::Unspecified < Authority::Public);
        assert!(Authority::Public < Authority::Admin);
        assert!(Authority::Admin < Authority::Root);
    }

    #[test]
    fn test_authority_from_str() {
        assert_eq!("Admin".parse::<Authority>(), Ok(Authority::Admin));
        assert_eq!("root".parse::<Authority>(), Ok(Authority::Root));
        assert!("owner".parse::<Authority>().is_err());
    }

    #[test]
    fn test_conversation_identity_requires_exact_match() {
        let a = ConversationId::new("group-1", "alice");
        let b = ConversationId::new("group-1", "alice").with_sub_channel("thread");
        assert_ne!(a, b);
        assert_eq!(a, ConversationId::new("group-1", "alice"));
        assert_eq!(b.to_string(), "group-1/thread:alice");
    }
}
