//! The contacts roster consulted to enrich inbound messages.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::message::{Authority, ChannelInfo, InboundMessage, MemberInfo, MemberRole, MessageContext};

type ChannelKey = (String, Option<String>);
type MemberKey = (String, Option<String>, String);

/// Resolves members and channels for context enrichment.
#[async_trait]
pub trait ContactsProvider: Send + Sync {
    fn try_resolve_member(
        &self,
        channel: &str,
        user: &str,
        sub_channel: Option<&str>,
    ) -> Option<MemberInfo>;

    fn try_resolve_channel(&self, channel: &str, sub_channel: Option<&str>) -> Option<ChannelInfo>;

    /// Reloads the roster from its source. Called at startup and periodically.
    async fn refresh(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// In-memory roster backed by concurrent maps.
#[derive(Default)]
pub struct MemoryContacts {
    members: RwLock<HashMap<MemberKey, MemberInfo>>,
    channels: RwLock<HashMap<ChannelKey, ChannelInfo>>,
}

impl MemoryContacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_member(&self, member: MemberInfo) {
        let key = (
            member.channel.clone(),
            member.sub_channel.clone(),
            member.user.clone(),
        );
        self.members.write().insert(key, member);
    }

    pub fn upsert_channel(&self, channel: ChannelInfo) {
        let key = (channel.channel.clone(), channel.sub_channel.clone());
        self.channels.write().insert(key, channel);
    }

    pub fn remove_channel(&self, channel: &str, sub_channel: Option<&str>) {
        let sub = sub_channel.map(str::to_owned);
        self.channels
            .write()
            .remove(&(channel.to_owned(), sub.clone()));
        self.members
            .write()
            .retain(|(c, s, _), _| !(c == channel && *s == sub));
    }
}

#[async_trait]
impl ContactsProvider for MemoryContacts {
    fn try_resolve_member(
        &self,
        channel: &str,
        user: &str,
        sub_channel: Option<&str>,
    ) -> Option<MemberInfo> {
        let key = (
            channel.to_owned(),
            sub_channel.map(str::to_owned),
            user.to_owned(),
        );
        self.members.read().get(&key).cloned()
    }

    fn try_resolve_channel(&self, channel: &str, sub_channel: Option<&str>) -> Option<ChannelInfo> {
        let key = (channel.to_owned(), sub_channel.map(str::to_owned));
        self.channels.read().get(&key).cloned()
    }
}

/// Builds the dispatch context of a message: roster lookups plus authority.
///
/// Users in `root_users` are `Root`; members with an admin or owner role are
/// `Admin`; everyone else is `Public`.
pub fn enrich(
    message: InboundMessage,
    contacts: &dyn ContactsProvider,
    root_users: &[String],
) -> MessageContext {
    let conv = &message.conversation;
    let sub = conv.sub_channel.as_deref();
    let member = contacts.try_resolve_member(&conv.channel, &message.sender, sub);
    let channel = contacts.try_resolve_channel(&conv.channel, sub);

    let authority = if root_users.iter().any(|u| *u == message.sender) {
        Authority::Root
    } else if matches!(
        member.as_ref().map(|m| m.role),
        Some(MemberRole::Admin | MemberRole::Owner)
    ) {
        Authority::Admin
    } else {
        Authority::Public
    };

    MessageContext {
        message,
        authority,
        member,
        channel,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ConversationId;

    fn member(user: &str, role: MemberRole) -> MemberInfo {
        MemberInfo {
            channel: "g1".into(),
            sub_channel: None,
            user: user.into(),
            nickname: None,
            role,
        }
    }

    #[test]
    fn test_enrich_computes_authority() {
        let contacts = MemoryContacts::new();
        contacts.upsert_member(member("alice", MemberRole::Owner));
        contacts.upsert_member(member("bob", MemberRole::Member));
        let roots = vec!["carol".to_string()];

        let msg = |user: &str| InboundMessage::new(ConversationId::new("g1", user), "hi");

        assert_eq!(enrich(msg("alice"), &contacts, &roots).authority, Authority::Admin);
        assert_eq!(enrich(msg("bob"), &contacts, &roots).authority, Authority::Public);
        assert_eq!(enrich(msg("carol"), &contacts, &roots).authority, Authority::Root);
        assert_eq!(enrich(msg("dave"), &contacts, &roots).authority, Authority::Public);
    }

    #[test]
    fn test_remove_channel_drops_members() {
        let contacts = MemoryContacts::new();
        contacts.upsert_member(member("alice", MemberRole::Admin));
        contacts.upsert_channel(ChannelInfo {
            channel: "g1".into(),
            sub_channel: None,
            name: "general".into(),
        });
        contacts.remove_channel("g1", None);
        assert!(contacts.try_resolve_member("g1", "alice", None).is_none());
        assert!(contacts.try_resolve_channel("g1", None).is_none());
    }
}
