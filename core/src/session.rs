/// Per-sign-in state: who we are, who we can talk to, what is open
use crate::conversation_store::ConversationStore;
use crate::messenger_types::Profile;

/// Contact list fetched from the profiles table, cached until reload
#[derive(Debug, Default, Clone)]
pub struct ContactCache {
    contacts: Vec<Profile>,
    loaded: bool,
}

impl ContactCache {
    pub fn replace(&mut self, mut contacts: Vec<Profile>) {
        contacts.sort_by(|a, b| a.username.to_lowercase().cmp(&b.username.to_lowercase()));
        self.contacts = contacts;
        self.loaded = true;
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn all(&self) -> &[Profile] {
        &self.contacts
    }

    pub fn get(&self, id: &str) -> Option<&Profile> {
        self.contacts.iter().find(|c| c.id == id)
    }

    /// Look up by id, then by username (case-insensitive)
    pub fn resolve(&self, key: &str) -> Option<&Profile> {
        self.get(key).or_else(|| {
            self.contacts
                .iter()
                .find(|c| c.username.eq_ignore_ascii_case(key))
        })
    }

    /// Display name for notifications; unknown senders show their id
    pub fn display_name(&self, id: &str) -> String {
        self.get(id)
            .map(|c| c.username.clone())
            .unwrap_or_else(|| id.to_string())
    }
}

/// Everything that lives between sign-in and sign-out
#[derive(Debug)]
pub struct SessionContext {
    pub me: Profile,
    pub contacts: ContactCache,
    pub conversation: ConversationStore,
    /// Notification permission was asked for in this session
    pub notifications_requested: bool,
}

impl SessionContext {
    pub fn new(me: Profile) -> Self {
        Self {
            me,
            contacts: ContactCache::default(),
            conversation: ConversationStore::new(),
            notifications_requested: false,
        }
    }

    pub fn me_id(&self) -> &str {
        &self.me.id
    }

    pub fn open_peer(&self) -> Option<&str> {
        self.conversation.peer_id()
    }
}
