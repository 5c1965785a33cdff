use bitflags::bitflags;
use std::fmt;

bitflags! {
    /// Path-segment categories that, together with the major parameter,
    /// identify a rate-limit bucket.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct UrlParts: u32 {
        const CHANNELS = 1 << 0;
        const MESSAGES = 1 << 1;
        const BULK_DELETE = 1 << 2;
        const TYPING = 1 << 3;
        const PERMISSIONS = 1 << 4;
        const INVITES = 1 << 5;
        const PINS = 1 << 6;
        const RECIPIENTS = 1 << 7;
        const REACTIONS = 1 << 8;
        const GUILDS = 1 << 9;
        const MEMBERS = 1 << 10;
        const ROLES = 1 << 11;
        const BANS = 1 << 12;
        const EMOJIS = 1 << 13;
        const PRUNE = 1 << 14;
        const INTEGRATIONS = 1 << 15;
        const WEBHOOKS = 1 << 16;
        const USERS = 1 << 17;
        const AUDIT_LOGS = 1 << 18;
        const GATEWAY = 1 << 19;
        const APPLICATIONS = 1 << 20;
        const INTERACTIONS = 1 << 21;
        const THREADS = 1 << 22;
        const VOICE = 1 << 23;
    }
}

impl UrlParts {
    /// Map a literal route segment to its category.
    fn from_segment(segment: &str) -> Option<Self> {
        let part = match segment {
            "channels" => Self::CHANNELS,
            "messages" => Self::MESSAGES,
            "bulk-delete" | "bulk_delete" => Self::BULK_DELETE,
            "typing" => Self::TYPING,
            "permissions" => Self::PERMISSIONS,
            "invites" => Self::INVITES,
            "pins" => Self::PINS,
            "recipients" => Self::RECIPIENTS,
            "reactions" => Self::REACTIONS,
            "guilds" => Self::GUILDS,
            "members" => Self::MEMBERS,
            "roles" => Self::ROLES,
            "bans" => Self::BANS,
            "emojis" => Self::EMOJIS,
            "prune" => Self::PRUNE,
            "integrations" => Self::INTEGRATIONS,
            "webhooks" => Self::WEBHOOKS,
            "users" => Self::USERS,
            "audit-logs" => Self::AUDIT_LOGS,
            "gateway" => Self::GATEWAY,
            "applications" => Self::APPLICATIONS,
            "interactions" => Self::INTERACTIONS,
            "threads" => Self::THREADS,
            "voice" => Self::VOICE,
            _ => return None,
        };
        Some(part)
    }

    /// Whether an identifier following this segment scopes the bucket.
    fn is_major(self) -> bool {
        self == Self::CHANNELS || self == Self::GUILDS || self == Self::WEBHOOKS
    }
}

/// Identifies a rate-limit bucket.
///
/// Two requests share a bucket iff their keys are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct RateLimitKey {
    major_id: String,
    url_parts: UrlParts,
}

impl RateLimitKey {
    /// Create a key from a major parameter (empty when unscoped) and route categories.
    pub fn new(major_id: impl Into<String>, url_parts: UrlParts) -> Self {
        Self {
            major_id: major_id.into(),
            url_parts,
        }
    }

    /// Derive a key from a REST route or full API URL.
    ///
    /// Known literal segments set their [`UrlParts`] flag. The first identifier
    /// following `channels`, `guilds` or `webhooks` becomes the major parameter;
    /// any other identifier (message ids, user ids, tokens, version prefixes)
    /// does not split the bucket.
    ///
    /// ```
    /// use gateway_flow::{RateLimitKey, UrlParts};
    ///
    /// let key = RateLimitKey::from_route("/channels/123/messages/456");
    /// assert_eq!(key.major_id(), "123");
    /// assert_eq!(key.url_parts(), UrlParts::CHANNELS | UrlParts::MESSAGES);
    /// ```
    pub fn from_route(route: &str) -> Self {
        let path = match url::Url::parse(route) {
            Ok(url) => url.path().to_string(),
            // Relative route, e.g. "/guilds/1/members"
            Err(_) => route.split(['?', '#']).next().unwrap_or_default().to_string(),
        };

        let mut url_parts = UrlParts::empty();
        let mut major_id = String::new();
        let mut previous: Option<UrlParts> = None;

        for segment in path.split('/').filter(|s| !s.is_empty()) {
            match UrlParts::from_segment(segment) {
                Some(part) => {
                    url_parts |= part;
                    previous = Some(part);
                }
                None => {
                    if major_id.is_empty() && previous.is_some_and(UrlParts::is_major) {
                        major_id = segment.to_string();
                    }
                    previous = None;
                }
            }
        }

        Self {
            major_id,
            url_parts,
        }
    }

    /// The scoping resource id, empty when the route has none
    pub fn major_id(&self) -> &str {
        &self.major_id
    }

    /// The route categories of this key
    pub fn url_parts(&self) -> UrlParts {
        self.url_parts
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.major_id.is_empty() {
            write!(f, "{:?}", self.url_parts)
        } else {
            write!(f, "{:?}@{}", self.url_parts, self.major_id)
        }
    }
}

/// Implemented by endpoint descriptions that know which bucket they fall in.
pub trait RateLimited {
    /// The bucket key for this endpoint
    fn rate_limit_key(&self) -> RateLimitKey;
}

impl RateLimited for RateLimitKey {
    fn rate_limit_key(&self) -> RateLimitKey {
        self.clone()
    }
}
